//! Tiredness index computation
//!
//! Turns calibrated landmarks into the four indices:
//!
//! - **Drowsiness**: EAR drop against the subject's baseline, raised by
//!   recent prolonged eye closures
//! - **Slouching**: relative drop of the nose-to-shoulder ratio
//! - **Attention**: rolling gaze deviation (head pose when the iris is unusable)
//! - **Yawn**: count of yawn events in the last minute

pub mod detectors;
pub mod engine;
pub mod geometry;

pub use detectors::{AttentionTracker, BlinkCounter, EyeClosureDetector, YawnDetector};
pub use engine::IndexEngine;
pub use geometry::{EyePoints, HeadPose, MouthPoints};
