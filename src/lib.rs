//! Alertloop - Landmark-driven fatigue indices and adaptive break enforcement
//!
//! Alertloop turns per-frame face and pose landmarks into four tiredness
//! indices, fuses them with learned per-(task, subject) weights, and enforces
//! breaks whose length adapts to how quickly the subject recovers:
//! calibration → indices → fusion → hysteresis trigger → break → learning.
//!
//! ## Modules
//!
//! - **Vision side**: `landmarks`, `calibration`, `indices`
//! - **Control side**: `fusion`, `trigger`, `breaks`, `learning`
//! - **Orchestration**: `pipeline` (synchronous), `runtime` (tokio worker)
//! - **Collaborators**: `ports` (camera, provider, store, presenter), `store`

pub mod breaks;
pub mod calibration;
pub mod config;
pub mod error;
pub mod fusion;
pub mod indices;
pub mod landmarks;
pub mod learning;
pub mod pipeline;
pub mod ports;
pub mod runtime;
pub mod store;
pub mod trigger;
pub mod types;
pub mod window;

pub use breaks::{break_duration, BreakSession, InputGrab};
pub use calibration::{enroll_subject, LandmarkCalibrator, ReferenceProfile, SubjectRecord};
pub use config::LoopConfig;
pub use error::LoopError;
pub use fusion::WeightedFusion;
pub use indices::IndexEngine;
pub use landmarks::{LandmarkDetection, LandmarkFrame, RawLandmarkFrame};
pub use learning::{ScalerLearner, WeightLearner};
pub use pipeline::{MonitorSession, TickReport};
pub use ports::{InputBlocker, LandmarkProvider, Presenter, StateStore};
pub use runtime::{spawn_monitor, MonitorEvent, MonitorHandle, MonitorSetup};
pub use store::JsonStateStore;
pub use trigger::{TriggerController, TriggerEvent};

/// Alertloop version, recorded by the CLI
pub const ALERTLOOP_VERSION: &str = env!("CARGO_PKG_VERSION");
