//! Collaborator interfaces of the control loop
//!
//! The loop owns no camera, model, window or disk. It talks to them through
//! the traits here:
//!
//! - [`FrameSource`]: the camera, wrapped in a [`CameraSlot`] so at most one
//!   handle is ever open
//! - [`LandmarkProvider`]: a stateless `frame -> landmarks` function
//! - [`StateStore`]: enrolled subjects, learned state and the append-only logs
//! - [`InputBlocker`]: the exclusive input-suppression resource
//! - [`Presenter`]: the UI side of the loop

use crate::calibration::SubjectRecord;
use crate::error::LoopError;
use crate::landmarks::{LandmarkDetection, RawLandmarkFrame};
use crate::trigger::TriggerEvent;
use crate::types::{
    BreakEventRecord, BreakNotice, BreakOutcome, IndexSnapshot, IndexWarning, LearnedState,
    Seconds, SessionRecord, StateKey,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Camera or any other producer of image frames
pub trait FrameSource {
    type Frame;

    fn open(&mut self) -> Result<(), LoopError>;

    fn capture(&mut self) -> Result<Self::Frame, LoopError>;

    fn close(&mut self);
}

/// Pure landmark detection over one frame, in normalized image coordinates
pub trait LandmarkProvider<F> {
    fn detect(&self, frame: &F) -> Result<LandmarkDetection, LoopError>;
}

impl<F, T> LandmarkProvider<F> for T
where
    T: Fn(&F) -> Result<LandmarkDetection, LoopError>,
{
    fn detect(&self, frame: &F) -> Result<LandmarkDetection, LoopError> {
        self(frame)
    }
}

/// Persistence collaborator
///
/// Written at calibration, read at session start, written at break
/// completion and session end.
pub trait StateStore {
    /// Insert or replace the subject's enrollment
    fn record_subject(&mut self, record: &SubjectRecord) -> Result<(), LoopError>;

    fn load_subject(&self, subject: &str) -> Result<Option<SubjectRecord>, LoopError>;

    fn subjects(&self) -> Result<Vec<SubjectRecord>, LoopError>;

    fn load_state(&self, key: &StateKey) -> Result<Option<LearnedState>, LoopError>;

    fn save_state(&mut self, key: &StateKey, state: &LearnedState) -> Result<(), LoopError>;

    fn append_break_event(&mut self, event: &BreakEventRecord) -> Result<(), LoopError>;

    /// Insert or replace the record with the same id
    fn record_session(&mut self, record: &SessionRecord) -> Result<(), LoopError>;
}

impl<S: StateStore + ?Sized> StateStore for &mut S {
    fn record_subject(&mut self, record: &SubjectRecord) -> Result<(), LoopError> {
        (**self).record_subject(record)
    }

    fn load_subject(&self, subject: &str) -> Result<Option<SubjectRecord>, LoopError> {
        (**self).load_subject(subject)
    }

    fn subjects(&self) -> Result<Vec<SubjectRecord>, LoopError> {
        (**self).subjects()
    }

    fn load_state(&self, key: &StateKey) -> Result<Option<LearnedState>, LoopError> {
        (**self).load_state(key)
    }

    fn save_state(&mut self, key: &StateKey, state: &LearnedState) -> Result<(), LoopError> {
        (**self).save_state(key, state)
    }

    fn append_break_event(&mut self, event: &BreakEventRecord) -> Result<(), LoopError> {
        (**self).append_break_event(event)
    }

    fn record_session(&mut self, record: &SessionRecord) -> Result<(), LoopError> {
        (**self).record_session(record)
    }
}

/// Exclusive input suppression, held only while a break is active
pub trait InputBlocker: Send {
    fn acquire(&mut self) -> Result<(), LoopError>;

    fn release(&mut self);
}

/// Input blocker shared between the loop and whoever installed it
pub type SharedBlocker = Arc<Mutex<dyn InputBlocker + Send>>;

/// Presentation collaborator for the synchronous driver
///
/// Every method has a no-op default so a presenter only implements what it
/// shows.
pub trait Presenter {
    fn snapshot(&mut self, _snapshot: &IndexSnapshot, _weighted_tiredness: f64) {}

    fn warning(&mut self, _warning: &IndexWarning) {}

    /// Acknowledge a break before input suppression starts. Returning `false`
    /// runs the break without suppression.
    fn break_begin(&mut self, _event: &TriggerEvent, _duration: Seconds) -> bool {
        true
    }

    fn break_progress(&mut self, _notice: &BreakNotice) {}

    fn break_completed(&mut self, _outcome: &BreakOutcome) {}
}

/// Presenter that shows nothing and acknowledges every break
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPresenter;

impl Presenter for NullPresenter {}

/// Single owner of a [`FrameSource`]
///
/// Opens at most once, refuses to capture before a successful open, and
/// closes the source when dropped.
#[derive(Debug)]
pub struct CameraSlot<S: FrameSource> {
    source: S,
    open: bool,
}

impl<S: FrameSource> CameraSlot<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Open the source; a second call keeps the existing handle
    pub fn open(&mut self) -> Result<(), LoopError> {
        if self.open {
            debug!("camera already open");
            return Ok(());
        }
        self.source.open()?;
        self.open = true;
        info!("camera opened");
        Ok(())
    }

    pub fn capture(&mut self) -> Result<S::Frame, LoopError> {
        if !self.open {
            return Err(LoopError::ResourceUnavailable(
                "capture attempted before the camera was opened".into(),
            ));
        }
        self.source.capture()
    }

    pub fn close(&mut self) {
        if self.open {
            self.source.close();
            self.open = false;
            info!("camera closed");
        }
    }
}

impl<S: FrameSource> Drop for CameraSlot<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Frame source over recorded landmark frames
///
/// Once the recording is exhausted every capture yields an empty detection
/// at the last timestamp.
#[derive(Debug, Clone, Default)]
pub struct RecordedFrames {
    frames: VecDeque<RawLandmarkFrame>,
    last_timestamp: Seconds,
}

impl RecordedFrames {
    pub fn new(frames: impl IntoIterator<Item = RawLandmarkFrame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            last_timestamp: 0.0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for RecordedFrames {
    type Frame = RawLandmarkFrame;

    fn open(&mut self) -> Result<(), LoopError> {
        Ok(())
    }

    fn capture(&mut self) -> Result<RawLandmarkFrame, LoopError> {
        match self.frames.pop_front() {
            Some(frame) => {
                self.last_timestamp = frame.timestamp;
                Ok(frame)
            }
            None => Ok(RawLandmarkFrame {
                timestamp: self.last_timestamp,
                detection: LandmarkDetection::default(),
            }),
        }
    }

    fn close(&mut self) {}
}

/// Provider for recorded frames: the detection is already in the frame
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordedLandmarks;

impl LandmarkProvider<RawLandmarkFrame> for RecordedLandmarks {
    fn detect(&self, frame: &RawLandmarkFrame) -> Result<LandmarkDetection, LoopError> {
        Ok(frame.detection.clone())
    }
}

/// Input blocker that counts grabs and releases
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Default)]
    pub struct CountingBlocker {
        pub acquired: u32,
        pub released: u32,
        pub refuse: bool,
    }

    impl InputBlocker for CountingBlocker {
        fn acquire(&mut self) -> Result<(), LoopError> {
            if self.refuse {
                return Err(LoopError::ResourceUnavailable("input grab refused".into()));
            }
            self.acquired += 1;
            Ok(())
        }

        fn release(&mut self) {
            self.released += 1;
        }
    }

    pub fn counting_blocker(refuse: bool) -> Arc<Mutex<CountingBlocker>> {
        Arc::new(Mutex::new(CountingBlocker {
            refuse,
            ..Default::default()
        }))
    }
}
