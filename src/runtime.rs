//! Async monitoring worker
//!
//! [`spawn_monitor`] runs a [`MonitorSession`] on a tokio task. A fixed-cadence
//! poll interval captures, detects and analyzes frames; a second interval in
//! the same task drives the break countdown, so neither ever blocks on a sleep.
//! Everything the presentation layer needs arrives as [`MonitorEvent`]s on an
//! mpsc channel; the worker never touches UI state itself.
//!
//! Loop time is the tokio clock measured from the start of the task, which
//! keeps the worker deterministic under `tokio::time::pause`.

use crate::calibration::ReferenceProfile;
use crate::config::LoopConfig;
use crate::error::LoopError;
use crate::landmarks::{LandmarkDetection, LandmarkFrame};
use crate::pipeline::MonitorSession;
use crate::ports::{CameraSlot, FrameSource, LandmarkProvider, SharedBlocker, StateStore};
use crate::trigger::TriggerEvent;
use crate::types::{
    BreakNotice, BreakOutcome, IndexSnapshot, IndexWarning, Seconds, SessionSummary, StateKey,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Capacity of the event channel
const EVENT_BUFFER: usize = 256;

/// Notification for the presentation layer
#[derive(Debug)]
pub enum MonitorEvent {
    Snapshot {
        snapshot: IndexSnapshot,
        weighted_tiredness: f64,
    },
    Warning(IndexWarning),
    /// Reply `true` on `ack` to allow input suppression. No reply within the
    /// acknowledgement timeout runs the break unblocked.
    BreakBegin {
        event: TriggerEvent,
        duration: Seconds,
        ack: oneshot::Sender<bool>,
    },
    BreakProgress(BreakNotice),
    BreakCompleted(BreakOutcome),
    /// A structural error; the worker stops after sending it
    Error(String),
    Stopped(SessionSummary),
}

/// Everything the worker needs
pub struct MonitorSetup<S, Src, P> {
    pub config: LoopConfig,
    pub key: StateKey,
    pub profile: ReferenceProfile,
    pub store: S,
    pub source: Src,
    pub provider: P,
    pub blocker: Option<SharedBlocker>,
}

/// Handle to a running worker
pub struct MonitorHandle {
    events: mpsc::Receiver<MonitorEvent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<SessionSummary, LoopError>>,
}

impl MonitorHandle {
    /// Next event; `None` once the worker has exited and the buffer is drained
    pub async fn next_event(&mut self) -> Option<MonitorEvent> {
        self.events.recv().await
    }

    pub fn request_shutdown(&self) {
        // The worker may already have exited on its own
        let _ = self.shutdown.send(true);
    }

    /// Request shutdown and wait for teardown to finish
    pub async fn shutdown(self) -> Result<SessionSummary, LoopError> {
        let MonitorHandle {
            events,
            shutdown,
            task,
        } = self;
        let _ = shutdown.send(true);
        // Dropping the receiver unblocks a worker stuck on a full channel
        drop(events);
        task.await
            .map_err(|e| LoopError::ResourceUnavailable(format!("monitor task failed: {e}")))?
    }
}

/// Start the polling worker on the current tokio runtime
pub fn spawn_monitor<S, Src, P>(setup: MonitorSetup<S, Src, P>) -> MonitorHandle
where
    S: StateStore + Send + 'static,
    Src: FrameSource + Send + 'static,
    P: LandmarkProvider<Src::Frame> + Send + 'static,
{
    let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_monitor(setup, events_tx, shutdown_rx));
    MonitorHandle {
        events,
        shutdown,
        task,
    }
}

fn seconds_since(origin: Instant) -> Seconds {
    origin.elapsed().as_secs_f64()
}

/// Capture and detect one frame. `Ok(None)` skips a frame that could not be
/// captured; only structural camera errors are returned.
fn detect_frame<Src, P>(
    camera: &mut CameraSlot<Src>,
    provider: &P,
) -> Result<Option<LandmarkDetection>, LoopError>
where
    Src: FrameSource,
    P: LandmarkProvider<Src::Frame>,
{
    let frame = match camera.capture() {
        Ok(frame) => frame,
        Err(e) if e.is_structural() => return Err(e),
        Err(e) => {
            debug!(error = %e, "frame skipped");
            return Ok(None);
        }
    };
    Ok(Some(provider.detect(&frame).unwrap_or_else(|e| {
        debug!(error = %e, "no landmarks this frame");
        LandmarkDetection::default()
    })))
}

async fn emit(events: &mpsc::Sender<MonitorEvent>, event: MonitorEvent) {
    if events.send(event).await.is_err() {
        debug!("event receiver dropped");
    }
}

async fn run_monitor<S, Src, P>(
    setup: MonitorSetup<S, Src, P>,
    events: mpsc::Sender<MonitorEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SessionSummary, LoopError>
where
    S: StateStore + Send + 'static,
    Src: FrameSource + Send + 'static,
    P: LandmarkProvider<Src::Frame> + Send + 'static,
{
    let MonitorSetup {
        config,
        key,
        profile,
        store,
        source,
        provider,
        blocker,
    } = setup;

    let poll_period = Duration::from_millis(config.monitor.poll_interval_ms);
    let sample_period = Duration::from_secs_f64(config.breaks.sample_interval_seconds);
    let ack_timeout = Duration::from_secs_f64(config.breaks.ack_timeout_seconds);

    let mut session = match MonitorSession::start(config, key, profile, store) {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "monitoring could not start");
            emit(&events, MonitorEvent::Error(e.to_string())).await;
            return Err(e);
        }
    };

    let mut camera = CameraSlot::new(source);
    if let Err(e) = camera.open() {
        error!(error = %e, "camera unavailable");
        emit(&events, MonitorEvent::Error(e.to_string())).await;
        // Close out the session record before reporting the failure
        if let Err(end_error) = session.end(0.0) {
            warn!(error = %end_error, "failed to close session after camera error");
        }
        return Err(e);
    }

    let origin = Instant::now();
    let mut poll = time::interval(poll_period);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut countdown = time::interval(sample_period);
    countdown.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(poll_ms = poll_period.as_millis() as u64, "monitor worker running");

    let mut failure = None;
    'monitor: loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("shutdown requested");
                    break;
                }
            }
            _ = poll.tick() => {
                let detection = match detect_frame(&mut camera, &provider) {
                    Ok(Some(detection)) => detection,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(error = %e, "camera failed");
                        emit(&events, MonitorEvent::Error(e.to_string())).await;
                        failure = Some(e);
                        break;
                    }
                };
                let frame = LandmarkFrame::from_detection(seconds_since(origin), &detection);
                let report = session.process_frame(&frame);

                emit(&events, MonitorEvent::Snapshot {
                    snapshot: report.snapshot,
                    weighted_tiredness: report.weighted_tiredness,
                }).await;
                for warning in report.warnings {
                    emit(&events, MonitorEvent::Warning(warning)).await;
                }

                if let Some(event) = report.trigger {
                    let duration = session.planned_duration(&event);
                    let (ack, reply) = oneshot::channel();
                    emit(&events, MonitorEvent::BreakBegin {
                        event: event.clone(),
                        duration,
                        ack,
                    }).await;
                    let acknowledged = tokio::select! {
                        reply = time::timeout(ack_timeout, reply) => matches!(reply, Ok(Ok(true))),
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                debug!("shutdown requested while awaiting acknowledgement");
                                break 'monitor;
                            }
                            false
                        }
                    };
                    if !acknowledged {
                        warn!("break not acknowledged, running without input blocking");
                    }
                    let blocker = if acknowledged { blocker.clone() } else { None };
                    match session.begin_break(&event, seconds_since(origin), blocker) {
                        Ok(notice) => {
                            emit(&events, MonitorEvent::BreakProgress(notice)).await;
                            countdown.reset();
                        }
                        Err(e) => warn!(error = %e, "break not started"),
                    }
                }
            }
            _ = countdown.tick(), if session.is_break_active() => {
                if let Some(tick) = session.break_tick(seconds_since(origin)) {
                    emit(&events, MonitorEvent::BreakProgress(tick.notice)).await;
                    if let Some(outcome) = tick.outcome {
                        emit(&events, MonitorEvent::BreakCompleted(outcome)).await;
                    }
                }
            }
        }
    }

    camera.close();
    let summary = session.end(seconds_since(origin))?;
    emit(&events, MonitorEvent::Stopped(summary.clone())).await;
    match failure {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}
