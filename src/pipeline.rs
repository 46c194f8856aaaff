//! Control-loop orchestration
//!
//! A [`MonitorSession`] owns one monitoring session for one (task, subject):
//!
//! 1. IndexEngine - landmarks to the four indices
//! 2. WeightedFusion - indices to weighted tiredness
//! 3. TriggerController - dwell and cooldown gating
//! 4. BreakSession - countdown and alertness confirmation
//! 5. ScalerLearner / WeightLearner - adapt and persist
//!
//! The session is synchronous and time-agnostic: the caller supplies frame
//! timestamps and break tick times. [`MonitorSession::step`] is a complete
//! driver for recorded streams; the async worker lives in `runtime`.

use crate::breaks::{break_duration, BreakSession, InputGrab};
use crate::calibration::ReferenceProfile;
use crate::config::LoopConfig;
use crate::error::LoopError;
use crate::fusion::WeightedFusion;
use crate::indices::IndexEngine;
use crate::landmarks::LandmarkFrame;
use crate::learning::{ScalerLearner, SessionIndexAccumulator, WeightLearner};
use crate::ports::{Presenter, SharedBlocker, StateStore};
use crate::trigger::{TriggerController, TriggerEvent};
use crate::types::{
    AlertSample, BreakEventRecord, BreakNotice, BreakOutcome, BreakPhase, IndexKind,
    IndexSnapshot, IndexWarning, LearnedState, PerIndex, Seconds, SessionRecord, SessionSummary,
    StateKey, Weightages,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of analyzing one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub snapshot: IndexSnapshot,
    pub weighted_tiredness: f64,
    /// Set when a break should start now
    pub trigger: Option<TriggerEvent>,
    pub warnings: Vec<IndexWarning>,
}

/// Result of one break countdown tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakTick {
    pub notice: BreakNotice,
    /// Set on the tick that completed the break
    pub outcome: Option<BreakOutcome>,
}

/// Per-index warning rate limiter
#[derive(Debug, Clone)]
pub struct IndexWarningGate {
    threshold: f64,
    cooldown: Seconds,
    last: PerIndex<Option<Seconds>>,
}

impl IndexWarningGate {
    pub fn new(threshold: f64, cooldown: Seconds) -> Self {
        Self {
            threshold,
            cooldown,
            last: PerIndex::default(),
        }
    }

    /// Warnings for every index at or above the threshold whose previous
    /// warning is at least one cooldown old
    pub fn check(&mut self, snapshot: &IndexSnapshot) -> Vec<IndexWarning> {
        let now = snapshot.timestamp;
        let cooldown = self.cooldown;
        let mut warnings = Vec::new();
        for kind in IndexKind::ALL {
            let value = *snapshot.indices.get(kind);
            if !(value.is_finite() && value >= self.threshold) {
                continue;
            }
            let last = self.last.get_mut(kind);
            if last.is_some_and(|at| now - at < cooldown) {
                continue;
            }
            *last = Some(now);
            debug!(index = %kind, value, "index warning");
            warnings.push(IndexWarning {
                kind,
                value,
                at: now,
            });
        }
        warnings
    }
}

#[derive(Debug)]
struct ActiveBreak {
    session: BreakSession,
    event: TriggerEvent,
    started_at: DateTime<Utc>,
}

/// Latest analyzed frame, as seen by break sampling
#[derive(Debug, Clone, Copy)]
struct LatestSample {
    at: Seconds,
    /// `None` when nothing was detected in that frame
    weighted_tiredness: Option<f64>,
}

/// One monitoring session for one (task, subject)
#[derive(Debug)]
pub struct MonitorSession<S: StateStore> {
    config: LoopConfig,
    key: StateKey,
    store: S,
    record: SessionRecord,
    engine: IndexEngine,
    fusion: WeightedFusion,
    trigger: TriggerController,
    scaler_learner: ScalerLearner,
    weight_learner: WeightLearner,
    accumulator: SessionIndexAccumulator,
    warnings: IndexWarningGate,
    state: LearnedState,
    weights_before: Weightages,
    active: Option<ActiveBreak>,
    latest: Option<LatestSample>,
    next_break_tick: Option<Seconds>,
    ticks_analyzed: u64,
}

impl<S: StateStore> MonitorSession<S> {
    /// Start monitoring.
    ///
    /// # Arguments
    /// * `config` - Loop configuration, validated here
    /// * `key` - The (task, subject) whose learned state is used
    /// * `profile` - The subject's reference profile
    /// * `store` - Persistence collaborator
    ///
    /// # Errors
    /// [`LoopError::CalibrationInvalid`] when the profile lacks its anchors,
    /// plus any configuration or store error.
    pub fn start(
        config: LoopConfig,
        key: StateKey,
        profile: ReferenceProfile,
        mut store: S,
    ) -> Result<Self, LoopError> {
        config.validate()?;
        let engine = IndexEngine::with_reference(&config, profile)?;

        let learning = &config.learning;
        let state = store
            .load_state(&key)?
            .unwrap_or_else(|| LearnedState::initial(learning.default_scaler))
            .sanitized(learning.scaler_min, learning.scaler_max, learning.default_scaler);

        let record = SessionRecord {
            id: Uuid::new_v4(),
            task: key.task.clone(),
            subject: key.subject.clone(),
            started_at: Utc::now(),
            ended_at: None,
            breaks_triggered: 0,
            total_break_seconds: 0.0,
        };
        store.record_session(&record)?;
        info!(
            session = %record.id,
            task = %key.task,
            subject = %key.subject,
            scaler = state.scaler,
            sessions = state.session_count,
            "monitoring session started"
        );

        Ok(Self {
            fusion: WeightedFusion::new(state.weights),
            trigger: TriggerController::new(config.trigger.clone()),
            scaler_learner: ScalerLearner::new(&config.learning),
            weight_learner: WeightLearner,
            accumulator: SessionIndexAccumulator::new(),
            warnings: IndexWarningGate::new(
                config.monitor.warning_threshold,
                config.monitor.warning_cooldown_seconds,
            ),
            weights_before: state.weights,
            state,
            engine,
            record,
            store,
            key,
            config,
            active: None,
            latest: None,
            next_break_tick: None,
            ticks_analyzed: 0,
        })
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn key(&self) -> &StateKey {
        &self.key
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn learned_state(&self) -> &LearnedState {
        &self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_break_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn break_phase(&self) -> BreakPhase {
        self.active
            .as_ref()
            .map_or(BreakPhase::Idle, |active| active.session.phase())
    }

    pub fn break_notice(&self) -> Option<BreakNotice> {
        self.active.as_ref().map(|active| active.session.notice())
    }

    /// When the synchronous driver runs the next countdown tick
    pub fn next_break_tick(&self) -> Option<Seconds> {
        self.next_break_tick
    }

    /// Break length a trigger would get with the current scaler
    pub fn planned_duration(&self, event: &TriggerEvent) -> Seconds {
        break_duration(
            self.state.scaler,
            event.weighted_tiredness,
            self.config.breaks.min_break_seconds,
        )
    }

    /// Analyze one frame and advance the trigger
    pub fn process_frame(&mut self, frame: &LandmarkFrame) -> TickReport {
        let snapshot = self.engine.analyze(frame);
        let weighted_tiredness = self.fusion.fuse(&snapshot.indices);
        let detected = snapshot.face_detected || snapshot.pose_detected;
        self.latest = Some(LatestSample {
            at: snapshot.timestamp,
            weighted_tiredness: detected.then_some(weighted_tiredness),
        });

        let mut warnings = Vec::new();
        if self.active.is_none() {
            self.accumulator.add(&snapshot.indices);
            self.ticks_analyzed += 1;
            warnings = self.warnings.check(&snapshot);
        }
        let trigger = self
            .trigger
            .tick(snapshot.timestamp, weighted_tiredness, &snapshot.indices);

        TickReport {
            snapshot,
            weighted_tiredness,
            trigger,
            warnings,
        }
    }

    /// Alertness sample for a break tick at `now`, from the latest frame
    pub fn break_sample(&self, now: Seconds) -> AlertSample {
        match self.latest {
            Some(latest) if now - latest.at <= self.config.breaks.sample_max_age_seconds => {
                match latest.weighted_tiredness {
                    Some(tiredness) => AlertSample::Tiredness(tiredness),
                    None => AlertSample::Failed,
                }
            }
            _ => AlertSample::Skipped,
        }
    }

    /// Enter a break for `event`. Input is suppressed only if `blocker` is
    /// given and grants the grab; a refused grab runs the break unblocked.
    pub fn begin_break(
        &mut self,
        event: &TriggerEvent,
        now: Seconds,
        blocker: Option<SharedBlocker>,
    ) -> Result<BreakNotice, LoopError> {
        if self.active.is_some() {
            return Err(LoopError::BreakAlreadyActive);
        }
        let grab = blocker.and_then(|blocker| match InputGrab::acquire(blocker) {
            Ok(grab) => Some(grab),
            Err(e) => {
                warn!(error = %e, "input blocking unavailable, break runs unblocked");
                None
            }
        });
        let session = BreakSession::start(
            now,
            event.weighted_tiredness,
            self.state.scaler,
            event.dominant,
            self.trigger.threshold(),
            self.config.breaks.clone(),
            grab,
        );
        let notice = session.notice();
        self.trigger.set_break_active(true);
        self.record.breaks_triggered += 1;
        self.next_break_tick = Some(now + self.config.breaks.sample_interval_seconds);
        self.active = Some(ActiveBreak {
            session,
            event: event.clone(),
            started_at: Utc::now(),
        });
        Ok(notice)
    }

    /// Advance the active break to `now`. `None` when no break is active.
    pub fn break_tick(&mut self, now: Seconds) -> Option<BreakTick> {
        let sample = self.break_sample(now);
        let active = self.active.as_mut()?;
        let notice = active.session.tick(now, sample);
        if notice.phase != BreakPhase::Completed {
            self.next_break_tick = Some(now + self.config.breaks.sample_interval_seconds);
            return Some(BreakTick {
                notice,
                outcome: None,
            });
        }
        let outcome = self.finish_break();
        Some(BreakTick { notice, outcome })
    }

    /// Learn from, persist and log the completed break
    fn finish_break(&mut self) -> Option<BreakOutcome> {
        let mut active = self.active.take()?;
        self.next_break_tick = None;
        self.trigger.break_finished();
        self.record.total_break_seconds += active.session.elapsed();
        let outcome = active.session.take_outcome()?;

        if outcome.forced {
            debug!("forced break outcome not learned from");
        } else {
            self.state.scaler = self.scaler_learner.update_from(self.state.scaler, &outcome);
            if let Err(e) = self.store.save_state(&self.key, &self.state) {
                warn!(error = %e, "failed to persist learned scaler");
            }
        }

        let record = BreakEventRecord {
            session_id: self.record.id,
            started_at: active.started_at,
            duration: outcome.duration,
            indices: active.event.indices,
            dominant: active.event.dominant,
            weighted_tiredness: active.event.weighted_tiredness,
            alert_before: outcome.alert_before,
            drowsy_after: outcome.drowsy_after,
            became_alert_at: outcome.became_alert_at,
            forced: outcome.forced,
        };
        if let Err(e) = self.store.append_break_event(&record) {
            warn!(error = %e, "failed to log break event");
        }
        Some(outcome)
    }

    /// Drive one frame through the loop, running every countdown tick due by
    /// the frame's timestamp.
    pub fn step(
        &mut self,
        frame: &LandmarkFrame,
        presenter: &mut impl Presenter,
        blocker: Option<SharedBlocker>,
    ) -> Result<TickReport, LoopError> {
        let now = frame.timestamp;
        let report = self.process_frame(frame);
        presenter.snapshot(&report.snapshot, report.weighted_tiredness);
        for warning in &report.warnings {
            presenter.warning(warning);
        }

        if let Some(event) = report.trigger.as_ref() {
            let duration = self.planned_duration(event);
            let blocker = if presenter.break_begin(event, duration) {
                blocker
            } else {
                warn!("break not acknowledged, running without input blocking");
                None
            };
            let notice = self.begin_break(event, now, blocker)?;
            presenter.break_progress(&notice);
        }

        while let Some(due) = self.next_break_tick.filter(|due| *due <= now) {
            let Some(tick) = self.break_tick(due) else {
                break;
            };
            presenter.break_progress(&tick.notice);
            if let Some(outcome) = tick.outcome.as_ref() {
                presenter.break_completed(outcome);
            }
        }
        Ok(report)
    }

    /// Tear down: force-complete any active break, learn weights, persist.
    pub fn end(mut self, now: Seconds) -> Result<SessionSummary, LoopError> {
        if let Some(active) = self.active.as_mut() {
            active.session.force_complete(now);
            self.finish_break();
        }

        let weights_after = self
            .weight_learner
            .learn(&self.state.weights, &self.accumulator);
        self.state.weights = weights_after;
        self.state.session_count = self.state.session_count.saturating_add(1);
        self.store.save_state(&self.key, &self.state)?;

        self.record.ended_at = Some(Utc::now());
        self.store.record_session(&self.record)?;
        info!(
            session = %self.record.id,
            breaks = self.record.breaks_triggered,
            total_break_seconds = self.record.total_break_seconds,
            scaler = self.state.scaler,
            "monitoring session ended"
        );

        Ok(SessionSummary {
            record: self.record.clone(),
            weights_before: self.weights_before,
            weights_after,
            scaler: self.state.scaler,
            session_count: self.state.session_count,
            ticks_analyzed: self.ticks_analyzed,
        })
    }
}
