//! Break lifecycle
//!
//! A [`BreakSession`] runs `Running → {Completed | WaitingForAlert} → Completed`.
//! The full countdown always elapses; alertness seen early is recorded for the
//! learners but never shortens the break. Sampling failures let the break
//! finish rather than trap the user, and so does a sample stream that stays
//! stale for `max_stale_seconds` once the countdown is over.

use crate::config::BreakConfig;
use crate::error::LoopError;
use crate::ports::SharedBlocker;
use crate::types::{AlertSample, BreakNotice, BreakOutcome, BreakPhase, IndexKind, Seconds};
use std::sync::PoisonError;
use tracing::{debug, info, warn};

/// Slack for comparing accumulated tick times against durations
const TIME_EPSILON: f64 = 1e-9;

/// Exclusive input-blocking grab, released on every exit path
pub struct InputGrab {
    blocker: Option<SharedBlocker>,
}

impl std::fmt::Debug for InputGrab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputGrab")
            .field("held", &self.is_held())
            .finish()
    }
}

impl InputGrab {
    /// Acquire the blocker; fails if the blocker refuses
    pub fn acquire(blocker: SharedBlocker) -> Result<Self, LoopError> {
        blocker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .acquire()?;
        debug!("input blocking acquired");
        Ok(Self {
            blocker: Some(blocker),
        })
    }

    pub fn is_held(&self) -> bool {
        self.blocker.is_some()
    }

    /// Release once; later calls do nothing
    pub fn release(&mut self) {
        if let Some(blocker) = self.blocker.take() {
            blocker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .release();
            debug!("input blocking released");
        }
    }
}

impl Drop for InputGrab {
    fn drop(&mut self) {
        self.release();
    }
}

/// Break duration: `scaler × weighted_tiredness`, never below the minimum
pub fn break_duration(scaler: f64, weighted_tiredness: f64, min_break: Seconds) -> Seconds {
    let raw = scaler * weighted_tiredness;
    if raw.is_finite() {
        raw.max(min_break)
    } else {
        min_break
    }
}

/// One active break
#[derive(Debug)]
pub struct BreakSession {
    config: BreakConfig,
    threshold: f64,
    phase: BreakPhase,
    reason: IndexKind,
    started_at: Seconds,
    duration: Seconds,
    alert_before: bool,
    drowsy_after: bool,
    became_alert_at: Option<Seconds>,
    /// Start of the current continuous alert run while waiting
    alert_run_since: Option<Seconds>,
    /// Start of the current run of skipped samples after the countdown
    stale_since: Option<Seconds>,
    elapsed: Seconds,
    grab: Option<InputGrab>,
    outcome: Option<BreakOutcome>,
}

impl BreakSession {
    /// Enter `Running`. `grab` is held until the session completes.
    pub fn start(
        now: Seconds,
        weighted_tiredness: f64,
        scaler: f64,
        reason: IndexKind,
        threshold: f64,
        config: BreakConfig,
        grab: Option<InputGrab>,
    ) -> Self {
        let duration = break_duration(scaler, weighted_tiredness, config.min_break_seconds);
        info!(
            duration,
            scaler,
            weighted_tiredness,
            reason = %reason,
            input_blocked = grab.as_ref().is_some_and(InputGrab::is_held),
            "break started"
        );
        Self {
            config,
            threshold,
            phase: BreakPhase::Running,
            reason,
            started_at: now,
            duration,
            alert_before: false,
            drowsy_after: false,
            became_alert_at: None,
            alert_run_since: None,
            stale_since: None,
            elapsed: 0.0,
            grab,
            outcome: None,
        }
    }

    pub fn phase(&self) -> BreakPhase {
        self.phase
    }

    pub fn duration(&self) -> Seconds {
        self.duration
    }

    pub fn reason(&self) -> IndexKind {
        self.reason
    }

    pub fn started_at(&self) -> Seconds {
        self.started_at
    }

    pub fn elapsed(&self) -> Seconds {
        self.elapsed
    }

    pub fn became_alert_at(&self) -> Option<Seconds> {
        self.became_alert_at
    }

    pub fn is_input_blocked(&self) -> bool {
        self.grab.as_ref().is_some_and(InputGrab::is_held)
    }

    pub fn notice(&self) -> BreakNotice {
        let alert_confirm_remaining = match self.phase {
            BreakPhase::WaitingForAlert => Some(match self.alert_run_since {
                Some(since) => {
                    (self.config.alert_confirm_seconds - (self.elapsed - since)).max(0.0)
                }
                None => self.config.alert_confirm_seconds,
            }),
            _ => None,
        };
        BreakNotice {
            phase: self.phase,
            reason: self.reason,
            duration: self.duration,
            elapsed: self.elapsed,
            remaining: (self.duration - self.elapsed).max(0.0),
            alert_confirm_remaining,
        }
    }

    fn is_alert(&self, tiredness: f64) -> bool {
        tiredness < self.threshold
    }

    /// Extend the stale run; true once it has lasted `max_stale_seconds`
    fn stale_run_expired(&mut self) -> bool {
        let since = *self.stale_since.get_or_insert(self.elapsed);
        self.elapsed - since + TIME_EPSILON >= self.config.max_stale_seconds
    }

    fn complete_if_stale(&mut self) {
        if self.stale_run_expired() {
            warn!(
                stale_seconds = self.config.max_stale_seconds,
                "no fresh alertness samples, completing break"
            );
            self.complete(false);
        }
    }

    /// Advance the countdown to `now` with one alertness sample
    pub fn tick(&mut self, now: Seconds, sample: AlertSample) -> BreakNotice {
        if !self.phase.is_active() {
            return self.notice();
        }
        self.elapsed = (now - self.started_at).max(self.elapsed);
        if sample != AlertSample::Skipped {
            self.stale_since = None;
        }

        match self.phase {
            BreakPhase::Running if self.elapsed + TIME_EPSILON < self.duration => {
                if let AlertSample::Tiredness(tiredness) = sample {
                    if self.became_alert_at.is_none() && self.is_alert(tiredness) {
                        self.became_alert_at = Some(self.elapsed);
                        self.alert_before = true;
                        info!(elapsed = self.elapsed, "alert during break");
                    }
                }
            }
            BreakPhase::Running => match sample {
                AlertSample::Tiredness(tiredness) if self.is_alert(tiredness) => {
                    self.complete(false);
                }
                AlertSample::Tiredness(_) => {
                    self.drowsy_after = true;
                    self.phase = BreakPhase::WaitingForAlert;
                    info!(
                        confirm_seconds = self.config.alert_confirm_seconds,
                        "still tired after countdown, waiting for alertness"
                    );
                }
                AlertSample::Failed => {
                    warn!("alertness sampling failed at countdown end, completing break");
                    self.complete(false);
                }
                AlertSample::Skipped => self.complete_if_stale(),
            },
            BreakPhase::WaitingForAlert => match sample {
                AlertSample::Tiredness(tiredness) if self.is_alert(tiredness) => {
                    let since = *self.alert_run_since.get_or_insert(self.elapsed);
                    if self.elapsed - since + TIME_EPSILON >= self.config.alert_confirm_seconds {
                        self.complete(false);
                    }
                }
                AlertSample::Tiredness(_) => {
                    if self.alert_run_since.take().is_some() {
                        debug!("alert run interrupted");
                    }
                }
                AlertSample::Failed => {
                    warn!("alertness sampling failed while waiting, completing break");
                    self.complete(false);
                }
                AlertSample::Skipped => self.complete_if_stale(),
            },
            BreakPhase::Idle | BreakPhase::Completed => {}
        }
        self.notice()
    }

    fn complete(&mut self, forced: bool) {
        if let Some(grab) = self.grab.as_mut() {
            grab.release();
        }
        self.grab = None;
        self.phase = BreakPhase::Completed;
        let outcome = BreakOutcome {
            alert_before: self.alert_before,
            drowsy_after: self.drowsy_after,
            became_alert_at: self.became_alert_at,
            duration: self.duration,
            forced,
        };
        info!(
            elapsed = self.elapsed,
            alert_before = outcome.alert_before,
            drowsy_after = outcome.drowsy_after,
            forced,
            "break completed"
        );
        self.outcome = Some(outcome);
    }

    /// Teardown path: complete immediately if still active
    pub fn force_complete(&mut self, now: Seconds) -> Option<BreakOutcome> {
        if self.phase.is_active() {
            self.elapsed = (now - self.started_at).max(self.elapsed);
            self.complete(true);
        }
        self.outcome
    }

    /// The outcome, handed out once
    pub fn take_outcome(&mut self) -> Option<BreakOutcome> {
        self.outcome.take()
    }
}

impl Drop for BreakSession {
    fn drop(&mut self) {
        if self.phase.is_active() {
            warn!("break session dropped while active");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::testing::counting_blocker;
    use pretty_assertions::assert_eq;

    const THRESHOLD: f64 = 0.30;

    /// scaler 120 × tiredness 0.5 = a 60 second break
    fn sixty_second_break(grab: Option<InputGrab>) -> BreakSession {
        BreakSession::start(
            0.0,
            0.5,
            120.0,
            IndexKind::Drowsiness,
            THRESHOLD,
            BreakConfig::default(),
            grab,
        )
    }

    fn run_until(session: &mut BreakSession, from: u32, to: u32, tiredness: f64) {
        for t in from..=to {
            session.tick(t as f64, AlertSample::Tiredness(tiredness));
        }
    }

    #[test]
    fn test_duration_floor() {
        assert_eq!(break_duration(300.0, 0.05, 30.0), 30.0);
        assert_eq!(break_duration(300.0, 0.5, 30.0), 150.0);
        assert_eq!(break_duration(f64::NAN, 0.5, 30.0), 30.0);
    }

    #[test]
    fn test_alert_at_countdown_end_completes_directly() {
        let mut session = sixty_second_break(None);
        run_until(&mut session, 1, 59, 0.5);
        assert_eq!(session.phase(), BreakPhase::Running);

        let notice = session.tick(60.0, AlertSample::Tiredness(0.1));
        assert_eq!(notice.phase, BreakPhase::Completed);

        let outcome = session.take_outcome().unwrap();
        assert!(!outcome.drowsy_after);
        assert!(!outcome.alert_before);
        assert_eq!(outcome.duration, 60.0);
        assert!(session.take_outcome().is_none());
    }

    #[test]
    fn test_tired_at_countdown_end_waits_ten_seconds() {
        let mut session = sixty_second_break(None);
        run_until(&mut session, 1, 59, 0.5);
        assert_eq!(
            session.tick(60.0, AlertSample::Tiredness(0.5)).phase,
            BreakPhase::WaitingForAlert
        );

        run_until(&mut session, 61, 70, 0.1);
        assert_eq!(session.phase(), BreakPhase::WaitingForAlert);
        let notice = session.tick(71.0, AlertSample::Tiredness(0.1));
        assert_eq!(notice.phase, BreakPhase::Completed);

        let outcome = session.take_outcome().unwrap();
        assert!(outcome.drowsy_after);
    }

    #[test]
    fn test_tired_sample_resets_alert_run() {
        let mut session = sixty_second_break(None);
        run_until(&mut session, 1, 60, 0.5);
        run_until(&mut session, 61, 69, 0.1);
        session.tick(70.0, AlertSample::Tiredness(0.6));
        assert_eq!(
            session.notice().alert_confirm_remaining,
            Some(10.0)
        );

        run_until(&mut session, 71, 80, 0.1);
        assert_eq!(session.phase(), BreakPhase::WaitingForAlert);
        session.tick(81.0, AlertSample::Tiredness(0.1));
        assert_eq!(session.phase(), BreakPhase::Completed);
    }

    #[test]
    fn test_early_alertness_recorded_but_never_shortens() {
        let mut session = sixty_second_break(None);
        run_until(&mut session, 1, 9, 0.5);
        session.tick(10.0, AlertSample::Tiredness(0.1));
        assert_eq!(session.became_alert_at(), Some(10.0));

        run_until(&mut session, 11, 59, 0.1);
        assert_eq!(session.phase(), BreakPhase::Running);
        // A later tired sample does not move the first alert time
        session.tick(59.5, AlertSample::Tiredness(0.9));
        session.tick(60.0, AlertSample::Tiredness(0.1));

        let outcome = session.take_outcome().unwrap();
        assert!(outcome.alert_before);
        assert_eq!(outcome.became_alert_at, Some(10.0));
    }

    #[test]
    fn test_failed_sample_fails_open() {
        let mut session = sixty_second_break(None);
        session.tick(30.0, AlertSample::Failed);
        assert_eq!(session.phase(), BreakPhase::Running);
        session.tick(60.0, AlertSample::Failed);
        assert_eq!(session.phase(), BreakPhase::Completed);
        assert_eq!(session.take_outcome().unwrap().became_alert_at, None);

        let mut waiting = sixty_second_break(None);
        waiting.tick(60.0, AlertSample::Tiredness(0.8));
        waiting.tick(61.0, AlertSample::Failed);
        assert_eq!(waiting.phase(), BreakPhase::Completed);
    }

    #[test]
    fn test_skipped_sample_changes_nothing() {
        let mut session = sixty_second_break(None);
        session.tick(60.0, AlertSample::Skipped);
        assert_eq!(session.phase(), BreakPhase::Running);
        assert_eq!(session.notice().remaining, 0.0);
        session.tick(61.0, AlertSample::Tiredness(0.1));
        assert_eq!(session.phase(), BreakPhase::Completed);
    }

    #[test]
    fn test_stale_samples_complete_after_countdown() {
        let blocker = counting_blocker(false);
        let mut session =
            sixty_second_break(Some(InputGrab::acquire(blocker.clone()).unwrap()));
        // Skips during the countdown never start the stale run
        for t in 1..=69 {
            session.tick(t as f64, AlertSample::Skipped);
        }
        assert_eq!(session.phase(), BreakPhase::Running);
        assert!(session.is_input_blocked());

        let notice = session.tick(70.0, AlertSample::Skipped);
        assert_eq!(notice.phase, BreakPhase::Completed);
        let outcome = session.take_outcome().unwrap();
        assert!(!outcome.forced);
        assert_eq!(outcome.became_alert_at, None);
        assert_eq!(blocker.lock().unwrap().released, 1);
    }

    #[test]
    fn test_fresh_sample_restarts_stale_run_while_waiting() {
        let mut session = sixty_second_break(None);
        session.tick(60.0, AlertSample::Tiredness(0.8));
        assert_eq!(session.phase(), BreakPhase::WaitingForAlert);

        for t in 61..=68 {
            session.tick(t as f64, AlertSample::Skipped);
        }
        session.tick(69.0, AlertSample::Tiredness(0.8));
        for t in 70..=79 {
            session.tick(t as f64, AlertSample::Skipped);
        }
        assert_eq!(session.phase(), BreakPhase::WaitingForAlert);
        session.tick(80.0, AlertSample::Skipped);
        assert_eq!(session.phase(), BreakPhase::Completed);
        assert!(session.take_outcome().unwrap().drowsy_after);
    }

    #[test]
    fn test_grab_released_on_completion() {
        let blocker = counting_blocker(false);
        let grab = InputGrab::acquire(blocker.clone()).unwrap();
        let mut session = sixty_second_break(Some(grab));
        assert!(session.is_input_blocked());

        session.tick(60.0, AlertSample::Tiredness(0.1));
        assert!(!session.is_input_blocked());
        drop(session);

        let blocker = blocker.lock().unwrap();
        assert_eq!(blocker.acquired, 1);
        assert_eq!(blocker.released, 1);
    }

    #[test]
    fn test_grab_released_on_force_and_drop() {
        let blocker = counting_blocker(false);
        let mut session =
            sixty_second_break(Some(InputGrab::acquire(blocker.clone()).unwrap()));
        let outcome = session.force_complete(12.0).unwrap();
        assert!(outcome.forced);
        assert_eq!(blocker.lock().unwrap().released, 1);

        let dropped = sixty_second_break(Some(InputGrab::acquire(blocker.clone()).unwrap()));
        drop(dropped);
        assert_eq!(blocker.lock().unwrap().released, 2);
    }

    #[test]
    fn test_refused_grab_is_an_error() {
        let blocker = counting_blocker(true);
        assert!(InputGrab::acquire(blocker).is_err());
    }
}
