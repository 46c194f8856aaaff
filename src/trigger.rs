//! Hysteretic break trigger
//!
//! Weighted tiredness must stay at or above the threshold for the dwell time
//! before a break fires. Dropping below the threshold resets the dwell
//! immediately. Triggers are spaced by a cooldown measured from the previous
//! trigger, and nothing fires while a break is active.

use crate::config::TriggerConfig;
use crate::types::{IndexKind, IndexValues, Seconds};
use crate::window::TemporalWindow;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Dwell accumulator state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TriggerState {
    BelowThreshold,
    AboveThresholdAccumulating { since: Seconds },
}

/// A fired trigger: start a break
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub at: Seconds,
    /// Index with the highest raw value over the dominance window
    pub dominant: IndexKind,
    pub weighted_tiredness: f64,
    /// Raw indices on the firing tick
    pub indices: IndexValues,
    /// Per-index maxima over the dominance window
    pub peaks: IndexValues,
}

#[derive(Debug, Clone)]
pub struct TriggerController {
    config: TriggerConfig,
    state: TriggerState,
    last_trigger_at: Option<Seconds>,
    break_active: bool,
    recent: TemporalWindow<IndexValues>,
}

impl Default for TriggerController {
    fn default() -> Self {
        Self::new(TriggerConfig::default())
    }
}

impl TriggerController {
    pub fn new(config: TriggerConfig) -> Self {
        let recent = TemporalWindow::new(config.dominance_window_seconds);
        Self {
            config,
            state: TriggerState::BelowThreshold,
            last_trigger_at: None,
            break_active: false,
            recent,
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    pub fn last_trigger_at(&self) -> Option<Seconds> {
        self.last_trigger_at
    }

    pub fn is_break_active(&self) -> bool {
        self.break_active
    }

    /// Suspend or resume triggering; suspending resets the accumulator
    pub fn set_break_active(&mut self, active: bool) {
        self.break_active = active;
        if active {
            self.state = TriggerState::BelowThreshold;
        }
    }

    /// The active break has completed
    pub fn break_finished(&mut self) {
        self.set_break_active(false);
    }

    fn cooldown_elapsed(&self, now: Seconds) -> bool {
        self.last_trigger_at
            .map_or(true, |last| now - last >= self.config.cooldown_seconds)
    }

    /// Per-index maxima over the trailing dominance window
    pub fn peaks(&self) -> IndexValues {
        let mut peaks = IndexValues::default();
        for values in self.recent.values() {
            for kind in IndexKind::ALL {
                let value = *values.get(kind);
                let peak = peaks.get_mut(kind);
                if value.is_finite() && value > *peak {
                    *peak = value;
                }
            }
        }
        peaks
    }

    /// Advance one tick. Returns a trigger when a break should start.
    pub fn tick(
        &mut self,
        now: Seconds,
        weighted_tiredness: f64,
        indices: &IndexValues,
    ) -> Option<TriggerEvent> {
        self.recent.push(now, *indices);

        if self.break_active {
            self.state = TriggerState::BelowThreshold;
            return None;
        }

        let above = weighted_tiredness.is_finite() && weighted_tiredness >= self.config.threshold;
        if !above {
            if let TriggerState::AboveThresholdAccumulating { since } = self.state {
                debug!(dwell = now - since, "tiredness dropped below threshold");
            }
            self.state = TriggerState::BelowThreshold;
            return None;
        }

        let since = match self.state {
            TriggerState::BelowThreshold => {
                self.state = TriggerState::AboveThresholdAccumulating { since: now };
                now
            }
            TriggerState::AboveThresholdAccumulating { since } => since,
        };

        if now - since < self.config.dwell_seconds || !self.cooldown_elapsed(now) {
            return None;
        }

        let peaks = self.peaks();
        let event = TriggerEvent {
            at: now,
            dominant: peaks.argmax(),
            weighted_tiredness,
            indices: *indices,
            peaks,
        };
        info!(
            at = now,
            dominant = %event.dominant,
            weighted_tiredness,
            "break triggered"
        );
        self.state = TriggerState::BelowThreshold;
        self.last_trigger_at = Some(now);
        self.break_active = true;
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PerIndex;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn indices(drowsiness: f64, yawn: f64) -> IndexValues {
        PerIndex {
            drowsiness,
            slouching: 0.0,
            attention: 0.0,
            yawn,
        }
    }

    /// Feed `value` every 50ms over `[from, to)` and collect triggers
    fn run(
        controller: &mut TriggerController,
        from: Seconds,
        to: Seconds,
        value: f64,
    ) -> Vec<TriggerEvent> {
        let mut fired = Vec::new();
        let mut step = 0;
        loop {
            let now = from + step as f64 * 0.05;
            if now >= to {
                break;
            }
            if let Some(event) = controller.tick(now, value, &indices(value, 0.0)) {
                fired.push(event);
            }
            step += 1;
        }
        fired
    }

    #[test]
    fn test_fires_after_dwell() {
        let mut controller = TriggerController::default();
        assert!(controller.tick(0.0, 0.5, &indices(0.5, 0.0)).is_none());
        assert!(controller.tick(3.9, 0.5, &indices(0.5, 0.0)).is_none());
        let event = controller.tick(4.0, 0.5, &indices(0.5, 0.0)).unwrap();
        assert_eq!(event.at, 4.0);
        assert_eq!(event.dominant, IndexKind::Drowsiness);
        assert!(controller.is_break_active());
        assert_eq!(controller.state(), TriggerState::BelowThreshold);
    }

    #[test]
    fn test_drop_resets_dwell() {
        let mut controller = TriggerController::default();
        controller.tick(0.0, 0.5, &indices(0.5, 0.0));
        controller.tick(3.0, 0.1, &indices(0.1, 0.0));
        assert_eq!(controller.state(), TriggerState::BelowThreshold);
        controller.tick(3.5, 0.5, &indices(0.5, 0.0));
        assert!(controller.tick(7.0, 0.5, &indices(0.5, 0.0)).is_none());
        assert!(controller.tick(7.5, 0.5, &indices(0.5, 0.0)).is_some());
    }

    #[test]
    fn test_suspended_while_break_active() {
        let mut controller = TriggerController::default();
        controller.set_break_active(true);
        assert!(run(&mut controller, 0.0, 100.0, 0.9).is_empty());
        assert_eq!(controller.state(), TriggerState::BelowThreshold);
    }

    #[test]
    fn test_cooldown_from_last_trigger() {
        let mut controller = TriggerController::default();
        let first = run(&mut controller, 0.0, 5.0, 0.9);
        assert_eq!(first.len(), 1);
        let fired_at = first[0].at;

        // Break ends quickly; tiredness stays high
        controller.break_finished();
        let second = run(&mut controller, 5.0, 120.0, 0.9);
        assert_eq!(second.len(), 1);
        assert!(second[0].at - fired_at >= 60.0);
    }

    #[test]
    fn test_dominant_uses_window_peak() {
        let mut controller = TriggerController::default();
        controller.tick(0.0, 0.4, &indices(0.3, 0.9));
        controller.tick(2.0, 0.4, &indices(0.5, 0.2));
        let event = controller.tick(4.0, 0.4, &indices(0.5, 0.2)).unwrap();
        assert_eq!(event.dominant, IndexKind::Yawn);
        assert_eq!(event.peaks.yawn, 0.9);
    }

    #[test]
    fn test_dominant_ignores_samples_outside_window() {
        let mut controller = TriggerController::default();
        controller.tick(0.0, 0.1, &indices(0.0, 1.0));
        controller.tick(11.0, 0.4, &indices(0.5, 0.0));
        let event = controller.tick(15.0, 0.4, &indices(0.5, 0.0)).unwrap();
        assert_eq!(event.dominant, IndexKind::Drowsiness);
    }

    proptest! {
        #[test]
        fn test_never_fires_twice_within_cooldown(
            values in proptest::collection::vec(0.0f64..1.0, 100..2000),
            break_every in 1usize..50,
        ) {
            let mut controller = TriggerController::default();
            let mut last: Option<Seconds> = None;
            for (i, value) in values.iter().enumerate() {
                let now = i as f64 * 0.25;
                if i % break_every == 0 {
                    controller.break_finished();
                }
                if let Some(event) = controller.tick(now, *value, &indices(*value, 0.0)) {
                    if let Some(previous) = last {
                        prop_assert!(event.at - previous >= 60.0);
                    }
                    last = Some(event.at);
                }
            }
        }

        #[test]
        fn test_never_fires_during_break(
            values in proptest::collection::vec(0.0f64..1.0, 10..500),
        ) {
            let mut controller = TriggerController::default();
            controller.set_break_active(true);
            for (i, value) in values.iter().enumerate() {
                prop_assert!(controller.tick(i as f64, *value, &indices(*value, 0.0)).is_none());
            }
        }
    }
}
