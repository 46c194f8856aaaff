//! Online adaptation of the break-duration scaler and the index weights
//!
//! The scaler moves once per break outcome; the weights move once per session.
//! Both learners clamp or normalize their output so a bad input can never
//! leave the valid range.

use crate::config::LearningConfig;
use crate::types::{BreakOutcome, IndexKind, IndexValues, PerIndex, Seconds, Weightages};
use tracing::info;

/// Multiplicative scaler updates from break outcomes
#[derive(Debug, Clone, PartialEq)]
pub struct ScalerLearner {
    learning_rate: f64,
    min: f64,
    max: f64,
}

impl Default for ScalerLearner {
    fn default() -> Self {
        Self::new(&LearningConfig::default())
    }
}

impl ScalerLearner {
    pub fn new(config: &LearningConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            min: config.scaler_min,
            max: config.scaler_max,
        }
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    pub fn clamp(&self, scaler: f64) -> f64 {
        if scaler.is_finite() {
            scaler.clamp(self.min, self.max)
        } else {
            self.min
        }
    }

    /// Shrink when the subject recovered early (more the earlier), grow when
    /// still tired at the end, otherwise keep.
    pub fn update(
        &self,
        current: f64,
        alert_before: bool,
        drowsy_after: bool,
        became_alert_at: Option<Seconds>,
        duration: Seconds,
    ) -> f64 {
        let updated = match became_alert_at {
            Some(at) if alert_before => {
                let progress = if duration > 0.0 && duration.is_finite() {
                    at / duration
                } else {
                    1.0
                };
                let rate = if progress < 0.3 {
                    self.learning_rate * 1.5
                } else if progress < 0.6 {
                    self.learning_rate
                } else {
                    self.learning_rate * 0.5
                };
                current * (1.0 - rate)
            }
            _ if drowsy_after => current * (1.0 + self.learning_rate),
            _ => current,
        };
        self.clamp(updated)
    }

    pub fn update_from(&self, current: f64, outcome: &BreakOutcome) -> f64 {
        let updated = self.update(
            current,
            outcome.alert_before,
            outcome.drowsy_after,
            outcome.became_alert_at,
            outcome.duration,
        );
        info!(
            previous = current,
            updated,
            alert_before = outcome.alert_before,
            drowsy_after = outcome.drowsy_after,
            "scaler updated"
        );
        updated
    }
}

/// Running per-index sums over the ticks of one session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionIndexAccumulator {
    sums: PerIndex<f64>,
    samples: u64,
}

impl SessionIndexAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one tick; non-finite values count as 0
    pub fn add(&mut self, indices: &IndexValues) {
        for kind in IndexKind::ALL {
            let value = *indices.get(kind);
            if value.is_finite() {
                *self.sums.get_mut(kind) += value.clamp(0.0, 1.0);
            }
        }
        self.samples += 1;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn means(&self) -> Option<IndexValues> {
        if self.samples == 0 {
            return None;
        }
        let n = self.samples as f64;
        Some(self.sums.map(|&sum| sum / n))
    }

    /// Each index's mean over the sum of all four means. `None` without
    /// samples or when every mean is 0.
    pub fn shares(&self) -> Option<IndexValues> {
        let means = self.means()?;
        let total = means.sum();
        if total <= f64::EPSILON {
            return None;
        }
        Some(means.map(|&m| m / total))
    }
}

/// Low-pass blend of session dominance into stored weights
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WeightLearner;

impl WeightLearner {
    /// `(old + share) / 2`, renormalized
    pub fn blend(&self, old: &Weightages, shares: &IndexValues) -> Weightages {
        let old = old.normalized();
        let mut blended = IndexValues::default();
        for kind in IndexKind::ALL {
            let share = *shares.get(kind);
            let share = if share.is_finite() { share.max(0.0) } else { 0.0 };
            *blended.get_mut(kind) = (old.get(kind) + share) / 2.0;
        }
        Weightages::new(blended)
    }

    /// Blend from an accumulator; unchanged weights if it has nothing to say
    pub fn learn(&self, old: &Weightages, session: &SessionIndexAccumulator) -> Weightages {
        match session.shares() {
            Some(shares) => {
                let updated = self.blend(old, &shares);
                info!(?updated, samples = session.samples(), "weights updated");
                updated
            }
            None => old.normalized(),
        }
    }
}
