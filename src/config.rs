//! Configuration for the control loop
//!
//! Every tunable constant lives here. A TOML file only needs the keys it wants
//! to change; missing sections and keys fall back to the defaults below.
//!
//! ```toml
//! [trigger]
//! threshold = 0.35
//!
//! [learning]
//! learning_rate = 0.1
//! ```

use crate::error::LoopError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub trigger: TriggerConfig,
    pub breaks: BreakConfig,
    pub learning: LearningConfig,
    pub calibration: CalibrationConfig,
    pub indices: IndicesConfig,
    pub monitor: MonitorConfig,
}

/// Hysteresis trigger settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Weighted tiredness at or above which dwell time accumulates
    pub threshold: f64,
    /// Continuous time above threshold before a break fires
    pub dwell_seconds: f64,
    /// Minimum spacing between fired triggers
    pub cooldown_seconds: f64,
    /// Trailing window used to pick the dominant index
    pub dominance_window_seconds: f64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            threshold: 0.30,
            dwell_seconds: 4.0,
            cooldown_seconds: 60.0,
            dominance_window_seconds: 10.0,
        }
    }
}

/// Break state machine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakConfig {
    /// Continuous below-threshold run required after an over-tired countdown
    pub alert_confirm_seconds: f64,
    /// Lower bound on break duration
    pub min_break_seconds: f64,
    /// Countdown tick / alertness sampling period
    pub sample_interval_seconds: f64,
    /// Older samples count as not ready
    pub sample_max_age_seconds: f64,
    /// How long to wait for the presentation layer to acknowledge a break
    pub ack_timeout_seconds: f64,
    /// Stale-sample run after the countdown that completes the break
    pub max_stale_seconds: f64,
}

impl Default for BreakConfig {
    fn default() -> Self {
        Self {
            alert_confirm_seconds: 10.0,
            min_break_seconds: 30.0,
            sample_interval_seconds: 1.0,
            sample_max_age_seconds: 2.0,
            ack_timeout_seconds: 5.0,
            max_stale_seconds: 10.0,
        }
    }
}

/// Scaler and weight learning settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub scaler_min: f64,
    pub scaler_max: f64,
    /// Scaler for a (task, subject) with no history
    pub default_scaler: f64,
    pub learning_rate: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            scaler_min: 50.0,
            scaler_max: 600.0,
            default_scaler: 300.0,
            learning_rate: 0.15,
        }
    }
}

/// Reference-to-frame alignment settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Max RMS anchor residual (normalized coordinates) for accepting the
    /// subject's reference geometry
    pub residual_threshold: f64,
    /// Max descriptor distance for recognising an enrolled subject
    pub subject_match_distance: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            residual_threshold: 0.03,
            subject_match_distance: 0.05,
        }
    }
}

/// Detector constants for the four indices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicesConfig {
    /// Relative EAR drop that saturates the drowsiness score
    pub ear_drop_saturation: f64,
    pub ear_history_seconds: f64,
    pub closure_close_ear: f64,
    pub closure_open_ear: f64,
    pub closure_min_seconds: f64,
    pub closure_full_severity_seconds: f64,
    pub closure_window_seconds: f64,
    pub closure_event_weight: f64,
    pub closure_min_recency: f64,
    /// Share of the continuous EAR term when blending with closure events
    pub closure_current_share: f64,
    pub blink_open_ear: f64,
    pub blink_closed_ear: f64,
    pub blink_window_seconds: f64,
    /// Relative shoulder-ratio drop that saturates the slouch score
    pub slouch_saturation: f64,
    pub attention_window_seconds: f64,
    pub attention_recent_samples: usize,
    pub attention_recent_weight: f64,
    pub attention_gain: f64,
    pub yawn_start_mar: f64,
    pub yawn_end_mar: f64,
    pub yawn_min_seconds: f64,
    pub yawn_max_seconds: f64,
    pub yawn_window_seconds: f64,
    /// Yawns in the window that saturate the yawn score
    pub yawn_saturation_count: f64,
    pub mar_history_seconds: f64,
}

impl Default for IndicesConfig {
    fn default() -> Self {
        Self {
            ear_drop_saturation: 0.5,
            ear_history_seconds: 30.0,
            closure_close_ear: 0.18,
            closure_open_ear: 0.22,
            closure_min_seconds: 0.4,
            closure_full_severity_seconds: 1.5,
            closure_window_seconds: 60.0,
            closure_event_weight: 0.4,
            closure_min_recency: 0.3,
            closure_current_share: 0.7,
            blink_open_ear: 0.25,
            blink_closed_ear: 0.20,
            blink_window_seconds: 60.0,
            slouch_saturation: 0.30,
            attention_window_seconds: 15.0,
            attention_recent_samples: 5,
            attention_recent_weight: 0.7,
            attention_gain: 1.2,
            yawn_start_mar: 0.6,
            yawn_end_mar: 0.4,
            yawn_min_seconds: 0.5,
            yawn_max_seconds: 3.0,
            yawn_window_seconds: 60.0,
            yawn_saturation_count: 3.0,
            mar_history_seconds: 30.0,
        }
    }
}

/// Polling worker and warning settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    /// A single index at or above this value raises a warning
    pub warning_threshold: f64,
    /// Minimum spacing between warnings for the same index
    pub warning_cooldown_seconds: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            warning_threshold: 0.5,
            warning_cooldown_seconds: 60.0,
        }
    }
}

fn positive(name: &str, value: f64) -> Result<(), LoopError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(LoopError::Config(format!("{name} must be positive, got {value}")))
    }
}

fn unit(name: &str, value: f64) -> Result<(), LoopError> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(LoopError::Config(format!("{name} must be in (0, 1], got {value}")))
    }
}

impl LoopConfig {
    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoopError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading configuration");
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, LoopError> {
        let config: LoopConfig =
            toml::from_str(text).map_err(|e| LoopError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, LoopError> {
        toml::to_string_pretty(self).map_err(|e| LoopError::Config(e.to_string()))
    }

    /// Check ranges and threshold orderings
    pub fn validate(&self) -> Result<(), LoopError> {
        let t = &self.trigger;
        unit("trigger.threshold", t.threshold)?;
        positive("trigger.dwell_seconds", t.dwell_seconds)?;
        positive("trigger.cooldown_seconds", t.cooldown_seconds)?;
        positive("trigger.dominance_window_seconds", t.dominance_window_seconds)?;

        let b = &self.breaks;
        positive("breaks.alert_confirm_seconds", b.alert_confirm_seconds)?;
        positive("breaks.min_break_seconds", b.min_break_seconds)?;
        positive("breaks.sample_interval_seconds", b.sample_interval_seconds)?;
        positive("breaks.sample_max_age_seconds", b.sample_max_age_seconds)?;
        positive("breaks.ack_timeout_seconds", b.ack_timeout_seconds)?;
        positive("breaks.max_stale_seconds", b.max_stale_seconds)?;

        let l = &self.learning;
        positive("learning.scaler_min", l.scaler_min)?;
        positive("learning.scaler_max", l.scaler_max)?;
        if l.scaler_min >= l.scaler_max {
            return Err(LoopError::Config(format!(
                "learning.scaler_min ({}) must be below learning.scaler_max ({})",
                l.scaler_min, l.scaler_max
            )));
        }
        if !(l.scaler_min..=l.scaler_max).contains(&l.default_scaler) {
            return Err(LoopError::Config(format!(
                "learning.default_scaler must be within [{}, {}], got {}",
                l.scaler_min, l.scaler_max, l.default_scaler
            )));
        }
        if !(l.learning_rate.is_finite() && l.learning_rate > 0.0 && l.learning_rate < 1.0) {
            return Err(LoopError::Config(format!(
                "learning.learning_rate must be in (0, 1), got {}",
                l.learning_rate
            )));
        }

        positive("calibration.residual_threshold", self.calibration.residual_threshold)?;
        positive(
            "calibration.subject_match_distance",
            self.calibration.subject_match_distance,
        )?;

        let i = &self.indices;
        unit("indices.ear_drop_saturation", i.ear_drop_saturation)?;
        unit("indices.slouch_saturation", i.slouch_saturation)?;
        if i.closure_close_ear >= i.closure_open_ear {
            return Err(LoopError::Config(
                "indices.closure_close_ear must be below indices.closure_open_ear".into(),
            ));
        }
        if i.blink_closed_ear >= i.blink_open_ear {
            return Err(LoopError::Config(
                "indices.blink_closed_ear must be below indices.blink_open_ear".into(),
            ));
        }
        if i.yawn_end_mar >= i.yawn_start_mar {
            return Err(LoopError::Config(
                "indices.yawn_end_mar must be below indices.yawn_start_mar".into(),
            ));
        }
        if i.yawn_min_seconds > i.yawn_max_seconds {
            return Err(LoopError::Config(
                "indices.yawn_min_seconds must not exceed indices.yawn_max_seconds".into(),
            ));
        }
        positive("indices.ear_history_seconds", i.ear_history_seconds)?;
        positive("indices.mar_history_seconds", i.mar_history_seconds)?;
        positive("indices.closure_window_seconds", i.closure_window_seconds)?;
        positive("indices.closure_full_severity_seconds", i.closure_full_severity_seconds)?;
        positive("indices.blink_window_seconds", i.blink_window_seconds)?;
        positive("indices.attention_window_seconds", i.attention_window_seconds)?;
        positive("indices.yawn_window_seconds", i.yawn_window_seconds)?;
        positive("indices.yawn_saturation_count", i.yawn_saturation_count)?;
        unit("indices.closure_current_share", i.closure_current_share)?;
        unit("indices.attention_recent_weight", i.attention_recent_weight)?;
        if i.attention_recent_samples == 0 {
            return Err(LoopError::Config(
                "indices.attention_recent_samples must be at least 1".into(),
            ));
        }
        positive("indices.attention_gain", i.attention_gain)?;

        let m = &self.monitor;
        if m.poll_interval_ms == 0 {
            return Err(LoopError::Config(
                "monitor.poll_interval_ms must be positive".into(),
            ));
        }
        unit("monitor.warning_threshold", m.warning_threshold)?;
        positive("monitor.warning_cooldown_seconds", m.warning_cooldown_seconds)?;

        Ok(())
    }
}
