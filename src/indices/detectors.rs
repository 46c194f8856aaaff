//! Rolling-window event detectors
//!
//! Each detector owns its own [`TemporalWindow`] and is advanced with
//! `(now, measurement)` pairs. None of them read a clock.

use crate::config::IndicesConfig;
use crate::types::Seconds;
use crate::window::TemporalWindow;

/// Prolonged eye-closure detector (microsleeps, not blinks)
#[derive(Debug, Clone)]
pub struct EyeClosureDetector {
    close_ear: f64,
    open_ear: f64,
    min_duration: Seconds,
    full_severity: Seconds,
    event_weight: f64,
    min_recency: f64,
    closed_since: Option<Seconds>,
    /// Recorded closures: (end time, duration)
    events: TemporalWindow<Seconds>,
}

impl EyeClosureDetector {
    pub fn new(config: &IndicesConfig) -> Self {
        Self {
            close_ear: config.closure_close_ear,
            open_ear: config.closure_open_ear,
            min_duration: config.closure_min_seconds,
            full_severity: config.closure_full_severity_seconds,
            event_weight: config.closure_event_weight,
            min_recency: config.closure_min_recency,
            closed_since: None,
            events: TemporalWindow::new(config.closure_window_seconds),
        }
    }

    /// Feed one EAR sample. Returns the duration of a closure recorded on
    /// this sample, if any.
    pub fn update(&mut self, now: Seconds, ear: f64) -> Option<Seconds> {
        let mut recorded = None;
        match self.closed_since {
            None if ear < self.close_ear => self.closed_since = Some(now),
            Some(since) if ear >= self.open_ear => {
                let duration = now - since;
                if duration >= self.min_duration {
                    self.events.push(now, duration);
                    recorded = Some(duration);
                }
                self.closed_since = None;
            }
            _ => {}
        }
        self.events.evict(now);
        recorded
    }

    pub fn is_closed(&self) -> bool {
        self.closed_since.is_some()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Recency-weighted severity of retained closures, in [0, 1]
    pub fn event_term(&mut self, now: Seconds) -> f64 {
        self.events.evict(now);
        let horizon = self.events.horizon();
        let total: f64 = self
            .events
            .iter()
            .map(|(ended_at, duration)| {
                let age = now - ended_at;
                let recency = (1.0 - age / horizon).max(self.min_recency);
                let severity = (duration / self.full_severity).min(1.0);
                severity * recency * self.event_weight
            })
            .sum();
        total.min(1.0)
    }
}

/// Discrete yawn detector on mouth aspect ratio
#[derive(Debug, Clone)]
pub struct YawnDetector {
    start_mar: f64,
    end_mar: f64,
    min_duration: Seconds,
    max_duration: Seconds,
    saturation_count: f64,
    yawning_since: Option<Seconds>,
    events: TemporalWindow<Seconds>,
}

impl YawnDetector {
    pub fn new(config: &IndicesConfig) -> Self {
        Self {
            start_mar: config.yawn_start_mar,
            end_mar: config.yawn_end_mar,
            min_duration: config.yawn_min_seconds,
            max_duration: config.yawn_max_seconds,
            saturation_count: config.yawn_saturation_count,
            yawning_since: None,
            events: TemporalWindow::new(config.yawn_window_seconds),
        }
    }

    /// Feed one MAR sample. Returns true when a yawn was counted.
    pub fn update(&mut self, now: Seconds, mar: f64) -> bool {
        let mut counted = false;
        match self.yawning_since {
            None if mar > self.start_mar => self.yawning_since = Some(now),
            Some(since) if mar < self.end_mar => {
                let duration = now - since;
                if (self.min_duration..=self.max_duration).contains(&duration) {
                    self.events.push(now, duration);
                    counted = true;
                }
                self.yawning_since = None;
            }
            _ => {}
        }
        self.events.evict(now);
        counted
    }

    pub fn is_yawning(&self) -> bool {
        self.yawning_since.is_some()
    }

    pub fn count(&mut self, now: Seconds) -> usize {
        self.events.evict(now);
        self.events.len()
    }

    /// Yawns in the window over the saturation count, capped at 1
    pub fn index(&mut self, now: Seconds) -> f64 {
        (self.count(now) as f64 / self.saturation_count).min(1.0)
    }
}

/// Open-to-closed blink counter
#[derive(Debug, Clone)]
pub struct BlinkCounter {
    open_ear: f64,
    closed_ear: f64,
    armed: bool,
    blinks: TemporalWindow<()>,
}

impl BlinkCounter {
    pub fn new(config: &IndicesConfig) -> Self {
        Self {
            open_ear: config.blink_open_ear,
            closed_ear: config.blink_closed_ear,
            armed: false,
            blinks: TemporalWindow::new(config.blink_window_seconds),
        }
    }

    pub fn update(&mut self, now: Seconds, ear: f64) -> bool {
        let mut blinked = false;
        if ear > self.open_ear {
            self.armed = true;
        } else if self.armed && ear < self.closed_ear {
            self.blinks.push(now, ());
            self.armed = false;
            blinked = true;
        }
        self.blinks.evict(now);
        blinked
    }

    pub fn per_minute(&mut self, now: Seconds) -> f64 {
        self.blinks.evict(now);
        self.blinks.len() as f64 * 60.0 / self.blinks.horizon()
    }
}

/// Rolling gaze-deviation tracker
#[derive(Debug, Clone)]
pub struct AttentionTracker {
    recent_samples: usize,
    recent_weight: f64,
    gain: f64,
    samples: TemporalWindow<f64>,
}

impl AttentionTracker {
    pub fn new(config: &IndicesConfig) -> Self {
        Self {
            recent_samples: config.attention_recent_samples,
            recent_weight: config.attention_recent_weight,
            gain: config.attention_gain,
            samples: TemporalWindow::new(config.attention_window_seconds),
        }
    }

    pub fn push(&mut self, now: Seconds, deviation: f64) {
        self.samples.push(now, deviation.clamp(0.0, 1.0));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Recent-weighted mean of the window, amplified and capped at 1.
    /// `None` when the window is empty.
    pub fn index(&mut self, now: Seconds) -> Option<f64> {
        self.samples.evict(now);
        let values: Vec<f64> = self.samples.values().copied().collect();
        if values.is_empty() {
            return None;
        }
        let blended = if values.len() > self.recent_samples {
            let split = values.len() - self.recent_samples;
            let (older, recent) = values.split_at(split);
            self.recent_weight * mean(recent) + (1.0 - self.recent_weight) * mean(older)
        } else {
            mean(&values)
        };
        Some((blended * self.gain).clamp(0.0, 1.0))
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}
