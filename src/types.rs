//! Core types for the Alertloop control loop
//!
//! This module defines the data structures that flow between stages:
//! per-index values, learned weightages, snapshots, break phases and outcomes,
//! and the records handed to the persistence collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Monotonic loop time in seconds, supplied by the caller
pub type Seconds = f64;

/// The four tiredness indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Drowsiness,
    Slouching,
    Attention,
    Yawn,
}

impl IndexKind {
    pub const ALL: [IndexKind; 4] = [
        IndexKind::Drowsiness,
        IndexKind::Slouching,
        IndexKind::Attention,
        IndexKind::Yawn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Drowsiness => "drowsiness",
            IndexKind::Slouching => "slouching",
            IndexKind::Attention => "attention",
            IndexKind::Yawn => "yawn",
        }
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per index, addressed by [`IndexKind`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerIndex<T> {
    pub drowsiness: T,
    pub slouching: T,
    pub attention: T,
    pub yawn: T,
}

impl<T> PerIndex<T> {
    pub fn splat(value: T) -> Self
    where
        T: Clone,
    {
        Self {
            drowsiness: value.clone(),
            slouching: value.clone(),
            attention: value.clone(),
            yawn: value,
        }
    }

    pub fn get(&self, kind: IndexKind) -> &T {
        match kind {
            IndexKind::Drowsiness => &self.drowsiness,
            IndexKind::Slouching => &self.slouching,
            IndexKind::Attention => &self.attention,
            IndexKind::Yawn => &self.yawn,
        }
    }

    pub fn get_mut(&mut self, kind: IndexKind) -> &mut T {
        match kind {
            IndexKind::Drowsiness => &mut self.drowsiness,
            IndexKind::Slouching => &mut self.slouching,
            IndexKind::Attention => &mut self.attention,
            IndexKind::Yawn => &mut self.yawn,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (IndexKind, &T)> + '_ {
        IndexKind::ALL.iter().map(move |&kind| (kind, self.get(kind)))
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> PerIndex<U> {
        PerIndex {
            drowsiness: f(&self.drowsiness),
            slouching: f(&self.slouching),
            attention: f(&self.attention),
            yawn: f(&self.yawn),
        }
    }
}

impl PerIndex<f64> {
    pub fn sum(&self) -> f64 {
        self.iter().map(|(_, v)| *v).sum()
    }

    /// Index with the highest value; ties resolve in [`IndexKind::ALL`] order
    pub fn argmax(&self) -> IndexKind {
        let mut best = IndexKind::Drowsiness;
        let mut best_value = f64::NEG_INFINITY;
        for (kind, &value) in self.iter() {
            if value > best_value {
                best = kind;
                best_value = value;
            }
        }
        best
    }
}

/// Raw index values, each in [0, 1]
pub type IndexValues = PerIndex<f64>;

/// Learned per-index weights, scoped per (task, subject)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Weightages(PerIndex<f64>);

impl Default for Weightages {
    fn default() -> Self {
        Self::uniform()
    }
}

impl Weightages {
    /// Equal weight for every index
    pub fn uniform() -> Self {
        Weightages(PerIndex::splat(1.0 / IndexKind::ALL.len() as f64))
    }

    /// Build from raw weights; the result is normalized
    pub fn new(raw: PerIndex<f64>) -> Self {
        Weightages(raw).normalized()
    }

    pub fn get(&self, kind: IndexKind) -> f64 {
        *self.0.get(kind)
    }

    pub fn values(&self) -> &PerIndex<f64> {
        &self.0
    }

    /// Project onto the simplex: non-finite and negative weights become 0, the
    /// rest are scaled to sum to 1. An all-zero set falls back to uniform.
    pub fn normalized(&self) -> Self {
        let cleaned = self
            .0
            .map(|&w| if w.is_finite() && w > 0.0 { w } else { 0.0 });
        let total = cleaned.sum();
        if total <= f64::EPSILON {
            return Self::uniform();
        }
        Weightages(cleaned.map(|&w| w / total))
    }

    pub fn is_normalized(&self) -> bool {
        self.0.iter().all(|(_, w)| w.is_finite() && *w >= 0.0) && (self.0.sum() - 1.0).abs() < 1e-9
    }
}

/// Why an index value is not a fresh, fully-calibrated measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexFlag {
    NoReference,
    FaceNotDetected,
    PoseNotDetected,
    NoPostureReference,
    DegenerateEyeGeometry,
    DegenerateMouthGeometry,
    DegenerateShoulderGeometry,
    DegenerateGazeGeometry,
    HeadPoseFallback,
    CalibrationFallback,
    HeldFromHistory,
    MissingLandmark,
}

/// Per-frame diagnostic breakdown behind the four indices
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexDiagnostics {
    /// Current eye aspect ratio (both eyes averaged)
    pub ear: Option<f64>,
    /// Current EAR relative to the reference EAR
    pub ear_ratio: Option<f64>,
    /// EAR-drop score before the closure-event refinement
    pub eye_score: Option<f64>,
    /// Prolonged-closure event term (0-1)
    pub closure_event_term: f64,
    /// Prolonged closures retained in the event window
    pub closure_events: usize,
    /// Blinks per minute over the blink window
    pub blinks_per_minute: f64,
    /// Current mouth aspect ratio
    pub mar: Option<f64>,
    /// Yawns retained in the event window
    pub yawn_events: usize,
    /// Current nose-to-shoulder ratio
    pub shoulder_ratio: Option<f64>,
    /// Latest gaze deviation sample (0-1)
    pub gaze_deviation: Option<f64>,
    /// Samples in the attention window
    pub attention_samples: usize,
    /// RMS residual of the reference-to-frame anchor fit
    pub alignment_error: Option<f64>,
    /// Whether the subject's own reference geometry was used this frame
    pub used_reference_mapping: bool,
}

/// The four indices for one analyzed frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub timestamp: Seconds,
    pub indices: IndexValues,
    /// False where the value is a fallback rather than a measurement
    pub valid: PerIndex<bool>,
    pub face_detected: bool,
    pub pose_detected: bool,
    pub flags: Vec<IndexFlag>,
    pub diagnostics: IndexDiagnostics,
}

impl IndexSnapshot {
    /// All-zero snapshot, used when no reference profile is installed
    pub fn empty(timestamp: Seconds, flag: IndexFlag) -> Self {
        Self {
            timestamp,
            indices: IndexValues::default(),
            valid: PerIndex::splat(false),
            face_detected: false,
            pose_detected: false,
            flags: vec![flag],
            diagnostics: IndexDiagnostics::default(),
        }
    }

    pub fn has_flag(&self, flag: IndexFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// Lifecycle phase of a break
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakPhase {
    Idle,
    Running,
    WaitingForAlert,
    Completed,
}

impl BreakPhase {
    /// Running or waiting for alertness confirmation
    pub fn is_active(&self) -> bool {
        matches!(self, BreakPhase::Running | BreakPhase::WaitingForAlert)
    }
}

/// How a break ended, consumed once by the learners
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakOutcome {
    pub alert_before: bool,
    pub drowsy_after: bool,
    pub became_alert_at: Option<Seconds>,
    pub duration: Seconds,
    /// Completed by teardown rather than by the state machine
    pub forced: bool,
}

/// One alertness sample taken during a break
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AlertSample {
    /// Fresh weighted tiredness
    Tiredness(f64),
    /// The sample was not ready in time; ignored for this tick
    Skipped,
    /// The vision pipeline produced no usable measurement
    Failed,
}

/// Phase-change and countdown notification for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakNotice {
    pub phase: BreakPhase,
    pub reason: IndexKind,
    pub duration: Seconds,
    pub elapsed: Seconds,
    /// Countdown seconds left while running
    pub remaining: Seconds,
    /// Seconds of continuous alertness still required while waiting
    pub alert_confirm_remaining: Option<Seconds>,
}

/// Informational warning for a single elevated index
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexWarning {
    pub kind: IndexKind,
    pub value: f64,
    pub at: Seconds,
}

/// Persistence key: learned state is scoped per (task, subject)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub task: String,
    pub subject: String,
}

impl StateKey {
    pub fn new(task: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            subject: subject.into(),
        }
    }

    pub fn storage_key(&self) -> String {
        format!("{}::{}", self.task, self.subject)
    }
}

/// Learned state for one (task, subject)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearnedState {
    pub weights: Weightages,
    pub scaler: f64,
    pub session_count: u32,
}

impl LearnedState {
    pub fn initial(default_scaler: f64) -> Self {
        Self {
            weights: Weightages::uniform(),
            scaler: default_scaler,
            session_count: 0,
        }
    }

    /// Normalized weights and a scaler clamped to `[min, max]`; a non-finite
    /// scaler resets to `fallback`
    pub fn sanitized(&self, min: f64, max: f64, fallback: f64) -> Self {
        let scaler = if self.scaler.is_finite() {
            self.scaler.clamp(min, max)
        } else {
            fallback.clamp(min, max)
        };
        Self {
            weights: self.weights.normalized(),
            scaler,
            session_count: self.session_count,
        }
    }
}

/// Append-only break-event log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakEventRecord {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Seconds,
    pub indices: IndexValues,
    pub dominant: IndexKind,
    pub weighted_tiredness: f64,
    pub alert_before: bool,
    pub drowsy_after: bool,
    pub became_alert_at: Option<Seconds>,
    pub forced: bool,
}

/// Session start/end record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub task: String,
    pub subject: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub breaks_triggered: u32,
    pub total_break_seconds: f64,
}

/// What a finished session learned and recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub record: SessionRecord,
    pub weights_before: Weightages,
    pub weights_after: Weightages,
    pub scaler: f64,
    pub session_count: u32,
    pub ticks_analyzed: u64,
}
