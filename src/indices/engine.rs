//! Per-frame index computation
//!
//! [`IndexEngine`] owns the subject's reference profile and every rolling
//! window. Each feature is computed in its own scope: a failure there zeroes
//! that index, clears its validity bit and adds a flag, but never aborts the
//! frame.

use crate::calibration::{LandmarkCalibrator, ReferenceMapping, ReferenceProfile};
use crate::config::{IndicesConfig, LoopConfig};
use crate::error::LoopError;
use crate::indices::detectors::{AttentionTracker, BlinkCounter, EyeClosureDetector, YawnDetector};
use crate::indices::geometry::{self, EyePoints, MouthPoints};
use crate::landmarks::{FaceLandmark, LandmarkFrame, LandmarkSet, PoseLandmark};
use crate::types::{
    IndexDiagnostics, IndexFlag, IndexKind, IndexSnapshot, IndexValues, PerIndex, Seconds,
};
use crate::window::TemporalWindow;
use tracing::debug;

/// Rolling state, split from the reference so both can be borrowed at once
#[derive(Debug, Clone)]
struct Detectors {
    config: IndicesConfig,
    ear_history: TemporalWindow<f64>,
    mar_history: TemporalWindow<f64>,
    closure: EyeClosureDetector,
    yawns: YawnDetector,
    blinks: BlinkCounter,
    attention: AttentionTracker,
}

impl Detectors {
    fn new(config: &IndicesConfig) -> Self {
        Self {
            config: config.clone(),
            ear_history: TemporalWindow::new(config.ear_history_seconds),
            mar_history: TemporalWindow::new(config.mar_history_seconds),
            closure: EyeClosureDetector::new(config),
            yawns: YawnDetector::new(config),
            blinks: BlinkCounter::new(config),
            attention: AttentionTracker::new(config),
        }
    }

    fn drowsiness(
        &mut self,
        now: Seconds,
        face: &LandmarkSet<FaceLandmark>,
        mapping: Option<&ReferenceMapping>,
        profile: &ReferenceProfile,
        diag: &mut IndexDiagnostics,
    ) -> Result<f64, LoopError> {
        let mut left = EyePoints::from_face(face, FaceLandmark::LEFT_EYE)?;
        let mut right = EyePoints::from_face(face, FaceLandmark::RIGHT_EYE)?;
        if let (Some(m), Some(ref_left), Some(ref_right)) =
            (mapping, profile.left_eye.as_ref(), profile.right_eye.as_ref())
        {
            left = m.refine_eye(left, ref_left);
            right = m.refine_eye(right, ref_right);
        }

        let ear = geometry::mean_eye_aspect_ratio(&left, &right)?;
        diag.ear = Some(ear);
        self.ear_history.push(now, ear);
        self.closure.update(now, ear);
        self.blinks.update(now, ear);

        let reference_ear = profile.ear.ok_or(LoopError::MissingLandmark("reference_ear"))?;
        let base = geometry::ear_drop_score(ear, reference_ear, self.config.ear_drop_saturation)?;
        diag.ear_ratio = Some(ear / reference_ear);
        diag.eye_score = Some(base);

        let event = self.closure.event_term(now);
        diag.closure_event_term = event;
        let share = self.config.closure_current_share;
        let blended = (share * base + (1.0 - share) * event).min(1.0);
        Ok(base.max(blended))
    }

    fn slouching(
        &mut self,
        pose: &LandmarkSet<PoseLandmark>,
        reference_ratio: f64,
        diag: &mut IndexDiagnostics,
    ) -> Result<f64, LoopError> {
        let [nose, left, right] = pose.require_all([
            PoseLandmark::Nose,
            PoseLandmark::LeftShoulder,
            PoseLandmark::RightShoulder,
        ])?;
        let ratio = geometry::shoulder_ratio(nose, left, right)?;
        diag.shoulder_ratio = Some(ratio);
        geometry::slouch_score(ratio, reference_ratio, self.config.slouch_saturation)
    }

    /// Push one attention sample: iris gaze, or head pose when the iris is
    /// unusable. Returns whether the head-pose fallback was used.
    fn attention_sample(
        &mut self,
        now: Seconds,
        face: &LandmarkSet<FaceLandmark>,
        diag: &mut IndexDiagnostics,
    ) -> Result<bool, LoopError> {
        let gaze = (|| {
            let left = EyePoints::from_face(face, FaceLandmark::LEFT_EYE)?;
            let right = EyePoints::from_face(face, FaceLandmark::RIGHT_EYE)?;
            let left_iris = face.require(FaceLandmark::LeftIris)?;
            let right_iris = face.require(FaceLandmark::RightIris)?;
            geometry::gaze_deviation(&left, &right, left_iris, right_iris)
        })();

        let (deviation, fallback) = match gaze {
            Ok(deviation) => (deviation, false),
            Err(gaze_error) => {
                debug!(error = %gaze_error, "iris gaze unavailable, using head pose");
                let pose = geometry::head_pose_from_face(face)?;
                (pose.deviation(), true)
            }
        };
        diag.gaze_deviation = Some(deviation);
        self.attention.push(now, deviation);
        Ok(fallback)
    }

    fn mouth_sample(
        &mut self,
        now: Seconds,
        face: &LandmarkSet<FaceLandmark>,
        mapping: Option<&ReferenceMapping>,
        profile: &ReferenceProfile,
        diag: &mut IndexDiagnostics,
    ) -> Result<(), LoopError> {
        let mut mouth = MouthPoints::from_face(face)?;
        if let (Some(m), Some(reference)) = (mapping, profile.mouth.as_ref()) {
            mouth = m.refine_mouth(mouth, reference);
        }
        let mar = geometry::mouth_aspect_ratio(&mouth)?;
        diag.mar = Some(mar);
        self.mar_history.push(now, mar);
        self.yawns.update(now, mar);
        Ok(())
    }
}

/// Accumulates one frame's values, validity bits and flags
struct FrameOutput {
    indices: IndexValues,
    valid: PerIndex<bool>,
    flags: Vec<IndexFlag>,
}

impl FrameOutput {
    fn new() -> Self {
        Self {
            indices: IndexValues::default(),
            valid: PerIndex::splat(true),
            flags: Vec::new(),
        }
    }

    fn flag(&mut self, flag: IndexFlag) {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }

    fn set(&mut self, kind: IndexKind, value: f64) {
        *self.indices.get_mut(kind) = value;
    }

    /// Zero the index, clear its validity bit and flag the cause
    fn fail(&mut self, kind: IndexKind, error: &LoopError, degenerate: IndexFlag) {
        debug!(index = %kind, error = %error, "feature fallback");
        *self.indices.get_mut(kind) = 0.0;
        *self.valid.get_mut(kind) = false;
        self.flag(error_flag(error, degenerate));
    }

    fn invalidate(&mut self, kind: IndexKind, flag: IndexFlag) {
        *self.valid.get_mut(kind) = false;
        self.flag(flag);
    }
}

fn error_flag(error: &LoopError, degenerate: IndexFlag) -> IndexFlag {
    match error {
        LoopError::NumericDegenerate { .. } => degenerate,
        _ => IndexFlag::MissingLandmark,
    }
}

/// Computes the four indices frame by frame
#[derive(Debug, Clone)]
pub struct IndexEngine {
    calibrator: LandmarkCalibrator,
    reference: Option<ReferenceProfile>,
    detectors: Detectors,
}

impl Default for IndexEngine {
    fn default() -> Self {
        Self::new(&LoopConfig::default())
    }
}

impl IndexEngine {
    pub fn new(config: &LoopConfig) -> Self {
        Self {
            calibrator: LandmarkCalibrator::new(config.calibration.clone()),
            reference: None,
            detectors: Detectors::new(&config.indices),
        }
    }

    /// Engine with an installed reference profile
    pub fn with_reference(config: &LoopConfig, profile: ReferenceProfile) -> Result<Self, LoopError> {
        let mut engine = Self::new(config);
        engine.set_reference(profile)?;
        Ok(engine)
    }

    pub fn calibrator(&self) -> &LandmarkCalibrator {
        &self.calibrator
    }

    pub fn reference(&self) -> Option<&ReferenceProfile> {
        self.reference.as_ref()
    }

    /// Install a profile; rolling state from the previous subject is dropped
    pub fn set_reference(&mut self, profile: ReferenceProfile) -> Result<(), LoopError> {
        profile.ensure_valid()?;
        self.reset();
        self.reference = Some(profile);
        Ok(())
    }

    pub fn clear_reference(&mut self) {
        self.reference = None;
        self.reset();
    }

    /// Capture a profile from `frame` and install it if valid
    pub fn capture_reference(&mut self, frame: &LandmarkFrame) -> Result<ReferenceProfile, LoopError> {
        let profile = self.calibrator.capture_reference(frame);
        self.set_reference(profile.clone())?;
        Ok(profile)
    }

    /// Clear every rolling window and detector
    pub fn reset(&mut self) {
        self.detectors = Detectors::new(&self.detectors.config);
    }

    pub fn ear_history(&self) -> &TemporalWindow<f64> {
        &self.detectors.ear_history
    }

    pub fn mar_history(&self) -> &TemporalWindow<f64> {
        &self.detectors.mar_history
    }

    /// Compute the four indices for one frame
    pub fn analyze(&mut self, frame: &LandmarkFrame) -> IndexSnapshot {
        let now = frame.timestamp;
        let Some(profile) = self.reference.as_ref() else {
            return IndexSnapshot::empty(now, IndexFlag::NoReference);
        };
        let detectors = &mut self.detectors;
        let mut out = FrameOutput::new();
        let mut diag = IndexDiagnostics::default();

        match frame.face.as_ref() {
            Some(face) => {
                let mapping = self.calibrator.map_reference(profile, face);
                diag.alignment_error = mapping.as_ref().map(|m| m.alignment_error);
                diag.used_reference_mapping = mapping.as_ref().is_some_and(|m| m.accepted);
                if !diag.used_reference_mapping {
                    out.flag(IndexFlag::CalibrationFallback);
                }
                let mapping = mapping.as_ref();

                match detectors.drowsiness(now, face, mapping, profile, &mut diag) {
                    Ok(value) => out.set(IndexKind::Drowsiness, value),
                    Err(e) => out.fail(IndexKind::Drowsiness, &e, IndexFlag::DegenerateEyeGeometry),
                }

                match detectors.attention_sample(now, face, &mut diag) {
                    Ok(true) => out.flag(IndexFlag::HeadPoseFallback),
                    Ok(false) => {}
                    Err(e) => {
                        debug!(error = %e, "no attention sample this frame");
                        out.invalidate(
                            IndexKind::Attention,
                            error_flag(&e, IndexFlag::DegenerateGazeGeometry),
                        );
                    }
                }

                if let Err(e) = detectors.mouth_sample(now, face, mapping, profile, &mut diag) {
                    debug!(error = %e, "no mouth sample this frame");
                    out.invalidate(
                        IndexKind::Yawn,
                        error_flag(&e, IndexFlag::DegenerateMouthGeometry),
                    );
                }
            }
            None => {
                debug!(error = %LoopError::DetectionUnavailable, "no face this frame");
                out.set(IndexKind::Drowsiness, 0.0);
                out.invalidate(IndexKind::Drowsiness, IndexFlag::FaceNotDetected);
                out.invalidate(IndexKind::Attention, IndexFlag::HeldFromHistory);
                out.invalidate(IndexKind::Yawn, IndexFlag::HeldFromHistory);
            }
        }

        // Window-based indices hold their value across missing frames
        let attention = detectors.attention.index(now).unwrap_or(0.0);
        out.set(IndexKind::Attention, attention);
        out.set(IndexKind::Yawn, detectors.yawns.index(now));

        match (frame.pose.as_ref(), profile.shoulder_ratio) {
            (_, None) => {
                out.set(IndexKind::Slouching, 0.0);
                out.invalidate(IndexKind::Slouching, IndexFlag::NoPostureReference);
            }
            (None, Some(_)) => {
                out.set(IndexKind::Slouching, 0.0);
                out.invalidate(IndexKind::Slouching, IndexFlag::PoseNotDetected);
            }
            (Some(pose), Some(reference_ratio)) => {
                match detectors.slouching(pose, reference_ratio, &mut diag) {
                    Ok(value) => out.set(IndexKind::Slouching, value),
                    Err(e) => out.fail(
                        IndexKind::Slouching,
                        &e,
                        IndexFlag::DegenerateShoulderGeometry,
                    ),
                }
            }
        }

        diag.closure_events = detectors.closure.event_count();
        diag.blinks_per_minute = detectors.blinks.per_minute(now);
        diag.yawn_events = detectors.yawns.count(now);
        diag.attention_samples = detectors.attention.len();

        let indices = out
            .indices
            .map(|&v| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 });

        IndexSnapshot {
            timestamp: now,
            indices,
            valid: out.valid,
            face_detected: frame.face.is_some(),
            pose_detected: frame.pose.is_some(),
            flags: out.flags,
            diagnostics: diag,
        }
    }
}
