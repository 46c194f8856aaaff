//! Per-subject calibration
//!
//! A [`ReferenceProfile`] is captured once from a diagnostic frame. On every
//! later frame the profile's anchors are fitted onto the current anchors with a
//! similarity transform; when the fit is tight enough the subject's own
//! reference segment lengths replace the frame's fixed-index corners.

use crate::config::CalibrationConfig;
use crate::error::LoopError;
use crate::indices::geometry::{self, EyePoints, MouthPoints};
use crate::landmarks::{centroid, FaceLandmark, LandmarkFrame, LandmarkSet, Point2, PoseLandmark};
use crate::ports::StateStore;
use chrono::{DateTime, Utc};
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Source variance at or below this is treated as a single point
const MIN_SOURCE_VARIANCE: f64 = 1e-9;

/// `dst ≈ scale · rotation · src + translation`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub scale: f64,
    pub rotation: Matrix2<f64>,
    pub translation: Vector2<f64>,
}

impl SimilarityTransform {
    pub fn identity() -> Self {
        Self {
            scale: 1.0,
            rotation: Matrix2::identity(),
            translation: Vector2::zeros(),
        }
    }

    pub fn apply(&self, point: Point2) -> Point2 {
        Point2::from_vector(self.rotation * point.to_vector() * self.scale + self.translation)
    }

    pub fn apply_all(&self, points: &[Point2]) -> Vec<Point2> {
        points.iter().map(|p| self.apply(*p)).collect()
    }

    /// Rotation angle in radians
    pub fn angle(&self) -> f64 {
        self.rotation[(1, 0)].atan2(self.rotation[(0, 0)])
    }
}

/// Least-squares similarity fit mapping `src` onto `dst`.
///
/// Centres both sets, decomposes the cross-covariance with an SVD and flips
/// the last singular direction if the rotation comes out as a reflection.
/// Returns `None` for fewer than two correspondences or mismatched lengths.
pub fn align(src: &[Point2], dst: &[Point2]) -> Option<SimilarityTransform> {
    if src.len() < 2 || src.len() != dst.len() {
        return None;
    }
    let src_mean = centroid(src)?.to_vector();
    let dst_mean = centroid(dst)?.to_vector();

    let mut covariance = Matrix2::zeros();
    let mut src_variance = 0.0;
    for (s, d) in src.iter().zip(dst) {
        let sc = s.to_vector() - src_mean;
        let dc = d.to_vector() - dst_mean;
        covariance += sc * dc.transpose();
        src_variance += sc.norm_squared();
    }

    let svd = covariance.svd(true, true);
    let u = svd.u?;
    let mut v_t = svd.v_t?;
    let singular = svd.singular_values;

    let mut rotation = v_t.transpose() * u.transpose();
    let mut trace = singular[0] + singular[1];
    if rotation.determinant() < 0.0 {
        v_t[(1, 0)] = -v_t[(1, 0)];
        v_t[(1, 1)] = -v_t[(1, 1)];
        rotation = v_t.transpose() * u.transpose();
        trace = singular[0] - singular[1];
    }

    let scale = if src_variance <= MIN_SOURCE_VARIANCE {
        1.0
    } else {
        trace / src_variance
    };
    let translation = dst_mean - rotation * src_mean * scale;

    Some(SimilarityTransform {
        scale,
        rotation,
        translation,
    })
}

/// Root-mean-square coordinate residual between two point sets
pub fn rms_residual(a: &[Point2], b: &[Point2]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return f64::INFINITY;
    }
    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(p, q)| (p.x - q.x).powi(2) + (p.y - q.y).powi(2))
        .sum();
    (sum / (2 * a.len()) as f64).sqrt()
}

/// Per-subject baseline geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceProfile {
    /// Nose tip and the two lateral eye corners
    pub anchors: Option<[Point2; 3]>,
    pub left_eye: Option<[Point2; 6]>,
    pub right_eye: Option<[Point2; 6]>,
    pub mouth: Option<[Point2; 4]>,
    /// Baseline EAR, both eyes averaged
    pub ear: Option<f64>,
    pub shoulder_ratio: Option<f64>,
    /// Inter-ocular-normalized landmark descriptor
    pub descriptor: Option<Vec<f64>>,
    pub captured_at: DateTime<Utc>,
    /// Why the profile cannot be used; empty when valid
    pub issues: Vec<String>,
}

impl ReferenceProfile {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    /// Fail with [`LoopError::CalibrationInvalid`] unless the profile is usable
    pub fn ensure_valid(&self) -> Result<(), LoopError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(LoopError::CalibrationInvalid(self.issues.join("; ")))
        }
    }

    /// Short stable identifier of the baseline values (16 hex chars)
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for value in [self.ear, self.shoulder_ratio] {
            match value {
                Some(v) => {
                    hasher.update([1u8]);
                    hasher.update(v.to_le_bytes());
                }
                None => hasher.update([0u8]),
            }
        }
        for value in self.descriptor.iter().flatten() {
            hasher.update(value.to_le_bytes());
        }
        let digest = hasher.finalize();
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Euclidean distance between descriptors, for matching a returning subject
    pub fn descriptor_distance(&self, other: &ReferenceProfile) -> Option<f64> {
        let a = self.descriptor.as_ref()?;
        let b = other.descriptor.as_ref()?;
        if a.len() != b.len() {
            return None;
        }
        Some(
            a.iter()
                .zip(b)
                .map(|(x, y)| (x - y).powi(2))
                .sum::<f64>()
                .sqrt(),
        )
    }

    pub fn anchor_points(&self) -> Option<&[Point2; 3]> {
        self.anchors.as_ref()
    }
}

/// An enrolled subject and the reference captured for them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub subject: String,
    pub fingerprint: String,
    pub profile: ReferenceProfile,
    pub enrolled_at: DateTime<Utc>,
}

impl SubjectRecord {
    pub fn new(subject: impl Into<String>, profile: ReferenceProfile) -> Self {
        Self {
            subject: subject.into(),
            fingerprint: profile.fingerprint(),
            profile,
            enrolled_at: Utc::now(),
        }
    }
}

/// Closest enrolled subject whose descriptor lies within `max_distance`
pub fn match_subject<'a>(
    profile: &ReferenceProfile,
    enrolled: &'a [SubjectRecord],
    max_distance: f64,
) -> Option<&'a SubjectRecord> {
    enrolled
        .iter()
        .filter_map(|record| {
            let distance = profile.descriptor_distance(&record.profile)?;
            (distance <= max_distance).then_some((record, distance))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(record, _)| record)
}

/// Persist `profile` for a subject at calibration time.
///
/// With no `subject` id, a returning subject is recognised by descriptor
/// distance; an unknown face is enrolled as `subject-<fingerprint>`.
pub fn enroll_subject<S: StateStore>(
    store: &mut S,
    subject: Option<&str>,
    profile: ReferenceProfile,
    config: &CalibrationConfig,
) -> Result<SubjectRecord, LoopError> {
    profile.ensure_valid()?;
    let subject = match subject {
        Some(subject) => subject.to_string(),
        None => {
            let enrolled = store.subjects()?;
            match match_subject(&profile, &enrolled, config.subject_match_distance) {
                Some(known) => {
                    debug!(subject = %known.subject, "recognised enrolled subject");
                    known.subject.clone()
                }
                None => format!("subject-{}", profile.fingerprint()),
            }
        }
    };
    let record = SubjectRecord::new(subject, profile);
    store.record_subject(&record)?;
    info!(
        subject = %record.subject,
        fingerprint = %record.fingerprint,
        "subject enrolled"
    );
    Ok(record)
}

/// Centred landmark coordinates divided by the inter-ocular distance
pub fn build_descriptor(face: &LandmarkSet<FaceLandmark>) -> Result<Vec<f64>, LoopError> {
    let points = face.require_all(FaceLandmark::DESCRIPTOR)?;
    let left = face.require(FaceLandmark::LeftEyeOuter)?;
    let right = face.require(FaceLandmark::RightEyeOuter)?;
    let mut iod = left.distance(&right);
    if iod <= 1e-6 {
        iod = 1.0;
    }
    let center = centroid(&points).ok_or(LoopError::MissingLandmark("descriptor"))?;
    Ok(points
        .iter()
        .flat_map(|p| [(p.x - center.x) / iod, (p.y - center.y) / iod])
        .collect())
}

/// Reference geometry projected into the current frame
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceMapping {
    pub transform: SimilarityTransform,
    /// RMS residual of the transformed reference anchors
    pub alignment_error: f64,
    /// Residual under the configured threshold
    pub accepted: bool,
}

impl ReferenceMapping {
    /// Replace the eye corners with the subject's projected reference corners
    pub fn refine_eye(&self, eye: EyePoints, reference: &[Point2; 6]) -> EyePoints {
        if !self.accepted {
            return eye;
        }
        eye.with_corners(
            self.transform.apply(reference[0]),
            self.transform.apply(reference[1]),
        )
    }

    /// Replace the mouth corners with the subject's projected reference corners
    pub fn refine_mouth(&self, mouth: MouthPoints, reference: &[Point2; 4]) -> MouthPoints {
        if !self.accepted {
            return mouth;
        }
        mouth.with_corners(
            self.transform.apply(reference[2]),
            self.transform.apply(reference[3]),
        )
    }
}

/// Builds reference profiles and fits them onto live frames
#[derive(Debug, Clone, Default)]
pub struct LandmarkCalibrator {
    config: CalibrationConfig,
}

impl LandmarkCalibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    pub fn residual_threshold(&self) -> f64 {
        self.config.residual_threshold
    }

    /// Extract a baseline from a diagnostic frame.
    ///
    /// Anchors, both eye contours and a non-degenerate EAR are mandatory; the
    /// profile is marked invalid without them. Mouth, posture and descriptor
    /// are optional.
    pub fn capture_reference(&self, frame: &LandmarkFrame) -> ReferenceProfile {
        let mut issues = Vec::new();
        let face = frame.face.as_ref();

        let anchors = match face.map(|f| f.require_all(FaceLandmark::ANCHORS)) {
            Some(Ok(points)) => Some(points),
            Some(Err(e)) => {
                issues.push(format!("anchors: {e}"));
                None
            }
            None => {
                issues.push("no face detected".to_string());
                None
            }
        };

        let left_eye = face.and_then(|f| f.require_all(FaceLandmark::LEFT_EYE).ok());
        let right_eye = face.and_then(|f| f.require_all(FaceLandmark::RIGHT_EYE).ok());
        if face.is_some() && (left_eye.is_none() || right_eye.is_none()) {
            issues.push("eye contours incomplete".to_string());
        }

        let ear = match (left_eye, right_eye) {
            (Some(l), Some(r)) => {
                match geometry::mean_eye_aspect_ratio(
                    &EyePoints::from_array(l),
                    &EyePoints::from_array(r),
                ) {
                    Ok(ear) if ear > geometry::MIN_SEGMENT => Some(ear),
                    Ok(_) => {
                        issues.push("reference eyes are closed".to_string());
                        None
                    }
                    Err(e) => {
                        issues.push(format!("eye aspect ratio: {e}"));
                        None
                    }
                }
            }
            _ => None,
        };

        let mouth = face.and_then(|f| f.require_all(FaceLandmark::MOUTH).ok());
        let descriptor = face.and_then(|f| build_descriptor(f).ok());

        let shoulder_ratio = frame.pose.as_ref().and_then(|pose| {
            let [nose, left, right] = pose
                .require_all([
                    PoseLandmark::Nose,
                    PoseLandmark::LeftShoulder,
                    PoseLandmark::RightShoulder,
                ])
                .ok()?;
            match geometry::shoulder_ratio(nose, left, right) {
                Ok(ratio) if ratio > geometry::MIN_SEGMENT => Some(ratio),
                Ok(_) => None,
                Err(e) => {
                    debug!(error = %e, "no posture reference");
                    None
                }
            }
        });

        if !issues.is_empty() {
            debug!(?issues, "reference profile invalid");
        }

        ReferenceProfile {
            anchors,
            left_eye,
            right_eye,
            mouth,
            ear,
            shoulder_ratio,
            descriptor,
            captured_at: Utc::now(),
            issues,
        }
    }

    /// Fit the reference anchors onto the current anchors and gate on the
    /// residual. `None` when either side lacks anchors or the fit fails.
    pub fn map_reference(
        &self,
        profile: &ReferenceProfile,
        face: &LandmarkSet<FaceLandmark>,
    ) -> Option<ReferenceMapping> {
        let reference = profile.anchor_points()?;
        let current = face.require_all(FaceLandmark::ANCHORS).ok()?;
        let transform = align(reference, &current)?;
        let projected = transform.apply_all(reference);
        let alignment_error = rms_residual(&projected, &current);
        let accepted = alignment_error < self.config.residual_threshold;
        if !accepted {
            debug!(
                alignment_error,
                threshold = self.config.residual_threshold,
                "reference mapping rejected"
            );
        }
        Some(ReferenceMapping {
            transform,
            alignment_error,
            accepted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LearningConfig;
    use crate::landmarks::testing;
    use crate::store::JsonStateStore;
    use pretty_assertions::assert_eq;

    fn transform_points(points: &[Point2], scale: f64, angle: f64, tx: f64, ty: f64) -> Vec<Point2> {
        let (sin, cos) = angle.sin_cos();
        points
            .iter()
            .map(|p| {
                Point2::new(
                    scale * (cos * p.x - sin * p.y) + tx,
                    scale * (sin * p.x + cos * p.y) + ty,
                )
            })
            .collect()
    }

    #[test]
    fn test_align_recovers_similarity() {
        let src = vec![
            Point2::new(0.5, 0.5),
            Point2::new(0.4, 0.4),
            Point2::new(0.6, 0.4),
        ];
        let dst = transform_points(&src, 1.3, 0.2, 0.05, -0.02);

        let fit = align(&src, &dst).unwrap();
        assert!((fit.scale - 1.3).abs() < 1e-9);
        assert!((fit.angle() - 0.2).abs() < 1e-9);
        assert!(rms_residual(&fit.apply_all(&src), &dst) < 1e-9);
    }

    #[test]
    fn test_align_never_returns_reflection() {
        let src = vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(0.0, 1.0),
        ];
        // Mirror image across the y axis
        let dst: Vec<Point2> = src.iter().map(|p| Point2::new(-p.x, p.y)).collect();
        let fit = align(&src, &dst).unwrap();
        assert!(fit.rotation.determinant() > 0.0);
    }

    #[test]
    fn test_align_rejects_short_input() {
        assert!(align(&[Point2::new(0.0, 0.0)], &[Point2::new(1.0, 1.0)]).is_none());
        assert!(align(&[Point2::new(0.0, 0.0); 3], &[Point2::new(1.0, 1.0); 2]).is_none());
    }

    #[test]
    fn test_coincident_source_keeps_unit_scale() {
        let src = vec![Point2::new(0.3, 0.3); 3];
        let dst = vec![Point2::new(0.5, 0.5); 3];
        let fit = align(&src, &dst).unwrap();
        assert_eq!(fit.scale, 1.0);
    }

    #[test]
    fn test_capture_reference_from_full_frame() {
        let calibrator = LandmarkCalibrator::default();
        let profile = calibrator.capture_reference(&testing::frame(0.0, 0.3, 0.2, 0.5));

        assert!(profile.is_valid());
        assert!((profile.ear.unwrap() - 0.3).abs() < 1e-9);
        assert!((profile.shoulder_ratio.unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(profile.descriptor.as_ref().map(Vec::len), Some(12));
        assert_eq!(profile.fingerprint().len(), 16);
    }

    #[test]
    fn test_capture_reference_without_face_is_invalid() {
        let calibrator = LandmarkCalibrator::default();
        let frame = LandmarkFrame::new(0.0, None, Some(testing::pose(0.5)));
        let profile = calibrator.capture_reference(&frame);

        assert!(!profile.is_valid());
        assert!(matches!(
            profile.ensure_valid(),
            Err(LoopError::CalibrationInvalid(_))
        ));
    }

    #[test]
    fn test_capture_reference_without_pose_is_still_valid() {
        let calibrator = LandmarkCalibrator::default();
        let frame = LandmarkFrame::new(0.0, Some(testing::face(0.3, 0.2)), None);
        let profile = calibrator.capture_reference(&frame);
        assert!(profile.is_valid());
        assert_eq!(profile.shoulder_ratio, None);
    }

    #[test]
    fn test_mapping_accepts_moved_face() {
        let calibrator = LandmarkCalibrator::default();
        let profile = calibrator.capture_reference(&testing::frame(0.0, 0.3, 0.2, 0.5));

        let moved: Vec<(FaceLandmark, Point2)> = testing::face_points(0.3, 0.2, true)
            .into_iter()
            .map(|(l, p)| (l, Point2::new(p.x + 0.05, p.y - 0.03)))
            .collect();
        let face = LandmarkSet::from_points(moved);

        let mapping = calibrator.map_reference(&profile, &face).unwrap();
        assert!(mapping.accepted);
        assert!(mapping.alignment_error < 1e-9);
    }

    #[test]
    fn test_mapping_rejects_distorted_anchors() {
        let calibrator = LandmarkCalibrator::default();
        let profile = calibrator.capture_reference(&testing::frame(0.0, 0.3, 0.2, 0.5));

        let distorted: Vec<(FaceLandmark, Point2)> = testing::face_points(0.3, 0.2, true)
            .into_iter()
            .map(|(l, p)| match l {
                FaceLandmark::NoseTip => (l, Point2::new(p.x, p.y + 0.25)),
                _ => (l, p),
            })
            .collect();
        let face = LandmarkSet::from_points(distorted);

        let mapping = calibrator.map_reference(&profile, &face).unwrap();
        assert!(!mapping.accepted);
        assert!(mapping.alignment_error >= 0.03);
    }

    #[test]
    fn test_fingerprint_is_stable_and_distinguishes_subjects() {
        let calibrator = LandmarkCalibrator::default();
        let a = calibrator.capture_reference(&testing::frame(0.0, 0.3, 0.2, 0.5));
        let b = calibrator.capture_reference(&testing::frame(1.0, 0.3, 0.2, 0.5));
        let c = calibrator.capture_reference(&testing::frame(0.0, 0.25, 0.2, 0.5));

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.descriptor_distance(&b), Some(0.0));
    }

    fn shifted(profile: &ReferenceProfile, dx: f64) -> ReferenceProfile {
        let mut other = profile.clone();
        if let Some(descriptor) = other.descriptor.as_mut() {
            for x in descriptor.iter_mut().step_by(2) {
                *x += dx;
            }
        }
        other
    }

    #[test]
    fn test_match_subject_picks_closest_within_distance() {
        let profile = LandmarkCalibrator::default()
            .capture_reference(&testing::frame(0.0, 0.3, 0.2, 0.5));
        let enrolled = vec![
            SubjectRecord::new("far", shifted(&profile, 0.2)),
            SubjectRecord::new("near", shifted(&profile, 0.005)),
            SubjectRecord::new("nearer", shifted(&profile, 0.001)),
        ];

        let found = match_subject(&profile, &enrolled, 0.05).unwrap();
        assert_eq!(found.subject, "nearer");
        assert!(match_subject(&shifted(&profile, 0.5), &enrolled, 0.05).is_none());
        assert!(match_subject(&profile, &[], 0.05).is_none());
    }

    #[test]
    fn test_enroll_subject_recognises_returning_face() {
        let config = CalibrationConfig::default();
        let mut store = JsonStateStore::in_memory(&LearningConfig::default());
        let profile = LandmarkCalibrator::default()
            .capture_reference(&testing::frame(0.0, 0.3, 0.2, 0.5));

        let first = enroll_subject(&mut store, None, profile.clone(), &config).unwrap();
        assert_eq!(first.subject, format!("subject-{}", profile.fingerprint()));

        let named = enroll_subject(&mut store, Some("dana"), shifted(&profile, 0.3), &config)
            .unwrap();
        assert_eq!(named.subject, "dana");

        // Same face again, no id given: the existing enrollment is refreshed
        let again = enroll_subject(&mut store, None, profile, &config).unwrap();
        assert_eq!(again.subject, first.subject);
        assert_eq!(store.subjects().unwrap().len(), 2);
    }

    #[test]
    fn test_enroll_subject_rejects_invalid_profile() {
        let mut store = JsonStateStore::in_memory(&LearningConfig::default());
        let frame = LandmarkFrame::new(0.0, None, Some(testing::pose(0.5)));
        let profile = LandmarkCalibrator::default().capture_reference(&frame);

        let err = enroll_subject(&mut store, Some("erin"), profile, &CalibrationConfig::default())
            .unwrap_err();
        assert!(matches!(err, LoopError::CalibrationInvalid(_)));
        assert!(store.subjects().unwrap().is_empty());
    }
}
