//! Typed landmark access
//!
//! The landmark provider returns raw point arrays in a fixed face-mesh / pose
//! layout. Each frame is resolved once into a [`LandmarkSet`] keyed by a closed
//! enumeration of semantic points, so downstream code never indexes the raw
//! array directly.

use crate::error::LoopError;
use crate::types::Seconds;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// Normalized 2D image coordinate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn midpoint(&self, other: &Point2) -> Point2 {
        Point2::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn to_vector(self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    pub fn from_vector(v: Vector2<f64>) -> Self {
        Point2::new(v.x, v.y)
    }
}

/// Mean of a non-empty point set
pub fn centroid(points: &[Point2]) -> Option<Point2> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Some(Point2::new(sx / n, sy / n))
}

/// A closed set of named points resolvable from a provider's raw array
pub trait SemanticPoint: Copy + std::fmt::Debug + 'static {
    /// Every point, in slot order
    const ALL: &'static [Self];

    /// Position of this point in [`Self::ALL`]
    fn slot(self) -> usize;

    /// Raw provider indices; several indices are averaged into one point
    fn raw_indices(self) -> &'static [usize];

    fn name(self) -> &'static str;
}

/// Face-mesh points used by the index computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceLandmark {
    NoseTip,
    Chin,
    Forehead,
    LeftEyeOuter,
    LeftEyeInner,
    LeftEyeTop,
    LeftEyeBottom,
    LeftEyeMidTop,
    LeftEyeMidBottom,
    RightEyeInner,
    RightEyeOuter,
    RightEyeTop,
    RightEyeBottom,
    RightEyeMidTop,
    RightEyeMidBottom,
    MouthTop,
    MouthBottom,
    MouthLeft,
    MouthRight,
    LeftIris,
    RightIris,
}

impl FaceLandmark {
    /// Similarity-fit anchors: nose tip and the two lateral eye corners
    pub const ANCHORS: [FaceLandmark; 3] = [
        FaceLandmark::NoseTip,
        FaceLandmark::LeftEyeOuter,
        FaceLandmark::RightEyeOuter,
    ];

    /// Six-point EAR contour: two corners, then two vertical pairs
    pub const LEFT_EYE: [FaceLandmark; 6] = [
        FaceLandmark::LeftEyeOuter,
        FaceLandmark::LeftEyeInner,
        FaceLandmark::LeftEyeTop,
        FaceLandmark::LeftEyeBottom,
        FaceLandmark::LeftEyeMidTop,
        FaceLandmark::LeftEyeMidBottom,
    ];

    pub const RIGHT_EYE: [FaceLandmark; 6] = [
        FaceLandmark::RightEyeInner,
        FaceLandmark::RightEyeOuter,
        FaceLandmark::RightEyeTop,
        FaceLandmark::RightEyeBottom,
        FaceLandmark::RightEyeMidTop,
        FaceLandmark::RightEyeMidBottom,
    ];

    /// Mouth: top lip, bottom lip, left corner, right corner
    pub const MOUTH: [FaceLandmark; 4] = [
        FaceLandmark::MouthTop,
        FaceLandmark::MouthBottom,
        FaceLandmark::MouthLeft,
        FaceLandmark::MouthRight,
    ];

    /// Points kept in a subject descriptor
    pub const DESCRIPTOR: [FaceLandmark; 6] = [
        FaceLandmark::NoseTip,
        FaceLandmark::LeftEyeOuter,
        FaceLandmark::RightEyeOuter,
        FaceLandmark::Chin,
        FaceLandmark::MouthLeft,
        FaceLandmark::MouthRight,
    ];
}

impl SemanticPoint for FaceLandmark {
    const ALL: &'static [Self] = &[
        FaceLandmark::NoseTip,
        FaceLandmark::Chin,
        FaceLandmark::Forehead,
        FaceLandmark::LeftEyeOuter,
        FaceLandmark::LeftEyeInner,
        FaceLandmark::LeftEyeTop,
        FaceLandmark::LeftEyeBottom,
        FaceLandmark::LeftEyeMidTop,
        FaceLandmark::LeftEyeMidBottom,
        FaceLandmark::RightEyeInner,
        FaceLandmark::RightEyeOuter,
        FaceLandmark::RightEyeTop,
        FaceLandmark::RightEyeBottom,
        FaceLandmark::RightEyeMidTop,
        FaceLandmark::RightEyeMidBottom,
        FaceLandmark::MouthTop,
        FaceLandmark::MouthBottom,
        FaceLandmark::MouthLeft,
        FaceLandmark::MouthRight,
        FaceLandmark::LeftIris,
        FaceLandmark::RightIris,
    ];

    fn slot(self) -> usize {
        self as usize
    }

    fn raw_indices(self) -> &'static [usize] {
        match self {
            FaceLandmark::NoseTip => &[4],
            FaceLandmark::Chin => &[152],
            FaceLandmark::Forehead => &[10],
            FaceLandmark::LeftEyeOuter => &[33],
            FaceLandmark::LeftEyeInner => &[133],
            FaceLandmark::LeftEyeTop => &[159],
            FaceLandmark::LeftEyeBottom => &[145],
            FaceLandmark::LeftEyeMidTop => &[158],
            FaceLandmark::LeftEyeMidBottom => &[153],
            FaceLandmark::RightEyeInner => &[362],
            FaceLandmark::RightEyeOuter => &[263],
            FaceLandmark::RightEyeTop => &[386],
            FaceLandmark::RightEyeBottom => &[374],
            FaceLandmark::RightEyeMidTop => &[387],
            FaceLandmark::RightEyeMidBottom => &[373],
            FaceLandmark::MouthTop => &[13],
            FaceLandmark::MouthBottom => &[14],
            FaceLandmark::MouthLeft => &[61],
            FaceLandmark::MouthRight => &[291],
            FaceLandmark::LeftIris => &[468, 469, 470, 471, 472],
            FaceLandmark::RightIris => &[473, 474, 475, 476, 477],
        }
    }

    fn name(self) -> &'static str {
        match self {
            FaceLandmark::NoseTip => "nose_tip",
            FaceLandmark::Chin => "chin",
            FaceLandmark::Forehead => "forehead",
            FaceLandmark::LeftEyeOuter => "left_eye_outer",
            FaceLandmark::LeftEyeInner => "left_eye_inner",
            FaceLandmark::LeftEyeTop => "left_eye_top",
            FaceLandmark::LeftEyeBottom => "left_eye_bottom",
            FaceLandmark::LeftEyeMidTop => "left_eye_mid_top",
            FaceLandmark::LeftEyeMidBottom => "left_eye_mid_bottom",
            FaceLandmark::RightEyeInner => "right_eye_inner",
            FaceLandmark::RightEyeOuter => "right_eye_outer",
            FaceLandmark::RightEyeTop => "right_eye_top",
            FaceLandmark::RightEyeBottom => "right_eye_bottom",
            FaceLandmark::RightEyeMidTop => "right_eye_mid_top",
            FaceLandmark::RightEyeMidBottom => "right_eye_mid_bottom",
            FaceLandmark::MouthTop => "mouth_top",
            FaceLandmark::MouthBottom => "mouth_bottom",
            FaceLandmark::MouthLeft => "mouth_left",
            FaceLandmark::MouthRight => "mouth_right",
            FaceLandmark::LeftIris => "left_iris",
            FaceLandmark::RightIris => "right_iris",
        }
    }
}

/// Body-pose points used for posture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseLandmark {
    Nose,
    LeftShoulder,
    RightShoulder,
}

impl SemanticPoint for PoseLandmark {
    const ALL: &'static [Self] = &[
        PoseLandmark::Nose,
        PoseLandmark::LeftShoulder,
        PoseLandmark::RightShoulder,
    ];

    fn slot(self) -> usize {
        self as usize
    }

    fn raw_indices(self) -> &'static [usize] {
        match self {
            PoseLandmark::Nose => &[0],
            PoseLandmark::LeftShoulder => &[11],
            PoseLandmark::RightShoulder => &[12],
        }
    }

    fn name(self) -> &'static str {
        match self {
            PoseLandmark::Nose => "pose_nose",
            PoseLandmark::LeftShoulder => "left_shoulder",
            PoseLandmark::RightShoulder => "right_shoulder",
        }
    }
}

/// Semantic points resolved from one raw provider array
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSet<L> {
    points: Vec<Option<Point2>>,
    _layout: PhantomData<L>,
}

impl<L: SemanticPoint> LandmarkSet<L> {
    /// Resolve every semantic point from the raw array. A point is absent if
    /// any of its raw indices is out of range or non-finite.
    pub fn resolve(raw: &[Point2]) -> Self {
        let points = L::ALL
            .iter()
            .map(|landmark| {
                let indices = landmark.raw_indices();
                let mut picked = Vec::with_capacity(indices.len());
                for &index in indices {
                    match raw.get(index) {
                        Some(p) if p.is_finite() => picked.push(*p),
                        _ => return None,
                    }
                }
                centroid(&picked)
            })
            .collect();
        Self {
            points,
            _layout: PhantomData,
        }
    }

    /// Build directly from named points; unnamed points are absent
    pub fn from_points(named: impl IntoIterator<Item = (L, Point2)>) -> Self {
        let mut points = vec![None; L::ALL.len()];
        for (landmark, point) in named {
            points[landmark.slot()] = Some(point).filter(Point2::is_finite);
        }
        Self {
            points,
            _layout: PhantomData,
        }
    }

    pub fn get(&self, landmark: L) -> Option<Point2> {
        self.points.get(landmark.slot()).copied().flatten()
    }

    pub fn require(&self, landmark: L) -> Result<Point2, LoopError> {
        self.get(landmark)
            .ok_or(LoopError::MissingLandmark(landmark.name()))
    }

    pub fn require_all<const N: usize>(&self, landmarks: [L; N]) -> Result<[Point2; N], LoopError> {
        let mut out = [Point2::default(); N];
        for (slot, landmark) in out.iter_mut().zip(landmarks) {
            *slot = self.require(landmark)?;
        }
        Ok(out)
    }

    pub fn resolved_count(&self) -> usize {
        self.points.iter().filter(|p| p.is_some()).count()
    }
}

/// What the landmark provider returns for one image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LandmarkDetection {
    #[serde(default)]
    pub face: Option<Vec<Point2>>,
    #[serde(default)]
    pub pose: Option<Vec<Point2>>,
}

/// A timestamped provider result, as recorded on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLandmarkFrame {
    pub timestamp: Seconds,
    #[serde(flatten)]
    pub detection: LandmarkDetection,
}

/// One frame of resolved landmarks
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkFrame {
    pub timestamp: Seconds,
    pub face: Option<LandmarkSet<FaceLandmark>>,
    pub pose: Option<LandmarkSet<PoseLandmark>>,
}

impl LandmarkFrame {
    pub fn new(
        timestamp: Seconds,
        face: Option<LandmarkSet<FaceLandmark>>,
        pose: Option<LandmarkSet<PoseLandmark>>,
    ) -> Self {
        Self {
            timestamp,
            face,
            pose,
        }
    }

    /// Resolve a provider result
    pub fn from_detection(timestamp: Seconds, detection: &LandmarkDetection) -> Self {
        Self {
            timestamp,
            face: detection.face.as_deref().map(LandmarkSet::resolve),
            pose: detection.pose.as_deref().map(LandmarkSet::resolve),
        }
    }

    /// Frame with nothing detected
    pub fn empty(timestamp: Seconds) -> Self {
        Self::new(timestamp, None, None)
    }

    pub fn is_empty(&self) -> bool {
        self.face.is_none() && self.pose.is_none()
    }
}

impl From<&RawLandmarkFrame> for LandmarkFrame {
    fn from(raw: &RawLandmarkFrame) -> Self {
        LandmarkFrame::from_detection(raw.timestamp, &raw.detection)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_slots_match_declaration_order() {
        for (i, landmark) in FaceLandmark::ALL.iter().enumerate() {
            assert_eq!(landmark.slot(), i);
        }
        for (i, landmark) in PoseLandmark::ALL.iter().enumerate() {
            assert_eq!(landmark.slot(), i);
        }
    }

    #[test]
    fn test_resolve_averages_iris_points() {
        let mut raw = vec![Point2::new(0.0, 0.0); 478];
        for (offset, index) in (468..=472).enumerate() {
            raw[index] = Point2::new(0.40 + offset as f64 * 0.01, 0.5);
        }
        let face = LandmarkSet::<FaceLandmark>::resolve(&raw);
        let iris = face.get(FaceLandmark::LeftIris).unwrap();
        assert!((iris.x - 0.42).abs() < 1e-12);
        assert_eq!(iris.y, 0.5);
    }

    #[test]
    fn test_resolve_short_array_drops_iris() {
        // A 468-point mesh has no iris refinement
        let raw = vec![Point2::new(0.5, 0.5); 468];
        let face = LandmarkSet::<FaceLandmark>::resolve(&raw);
        assert!(face.get(FaceLandmark::NoseTip).is_some());
        assert!(face.get(FaceLandmark::LeftIris).is_none());
        assert!(face.get(FaceLandmark::RightIris).is_none());
    }

    #[test]
    fn test_require_reports_missing_point() {
        let pose = LandmarkSet::from_points([(PoseLandmark::Nose, Point2::new(0.5, 0.3))]);
        let err = pose.require(PoseLandmark::LeftShoulder).unwrap_err();
        assert_eq!(err.to_string(), "Missing landmark: left_shoulder");
    }

    #[test]
    fn test_non_finite_points_are_absent() {
        let mut raw = vec![Point2::new(0.1, 0.1); 33];
        raw[0] = Point2::new(f64::NAN, 0.3);
        let pose = LandmarkSet::<PoseLandmark>::resolve(&raw);
        assert!(pose.get(PoseLandmark::Nose).is_none());
        assert_eq!(pose.resolved_count(), 2);
    }

    #[test]
    fn test_raw_frame_json() {
        let json = r#"{"timestamp": 1.5, "pose": [{"x": 0.5, "y": 0.5}]}"#;
        let raw: RawLandmarkFrame = serde_json::from_str(json).unwrap();
        assert_eq!(raw.timestamp, 1.5);
        assert!(raw.detection.face.is_none());

        let frame = LandmarkFrame::from(&raw);
        assert!(frame.face.is_none());
        assert!(frame.pose.is_some());
    }
}
