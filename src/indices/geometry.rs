//! Per-frame geometric measurements
//!
//! Pure functions over resolved landmark points. Every division by a reference
//! segment checks for a zero-length segment and reports
//! [`LoopError::NumericDegenerate`] instead of producing NaN or infinity.

use crate::error::LoopError;
use crate::landmarks::{FaceLandmark, LandmarkSet, Point2};
use serde::{Deserialize, Serialize};

/// Segments at or below this length are degenerate
pub const MIN_SEGMENT: f64 = 1e-9;

/// Horizontal share of the gaze deviation
pub const GAZE_HORIZONTAL_WEIGHT: f64 = 0.7;
/// Vertical share of the gaze deviation
pub const GAZE_VERTICAL_WEIGHT: f64 = 0.3;

const YAW_LIMIT_DEG: f64 = 45.0;
const PITCH_LIMIT_DEG: f64 = 30.0;
const ROLL_LIMIT_DEG: f64 = 30.0;
/// Depth used to turn the nose offset into a yaw angle
const YAW_DEPTH: f64 = 0.1;

fn degenerate(feature: &'static str) -> LoopError {
    LoopError::NumericDegenerate { feature }
}

/// Six-point eye contour: two corners and two vertical lid pairs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EyePoints {
    pub corner_a: Point2,
    pub corner_b: Point2,
    pub top: Point2,
    pub bottom: Point2,
    pub mid_top: Point2,
    pub mid_bottom: Point2,
}

impl EyePoints {
    pub fn from_array(points: [Point2; 6]) -> Self {
        let [corner_a, corner_b, top, bottom, mid_top, mid_bottom] = points;
        Self {
            corner_a,
            corner_b,
            top,
            bottom,
            mid_top,
            mid_bottom,
        }
    }

    pub fn to_array(&self) -> [Point2; 6] {
        [
            self.corner_a,
            self.corner_b,
            self.top,
            self.bottom,
            self.mid_top,
            self.mid_bottom,
        ]
    }

    /// Read the contour straight from the frame's fixed layout
    pub fn from_face(
        face: &LandmarkSet<FaceLandmark>,
        layout: [FaceLandmark; 6],
    ) -> Result<Self, LoopError> {
        Ok(Self::from_array(face.require_all(layout)?))
    }

    /// Same lids, different corners
    pub fn with_corners(self, corner_a: Point2, corner_b: Point2) -> Self {
        Self {
            corner_a,
            corner_b,
            ..self
        }
    }
}

/// Mouth: lips and corners
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MouthPoints {
    pub top: Point2,
    pub bottom: Point2,
    pub left: Point2,
    pub right: Point2,
}

impl MouthPoints {
    pub fn from_array(points: [Point2; 4]) -> Self {
        let [top, bottom, left, right] = points;
        Self {
            top,
            bottom,
            left,
            right,
        }
    }

    pub fn to_array(&self) -> [Point2; 4] {
        [self.top, self.bottom, self.left, self.right]
    }

    pub fn from_face(face: &LandmarkSet<FaceLandmark>) -> Result<Self, LoopError> {
        Ok(Self::from_array(face.require_all(FaceLandmark::MOUTH)?))
    }

    pub fn with_corners(self, left: Point2, right: Point2) -> Self {
        Self {
            left,
            right,
            ..self
        }
    }
}

/// Eye aspect ratio: (sum of both lid gaps) / (2 × corner distance)
pub fn eye_aspect_ratio(eye: &EyePoints) -> Result<f64, LoopError> {
    let horizontal = eye.corner_a.distance(&eye.corner_b);
    if horizontal <= MIN_SEGMENT {
        return Err(degenerate("eye_aspect_ratio"));
    }
    let vertical_1 = eye.top.distance(&eye.bottom);
    let vertical_2 = eye.mid_top.distance(&eye.mid_bottom);
    Ok((vertical_1 + vertical_2) / (2.0 * horizontal))
}

/// EAR averaged over both eyes
pub fn mean_eye_aspect_ratio(left: &EyePoints, right: &EyePoints) -> Result<f64, LoopError> {
    Ok((eye_aspect_ratio(left)? + eye_aspect_ratio(right)?) / 2.0)
}

/// Mouth aspect ratio: lip gap over mouth width
pub fn mouth_aspect_ratio(mouth: &MouthPoints) -> Result<f64, LoopError> {
    let horizontal = mouth.left.distance(&mouth.right);
    if horizontal <= MIN_SEGMENT {
        return Err(degenerate("mouth_aspect_ratio"));
    }
    Ok(mouth.top.distance(&mouth.bottom) / horizontal)
}

/// Angle-invariant posture ratio: vertical nose-to-shoulder-midpoint distance
/// over shoulder width
pub fn shoulder_ratio(
    nose: Point2,
    left_shoulder: Point2,
    right_shoulder: Point2,
) -> Result<f64, LoopError> {
    let width = left_shoulder.distance(&right_shoulder);
    if width <= MIN_SEGMENT {
        return Err(degenerate("shoulder_ratio"));
    }
    let midpoint = left_shoulder.midpoint(&right_shoulder);
    Ok((nose.y - midpoint.y).abs() / width)
}

/// Iris position inside one eye box, `(horizontal, vertical)`, 0.5 = centred
fn iris_position(eye: &EyePoints, iris: Point2) -> Result<(f64, f64), LoopError> {
    let width = eye.corner_b.x - eye.corner_a.x;
    let height = (eye.bottom.y - eye.top.y).abs();
    if width.abs() <= MIN_SEGMENT || height <= MIN_SEGMENT {
        return Err(degenerate("gaze"));
    }
    Ok(((iris.x - eye.corner_a.x) / width, (iris.y - eye.top.y) / height))
}

/// Gaze deviation in [0, 1] from the iris offsets of both eyes
pub fn gaze_deviation(
    left_eye: &EyePoints,
    right_eye: &EyePoints,
    left_iris: Point2,
    right_iris: Point2,
) -> Result<f64, LoopError> {
    let (lh, lv) = iris_position(left_eye, left_iris)?;
    let (rh, rv) = iris_position(right_eye, right_iris)?;
    let horizontal = ((lh - 0.5).abs() + (rh - 0.5).abs()) * 2.0;
    let vertical = ((lv - 0.5).abs() + (rv - 0.5).abs()) * 2.0;
    let deviation = GAZE_HORIZONTAL_WEIGHT * horizontal + GAZE_VERTICAL_WEIGHT * vertical;
    Ok(deviation.clamp(0.0, 1.0))
}

/// Approximate head rotation in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadPose {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl HeadPose {
    /// 0 = facing the screen, 1 = turned away (yaw 60%, pitch 30%, roll 10%)
    pub fn deviation(&self) -> f64 {
        let yaw = self.yaw.abs() / YAW_LIMIT_DEG;
        let pitch = self.pitch.abs() / PITCH_LIMIT_DEG;
        let roll = self.roll.abs() / ROLL_LIMIT_DEG;
        (0.6 * yaw + 0.3 * pitch + 0.1 * roll).min(1.0)
    }
}

/// Estimate head pose from the nose, the two anchor eye corners, forehead and chin.
///
/// Pitch compares the forehead-to-nose and nose-to-chin spans, so a frontal
/// face with the nose midway reads as 0.
pub fn head_pose(
    nose: Point2,
    left_eye: Point2,
    right_eye: Point2,
    forehead: Point2,
    chin: Point2,
) -> Result<HeadPose, LoopError> {
    let eye_mid = left_eye.midpoint(&right_eye);
    let yaw = (nose.x - eye_mid.x).atan2(YAW_DEPTH).to_degrees();

    let upper = nose.y - forehead.y;
    let lower = chin.y - nose.y;
    let span = upper + lower;
    if span.abs() <= MIN_SEGMENT {
        return Err(degenerate("head_pitch"));
    }
    let pitch = (upper - lower).atan2(span.abs()).to_degrees();

    let dx = right_eye.x - left_eye.x;
    if dx.abs() <= MIN_SEGMENT {
        return Err(degenerate("head_roll"));
    }
    let roll = (right_eye.y - left_eye.y).atan2(dx.abs()).to_degrees();

    Ok(HeadPose {
        yaw: yaw.clamp(-YAW_LIMIT_DEG, YAW_LIMIT_DEG),
        pitch: pitch.clamp(-PITCH_LIMIT_DEG, PITCH_LIMIT_DEG),
        roll: roll.clamp(-ROLL_LIMIT_DEG, ROLL_LIMIT_DEG),
    })
}

/// Head pose straight from a resolved face
pub fn head_pose_from_face(face: &LandmarkSet<FaceLandmark>) -> Result<HeadPose, LoopError> {
    let [nose, left, right, forehead, chin] = face.require_all([
        FaceLandmark::NoseTip,
        FaceLandmark::LeftEyeOuter,
        FaceLandmark::RightEyeOuter,
        FaceLandmark::Forehead,
        FaceLandmark::Chin,
    ])?;
    head_pose(nose, left, right, forehead, chin)
}

/// EAR-drop score: a drop to `1 - saturation` of the reference EAR scores 1.0
pub fn ear_drop_score(ear: f64, reference_ear: f64, saturation: f64) -> Result<f64, LoopError> {
    if reference_ear <= MIN_SEGMENT {
        return Err(degenerate("reference_ear"));
    }
    let ratio = ear / reference_ear;
    if ratio >= 1.0 {
        return Ok(0.0);
    }
    Ok(((1.0 - ratio) / saturation).clamp(0.0, 1.0))
}

/// Slouch score from the relative drop of the shoulder ratio
pub fn slouch_score(
    current_ratio: f64,
    reference_ratio: f64,
    saturation: f64,
) -> Result<f64, LoopError> {
    if reference_ratio <= MIN_SEGMENT {
        return Err(degenerate("reference_shoulder_ratio"));
    }
    let change = (reference_ratio - current_ratio) / reference_ratio;
    Ok((change / saturation).clamp(0.0, 1.0))
}
