//! End-to-end control-loop tests: calibrate, monitor, break, learn, persist

use alertloop::landmarks::{FaceLandmark, Point2, SemanticPoint};
use alertloop::ports::{FrameSource, InputBlocker, NullPresenter, StateStore};
use alertloop::types::{IndexKind, Seconds, StateKey};
use alertloop::{
    break_duration, enroll_subject, spawn_monitor, JsonStateStore, LandmarkCalibrator, LandmarkDetection, LandmarkFrame,
    LoopConfig, LoopError, MonitorEvent, MonitorSession, MonitorSetup, RawLandmarkFrame,
};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};

const FACE_POINTS: usize = 478;
const POSE_POINTS: usize = 33;

/// Raw face-mesh array for a frontal face with the given eye and mouth
/// aspect ratios, gaze centred
fn face_mesh(ear: f64, mar: f64) -> Vec<Point2> {
    use FaceLandmark::*;
    let h = ear * 0.06 / 2.0;
    let v = mar * 0.10 / 2.0;
    let named = [
        (NoseTip, Point2::new(0.50, 0.50)),
        (Forehead, Point2::new(0.50, 0.30)),
        (Chin, Point2::new(0.50, 0.70)),
        (LeftEyeOuter, Point2::new(0.40, 0.40)),
        (LeftEyeInner, Point2::new(0.46, 0.40)),
        (LeftEyeTop, Point2::new(0.42, 0.40 - h)),
        (LeftEyeBottom, Point2::new(0.42, 0.40 + h)),
        (LeftEyeMidTop, Point2::new(0.44, 0.40 - h)),
        (LeftEyeMidBottom, Point2::new(0.44, 0.40 + h)),
        (RightEyeInner, Point2::new(0.54, 0.40)),
        (RightEyeOuter, Point2::new(0.60, 0.40)),
        (RightEyeTop, Point2::new(0.56, 0.40 - h)),
        (RightEyeBottom, Point2::new(0.56, 0.40 + h)),
        (RightEyeMidTop, Point2::new(0.58, 0.40 - h)),
        (RightEyeMidBottom, Point2::new(0.58, 0.40 + h)),
        (MouthTop, Point2::new(0.50, 0.60 - v)),
        (MouthBottom, Point2::new(0.50, 0.60 + v)),
        (MouthLeft, Point2::new(0.45, 0.60)),
        (MouthRight, Point2::new(0.55, 0.60)),
        (LeftIris, Point2::new(0.43, 0.40)),
        (RightIris, Point2::new(0.57, 0.40)),
    ];
    let mut raw = vec![Point2::new(0.5, 0.5); FACE_POINTS];
    for (landmark, point) in named {
        for &index in landmark.raw_indices() {
            raw[index] = point;
        }
    }
    raw
}

/// Raw pose array whose nose-to-shoulder ratio equals `ratio`
fn pose(ratio: f64) -> Vec<Point2> {
    let mut raw = vec![Point2::new(0.5, 0.9); POSE_POINTS];
    raw[0] = Point2::new(0.5, 0.3);
    raw[11] = Point2::new(0.4, 0.3 + ratio * 0.2);
    raw[12] = Point2::new(0.6, 0.3 + ratio * 0.2);
    raw
}

fn detection(ear: f64, ratio: f64) -> LandmarkDetection {
    LandmarkDetection {
        face: Some(face_mesh(ear, 0.1)),
        pose: Some(pose(ratio)),
    }
}

fn alert() -> LandmarkDetection {
    detection(0.30, 0.5)
}

fn tired() -> LandmarkDetection {
    detection(0.15, 0.35)
}

fn frame(timestamp: Seconds, detection: LandmarkDetection) -> LandmarkFrame {
    LandmarkFrame::from(&RawLandmarkFrame {
        timestamp,
        detection,
    })
}

fn times(from: Seconds, to: Seconds) -> impl Iterator<Item = Seconds> {
    let steps = ((to - from) / 0.25).round() as u32;
    (0..=steps).map(move |i| from + i as f64 * 0.25)
}

fn calibrate() -> alertloop::ReferenceProfile {
    // Through JSON, the way a recorded calibration frame arrives
    let json = serde_json::to_string(&RawLandmarkFrame {
        timestamp: 0.0,
        detection: alert(),
    })
    .unwrap();
    let raw: RawLandmarkFrame = serde_json::from_str(&json).unwrap();
    let profile = LandmarkCalibrator::new(LoopConfig::default().calibration)
        .capture_reference(&LandmarkFrame::from(&raw));
    assert!(profile.is_valid(), "{:?}", profile.issues);
    assert!(profile.shoulder_ratio.is_some());
    profile
}

#[test]
fn test_full_cycle_persists_and_shortens_next_break() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let config = LoopConfig::default();
    let key = StateKey::new("coding", "dana");
    let profile = calibrate();

    let store = JsonStateStore::open(&path, &config.learning).unwrap();
    let mut session =
        MonitorSession::start(config.clone(), key.clone(), profile.clone(), store).unwrap();
    let mut presenter = NullPresenter;

    let mut triggers = Vec::new();
    for t in times(0.0, 4.0) {
        let report = session.step(&frame(t, tired()), &mut presenter, None).unwrap();
        triggers.extend(report.trigger);
    }
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].dominant, IndexKind::Drowsiness);
    assert!((session.planned_duration(&triggers[0]) - 150.0).abs() < 1e-9);

    for t in times(4.25, 160.0) {
        session.step(&frame(t, alert()), &mut presenter, None).unwrap();
    }
    assert!(!session.is_break_active());
    let summary = session.end(160.0).unwrap();
    assert!((summary.scaler - 232.5).abs() < 1e-9);

    // A fresh store sees everything that was written
    let reopened = JsonStateStore::open(&path, &config.learning).unwrap();
    let state = reopened.load_state(&key).unwrap().unwrap();
    assert!((state.scaler - 232.5).abs() < 1e-9);
    assert_eq!(state.session_count, 1);
    assert!(state.weights.is_normalized());
    assert_eq!(reopened.document().break_events.len(), 1);
    assert_eq!(reopened.document().break_events[0].became_alert_at, Some(1.0));
    assert_eq!(reopened.document().sessions.len(), 1);

    // The next session plans its breaks from the learned state
    let min_break = config.breaks.min_break_seconds;
    let mut next = MonitorSession::start(config, key, profile, reopened).unwrap();
    assert_eq!(next.learned_state().session_count, 1);
    let mut fired = None;
    for t in times(0.0, 6.0) {
        fired = fired.or(next.step(&frame(t, tired()), &mut presenter, None).unwrap().trigger);
    }
    let fired = fired.unwrap();
    let expected = break_duration(232.5, fired.weighted_tiredness, min_break);
    assert!((next.planned_duration(&fired) - expected).abs() < 1e-9);
}

#[test]
fn test_other_subject_keeps_defaults() {
    let config = LoopConfig::default();
    let mut store = JsonStateStore::in_memory(&config.learning);
    let trained = StateKey::new("coding", "dana");
    let mut state = alertloop::types::LearnedState::initial(300.0);
    state.scaler = 120.0;
    store.save_state(&trained, &state).unwrap();

    let session = MonitorSession::start(
        config,
        StateKey::new("coding", "erin"),
        calibrate(),
        &mut store,
    )
    .unwrap();
    assert_eq!(session.learned_state().scaler, 300.0);
    assert_eq!(session.learned_state().session_count, 0);
}

#[test]
fn test_enrolled_subject_is_recognised_and_monitored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let config = LoopConfig::default();

    {
        let mut store = JsonStateStore::open(&path, &config.learning).unwrap();
        let record =
            enroll_subject(&mut store, Some("hana"), calibrate(), &config.calibration).unwrap();
        assert_eq!(record.fingerprint, calibrate().fingerprint());
    }

    // A later calibration of the same face without an id finds the enrollment
    let mut store = JsonStateStore::open(&path, &config.learning).unwrap();
    let again = enroll_subject(&mut store, None, calibrate(), &config.calibration).unwrap();
    assert_eq!(again.subject, "hana");
    assert_eq!(store.subjects().unwrap().len(), 1);

    let profile = store.load_subject("hana").unwrap().unwrap().profile;
    let mut session = MonitorSession::start(
        config,
        StateKey::new("coding", "hana"),
        profile,
        &mut store,
    )
    .unwrap();
    let mut fired = None;
    for t in times(0.0, 4.0) {
        fired = fired.or(session.step(&frame(t, tired()), &mut NullPresenter, None).unwrap().trigger);
    }
    assert_eq!(fired.unwrap().dominant, IndexKind::Drowsiness);
}

/// Camera whose captures are just frame counters
struct CountingCamera {
    captured: u32,
}

impl FrameSource for CountingCamera {
    type Frame = u32;

    fn open(&mut self) -> Result<(), LoopError> {
        Ok(())
    }

    fn capture(&mut self) -> Result<u32, LoopError> {
        self.captured += 1;
        Ok(self.captured)
    }

    fn close(&mut self) {}
}

#[derive(Default)]
struct Grabs {
    acquired: u32,
    released: u32,
}

impl InputBlocker for Grabs {
    fn acquire(&mut self) -> Result<(), LoopError> {
        self.acquired += 1;
        Ok(())
    }

    fn release(&mut self) {
        self.released += 1;
    }
}

#[tokio::test(start_paused = true)]
async fn test_async_worker_runs_a_break() {
    let config = LoopConfig::default();
    let grabs = Arc::new(Mutex::new(Grabs::default()));

    // 50ms polling: the first 100 frames (5 seconds) are tired
    let provider = |n: &u32| -> Result<LandmarkDetection, LoopError> {
        Ok(if *n <= 100 { tired() } else { alert() })
    };
    let mut handle = spawn_monitor(MonitorSetup {
        store: JsonStateStore::in_memory(&config.learning),
        config,
        key: StateKey::new("reading", "fran"),
        profile: calibrate(),
        source: CountingCamera { captured: 0 },
        provider,
        blocker: Some(grabs.clone()),
    });

    let mut begun = false;
    let mut progress = 0;
    let outcome = loop {
        match handle.next_event().await {
            Some(MonitorEvent::BreakBegin { duration, ack, .. }) => {
                assert!((duration - 150.0).abs() < 1e-6);
                ack.send(true).unwrap();
                begun = true;
            }
            Some(MonitorEvent::BreakProgress(_)) => progress += 1,
            Some(MonitorEvent::BreakCompleted(outcome)) => break outcome,
            Some(MonitorEvent::Error(message)) => panic!("worker error: {message}"),
            Some(_) => {}
            None => panic!("worker exited before the break completed"),
        }
    };
    assert!(begun);
    assert!(progress >= 150);
    assert!(outcome.alert_before);
    assert!(!outcome.drowsy_after);
    assert!(!outcome.forced);
    {
        let grabs = grabs.lock().unwrap();
        assert_eq!(grabs.acquired, 1);
        assert_eq!(grabs.released, 1);
    }

    let summary = handle.shutdown().await.unwrap();
    assert_eq!(summary.record.breaks_triggered, 1);
    assert!((summary.scaler - 232.5).abs() < 1e-6);
    assert_eq!(summary.session_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_break_runs_unblocked() {
    let config = LoopConfig::default();
    let grabs = Arc::new(Mutex::new(Grabs::default()));
    let provider = |_: &u32| -> Result<LandmarkDetection, LoopError> { Ok(tired()) };
    let mut handle = spawn_monitor(MonitorSetup {
        store: JsonStateStore::in_memory(&config.learning),
        config,
        key: StateKey::new("reading", "gale"),
        profile: calibrate(),
        source: CountingCamera { captured: 0 },
        provider,
        blocker: Some(grabs.clone()),
    });

    // Hold the acknowledgement sender without answering until the worker
    // gives up and starts the break
    let mut pending_ack = None;
    loop {
        match handle.next_event().await {
            Some(MonitorEvent::BreakBegin { ack, .. }) => pending_ack = Some(ack),
            Some(MonitorEvent::BreakProgress(notice)) => {
                assert!(notice.phase.is_active());
                break;
            }
            Some(_) => {}
            None => panic!("worker exited early"),
        }
    }
    assert!(pending_ack.is_some());
    assert_eq!(grabs.lock().unwrap().acquired, 0);

    let summary = handle.shutdown().await.unwrap();
    assert_eq!(summary.record.breaks_triggered, 1);
    // Teardown forced the break; forced outcomes are not learned from
    assert_eq!(summary.scaler, 300.0);
}
