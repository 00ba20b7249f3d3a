// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Camera state machine tests: backoff progression, recovery, gating.

use std::sync::Arc;
use std::time::Duration;

use sai_cam::state::{CameraState, CameraStateTracker};
use sai_cam::util::clock::ManualClock;

fn tracker(interval_secs: u64) -> (Arc<ManualClock>, CameraStateTracker) {
    let clock = Arc::new(ManualClock::new());
    let tracker =
        CameraStateTracker::new("cam1", Duration::from_secs(interval_secs), clock.clone());
    (clock, tracker)
}

#[test]
fn test_backoff_progression() {
    let (clock, t) = tracker(10);
    assert_eq!(t.state(), CameraState::Healthy);
    assert_eq!(t.backoff_multiplier(), 1);

    // Failure 1: scheduled at 1x, multiplier grows to 2.
    assert!(t.record_failure("read failed"));
    assert_eq!(t.next_attempt_in(), Some(Duration::from_secs(10)));
    assert_eq!(t.backoff_multiplier(), 2);
    assert_eq!(t.state(), CameraState::Failing);

    // Failure 2 after the window: 2x, multiplier grows to 4.
    clock.advance(Duration::from_secs(10));
    assert!(t.record_failure("read failed"));
    assert_eq!(t.next_attempt_in(), Some(Duration::from_secs(20)));
    assert_eq!(t.backoff_multiplier(), 4);
    assert_eq!(t.state(), CameraState::Failing);

    // Failure 3: camera goes offline, 4x window.
    clock.advance(Duration::from_secs(20));
    assert!(t.record_failure("read failed"));
    assert_eq!(t.next_attempt_in(), Some(Duration::from_secs(40)));
    assert_eq!(t.backoff_multiplier(), 8);
    assert_eq!(t.state(), CameraState::Offline);

    // Failure 4: 8x window, multiplier caps at 12.
    clock.advance(Duration::from_secs(40));
    assert!(t.record_failure("read failed"));
    assert_eq!(t.next_attempt_in(), Some(Duration::from_secs(80)));
    assert_eq!(t.backoff_multiplier(), 12);

    // Failure 5: 12x window, multiplier stays capped.
    clock.advance(Duration::from_secs(80));
    assert!(t.record_failure("read failed"));
    assert_eq!(t.next_attempt_in(), Some(Duration::from_secs(120)));
    assert_eq!(t.backoff_multiplier(), 12);

    // Failure 6: still 12x.
    clock.advance(Duration::from_secs(120));
    assert!(t.record_failure("read failed"));
    assert_eq!(t.next_attempt_in(), Some(Duration::from_secs(120)));
    assert_eq!(t.backoff_multiplier(), 12);
    assert_eq!(t.consecutive_failures(), 6);
}

#[test]
fn test_failure_inside_backoff_window_returns_false() {
    let (clock, t) = tracker(10);
    assert!(t.record_failure("boom"));
    // Still inside the 10s window: no reconnect, multiplier untouched.
    clock.advance(Duration::from_secs(3));
    assert!(!t.record_failure("boom"));
    assert_eq!(t.backoff_multiplier(), 2);
    assert_eq!(t.consecutive_failures(), 2);
}

#[test]
fn test_recovery_resets_to_fresh_state() {
    let (clock, t) = tracker(10);
    for _ in 0..5 {
        t.record_failure("boom");
        clock.advance(Duration::from_secs(200));
    }
    assert_eq!(t.state(), CameraState::Offline);

    t.record_success();
    assert_eq!(t.state(), CameraState::Healthy);
    assert_eq!(t.consecutive_failures(), 0);
    assert_eq!(t.backoff_multiplier(), 1);
    assert_eq!(t.time_until_next_attempt(), Duration::ZERO);
    assert!(t.should_attempt_capture());

    // The next failure starts the ladder from the beginning.
    assert!(t.record_failure("boom"));
    assert_eq!(t.next_attempt_in(), Some(Duration::from_secs(10)));
}

#[test]
fn test_should_attempt_capture_gating() {
    let (clock, t) = tracker(10);
    assert!(t.should_attempt_capture());

    t.record_failure("boom");
    assert!(!t.should_attempt_capture());
    assert_eq!(t.time_until_next_attempt(), Duration::from_secs(10));

    clock.advance(Duration::from_secs(4));
    assert_eq!(t.time_until_next_attempt(), Duration::from_secs(6));
    assert!(!t.should_attempt_capture());

    clock.advance(Duration::from_secs(6));
    assert!(t.should_attempt_capture());
}

#[test]
fn test_offline_after_three_failures() {
    let (clock, t) = tracker(5);
    t.record_failure("a");
    assert_eq!(t.state(), CameraState::Failing);
    clock.advance(Duration::from_secs(60));
    t.record_failure("b");
    assert_eq!(t.state(), CameraState::Failing);
    clock.advance(Duration::from_secs(60));
    t.record_failure("c");
    assert_eq!(t.state(), CameraState::Offline);
}

#[test]
fn test_multiplier_stays_in_ladder() {
    let (clock, t) = tracker(7);
    let ladder = [1u32, 2, 4, 8, 12];
    for _ in 0..20 {
        assert!(ladder.contains(&t.backoff_multiplier()));
        t.record_failure("x");
        clock.advance(Duration::from_secs(7 * 12 + 1));
    }
    assert_eq!(t.backoff_multiplier(), 12);
}

#[test]
fn test_status_view() {
    let (clock, t) = tracker(10);
    t.record_failure("x");
    clock.advance(Duration::from_secs(2));
    let status = t.status();
    assert_eq!(status.camera_id, "cam1");
    assert_eq!(status.state, CameraState::Failing);
    assert_eq!(status.consecutive_failures, 1);
    assert_eq!(status.backoff_multiplier, 2);
    assert_eq!(status.current_backoff_seconds, 20);
    assert!((status.time_until_next_attempt - 8.0).abs() < 0.5);
}
