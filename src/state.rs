// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-camera health state machine with exponential backoff.
//!
//! A camera is `healthy`, `failing` (1–2 consecutive failures) or `offline`
//! (3 or more). While not healthy, capture attempts are gated by
//! `next_attempt`, scheduled at `capture_interval × multiplier` with the
//! multiplier doubling 1→2→4→8→12 (capped) on every attempted failure. The
//! tracker never blocks; timing is advisory and the capture loop sleeps.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::util::clock::SharedClock;
use crate::util::ratelimit::RateLimiter;

pub const MAX_BACKOFF_MULTIPLIER: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraState {
    Healthy,
    Failing,
    Offline,
}

#[derive(Debug)]
struct TrackerInner {
    state: CameraState,
    consecutive_failures: u32,
    backoff_multiplier: u32,
    last_success: Instant,
    next_attempt: Option<Instant>,
}

/// Compact status view used by health snapshots and the portal.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStatus {
    pub camera_id: String,
    pub state: CameraState,
    pub consecutive_failures: u32,
    pub backoff_multiplier: u32,
    pub current_backoff_seconds: u64,
    pub time_until_next_attempt: f64,
    pub last_success_age: f64,
}

pub struct CameraStateTracker {
    camera_id: String,
    capture_interval: Duration,
    clock: SharedClock,
    limiter: RateLimiter,
    inner: Mutex<TrackerInner>,
}

impl CameraStateTracker {
    pub fn new(camera_id: impl Into<String>, capture_interval: Duration, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            camera_id: camera_id.into(),
            capture_interval,
            limiter: RateLimiter::new(clock.clone(), capture_interval),
            clock,
            inner: Mutex::new(TrackerInner {
                state: CameraState::Healthy,
                consecutive_failures: 0,
                backoff_multiplier: 1,
                last_success: now,
                next_attempt: None,
            }),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    fn offline_key(&self) -> String {
        format!("{}_offline", self.camera_id)
    }

    fn failure_key(&self) -> String {
        format!("{}_failure", self.camera_id)
    }

    fn current_backoff(&self, multiplier: u32) -> Duration {
        self.capture_interval * multiplier
    }

    /// Record a successful capture: back to `healthy`, counters reset, the
    /// camera's rate-limit keys cleared so the next problem logs immediately.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CameraState::Healthy {
            info!(
                camera = %self.camera_id,
                failures = inner.consecutive_failures,
                "Camera recovered"
            );
            self.limiter.clear_key(&self.offline_key());
            self.limiter.clear_key(&self.failure_key());
        }
        inner.state = CameraState::Healthy;
        inner.consecutive_failures = 0;
        inner.backoff_multiplier = 1;
        inner.last_success = self.clock.now();
        inner.next_attempt = None;
    }

    /// Record a failed capture. Returns `true` when the caller should attempt
    /// recovery (reconnect) now, `false` while still inside a backoff window.
    pub fn record_failure(&self, reason: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let now = self.clock.now();

        let new_state = if inner.consecutive_failures >= 3 {
            CameraState::Offline
        } else {
            CameraState::Failing
        };

        let backoff = self.current_backoff(inner.backoff_multiplier);
        if new_state != inner.state {
            if new_state == CameraState::Offline {
                if let Some(suppressed) = self.limiter.check(&self.offline_key(), None) {
                    warn!(
                        camera = %self.camera_id,
                        failures = inner.consecutive_failures,
                        retry_secs = backoff.as_secs(),
                        "{}",
                        RateLimiter::format("Camera marked offline", suppressed)
                    );
                }
            } else {
                warn!(
                    camera = %self.camera_id,
                    failure = inner.consecutive_failures,
                    "Capture failed: {reason}"
                );
            }
            inner.state = new_state;
        } else if let Some(suppressed) = self.limiter.check(&self.failure_key(), Some(backoff)) {
            warn!(
                camera = %self.camera_id,
                retry_secs = backoff.as_secs(),
                "{}",
                RateLimiter::format("Camera still offline", suppressed)
            );
        }

        if let Some(next) = inner.next_attempt {
            if now < next {
                return false;
            }
        }

        // Schedule the next attempt, then grow the multiplier for the one after.
        inner.next_attempt = Some(now + backoff);
        if inner.backoff_multiplier < MAX_BACKOFF_MULTIPLIER {
            inner.backoff_multiplier =
                (inner.backoff_multiplier * 2).min(MAX_BACKOFF_MULTIPLIER);
        }
        true
    }

    /// Whether a capture may be attempted right now.
    pub fn should_attempt_capture(&self) -> bool {
        let inner = self.inner.lock();
        if inner.state == CameraState::Healthy {
            return true;
        }
        match inner.next_attempt {
            Some(next) => self.clock.now() >= next,
            None => true,
        }
    }

    /// Remaining backoff, zero when healthy or due.
    pub fn time_until_next_attempt(&self) -> Duration {
        let inner = self.inner.lock();
        if inner.state == CameraState::Healthy {
            return Duration::ZERO;
        }
        match inner.next_attempt {
            Some(next) => next.saturating_duration_since(self.clock.now()),
            None => Duration::ZERO,
        }
    }

    pub fn state(&self) -> CameraState {
        self.inner.lock().state
    }

    pub fn status(&self) -> TrackerStatus {
        let inner = self.inner.lock();
        let now = self.clock.now();
        let until_next = match (inner.state, inner.next_attempt) {
            (CameraState::Healthy, _) | (_, None) => Duration::ZERO,
            (_, Some(next)) => next.saturating_duration_since(now),
        };
        TrackerStatus {
            camera_id: self.camera_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            backoff_multiplier: inner.backoff_multiplier,
            current_backoff_seconds: self.current_backoff(inner.backoff_multiplier).as_secs(),
            time_until_next_attempt: until_next.as_secs_f64(),
            last_success_age: now.duration_since(inner.last_success).as_secs_f64(),
        }
    }

    /// Scheduled offset of the next attempt from now, for tests and status.
    pub fn next_attempt_in(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .next_attempt
            .map(|next| next.saturating_duration_since(self.clock.now()))
    }

    pub fn backoff_multiplier(&self) -> u32 {
        self.inner.lock().backoff_multiplier
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}
