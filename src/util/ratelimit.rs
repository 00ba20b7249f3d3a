// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Keyed log rate limiter.
//!
//! The same event (identified by a key) passes once per interval; suppressed
//! repetitions are counted and reported with the next emitted line. Used to
//! keep offline cameras from flooding the log.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::util::clock::SharedClock;

#[derive(Debug, Clone, Copy)]
struct KeyState {
    last_logged: std::time::Instant,
    suppressed: u64,
}

pub struct RateLimiter {
    clock: SharedClock,
    default_interval: Duration,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl RateLimiter {
    pub fn new(clock: SharedClock, default_interval: Duration) -> Self {
        Self {
            clock,
            default_interval,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Some(suppressed_count)` when the caller should log now, `None`
    /// while the key is still inside its interval.
    pub fn check(&self, key: &str, interval: Option<Duration>) -> Option<u64> {
        let now = self.clock.now();
        let interval = interval.unwrap_or(self.default_interval);
        let mut keys = self.keys.lock();

        match keys.get_mut(key) {
            Some(state) if now.duration_since(state.last_logged) < interval => {
                state.suppressed += 1;
                None
            }
            Some(state) => {
                let suppressed = state.suppressed;
                state.last_logged = now;
                state.suppressed = 0;
                Some(suppressed)
            }
            None => {
                keys.insert(key.to_string(), KeyState { last_logged: now, suppressed: 0 });
                Some(0)
            }
        }
    }

    /// Append the suppressed count to a message when repetitions were dropped.
    pub fn format(msg: &str, suppressed: u64) -> String {
        if suppressed > 0 {
            format!("{msg} (repeated {suppressed}x since last log)")
        } else {
            msg.to_string()
        }
    }

    /// Forget a key so the next occurrence logs immediately. Called when a
    /// camera recovers.
    pub fn clear_key(&self, key: &str) {
        self.keys.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.keys.lock().clear();
    }
}
