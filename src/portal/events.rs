//! `/api/events` — Server-Sent Events stream.
//!
//! Four named event types at tiered cadences, each emitted only when its
//! payload actually changed since the last emission (change detection by
//! payload hash):
//!
//! - `health` — every second: health snapshot + portal version
//! - `status` — every 20 seconds: network, update state, wifi AP
//! - `slow`   — every 500 seconds: storage scan
//! - `log`    — new lines appended to the camera or update log, tagged with
//!   their source; rotation (size decrease) resets the tail offset

use std::collections::hash_map::DefaultHasher;
use std::convert::Infallible;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use serde_json::json;
use tokio::time::Instant;

use crate::portal::{log_paths, AppState};
use crate::update::get_update_info;

const HEALTH_PERIOD: Duration = Duration::from_secs(1);
const STATUS_PERIOD: Duration = Duration::from_secs(20);
const SLOW_PERIOD: Duration = Duration::from_secs(500);

fn payload_hash(payload: &serde_json::Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.to_string().hash(&mut hasher);
    hasher.finish()
}

/// Per-connection tail state for one log file.
struct FileTail {
    source: &'static str,
    path: PathBuf,
    offset: u64,
}

impl FileTail {
    fn new(source: &'static str, path: PathBuf) -> Self {
        // Start at the current end; only lines appended after connect stream.
        let offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self { source, path, offset }
    }

    /// Size check + seek; returns freshly appended complete lines.
    fn poll(&mut self) -> Vec<String> {
        use std::io::{Read, Seek, SeekFrom};

        let Ok(meta) = std::fs::metadata(&self.path) else {
            return Vec::new();
        };
        let size = meta.len();
        if size < self.offset {
            // Rotated or truncated underneath us.
            self.offset = 0;
        }
        if size == self.offset {
            return Vec::new();
        }
        let Ok(mut file) = std::fs::File::open(&self.path) else {
            return Vec::new();
        };
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return Vec::new();
        }
        let mut new_text = String::new();
        if file.read_to_string(&mut new_text).is_err() {
            return Vec::new();
        }
        self.offset = size;
        new_text
            .lines()
            .map(|l| l.trim_end().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }
}

pub async fn handle_events(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stream = async_stream::stream! {
        let mut tails: Vec<FileTail> = state
            .config_snapshot()
            .map(|cfg| {
                let (camera, update) = log_paths(&cfg);
                vec![FileTail::new("camera", camera), FileTail::new("update", update)]
            })
            .unwrap_or_default();

        let mut tick = tokio::time::interval(HEALTH_PERIOD);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut last_status_emit: Option<Instant> = None;
        let mut last_slow_emit: Option<Instant> = None;
        let mut health_hash = 0u64;
        let mut status_hash = 0u64;
        let mut slow_hash = 0u64;

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            let now = Instant::now();

            // health tier, every tick
            let snapshot = state.bus.snapshot();
            let payload = json!({
                "health": snapshot,
                "version": crate::VERSION,
            });
            let hash = payload_hash(&payload);
            if hash != health_hash {
                health_hash = hash;
                yield Ok::<Event, Infallible>(
                    Event::default().event("health").data(payload.to_string()),
                );
            }

            // status tier
            let status_due = last_status_emit
                .map(|at| now.duration_since(at) >= STATUS_PERIOD)
                .unwrap_or(true);
            if status_due {
                last_status_emit = Some(now);
                if let Some(cfg) = state.config_snapshot() {
                    let payload = json!({
                        "network": crate::portal::network_info(&cfg).await,
                        "update": if cfg.updates.enabled {
                            serde_json::to_value(get_update_info(&cfg.updates.state_path))
                                .unwrap_or(serde_json::Value::Null)
                        } else {
                            serde_json::Value::Null
                        },
                        "wifi_ap": crate::portal::wifi_ap_info(&cfg).await,
                    });
                    let hash = payload_hash(&payload);
                    if hash != status_hash {
                        status_hash = hash;
                        yield Ok(Event::default().event("status").data(payload.to_string()));
                    }
                }
            }

            // slow tier
            let slow_due = last_slow_emit
                .map(|at| now.duration_since(at) >= SLOW_PERIOD)
                .unwrap_or(true);
            if slow_due {
                last_slow_emit = Some(now);
                let payload = json!({"storage": state.storage.stats()});
                let hash = payload_hash(&payload);
                if hash != slow_hash {
                    slow_hash = hash;
                    yield Ok(Event::default().event("slow").data(payload.to_string()));
                }
            }

            // log tier, real time
            for tail in &mut tails {
                for line in tail.poll() {
                    let payload = json!({"source": tail.source, "log": line});
                    yield Ok(Event::default().event("log").data(payload.to_string()));
                }
            }
        }
    };

    (
        // Disable intermediate buffering so events reach the browser promptly.
        [("x-accel-buffering", "no"), ("cache-control", "no-cache")],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
}
