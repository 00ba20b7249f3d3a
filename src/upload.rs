// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Upload pipeline.
//!
//! Capture loops enqueue [`UploadItem`]s into a bounded channel; a single
//! worker drains it FIFO and POSTs each item to the ingest endpoint as a
//! multipart request (`image` + `metadata`) with a bearer token. Delivered
//! items are promoted to `uploaded/` in storage. Anything else stays pending
//! on disk; a periodic rescan re-attempts stranded pending files, so delivery
//! survives restarts and long outages.
//!
//! When uploads are disabled (`--local-save`) the worker exits immediately
//! and the queue is deliberately left untouched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::storage::StorageManager;
use crate::util::redact::redact_url_credentials;

const QUEUE_BOUND: usize = 1000;
const RESCAN_PERIOD: Duration = Duration::from_secs(60);
/// Pending files younger than this are assumed to still be in the queue.
const RESCAN_MIN_AGE: Duration = Duration::from_secs(120);
/// Do not re-attempt the same key more often than this.
const RETRY_MIN_INTERVAL: Duration = Duration::from_secs(60);
const RESCAN_BATCH: usize = 10;

/// One image on its way to the ingest endpoint.
#[derive(Debug)]
pub struct UploadItem {
    pub key: String,
    pub bytes: Bytes,
    pub metadata: serde_json::Value,
    pub camera_id: String,
}

pub fn upload_channel() -> (mpsc::Sender<UploadItem>, mpsc::Receiver<UploadItem>) {
    mpsc::channel(QUEUE_BOUND)
}

/// Recover the camera id from a storage key
/// (`<camera_id>_<%Y-%m-%d_%H-%M-%S>.jpg`; camera ids may contain `_`).
pub fn camera_id_from_key(key: &str) -> &str {
    const TS_LEN: usize = "2026-01-01_00-00-00".len();
    key.strip_suffix(".jpg")
        .filter(|stem| stem.len() > TS_LEN)
        .map(|stem| &stem[..stem.len() - TS_LEN])
        .and_then(|s| s.strip_suffix('_'))
        .unwrap_or(key)
}

pub struct Uploader {
    storage: Arc<StorageManager>,
    config: Arc<std::sync::RwLock<NodeConfig>>,
    enabled: bool,
    client: reqwest::Client,
    client_ssl_verify: bool,
    last_attempt: HashMap<String, Instant>,
}

impl Uploader {
    pub fn new(
        storage: Arc<StorageManager>,
        config: Arc<std::sync::RwLock<NodeConfig>>,
        enabled: bool,
    ) -> Self {
        let (ssl_verify, cert_path) = config
            .read()
            .map(|c| (c.server.ssl_verify, c.server.cert_path.clone()))
            .unwrap_or((true, None));
        Self {
            storage,
            config,
            enabled,
            client: build_client(ssl_verify, cert_path.as_deref()),
            client_ssl_verify: ssl_verify,
            last_attempt: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<UploadItem>, token: CancellationToken) {
        if !self.enabled {
            info!("Upload functionality disabled");
            return;
        }
        info!("Upload worker started");
        let mut rescan = tokio::time::interval(RESCAN_PERIOD);
        rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                item = rx.recv() => {
                    match item {
                        Some(item) => { self.upload(item).await; }
                        None => break,
                    }
                }
                _ = rescan.tick() => self.rescan().await,
            }
        }
        info!("Upload worker stopped");
    }

    fn endpoint(&self) -> Option<(String, String, Duration, bool)> {
        let cfg = self.config.read().ok()?;
        if cfg.server.url.is_empty() {
            return None;
        }
        Some((
            cfg.server.url.clone(),
            cfg.server.auth_token.clone(),
            Duration::from_secs(cfg.server.timeout.max(1)),
            cfg.server.ssl_verify,
        ))
    }

    /// Returns `true` when the item was delivered and promoted.
    async fn upload(&mut self, item: UploadItem) -> bool {
        let Some((url, auth_token, timeout, ssl_verify)) = self.endpoint() else {
            debug!(key = %item.key, "No ingest endpoint configured, leaving item pending");
            return false;
        };
        if ssl_verify != self.client_ssl_verify {
            let cert_path = self
                .config
                .read()
                .ok()
                .and_then(|c| c.server.cert_path.clone());
            self.client = build_client(ssl_verify, cert_path.as_deref());
            self.client_ssl_verify = ssl_verify;
        }
        self.last_attempt.insert(item.key.clone(), Instant::now());

        info!(
            camera = %item.camera_id,
            key = %item.key,
            size_kb = format!("{:.1}", item.bytes.len() as f64 / 1024.0),
            url = %redact_url_credentials(&url),
            "Uploading image"
        );

        let metadata_json = match serde_json::to_string(&item.metadata) {
            Ok(json) => json,
            Err(e) => {
                error!(key = %item.key, error = %e, "Cannot serialize metadata, dropping item");
                return false;
            }
        };
        let image_part = reqwest::multipart::Part::bytes(item.bytes.to_vec())
            .file_name(item.key.clone())
            .mime_str("image/jpeg");
        let metadata_part = reqwest::multipart::Part::text(metadata_json)
            .file_name("metadata.json")
            .mime_str("application/json");
        let (image_part, metadata_part) = match (image_part, metadata_part) {
            (Ok(i), Ok(m)) => (i, m),
            _ => {
                error!(key = %item.key, "Cannot build multipart request, dropping item");
                return false;
            }
        };
        let form = reqwest::multipart::Form::new()
            .part("image", image_part)
            .part("metadata", metadata_part);

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .bearer_auth(&auth_token)
            .timeout(timeout)
            .multipart(form)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                if let Err(e) = self.storage.mark_uploaded(&item.key) {
                    warn!(key = %item.key, error = %e, "Uploaded but could not promote");
                }
                self.last_attempt.remove(&item.key);
                info!(
                    key = %item.key,
                    elapsed = format!("{:.2}s", started.elapsed().as_secs_f64()),
                    "Successfully uploaded"
                );
                true
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                error!(
                    key = %item.key,
                    status = %status,
                    body = %body.chars().take(100).collect::<String>(),
                    "Upload failed, item stays pending"
                );
                false
            }
            Err(e) => {
                error!(key = %item.key, error = %e, "Upload transport error, item stays pending");
                false
            }
        }
    }

    /// Re-attempt pending files that fell out of the queue (crash, long
    /// outage, full channel). Oldest first, small batches.
    async fn rescan(&mut self) {
        let now = Instant::now();
        self.last_attempt
            .retain(|_, at| now.duration_since(*at) < RETRY_MIN_INTERVAL * 10);

        let mut uploaded = 0usize;
        for (key, mtime) in self.storage.pending_items() {
            if uploaded >= RESCAN_BATCH {
                break;
            }
            let age = std::time::SystemTime::now()
                .duration_since(mtime)
                .unwrap_or(Duration::ZERO);
            if age < RESCAN_MIN_AGE {
                continue;
            }
            if self
                .last_attempt
                .get(&key)
                .is_some_and(|at| now.duration_since(*at) < RETRY_MIN_INTERVAL)
            {
                continue;
            }
            let bytes = match self.storage.read_pending(&key) {
                Ok(bytes) => Bytes::from(bytes),
                Err(_) => continue, // evicted between scan and read
            };
            let metadata = self
                .storage
                .read_sidecar(&key)
                .unwrap_or(serde_json::Value::Null);
            let camera_id = camera_id_from_key(&key).to_string();
            debug!(key = %key, "Re-attempting stranded pending item");
            if self.upload(UploadItem { key, bytes, metadata, camera_id }).await {
                uploaded += 1;
            }
        }
    }
}

fn build_client(ssl_verify: bool, cert_path: Option<&std::path::Path>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(!ssl_verify);
    if let Some(path) = cert_path {
        match std::fs::read(path).map(|pem| reqwest::Certificate::from_pem(&pem)) {
            Ok(Ok(cert)) => builder = builder.add_root_certificate(cert),
            Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Invalid CA certificate"),
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot read CA certificate"),
        }
    }
    builder.build().unwrap_or_default()
}
