// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Bounded local persistence.
//!
//! Layout under `base_path`:
//!
//! ```text
//! <base>/<key>                      pending image
//! <base>/metadata/<key>.json        pending sidecar
//! <base>/uploaded/<key>             delivered image
//! <base>/uploaded/metadata/<key>.json
//! ```
//!
//! Eviction deletes uploaded items before pending ones, oldest first, and
//! never removes an image without also removing its sidecar. Cleanup runs
//! under a mutex; stores may proceed concurrently (cleanup tolerates files
//! vanishing underneath it).

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::error::{AgentError, Result};

const CLEANUP_PERIOD: Duration = Duration::from_secs(3600);
const CLEANUP_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub total_images: usize,
    pub uploaded_images: usize,
    pub pending_images: usize,
    pub total_size_mb: f64,
    pub uploaded_size_mb: f64,
    pub max_size_gb: f64,
}

pub struct StorageManager {
    base: PathBuf,
    uploaded: PathBuf,
    metadata_dir: PathBuf,
    uploaded_metadata: PathBuf,
    max_size_bytes: u64,
    cleanup_threshold_bytes: u64,
    retention: Duration,
    max_size_gb: f64,
    cleanup_lock: Mutex<()>,
}

impl StorageManager {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let base = config.base_path.clone();
        let uploaded = base.join("uploaded");
        let metadata_dir = base.join("metadata");
        let uploaded_metadata = uploaded.join("metadata");
        for dir in [&base, &uploaded, &metadata_dir, &uploaded_metadata] {
            std::fs::create_dir_all(dir)
                .map_err(|e| AgentError::Storage(format!("Cannot create {}: {e}", dir.display())))?;
        }
        Ok(Self {
            base,
            uploaded,
            metadata_dir,
            uploaded_metadata,
            max_size_bytes: gb_to_bytes(config.max_size_gb),
            cleanup_threshold_bytes: gb_to_bytes(config.cleanup_threshold_gb),
            retention: Duration::from_secs(config.retention_days * 24 * 3600),
            max_size_gb: config.max_size_gb,
            cleanup_lock: Mutex::new(()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Total bytes under the storage root, best effort.
    pub fn current_size_bytes(&self) -> u64 {
        dir_size(&self.base)
    }

    /// Persist an image and its sidecar. At or above the hard limit a forced
    /// cleanup runs first; if the write still fails the item is dropped.
    pub fn store<M: Serialize>(&self, bytes: &[u8], key: &str, metadata: Option<&M>) -> Result<()> {
        let current = self.current_size_bytes();
        debug!(
            used_mb = current / (1024 * 1024),
            limit_mb = self.max_size_bytes / (1024 * 1024),
            "Storage usage before store"
        );
        if current >= self.max_size_bytes {
            warn!(
                used_mb = current / (1024 * 1024),
                "Storage limit reached, forcing cleanup"
            );
            self.cleanup(true);
        }

        // Sidecar first so a crash can't leave a pending image without one.
        if let Some(meta) = metadata {
            let sidecar = self.metadata_dir.join(format!("{key}.json"));
            let json = serde_json::to_vec(meta)
                .map_err(|e| AgentError::Storage(format!("Cannot serialize metadata: {e}")))?;
            std::fs::write(&sidecar, json)
                .map_err(|e| AgentError::Storage(format!("Cannot write sidecar: {e}")))?;
        }

        let path = self.base.join(key);
        std::fs::write(&path, bytes)
            .map_err(|e| AgentError::Storage(format!("Cannot write {key}: {e}")))?;
        info!(key, size_kb = format!("{:.1}", bytes.len() as f64 / 1024.0), "Stored image");
        Ok(())
    }

    /// Promote a delivered item into `uploaded/`, sidecar included. A missing
    /// source means the item was evicted between enqueue and ack; tolerated.
    pub fn mark_uploaded(&self, key: &str) -> Result<()> {
        let src = self.base.join(key);
        if src.exists() {
            std::fs::rename(&src, self.uploaded.join(key))
                .map_err(|e| AgentError::Storage(format!("Cannot move {key}: {e}")))?;
        }
        let meta_src = self.metadata_dir.join(format!("{key}.json"));
        if meta_src.exists() {
            std::fs::rename(&meta_src, self.uploaded_metadata.join(format!("{key}.json")))
                .map_err(|e| AgentError::Storage(format!("Cannot move sidecar for {key}: {e}")))?;
        }
        debug!(key, "Marked as uploaded");
        Ok(())
    }

    /// Evict until usage drops below the soft threshold. Uploaded items go
    /// first, then pending, both oldest first. With `force` the retention
    /// window is ignored; otherwise only items older than retention die.
    pub fn cleanup(&self, force: bool) {
        let _guard = self.cleanup_lock.lock();

        let mut usage = self.current_size_bytes();
        if !force && usage < self.cleanup_threshold_bytes {
            return;
        }
        info!(
            used_mb = usage / (1024 * 1024),
            force,
            "Starting storage cleanup"
        );

        let now = SystemTime::now();
        let passes: [(&Path, &Path); 2] = [
            (&self.uploaded, &self.uploaded_metadata),
            (&self.base, &self.metadata_dir),
        ];
        'outer: for (dir, meta_dir) in passes {
            for (path, mtime, size) in jpg_files_by_mtime(dir) {
                if usage < self.cleanup_threshold_bytes {
                    break 'outer;
                }
                let age = now.duration_since(mtime).unwrap_or(Duration::ZERO);
                if !force && age <= self.retention {
                    continue;
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        usage = usage.saturating_sub(size);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        // Another pass already removed it.
                        debug!(path = %path.display(), "File already removed during cleanup");
                        continue;
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to delete during cleanup");
                        continue;
                    }
                }
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    let sidecar = meta_dir.join(format!("{name}.json"));
                    match std::fs::remove_file(&sidecar) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            warn!(path = %sidecar.display(), error = %e, "Failed to delete sidecar")
                        }
                    }
                }
            }
        }

        info!(
            used_mb = self.current_size_bytes() / (1024 * 1024),
            "Cleanup completed"
        );
    }

    /// Hourly cleanup loop. Runs until cancelled.
    pub async fn run_periodic(&self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(CLEANUP_PERIOD) => {}
            }
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.cleanup(false);
            }));
            if result.is_err() {
                error!("Storage cleanup panicked, retrying shortly");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(CLEANUP_RETRY) => {}
                }
            }
        }
    }

    /// Newest stored image for a camera, pending preferred over uploaded.
    pub fn latest_image(&self, camera_id: &str) -> Option<PathBuf> {
        let prefix = format!("{camera_id}_");
        let newest = |dir: &Path| {
            jpg_files_by_mtime(dir)
                .into_iter()
                .filter(|(p, _, _)| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&prefix))
                })
                .max_by_key(|(_, mtime, _)| *mtime)
        };
        newest(&self.base)
            .or_else(|| newest(&self.uploaded))
            .map(|(p, _, _)| p)
    }

    /// Pending images with their modification times, for the upload rescan.
    pub fn pending_items(&self) -> Vec<(String, SystemTime)> {
        jpg_files_by_mtime(&self.base)
            .into_iter()
            .filter_map(|(p, mtime, _)| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| (n.to_string(), mtime))
            })
            .collect()
    }

    pub fn read_pending(&self, key: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.base.join(key))?)
    }

    pub fn read_sidecar(&self, key: &str) -> Option<serde_json::Value> {
        let bytes = std::fs::read(self.metadata_dir.join(format!("{key}.json"))).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn stats(&self) -> StorageStats {
        let pending = jpg_files_by_mtime(&self.base);
        let uploaded = jpg_files_by_mtime(&self.uploaded);
        let pending_size: u64 = pending.iter().map(|(_, _, s)| s).sum();
        let uploaded_size: u64 = uploaded.iter().map(|(_, _, s)| s).sum();
        StorageStats {
            total_images: pending.len() + uploaded.len(),
            uploaded_images: uploaded.len(),
            pending_images: pending.len(),
            total_size_mb: (pending_size + uploaded_size) as f64 / (1024.0 * 1024.0),
            uploaded_size_mb: uploaded_size as f64 / (1024.0 * 1024.0),
            max_size_gb: self.max_size_gb,
        }
    }
}

fn gb_to_bytes(gb: f64) -> u64 {
    (gb * 1024.0 * 1024.0 * 1024.0) as u64
}

/// Total size of all files under `dir`, recursively. Unreadable entries are
/// skipped; a half-counted tree only makes cleanup run a little early or late.
fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total += dir_size(&path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}

/// Direct (non-recursive) `*.jpg` children sorted by mtime ascending.
fn jpg_files_by_mtime(dir: &Path) -> Vec<(PathBuf, SystemTime, u64)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<(PathBuf, SystemTime, u64)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jpg") {
                return None;
            }
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let mtime = meta.modified().ok()?;
            Some((path, mtime, meta.len()))
        })
        .collect();
    files.sort_by_key(|(_, mtime, _)| *mtime);
    files
}
