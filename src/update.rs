// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Update state file shared with the external self-update procedure.
//!
//! Two writers touch this file (the agent and the update script), so every
//! write goes through a temp file, fsync and an atomic rename; a concurrent
//! reader sees either the old document or the new one, never a torn write.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

pub const DEFAULT_STATE_PATH: &str = "/var/lib/sai-cam/update-state.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateState {
    pub status: String,
    pub current_version: String,
    pub latest_available: String,
    pub previous_version: String,
    pub last_check: String,
    pub last_update: String,
    pub consecutive_failures: u32,
    pub channel: String,
}

impl Default for UpdateState {
    fn default() -> Self {
        Self {
            status: "unknown".into(),
            current_version: "0.0.0".into(),
            latest_available: String::new(),
            previous_version: String::new(),
            last_check: String::new(),
            last_update: String::new(),
            consecutive_failures: 0,
            channel: "stable".into(),
        }
    }
}

/// State plus the derived `update_available` flag, as served by the portal.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateInfo {
    #[serde(flatten)]
    pub state: UpdateState,
    pub update_available: bool,
}

/// Read the state file, tolerating a missing or corrupt file. Fields absent
/// from the file keep their defaults.
pub fn read_state(path: &Path) -> UpdateState {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
        Err(_) => UpdateState::default(),
    }
}

/// Merge a mutation into the existing state and persist it atomically.
/// Parent directories are created as needed.
pub fn write_state<F>(path: &Path, mutate: F) -> Result<UpdateState>
where
    F: FnOnce(&mut UpdateState),
{
    let mut state = read_state(path);
    mutate(&mut state);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AgentError::UpdateState(format!("Cannot create {}: {e}", parent.display())))?;
    }

    let json = serde_json::to_string_pretty(&state)
        .map_err(|e| AgentError::UpdateState(format!("Cannot serialize state: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut f = std::fs::File::create(&tmp)
            .map_err(|e| AgentError::UpdateState(format!("Cannot create temp file: {e}")))?;
        f.write_all(json.as_bytes())
            .map_err(|e| AgentError::UpdateState(format!("Cannot write temp file: {e}")))?;
        f.sync_all()
            .map_err(|e| AgentError::UpdateState(format!("fsync failed: {e}")))?;
    }
    std::fs::rename(&tmp, path)
        .map_err(|e| AgentError::UpdateState(format!("Atomic rename failed: {e}")))?;
    Ok(state)
}

/// Parsed version: numeric components, release flag, pre-release tag.
/// A release sorts after its own pre-releases; equal bases fall back to a
/// lexicographic pre-release comparison.
fn parse_version(v: &str) -> (Vec<u64>, bool, String) {
    let v = v.trim().trim_start_matches('v');
    let (base, prerelease) = match v.split_once('-') {
        Some((base, pre)) => (base, Some(pre)),
        None => (v, None),
    };
    let parts = base
        .split('.')
        .map(|p| p.parse::<u64>().unwrap_or(0))
        .collect();
    (parts, prerelease.is_none(), prerelease.unwrap_or_default().to_string())
}

/// `true` when `candidate` is strictly newer than `current`.
pub fn check_version_newer(current: &str, candidate: &str) -> bool {
    parse_version(candidate) > parse_version(current)
}

/// State document enriched with `update_available`, for API responses.
pub fn get_update_info(path: &Path) -> UpdateInfo {
    let state = read_state(path);
    let update_available = !state.latest_available.is_empty()
        && check_version_newer(&state.current_version, &state.latest_available);
    UpdateInfo { state, update_available }
}
