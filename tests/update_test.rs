// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Update-state file and version comparison tests.

use tempfile::TempDir;

use sai_cam::update::{check_version_newer, get_update_info, read_state, write_state};

#[test]
fn test_read_missing_returns_defaults() {
    let dir = TempDir::new().expect("tempdir");
    let state = read_state(&dir.path().join("nope.json"));
    assert_eq!(state.status, "unknown");
    assert_eq!(state.current_version, "0.0.0");
    assert_eq!(state.channel, "stable");
    assert_eq!(state.consecutive_failures, 0);
}

#[test]
fn test_read_corrupt_returns_defaults() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("update-state.json");
    std::fs::write(&path, b"{not json!").expect("write");
    let state = read_state(&path);
    assert_eq!(state.status, "unknown");
}

#[test]
fn test_write_merges_and_round_trips() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("state").join("update-state.json");

    write_state(&path, |s| {
        s.status = "ok".into();
        s.current_version = "0.2.5".into();
    })
    .expect("first write");

    // Second write patches one field; the rest must survive.
    write_state(&path, |s| {
        s.latest_available = "0.3.0".into();
    })
    .expect("second write");

    let state = read_state(&path);
    assert_eq!(state.status, "ok");
    assert_eq!(state.current_version, "0.2.5");
    assert_eq!(state.latest_available, "0.3.0");

    // No temp file left behind after the atomic rename.
    assert!(!path.with_extension("json.tmp").exists());
}

#[test]
fn test_partial_file_keeps_defaults_for_missing_fields() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("update-state.json");
    std::fs::write(&path, br#"{"status": "updating"}"#).expect("write");
    let state = read_state(&path);
    assert_eq!(state.status, "updating");
    assert_eq!(state.current_version, "0.0.0");
    assert_eq!(state.channel, "stable");
}

#[test]
fn test_version_comparisons() {
    assert!(!check_version_newer("0.2.5", "0.2.5"));
    assert!(check_version_newer("0.2.5", "0.2.6"));
    assert!(!check_version_newer("0.2.6", "0.2.5"));
    assert!(check_version_newer("0.3.0-beta.1", "0.3.0"));
    assert!(!check_version_newer("0.3.0", "0.3.0-beta.1"));
    assert!(check_version_newer("v0.2.5", "v0.3.0"));
    assert!(check_version_newer("0.2.5", "v0.3.0"));
    assert!(check_version_newer("0.9.9", "1.0.0"));
    assert!(check_version_newer("0.3.0-beta.1", "0.3.0-beta.2"));
}

#[test]
fn test_version_order_is_strict() {
    let versions = ["0.2.5", "0.2.6", "0.3.0-beta.1", "0.3.0", "1.0.0", "v1.0.1"];
    for a in versions {
        // Irreflexive.
        assert!(!check_version_newer(a, a), "newer({a},{a}) must be false");
        for b in versions {
            // Antisymmetric.
            if check_version_newer(a, b) {
                assert!(!check_version_newer(b, a), "both {a}<{b} and {b}<{a}");
            }
            for c in versions {
                // Transitive.
                if check_version_newer(a, b) && check_version_newer(b, c) {
                    assert!(check_version_newer(a, c), "{a}<{b}<{c} but not {a}<{c}");
                }
            }
        }
    }
}

#[test]
fn test_get_update_info_flag() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("update-state.json");

    write_state(&path, |s| {
        s.current_version = "0.2.5".into();
        s.latest_available = "0.3.0".into();
    })
    .expect("write");
    assert!(get_update_info(&path).update_available);

    write_state(&path, |s| {
        s.latest_available = "0.2.5".into();
    })
    .expect("write");
    assert!(!get_update_info(&path).update_available);

    // Empty latest means "never checked": no update offered.
    write_state(&path, |s| {
        s.latest_available = String::new();
    })
    .expect("write");
    assert!(!get_update_info(&path).update_available);
}
