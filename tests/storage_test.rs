// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage lifecycle tests: store, promotion, eviction order, retention.

use std::path::Path;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use sai_cam::config::StorageConfig;
use sai_cam::storage::StorageManager;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

fn manager(dir: &Path, max_bytes: u64, threshold_bytes: u64, retention_days: u64) -> StorageManager {
    let config = StorageConfig {
        base_path: dir.to_path_buf(),
        max_size_gb: max_bytes as f64 / GB,
        cleanup_threshold_gb: threshold_bytes as f64 / GB,
        retention_days,
    };
    StorageManager::new(&config).expect("create storage manager")
}

#[test]
fn test_store_and_mark_uploaded_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    let storage = manager(dir.path(), 1 << 30, 1 << 29, 30);

    let bytes = vec![0xFFu8; 100];
    let key = "camA_2026-01-01_00-00-00.jpg";
    storage.store(&bytes, key, Some(&json!({"k": "v"}))).expect("store");

    assert!(dir.path().join(key).exists());
    assert!(dir.path().join("metadata").join(format!("{key}.json")).exists());

    storage.mark_uploaded(key).expect("mark uploaded");

    let uploaded = dir.path().join("uploaded").join(key);
    assert!(uploaded.exists());
    assert!(!dir.path().join(key).exists());
    assert_eq!(std::fs::read(&uploaded).expect("read uploaded"), bytes);

    let sidecar = dir.path().join("uploaded").join("metadata").join(format!("{key}.json"));
    assert!(sidecar.exists());
    assert!(!dir.path().join("metadata").join(format!("{key}.json")).exists());
    let meta: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&sidecar).expect("read sidecar")).expect("parse");
    assert_eq!(meta, json!({"k": "v"}));
}

#[test]
fn test_mark_uploaded_tolerates_missing_files() {
    let dir = TempDir::new().expect("tempdir");
    let storage = manager(dir.path(), 1 << 30, 1 << 29, 30);
    // Evicted between enqueue and ack: not an error.
    storage.mark_uploaded("gone_2026-01-01_00-00-00.jpg").expect("tolerated");
}

#[test]
fn test_store_without_metadata_has_no_sidecar() {
    let dir = TempDir::new().expect("tempdir");
    let storage = manager(dir.path(), 1 << 30, 1 << 29, 30);
    let key = "camB_2026-01-01_00-00-01.jpg";
    storage.store::<serde_json::Value>(&[1, 2, 3], key, None).expect("store");
    assert!(dir.path().join(key).exists());
    assert!(!dir.path().join("metadata").join(format!("{key}.json")).exists());
    storage.mark_uploaded(key).expect("mark uploaded");
    assert!(dir.path().join("uploaded").join(key).exists());
}

#[test]
fn test_force_cleanup_ignores_retention() {
    let dir = TempDir::new().expect("tempdir");
    // Effectively infinite retention; threshold of 500 bytes.
    let storage = manager(dir.path(), 10_000, 500, u64::MAX / (24 * 3600) / 2);

    storage
        .store(&vec![0xAAu8; 1000], "cam1_2026-01-01_00-00-00.jpg", Some(&json!({"i": 0})))
        .expect("store");
    assert!(storage.current_size_bytes() >= 1000);

    storage.cleanup(true);
    assert!(
        storage.current_size_bytes() < 500,
        "force cleanup must evict despite retention"
    );
    assert!(!dir.path().join("cam1_2026-01-01_00-00-00.jpg").exists());
    assert!(!dir
        .path()
        .join("metadata")
        .join("cam1_2026-01-01_00-00-00.jpg.json")
        .exists());
}

#[test]
fn test_cleanup_respects_retention_when_not_forced() {
    let dir = TempDir::new().expect("tempdir");
    // Above threshold, but files are far younger than the retention window.
    let storage = manager(dir.path(), 10_000, 100, 30);
    storage
        .store(&vec![0xBBu8; 1000], "cam1_2026-01-01_00-00-02.jpg", Some(&json!({})))
        .expect("store");
    storage.cleanup(false);
    assert!(dir.path().join("cam1_2026-01-01_00-00-02.jpg").exists());
}

#[test]
fn test_cleanup_deletes_uploaded_before_pending() {
    let dir = TempDir::new().expect("tempdir");
    let storage = manager(dir.path(), 100_000, 600, 0);

    storage
        .store(&vec![0xCCu8; 1000], "cam1_2026-01-01_00-00-03.jpg", Some(&json!({})))
        .expect("store uploaded-to-be");
    storage.mark_uploaded("cam1_2026-01-01_00-00-03.jpg").expect("promote");
    std::thread::sleep(Duration::from_millis(50));
    storage
        .store(&vec![0xDDu8; 400], "cam2_2026-01-01_00-00-04.jpg", Some(&json!({})))
        .expect("store pending");
    std::thread::sleep(Duration::from_millis(100)); // any positive age beats retention_days=0

    storage.cleanup(false);

    // Deleting the uploaded item brings usage under the threshold; the
    // pending item must survive.
    assert!(!dir.path().join("uploaded").join("cam1_2026-01-01_00-00-03.jpg").exists());
    assert!(dir.path().join("cam2_2026-01-01_00-00-04.jpg").exists());
}

#[test]
fn test_stats_counts_pending_and_uploaded() {
    let dir = TempDir::new().expect("tempdir");
    let storage = manager(dir.path(), 1 << 30, 1 << 29, 30);
    storage.store(&[0u8; 10], "cam1_2026-01-01_00-00-05.jpg", Some(&json!({}))).expect("a");
    storage.store(&[0u8; 10], "cam1_2026-01-01_00-00-06.jpg", Some(&json!({}))).expect("b");
    storage.mark_uploaded("cam1_2026-01-01_00-00-05.jpg").expect("promote");

    let stats = storage.stats();
    assert_eq!(stats.total_images, 2);
    assert_eq!(stats.uploaded_images, 1);
    assert_eq!(stats.pending_images, 1);
}

#[test]
fn test_latest_image_prefers_newest() {
    let dir = TempDir::new().expect("tempdir");
    let storage = manager(dir.path(), 1 << 30, 1 << 29, 30);
    storage.store(&[1u8; 10], "cam1_2026-01-01_00-00-07.jpg", Some(&json!({}))).expect("a");
    std::thread::sleep(Duration::from_millis(50));
    storage.store(&[2u8; 10], "cam1_2026-01-01_00-00-08.jpg", Some(&json!({}))).expect("b");

    let latest = storage.latest_image("cam1").expect("latest");
    assert!(latest.ends_with("cam1_2026-01-01_00-00-08.jpg"));
    assert!(storage.latest_image("cam9").is_none());

    // A camera id that prefixes another must not match its files.
    assert!(storage.latest_image("cam").is_none());
}

#[test]
fn test_pending_items_listed_oldest_first() {
    let dir = TempDir::new().expect("tempdir");
    let storage = manager(dir.path(), 1 << 30, 1 << 29, 30);
    storage.store(&[1u8; 10], "cam1_2026-01-01_00-00-09.jpg", Some(&json!({}))).expect("a");
    std::thread::sleep(Duration::from_millis(50));
    storage.store(&[2u8; 10], "cam1_2026-01-01_00-00-10.jpg", Some(&json!({}))).expect("b");

    let pending = storage.pending_items();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].0, "cam1_2026-01-01_00-00-09.jpg");
    assert_eq!(pending[1].0, "cam1_2026-01-01_00-00-10.jpg");
}
