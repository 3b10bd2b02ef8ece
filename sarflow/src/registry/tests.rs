//! Tests for registry storage

use super::*;
use crate::geo::Footprint;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn record(id: &str, outputs: &[(&str, &Path)]) -> SceneRecord {
    let t = Utc.with_ymd_and_hms(2023, 2, 6, 3, 24, 51).unwrap();
    SceneRecord {
        scene_id: SceneId::new(id),
        source_scene: id.to_string(),
        footprint: Footprint::from_bounds(36.0, 36.0, 37.0, 37.0).unwrap(),
        acquisition_time: t,
        polarization: Polarization::DualPol,
        phase: EventPhase::PostEvent,
        output_paths: outputs
            .iter()
            .map(|(band, path)| (band.to_string(), path.to_path_buf()))
            .collect::<BTreeMap<_, _>>(),
        status: SceneStatus::Processed,
        references: Vec::new(),
        created_at: t,
        updated_at: t,
    }
}

fn store_in(dir: &TempDir) -> RegistryStore {
    RegistryStore::new(dir.path().join(REGISTRY_FILE))
}

fn fast_policy(max_attempts: u32) -> CommitPolicy {
    CommitPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(20),
        ..CommitPolicy::default()
    }
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// =============================================================================
// Load
// =============================================================================

#[test]
fn test_load_missing_is_empty() {
    let dir = TempDir::new().unwrap();
    let registry = store_in(&dir).load().unwrap();
    assert!(registry.is_empty());
    assert_eq!(registry.generation, 0);
}

#[test]
fn test_load_malformed_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    fs::write(store.path(), b"{ not json").unwrap();

    let err = store.load().unwrap_err();
    assert!(err.is_corrupt());
}

#[test]
fn test_load_unsupported_version_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    fs::write(store.path(), br#"{"version": 99, "generation": 3, "scenes": []}"#).unwrap();

    let err = store.load().unwrap_err();
    assert!(err.to_string().contains("unsupported version 99"));
}

#[test]
fn test_load_duplicate_ids_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    let rec = serde_json::to_value(record("dup", &[])).unwrap();
    let doc = serde_json::json!({"version": 1, "generation": 1, "scenes": [rec.clone(), rec]});
    fs::write(store.path(), serde_json::to_vec(&doc).unwrap()).unwrap();

    assert!(store.load().unwrap_err().is_corrupt());
}

// =============================================================================
// Commit
// =============================================================================

#[tokio::test]
async fn test_commit_persists_and_bumps_generation() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    let committed = store
        .commit(|r| {
            r.upsert(record("a", &[]));
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(committed.generation, 1);

    let reloaded = store.load().unwrap();
    assert_eq!(reloaded, committed);
    assert_eq!(entries(dir.path()), vec![REGISTRY_FILE.to_string()]);
}

#[tokio::test]
async fn test_rejected_mutation_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    let err = store
        .commit(|_| Err(RegistryError::Rejected("outputs vanished".into())))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Rejected(_)));
    assert!(!store.path().exists());
}

#[tokio::test]
async fn test_interrupted_commit_leaves_document_identical() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    store
        .commit(|r| {
            r.upsert(record("kept", &[]));
            Ok(())
        })
        .await
        .unwrap();
    let before = fs::read(store.path()).unwrap();

    let staged = store
        .stage(|r| {
            r.upsert(record("lost", &[]));
            Ok(())
        })
        .unwrap();
    assert!(staged.temp_path().exists());
    // Process dies between the temp write and the rename.
    drop(staged);

    assert_eq!(fs::read(store.path()).unwrap(), before);
    assert_eq!(entries(dir.path()), vec![REGISTRY_FILE.to_string()]);
    assert!(store.load().unwrap().contains(&SceneId::new("kept")));
}

#[tokio::test]
async fn test_stale_stage_conflicts_after_foreign_commit() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    let staged = store
        .stage(|r| {
            r.upsert(record("slow", &[]));
            Ok(())
        })
        .unwrap();

    store
        .clone()
        .commit(|r| {
            r.upsert(record("fast", &[]));
            Ok(())
        })
        .await
        .unwrap();

    assert!(matches!(staged.publish().unwrap(), PublishOutcome::Conflict));
    let registry = store.load().unwrap();
    assert!(registry.contains(&SceneId::new("fast")));
    assert!(!registry.contains(&SceneId::new("slow")));
}

#[tokio::test]
async fn test_contention_exhausts_retries() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).with_policy(fast_policy(3));

    let lock_path = dir.path().join(format!("{}.lock", REGISTRY_FILE));
    let _held = CommitLock::try_acquire(&lock_path, DEFAULT_LOCK_STALE_AFTER)
        .unwrap()
        .unwrap();

    let err = store
        .commit(|r| {
            r.upsert(record("blocked", &[]));
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Contention { attempts: 3 }));
    assert!(!store.path().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commits_all_land() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(store_in(&dir).with_policy(fast_policy(500)));
    const WRITERS: usize = 16;

    let mut tasks = Vec::new();
    for i in 0..WRITERS {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            let id = format!("scene-{i}");
            store
                .commit(move |r| {
                    r.upsert(record(&id, &[]));
                    Ok(())
                })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let registry = store.load().unwrap();
    assert_eq!(registry.len(), WRITERS);
    assert_eq!(registry.generation, WRITERS as u64);
    assert!(registry.find_duplicate().is_none());
}

#[test]
fn test_backoff_is_bounded() {
    let policy = CommitPolicy {
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
        ..CommitPolicy::default()
    };
    for attempt in 0..40 {
        let delay = policy.backoff_delay(attempt);
        assert!(delay <= Duration::from_millis(100));
    }
    assert!(policy.backoff_delay(0) >= Duration::from_millis(5));
}

// =============================================================================
// Validate / rebuild
// =============================================================================

#[tokio::test]
async fn test_validate_reports_missing_and_empty_outputs() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    let good = dir.path().join("good_VV.tif");
    let empty = dir.path().join("empty_VH.tif");
    let gone = dir.path().join("gone_VV.tif");
    fs::write(&good, b"raster").unwrap();
    fs::write(&empty, b"").unwrap();

    let (g, m, e) = (good.clone(), gone.clone(), empty.clone());
    store
        .commit(move |r| {
            r.upsert(record("ok", &[("VV", g.as_path())]));
            r.upsert(record("bad", &[("VV", m.as_path()), ("VH", e.as_path())]));
            r.upsert(record("bare", &[]));
            Ok(())
        })
        .await
        .unwrap();

    let issues = store.validate().unwrap();
    assert_eq!(issues.len(), 3);
    assert!(issues.iter().any(|i| matches!(i, RegistryIssue::MissingOutput { band, .. } if band == "VV")));
    assert!(issues.iter().any(|i| matches!(i, RegistryIssue::EmptyOutput { band, .. } if band == "VH")));
    assert!(issues.iter().any(|i| matches!(i, RegistryIssue::NoOutputs { .. })));
}

#[tokio::test]
async fn test_find_unregistered_sidecars() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    let result_dir = dir.path().join("rtc/unit-1");
    fs::create_dir_all(&result_dir).unwrap();
    write_sidecar(&result_dir, &record("orphan", &[])).unwrap();

    let issues = store.find_unregistered(dir.path()).unwrap();
    assert_eq!(issues.len(), 1);
    assert!(matches!(&issues[0], RegistryIssue::Unregistered { scene_id, .. } if scene_id.as_str() == "orphan"));
}

#[tokio::test]
async fn test_rebuild_recovers_corrupt_registry() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    let result_dir = dir.path().join("rtc/unit-1");
    fs::create_dir_all(&result_dir).unwrap();
    let vv = result_dir.join("scene_VV.tif");
    fs::write(&vv, b"raster").unwrap();
    write_sidecar(&result_dir, &record("recovered", &[("VV", vv.as_path())])).unwrap();

    let broken_dir = dir.path().join("rtc/unit-2");
    fs::create_dir_all(&broken_dir).unwrap();
    let missing = broken_dir.join("scene_VV.tif");
    write_sidecar(&broken_dir, &record("broken", &[("VV", missing.as_path())])).unwrap();

    fs::write(store.path(), b"garbage").unwrap();

    let report = store.rebuild(dir.path()).await.unwrap();
    assert_eq!(report.registry.len(), 1);
    assert_eq!(report.rejected.len(), 1);

    let backup = report.backup.expect("existing document is backed up");
    assert_eq!(fs::read(&backup).unwrap(), b"garbage");

    let loaded = store.load().unwrap();
    assert!(loaded.contains(&SceneId::new("recovered")));
    assert_eq!(loaded.generation, 1);
}

#[tokio::test]
async fn test_abandoned_stage_reported_then_swept() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).with_policy(CommitPolicy {
        lock_stale_after: Duration::from_millis(1),
        ..CommitPolicy::default()
    });
    store
        .commit(|r| {
            r.upsert(record("kept", &[]));
            Ok(())
        })
        .await
        .unwrap();

    // A writer crashed after staging: its temp file outlives the process.
    let staged = store
        .stage(|r| {
            r.upsert(record("lost", &[]));
            Ok(())
        })
        .unwrap();
    let leftover = staged.temp_path().to_path_buf();
    std::mem::forget(staged);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let issues = store.audit(&dir.path().join("rtc")).await.unwrap();
    assert!(issues
        .iter()
        .any(|i| matches!(i, RegistryIssue::AbandonedStage { path } if *path == leftover)));

    let report = store.rebuild(&dir.path().join("rtc")).await.unwrap();
    assert_eq!(report.swept, vec![leftover.clone()]);
    assert!(!leftover.exists());
    assert!(store.validate().unwrap().is_empty());
}

#[tokio::test]
async fn test_fresh_stage_is_not_reported() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    let _staged = store
        .stage(|r| {
            r.upsert(record("in-flight", &[]));
            Ok(())
        })
        .unwrap();

    assert!(store.validate().unwrap().is_empty());
}

#[tokio::test]
async fn test_snapshot_matches_load() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    store
        .commit(|r| {
            r.upsert(record("a", &[]));
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(store.snapshot().await.unwrap(), store.load().unwrap());
}
