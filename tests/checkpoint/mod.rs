//! Durability and atomicity of the checkpoint store.

use std::fs;
use std::str::FromStr;

use bson::oid::ObjectId;
use bson::{doc, Bson};
use mongomirror::checkpoint::{BulkCheckpoint, CheckpointStore, HistoryRecorder};

#[test]
fn bulk_checkpoints_round_trip_opaque_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();

    let oid = ObjectId::from_str("507f1f77bcf86cd799439011").unwrap();
    let state = BulkCheckpoint::new(&Bson::ObjectId(oid), 42);
    store.save_bulk("users", &state).unwrap();

    let loaded = store.load_bulk("users").unwrap();
    assert_eq!(loaded.count, 42);
    assert_eq!(loaded.last_id_bson(), Some(Bson::ObjectId(oid)));
    assert!(dir.path().join("users.json").exists());
}

#[test]
fn missing_checkpoints_load_as_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();
    assert!(store.load_bulk("never-saved").is_none());
    assert!(store.load_polling("never-saved").is_none());
    assert!(store.load_resume_token("never-saved").is_none());
}

#[test]
fn corrupt_checkpoints_are_treated_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();

    fs::write(dir.path().join("orders.json"), b"{\"last_id\": ").unwrap();
    assert!(store.load_bulk("orders").is_none());
}

#[test]
fn interrupted_save_leaves_the_previous_state_intact() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();

    let state = BulkCheckpoint::new(&Bson::Int64(10), 10);
    store.save_bulk("users", &state).unwrap();

    // A crash between the temporary write and the rename leaves a stray
    // sibling file; the checkpoint itself must still read as the old state.
    fs::write(dir.path().join("users.json.tmp"), b"{\"last_id\": {\"$num").unwrap();
    let loaded = store.load_bulk("users").unwrap();
    assert_eq!(loaded.count, 10);
    assert_eq!(loaded.last_id_bson(), Some(Bson::Int64(10)));
}

#[test]
fn polling_counters_accumulate_across_saves() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();

    store
        .save_polling("users", Some("2024-01-01T00:00:00Z".into()), None, 5, 1)
        .unwrap();
    store
        .save_polling("users", Some("2024-01-02T00:00:00Z".into()), None, 3, 0)
        .unwrap();

    let state = store.load_polling("users").unwrap();
    assert_eq!(state.updates, 8);
    assert_eq!(state.deletions, 1);
    assert_eq!(state.last_updated_at.as_deref(), Some("2024-01-02T00:00:00Z"));
}

#[test]
fn counter_folds_preserve_watermarks() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();

    store
        .save_polling("users", Some("2024-03-01T00:00:00Z".into()), None, 2, 0)
        .unwrap();
    store.add_deletions("users", 4).unwrap();
    store.add_updates("users", 1).unwrap();

    let state = store.load_polling("users").unwrap();
    assert_eq!(state.updates, 3);
    assert_eq!(state.deletions, 4);
    assert_eq!(state.last_updated_at.as_deref(), Some("2024-03-01T00:00:00Z"));
}

#[test]
fn resume_tokens_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();

    let token = doc! { "seq": 1500_i64 };
    store.save_resume_token("users", &token).unwrap();

    let loaded = store.load_resume_token("users").unwrap();
    assert_eq!(loaded.get_i64("seq").unwrap(), 1500);
    assert!(dir.path().join("users_resume_token.json").exists());
}

#[test]
fn history_ring_is_bounded_and_estimates_eta() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();
    let recorder = HistoryRecorder::new(&store);
    let names = vec!["users".to_string()];

    for i in 1..=12_u64 {
        let state = BulkCheckpoint {
            last_id: serde_json::json!(i),
            count: i * 100,
            timestamp: 1_700_000_000.0 + i as f64,
        };
        store.save_bulk("users", &state).unwrap();
        recorder.record(&names).unwrap();
    }

    let raw = fs::read(dir.path().join("checkpoint_history.json")).unwrap();
    let history: std::collections::BTreeMap<String, Vec<serde_json::Value>> =
        serde_json::from_slice(&raw).unwrap();
    assert_eq!(history["users"].len(), 10);

    // 100 documents per second, 800 remaining after the newest entry.
    let eta = recorder.estimate_eta("users", 2_000).unwrap();
    assert!((eta - 8.0).abs() < 0.5, "eta was {}", eta);
}
