//! Bulk loader behavior: initial copy, mid-run resume, and index
//! replication.

use bson::Bson;
use mongomirror::bulk::BulkLoader;
use mongomirror::checkpoint::{BulkCheckpoint, CheckpointStore};
use mongomirror::conn::ConnectionManager;
use mongomirror::shutdown::Shutdown;
use mongomirror::stats::ReplicationStats;
use mongomirror::store::IndexSpec;

use crate::common;

#[test]
fn empty_start_copies_everything_and_checkpoints() {
    let (src_uri, tgt_uri) = common::fixture_uris("bulk-empty");
    let root = tempfile::tempdir().unwrap();
    let cfg = common::fast_config(&src_uri, &tgt_uri, root.path());

    common::collection(&src_uri, "x")
        .bulk_upsert(&common::simple_docs(1..=3))
        .unwrap();

    let conn = ConnectionManager::new(&cfg);
    let checkpoints = CheckpointStore::new(&cfg.progress_dir).unwrap();
    let loader = BulkLoader::new(&cfg, &conn, &checkpoints, Shutdown::new());
    let stats = ReplicationStats::new();

    let copied = loader.copy(&common::mapping("x"), &stats).unwrap();
    assert_eq!(copied, 3);
    assert_eq!(stats.synced(), 3);

    let tgt = common::collection(&tgt_uri, "x");
    assert_eq!(common::ids_of(tgt.as_ref()), vec![1, 2, 3]);

    let checkpoint = checkpoints.load_bulk("x").unwrap();
    assert_eq!(checkpoint.count, 3);
    assert_eq!(checkpoint.last_id_bson(), Some(Bson::Int32(3)));
}

#[test]
fn resume_skips_documents_already_copied() {
    let (src_uri, tgt_uri) = common::fixture_uris("bulk-resume");
    let root = tempfile::tempdir().unwrap();
    let cfg = common::fast_config(&src_uri, &tgt_uri, root.path());

    common::collection(&src_uri, "x")
        .bulk_upsert(&common::simple_docs(1..=10))
        .unwrap();
    // Simulate an interrupted earlier run: ids 1..6 already live in the
    // target and the checkpoint points past them.
    common::collection(&tgt_uri, "x")
        .bulk_upsert(&common::simple_docs(1..=6))
        .unwrap();
    let checkpoints = CheckpointStore::new(&cfg.progress_dir).unwrap();
    checkpoints
        .save_bulk("x", &BulkCheckpoint::new(&Bson::Int32(6), 6))
        .unwrap();

    let conn = ConnectionManager::new(&cfg);
    let loader = BulkLoader::new(&cfg, &conn, &checkpoints, Shutdown::new());
    let stats = ReplicationStats::new();
    let copied = loader.copy(&common::mapping("x"), &stats).unwrap();
    assert_eq!(copied, 4);

    let tgt = common::collection(&tgt_uri, "x");
    assert_eq!(common::ids_of(tgt.as_ref()), (1..=10).collect::<Vec<_>>());
    // Only the four missing documents were written: six pre-seeded events
    // plus four from the resumed copy.
    assert_eq!(common::log_events(tgt.as_ref()).len(), 10);

    let checkpoint = checkpoints.load_bulk("x").unwrap();
    assert_eq!(checkpoint.count, 10);
    assert_eq!(checkpoint.last_id_bson(), Some(Bson::Int32(10)));
}

#[test]
fn resumed_run_converges_to_the_uninterrupted_result() {
    let (src_uri, tgt_full) = common::fixture_uris("bulk-converge");
    let (_, tgt_resumed) = common::fixture_uris("bulk-converge-resumed");
    let root_full = tempfile::tempdir().unwrap();
    let root_resumed = tempfile::tempdir().unwrap();

    common::collection(&src_uri, "x")
        .bulk_upsert(&common::simple_docs(1..=25))
        .unwrap();

    // Uninterrupted run.
    let mut cfg = common::fast_config(&src_uri, &tgt_full, root_full.path());
    cfg.batch_size = 10;
    let conn = ConnectionManager::new(&cfg);
    let checkpoints = CheckpointStore::new(&cfg.progress_dir).unwrap();
    BulkLoader::new(&cfg, &conn, &checkpoints, Shutdown::new())
        .copy(&common::mapping("x"), &ReplicationStats::new())
        .unwrap();

    // A run resumed from a mid-copy checkpoint.
    let mut cfg = common::fast_config(&src_uri, &tgt_resumed, root_resumed.path());
    cfg.batch_size = 10;
    common::collection(&tgt_resumed, "x")
        .bulk_upsert(&common::simple_docs(1..=12))
        .unwrap();
    let checkpoints = CheckpointStore::new(&cfg.progress_dir).unwrap();
    checkpoints
        .save_bulk("x", &BulkCheckpoint::new(&Bson::Int32(12), 12))
        .unwrap();
    let conn = ConnectionManager::new(&cfg);
    BulkLoader::new(&cfg, &conn, &checkpoints, Shutdown::new())
        .copy(&common::mapping("x"), &ReplicationStats::new())
        .unwrap();

    let full = common::collection(&tgt_full, "x");
    let resumed = common::collection(&tgt_resumed, "x");
    assert_eq!(common::ids_of(full.as_ref()), common::ids_of(resumed.as_ref()));
    assert_eq!(checkpoints.load_bulk("x").unwrap().count, 25);
}

#[test]
fn secondary_indexes_are_replicated() {
    let (src_uri, tgt_uri) = common::fixture_uris("bulk-indexes");
    let root = tempfile::tempdir().unwrap();
    let cfg = common::fast_config(&src_uri, &tgt_uri, root.path());

    let src = common::collection(&src_uri, "x");
    src.bulk_upsert(&common::simple_docs(1..=2)).unwrap();
    src.create_index(&IndexSpec {
        name: "by_v".into(),
        keys: vec![("v".into(), 1)],
        unique: false,
    })
    .unwrap();

    let conn = ConnectionManager::new(&cfg);
    let checkpoints = CheckpointStore::new(&cfg.progress_dir).unwrap();
    BulkLoader::new(&cfg, &conn, &checkpoints, Shutdown::new())
        .copy(&common::mapping("x"), &ReplicationStats::new())
        .unwrap();

    let tgt = common::collection(&tgt_uri, "x");
    let names: Vec<String> = tgt
        .indexes()
        .unwrap()
        .into_iter()
        .map(|spec| spec.name)
        .collect();
    assert!(names.contains(&"by_v".to_string()));
}

#[test]
fn transient_write_failures_are_retried_through() {
    let (src_uri, tgt_uri) = common::fixture_uris("bulk-retry");
    let root = tempfile::tempdir().unwrap();
    let cfg = common::fast_config(&src_uri, &tgt_uri, root.path());

    common::collection(&src_uri, "x")
        .bulk_upsert(&common::simple_docs(1..=5))
        .unwrap();
    common::open(&tgt_uri).inject_write_faults(2);

    let conn = ConnectionManager::new(&cfg);
    let checkpoints = CheckpointStore::new(&cfg.progress_dir).unwrap();
    let copied = BulkLoader::new(&cfg, &conn, &checkpoints, Shutdown::new())
        .copy(&common::mapping("x"), &ReplicationStats::new())
        .unwrap();
    assert_eq!(copied, 5);
    assert_eq!(common::collection(&tgt_uri, "x").count().unwrap(), 5);
}
