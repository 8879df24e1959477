//! Change-capture behavior: polling semantics, delete reconciliation, and
//! the streaming worker's resume contract.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bson::doc;
use mongomirror::cdc::polling::PollingWorker;
use mongomirror::cdc::stream::StreamWorker;
use mongomirror::checkpoint::CheckpointStore;
use mongomirror::config::Config;
use mongomirror::conn::ConnectionManager;
use mongomirror::shutdown::Shutdown;
use mongomirror::stats::ReplicationStats;

use crate::common;

struct Harness {
    cfg: Config,
    conn: ConnectionManager,
    checkpoints: CheckpointStore,
}

impl Harness {
    fn new(cfg: Config) -> Harness {
        let conn = ConnectionManager::new(&cfg);
        let checkpoints = CheckpointStore::new(&cfg.progress_dir).unwrap();
        Harness {
            cfg,
            conn,
            checkpoints,
        }
    }

    fn poll_once(&self, collection: &str) -> mongomirror::Result<ReplicationStats> {
        let stats = ReplicationStats::new();
        let worker = PollingWorker::new(&self.cfg, &self.conn, &self.checkpoints, Shutdown::new());
        worker.run_once(&common::mapping(collection), &stats)?;
        Ok(stats)
    }
}

#[test]
fn newer_source_documents_propagate() {
    let (src_uri, tgt_uri) = common::fixture_uris("poll-update");
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new(common::fast_config(&src_uri, &tgt_uri, root.path()));

    let older = bson::DateTime::from_millis(1_704_067_200_000); // 2024-01-01
    let newer = bson::DateTime::from_millis(1_704_153_600_000); // 2024-01-02
    common::collection(&tgt_uri, "x")
        .bulk_upsert(&[doc! { "_id": 1, "updatedAt": older, "v": "a" }])
        .unwrap();
    common::collection(&src_uri, "x")
        .bulk_upsert(&[doc! { "_id": 1, "updatedAt": newer, "v": "b" }])
        .unwrap();

    let stats = harness.poll_once("x").unwrap();
    assert_eq!(stats.updated(), 1);

    let stored = common::collection(&tgt_uri, "x")
        .find_by_id(&bson::Bson::Int32(1))
        .unwrap()
        .unwrap();
    assert_eq!(stored.get_str("v").unwrap(), "b");
    assert_eq!(
        stored.get_datetime("updatedAt").unwrap().timestamp_millis(),
        1_704_153_600_000
    );

    let checkpoint = harness.checkpoints.load_polling("x").unwrap();
    assert_eq!(checkpoint.updates, 1);
    assert!(checkpoint.last_updated_at.is_some());
}

#[test]
fn stale_source_documents_are_ignored() {
    let (src_uri, tgt_uri) = common::fixture_uris("poll-stale");
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new(common::fast_config(&src_uri, &tgt_uri, root.path()));

    let older = bson::DateTime::from_millis(1_704_067_200_000);
    let newer = bson::DateTime::from_millis(1_704_153_600_000);
    common::collection(&src_uri, "x")
        .bulk_upsert(&[doc! { "_id": 1, "updatedAt": older, "v": "old" }])
        .unwrap();
    common::collection(&tgt_uri, "x")
        .bulk_upsert(&[doc! { "_id": 1, "updatedAt": newer, "v": "new" }])
        .unwrap();

    let stats = harness.poll_once("x").unwrap();
    assert_eq!(stats.updated(), 0);

    let stored = common::collection(&tgt_uri, "x")
        .find_by_id(&bson::Bson::Int32(1))
        .unwrap()
        .unwrap();
    assert_eq!(stored.get_str("v").unwrap(), "new");
}

#[test]
fn string_timestamp_watermarks_stay_in_their_native_type() {
    let (src_uri, tgt_uri) = common::fixture_uris("poll-string-stamps");
    let root = tempfile::tempdir().unwrap();
    let mut cfg = common::fast_config(&src_uri, &tgt_uri, root.path());
    // One document per fetch, so every batch boundary queries with the
    // advanced watermark.
    cfg.batch_size = 1;
    let harness = Harness::new(cfg);

    common::collection(&src_uri, "x")
        .bulk_upsert(&[
            doc! { "_id": 1, "updatedAt": "2024-01-01T00:00:00Z", "v": "a" },
            doc! { "_id": 2, "updatedAt": "2024-01-02T00:00:00Z", "v": "b" },
        ])
        .unwrap();

    let stats = harness.poll_once("x").unwrap();
    assert_eq!(stats.updated(), 2);

    let tgt = common::collection(&tgt_uri, "x");
    assert_eq!(common::ids_of(tgt.as_ref()), vec![1, 2]);

    let checkpoint = harness.checkpoints.load_polling("x").unwrap();
    assert_eq!(
        checkpoint.last_updated_at.as_deref(),
        Some("2024-01-02T00:00:00Z")
    );

    // A later cycle resumes from the persisted watermark without rewriting.
    let stats = harness.poll_once("x").unwrap();
    assert_eq!(stats.updated(), 0);
}

#[test]
fn a_second_cycle_with_no_mutations_writes_nothing() {
    let (src_uri, tgt_uri) = common::fixture_uris("poll-idempotent");
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new(common::fast_config(&src_uri, &tgt_uri, root.path()));

    let stamp = bson::DateTime::from_millis(1_704_067_200_000);
    let docs: Vec<_> = (1..=20)
        .map(|id| doc! { "_id": id, "updatedAt": stamp, "v": format!("value-{}", id) })
        .collect();
    common::collection(&src_uri, "x").bulk_upsert(&docs).unwrap();

    let first = harness.poll_once("x").unwrap();
    assert_eq!(first.updated(), 20);

    let tgt = common::collection(&tgt_uri, "x");
    let events_after_first = common::log_events(tgt.as_ref()).len();

    let second = harness.poll_once("x").unwrap();
    assert_eq!(second.updated(), 0);
    assert_eq!(common::log_events(tgt.as_ref()).len(), events_after_first);
}

#[test]
fn extra_target_documents_are_reconciled_away() {
    let (src_uri, tgt_uri) = common::fixture_uris("poll-deletes");
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new(common::fast_config(&src_uri, &tgt_uri, root.path()));

    common::collection(&src_uri, "x")
        .bulk_upsert(&common::simple_docs(1..=100))
        .unwrap();
    common::collection(&tgt_uri, "x")
        .bulk_upsert(&common::simple_docs(1..=103))
        .unwrap();

    let stats = harness.poll_once("x").unwrap();
    assert_eq!(stats.deleted(), 3);
    assert_eq!(common::collection(&tgt_uri, "x").count().unwrap(), 100);
    assert_eq!(harness.checkpoints.load_polling("x").unwrap().deletions, 3);
}

#[test]
fn force_refresh_repairs_drift_the_watermark_missed() {
    let (src_uri, tgt_uri) = common::fixture_uris("poll-refresh");
    let root = tempfile::tempdir().unwrap();
    let mut cfg = common::fast_config(&src_uri, &tgt_uri, root.path());
    cfg.force_refresh = true;
    let harness = Harness::new(cfg);

    // Content drifted without any usable timestamp; only a full comparison
    // can catch it.
    common::collection(&src_uri, "x")
        .bulk_upsert(&[
            doc! { "_id": 1, "v": "fresh" },
            doc! { "_id": 2, "v": "value-2" },
        ])
        .unwrap();
    common::collection(&tgt_uri, "x")
        .bulk_upsert(&[doc! { "_id": 1, "v": "rotten" }])
        .unwrap();

    harness.poll_once("x").unwrap();

    let tgt = common::collection(&tgt_uri, "x");
    assert_eq!(tgt.count().unwrap(), 2);
    let repaired = tgt.find_by_id(&bson::Bson::Int32(1)).unwrap().unwrap();
    assert_eq!(repaired.get_str("v").unwrap(), "fresh");
}

#[test]
fn exhausted_write_retries_are_recorded_in_the_failure_log() {
    let (src_uri, tgt_uri) = common::fixture_uris("poll-failures");
    let root = tempfile::tempdir().unwrap();
    let harness = Harness::new(common::fast_config(&src_uri, &tgt_uri, root.path()));

    common::collection(&src_uri, "x")
        .bulk_upsert(&common::simple_docs(1..=3))
        .unwrap();
    // Exhaust every retry attempt on the write path.
    common::open(&tgt_uri).inject_write_faults(harness.cfg.retry_limit);

    assert!(harness.poll_once("x").is_err());

    let log = fs::read_to_string(
        harness
            .cfg
            .log_dir
            .join("x_failed_docs.log"),
    )
    .unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 3);
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["doc_id"], "1");
    assert!(first["error"].as_str().unwrap().contains("injected"));
}

fn spawn_stream_worker(
    harness: &Arc<Harness>,
    collection: &str,
    shutdown: &Shutdown,
) -> thread::JoinHandle<mongomirror::Result<()>> {
    let harness = harness.clone();
    let mapping = common::mapping(collection);
    let shutdown = shutdown.clone();
    thread::spawn(move || {
        let worker = StreamWorker::new(
            &harness.cfg,
            &harness.conn,
            &harness.checkpoints,
            shutdown,
        );
        worker.run(&mapping, &ReplicationStats::new())
    })
}

#[test]
fn stream_worker_applies_live_changes_and_resumes_after_restart() {
    let (src_uri, tgt_uri) = common::fixture_uris("stream-resume");
    let root = tempfile::tempdir().unwrap();
    let harness = Arc::new(Harness::new(common::fast_config(
        &src_uri,
        &tgt_uri,
        root.path(),
    )));

    let src = common::collection(&src_uri, "x");
    let tgt = common::collection(&tgt_uri, "x");

    // Subscribe from the log origin so inserts racing the subscription are
    // still observed.
    harness
        .checkpoints
        .save_resume_token("x", &doc! { "seq": 0_i64 })
        .unwrap();

    // First worker lifetime: 150 inserts arrive while it runs.
    let shutdown = Shutdown::new();
    let handle = spawn_stream_worker(&harness, "x", &shutdown);
    for chunk in common::simple_docs(1..=150).chunks(25) {
        src.bulk_upsert(chunk).unwrap();
    }
    assert!(
        common::wait_until(Duration::from_secs(10), || tgt.count().unwrap() == 150),
        "stream worker did not catch up"
    );
    shutdown.trigger();
    handle.join().unwrap().unwrap();
    assert!(harness.checkpoints.load_resume_token("x").is_some());

    // Mutations land while no worker is running; a fresh worker must pick
    // them up from the saved token without losing or duplicating anything.
    src.bulk_upsert(&common::simple_docs(151..=200)).unwrap();
    src.bulk_delete(&[bson::Bson::Int32(1)]).unwrap();

    let shutdown = Shutdown::new();
    let handle = spawn_stream_worker(&harness, "x", &shutdown);
    assert!(
        common::wait_until(Duration::from_secs(10), || tgt.count().unwrap() == 199),
        "restarted worker did not converge"
    );
    shutdown.trigger();
    handle.join().unwrap().unwrap();

    assert!(tgt.find_by_id(&bson::Bson::Int32(1)).unwrap().is_none());
    assert!(tgt.find_by_id(&bson::Bson::Int32(200)).unwrap().is_some());
}
