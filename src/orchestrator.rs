//! Mode selection and per-collection fan-out.
//!
//! The orchestrator validates both endpoints, then runs one of four modes:
//! `migrate` (bulk copy, a drift pass, verification, and a report), `cdc`
//! (streaming capture with a polling fallback), `verify`, or `update` (one
//! polling pass). Collections are independent: a failure in one is recorded
//! and the rest proceed.

use std::collections::VecDeque;
use std::fs;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::bulk::BulkLoader;
use crate::cdc::polling::PollingWorker;
use crate::cdc::stream::StreamWorker;
use crate::checkpoint::{CheckpointStore, HistoryRecorder};
use crate::config::{CollectionMapping, Config};
use crate::conn::ConnectionManager;
use crate::error::{Error, Result};
use crate::report::{self, FailedCollection, MigrateReport};
use crate::shutdown::Shutdown;
use crate::stats::ReplicationStats;
use crate::verify::{Status, Verifier};

/// How long workers get to finish their in-flight batch after shutdown
/// before they are abandoned.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Operation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Migrate,
    Cdc,
    Verify,
    Update,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Mode> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "migrate" => Mode::Migrate,
            "cdc" => Mode::Cdc,
            "verify" => Mode::Verify,
            "update" => Mode::Update,
            _ => {
                return Err(Error::Argument(format!(
                    "unknown mode {:?}; valid modes are migrate, cdc, verify, update",
                    s
                )))
            }
        })
    }
}

/// Change-capture fan-out: one worker per collection, or a fixed pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threads {
    PerCollection,
    Fixed(usize),
}

impl FromStr for Threads {
    type Err = Error;

    fn from_str(s: &str) -> Result<Threads> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Threads::PerCollection);
        }
        match s.parse::<usize>() {
            Ok(0) => Ok(Threads::PerCollection),
            Ok(n) => Ok(Threads::Fixed(n)),
            Err(_) => Err(Error::Argument(format!(
                "could not parse thread count {:?}; expected `auto` or a number",
                s
            ))),
        }
    }
}

struct Context {
    cfg: Config,
    conn: ConnectionManager,
    checkpoints: CheckpointStore,
    shutdown: Shutdown,
}

pub struct Orchestrator {
    ctx: Arc<Context>,
}

impl Orchestrator {
    pub fn new(cfg: Config, shutdown: Shutdown) -> Result<Orchestrator> {
        let conn = ConnectionManager::new(&cfg);
        let checkpoints = CheckpointStore::new(&cfg.progress_dir)?;
        for dir in [&cfg.log_dir, &cfg.verification_dir, &cfg.report_dir].iter() {
            fs::create_dir_all(dir)?;
        }
        Ok(Orchestrator {
            ctx: Arc::new(Context {
                cfg,
                conn,
                checkpoints,
                shutdown,
            }),
        })
    }

    /// Run `mode` over `mappings`. Returns the process exit code.
    pub fn run(
        &self,
        mode: Mode,
        mappings: Vec<CollectionMapping>,
        threads: Threads,
    ) -> Result<i32> {
        self.ctx.conn.validate(&self.ctx.cfg, &self.ctx.shutdown)?;
        match mode {
            Mode::Migrate => self.run_migrate(mappings),
            Mode::Cdc => self.run_cdc(mappings, threads),
            Mode::Verify => self.run_verify(&mappings),
            Mode::Update => self.run_update(&mappings),
        }
    }

    fn run_migrate(&self, mappings: Vec<CollectionMapping>) -> Result<i32> {
        let ctx = &self.ctx;
        let started_at = Utc::now().to_rfc3339();
        let workers = ctx.cfg.concurrency.min(mappings.len()).max(1);
        info!(
            workers,
            collections = mappings.len(),
            "starting migration"
        );

        let queue = Arc::new(Mutex::new(VecDeque::from(mappings.clone())));
        let succeeded = Arc::new(Mutex::new(Vec::new()));
        let failed = Arc::new(Mutex::new(Vec::new()));
        let copied = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let ctx = self.ctx.clone();
            let queue = queue.clone();
            let succeeded = succeeded.clone();
            let failed = failed.clone();
            let copied = copied.clone();
            let handle = thread::Builder::new()
                .name(format!("bulk-{}", worker))
                .spawn(move || loop {
                    let mapping = match queue.lock().ok().and_then(|mut q| q.pop_front()) {
                        Some(mapping) => mapping,
                        None => break,
                    };
                    if ctx.shutdown.is_triggered() {
                        break;
                    }
                    let collection = mapping.collection.clone();
                    let stats = ReplicationStats::new();
                    let loader =
                        BulkLoader::new(&ctx.cfg, &ctx.conn, &ctx.checkpoints, ctx.shutdown.clone());
                    let start = Instant::now();
                    match loader.copy(&mapping, &stats) {
                        Ok(count) => {
                            info!(
                                collection = collection.as_str(),
                                copied = count,
                                elapsed_secs = start.elapsed().as_secs(),
                                "collection migrated"
                            );
                            copied.fetch_add(count, Ordering::Relaxed);
                            if let Ok(mut list) = succeeded.lock() {
                                list.push(collection);
                            }
                        }
                        Err(err) => {
                            error!(collection = collection.as_str(), %err, "migration failed");
                            if let Ok(mut list) = failed.lock() {
                                list.push(FailedCollection {
                                    collection,
                                    error: err.to_string(),
                                });
                            }
                        }
                    }
                })
                .map_err(Error::Io)?;
            handles.push(handle);
        }
        self.join_all(handles);

        // Ring-buffer entries for external ETA estimation.
        let names: Vec<String> = mappings.iter().map(|m| m.collection.clone()).collect();
        let recorder = HistoryRecorder::new(&self.ctx.checkpoints);
        if let Err(err) = recorder.record(&names) {
            warn!(%err, "could not record checkpoint history");
        }

        info!("running drift pass to catch changes made during the copy");
        let (updated, drift_failures) = self.polling_pass(&mappings);
        let mut all_failed = failed.lock().map(|list| list.clone()).unwrap_or_default();
        all_failed.extend(drift_failures);

        let verifier = Verifier::new(&self.ctx.cfg, &self.ctx.conn, self.ctx.shutdown.clone());
        let (records, _path) = verifier.verify_all(&mappings)?;
        let all_verified = records.iter().all(|record| record.status == Status::Ok);
        if all_verified {
            info!("all collections verified successfully");
        } else {
            warn!(
                failed = records
                    .iter()
                    .filter(|record| record.status != Status::Ok)
                    .count(),
                "collections failed verification"
            );
        }

        let report = MigrateReport {
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            succeeded: succeeded.lock().map(|list| list.clone()).unwrap_or_default(),
            failed: all_failed.clone(),
            documents_copied: copied.load(Ordering::Relaxed),
            documents_updated: updated,
            verification: records,
        };
        match report::write_migrate_report(&self.ctx.cfg.report_dir, &report) {
            Ok(path) => info!(path = %path.display(), "migration report written"),
            Err(err) => warn!(%err, "could not write migration report"),
        }

        Ok(if all_failed.is_empty() && all_verified {
            0
        } else {
            1
        })
    }

    fn run_cdc(&self, mappings: Vec<CollectionMapping>, threads: Threads) -> Result<i32> {
        let streaming = match mappings.first() {
            Some(first) => self.probe_streaming(first),
            None => false,
        };
        if streaming {
            info!("change log supported, using streaming capture");
            self.run_streaming(mappings)
        } else {
            warn!("change log unavailable, falling back to polling capture");
            self.run_polling_loop(mappings, threads)
        }
    }

    /// Whether the source supports a change-log subscription, probed on one
    /// collection.
    fn probe_streaming(&self, mapping: &CollectionMapping) -> bool {
        let session = match self.ctx.conn.session(&self.ctx.cfg.source_uri) {
            Ok(session) => session,
            Err(_) => return false,
        };
        let coll = session.collection(&mapping.source_db, &mapping.collection);
        match coll.watch(None) {
            Ok(_) => true,
            Err(err) => {
                warn!(%err, "change log probe failed");
                false
            }
        }
    }

    fn run_streaming(&self, mappings: Vec<CollectionMapping>) -> Result<i32> {
        let mut handles = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let ctx = self.ctx.clone();
            let handle = thread::Builder::new()
                .name(format!("stream-{}", mapping.collection))
                .spawn(move || {
                    let stats = ReplicationStats::new();
                    let worker =
                        StreamWorker::new(&ctx.cfg, &ctx.conn, &ctx.checkpoints, ctx.shutdown.clone());
                    if let Err(err) = worker.run(&mapping, &stats) {
                        // Keep the collection converging even when its
                        // stream dies for good.
                        error!(
                            collection = mapping.collection.as_str(),
                            %err,
                            "stream worker failed, switching to polling"
                        );
                        poll_until_shutdown(&ctx, &mapping, &stats);
                    }
                })
                .map_err(Error::Io)?;
            handles.push(handle);
        }
        self.join_all(handles);
        info!("change capture stopped");
        Ok(0)
    }

    fn run_polling_loop(&self, mappings: Vec<CollectionMapping>, threads: Threads) -> Result<i32> {
        let workers = match threads {
            Threads::PerCollection => mappings.len(),
            Threads::Fixed(n) => n.min(mappings.len()),
        }
        .max(1);
        info!(workers, collections = mappings.len(), "starting polling capture");

        let mut shares: Vec<Vec<CollectionMapping>> = vec![Vec::new(); workers];
        for (i, mapping) in mappings.into_iter().enumerate() {
            shares[i % workers].push(mapping);
        }

        let mut handles = Vec::with_capacity(workers);
        for (worker, share) in shares.into_iter().enumerate() {
            let ctx = self.ctx.clone();
            let handle = thread::Builder::new()
                .name(format!("poll-{}", worker))
                .spawn(move || {
                    let stats = ReplicationStats::new();
                    let poller =
                        PollingWorker::new(&ctx.cfg, &ctx.conn, &ctx.checkpoints, ctx.shutdown.clone());
                    while !ctx.shutdown.is_triggered() {
                        for mapping in &share {
                            if ctx.shutdown.is_triggered() {
                                break;
                            }
                            if let Err(err) = poller.run_once(mapping, &stats) {
                                error!(
                                    collection = mapping.collection.as_str(),
                                    %err,
                                    "polling cycle failed"
                                );
                                stats.record_error(&err.to_string());
                            }
                        }
                        if !ctx.shutdown.sleep(ctx.cfg.polling_interval) {
                            break;
                        }
                    }
                })
                .map_err(Error::Io)?;
            handles.push(handle);
        }
        self.join_all(handles);
        info!("polling capture stopped");
        Ok(0)
    }

    fn run_verify(&self, mappings: &[CollectionMapping]) -> Result<i32> {
        let verifier = Verifier::new(&self.ctx.cfg, &self.ctx.conn, self.ctx.shutdown.clone());
        let (records, _path) = verifier.verify_all(mappings)?;
        let failed: Vec<&str> = records
            .iter()
            .filter(|record| record.status != Status::Ok)
            .map(|record| record.collection.as_str())
            .collect();
        if failed.is_empty() {
            info!(collections = records.len(), "all collections verified");
            Ok(0)
        } else {
            warn!(?failed, "verification failed");
            Ok(1)
        }
    }

    fn run_update(&self, mappings: &[CollectionMapping]) -> Result<i32> {
        let (updated, failed) = self.polling_pass(mappings);
        info!(updated, failed = failed.len(), "update pass complete");
        Ok(if failed.is_empty() { 0 } else { 1 })
    }

    /// One polling cycle over every mapping, sequentially. Returns the
    /// number of documents updated and the collections that failed.
    fn polling_pass(&self, mappings: &[CollectionMapping]) -> (u64, Vec<FailedCollection>) {
        let poller = PollingWorker::new(
            &self.ctx.cfg,
            &self.ctx.conn,
            &self.ctx.checkpoints,
            self.ctx.shutdown.clone(),
        );
        let mut updated: u64 = 0;
        let mut failed = Vec::new();
        for mapping in mappings {
            if self.ctx.shutdown.is_triggered() {
                break;
            }
            let stats = ReplicationStats::new();
            match poller.run_once(mapping, &stats) {
                Ok(()) => updated += stats.updated(),
                Err(err) => {
                    error!(collection = mapping.collection.as_str(), %err, "polling pass failed");
                    failed.push(FailedCollection {
                        collection: mapping.collection.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        (updated, failed)
    }

    /// Wait for workers, abandoning any that outlive the grace period after
    /// shutdown was requested.
    fn join_all(&self, handles: Vec<thread::JoinHandle<()>>) {
        let mut remaining = handles;
        let mut deadline: Option<Instant> = None;
        loop {
            remaining.retain(|handle| !handle.is_finished());
            if remaining.is_empty() {
                return;
            }
            if self.ctx.shutdown.is_triggered() {
                let cutoff = *deadline.get_or_insert_with(|| Instant::now() + SHUTDOWN_GRACE);
                if Instant::now() >= cutoff {
                    warn!(
                        abandoned = remaining.len(),
                        "workers did not stop within the grace period"
                    );
                    return;
                }
            }
            thread::sleep(Duration::from_millis(200));
        }
    }
}

/// The polling fallback for a stream worker whose subscription died.
fn poll_until_shutdown(ctx: &Context, mapping: &CollectionMapping, stats: &ReplicationStats) {
    let poller = PollingWorker::new(&ctx.cfg, &ctx.conn, &ctx.checkpoints, ctx.shutdown.clone());
    while !ctx.shutdown.is_triggered() {
        if let Err(err) = poller.run_once(mapping, stats) {
            error!(collection = mapping.collection.as_str(), %err, "polling cycle failed");
            stats.record_error(&err.to_string());
        }
        if !ctx.shutdown.sleep(ctx.cfg.polling_interval) {
            break;
        }
    }
}
