//! The streaming change-capture worker.
//!
//! One worker tails the change log of one collection until shutdown,
//! applying each event to the target and persisting the resume token at a
//! fixed cadence. A transient failure reopens the subscription from the last
//! delivered token; a permanent one surfaces to the orchestrator, which may
//! fall back to polling for the collection.

use std::time::Duration;

use bson::Document;
use tracing::{error, info, warn};

use super::apply_event;
use crate::checkpoint::CheckpointStore;
use crate::config::{CollectionMapping, Config};
use crate::conn::ConnectionManager;
use crate::error::Result;
use crate::shutdown::Shutdown;
use crate::stats::ReplicationStats;

/// Resume tokens are persisted once per this many applied events, bounding
/// the replay window after a hard crash.
const TOKEN_SAVE_INTERVAL: u64 = 100;

/// Wait before reopening the change log after a transient failure.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Idle wait when the change log is drained.
const DRAINED_WAIT: Duration = Duration::from_millis(100);

pub struct StreamWorker<'a> {
    cfg: &'a Config,
    conn: &'a ConnectionManager,
    checkpoints: &'a CheckpointStore,
    shutdown: Shutdown,
}

impl<'a> StreamWorker<'a> {
    pub fn new(
        cfg: &'a Config,
        conn: &'a ConnectionManager,
        checkpoints: &'a CheckpointStore,
        shutdown: Shutdown,
    ) -> StreamWorker<'a> {
        StreamWorker {
            cfg,
            conn,
            checkpoints,
            shutdown,
        }
    }

    /// Tail the change log until shutdown is signaled.
    ///
    /// Returns `Ok` on a clean shutdown. An error means the subscription
    /// failed permanently; the latest token has already been persisted.
    pub fn run(&self, mapping: &CollectionMapping, stats: &ReplicationStats) -> Result<()> {
        let collection = mapping.collection.as_str();
        let source = self.conn.session(&self.cfg.source_uri)?;
        let target = self.conn.session(&self.cfg.target_uri)?;
        let src = source.collection(&mapping.source_db, collection);
        let tgt = target.collection(&mapping.target_db, collection);

        let mut token = self.checkpoints.load_resume_token(collection);
        if token.is_some() {
            info!(collection, "resuming change log from saved token");
        } else {
            info!(collection, "starting new change log subscription");
        }

        let mut cursor = src.watch(token.as_ref())?;
        let mut applied: u64 = 0;

        loop {
            if self.shutdown.is_triggered() {
                let latest = cursor.resume_token().or(token);
                self.persist_token(collection, latest);
                info!(collection, applied, "change log worker stopped");
                return Ok(());
            }

            match cursor.try_next() {
                Ok(Some(event)) => {
                    self.conn.retry.run(&self.shutdown, "apply change", || {
                        apply_event(tgt.as_ref(), &event, collection, stats)
                    })?;
                    token = Some(event.resume_token.clone());
                    applied += 1;
                    if applied % TOKEN_SAVE_INTERVAL == 0 {
                        self.persist_token(collection, token.clone());
                        info!(collection, applied, "persisted resume token");
                    }
                }
                Ok(None) => {
                    self.shutdown.sleep(DRAINED_WAIT);
                }
                Err(err) if err.is_transient() => {
                    // Reopen from the last delivered event; the log replays
                    // nothing before the token.
                    warn!(collection, %err, "change log interrupted, reconnecting");
                    let latest = cursor.resume_token().or_else(|| token.clone());
                    self.persist_token(collection, latest.clone());
                    if !self.shutdown.sleep(RECONNECT_DELAY) {
                        return Ok(());
                    }
                    token = latest;
                    cursor = src.watch(token.as_ref())?;
                }
                Err(err) => {
                    error!(collection, %err, "change log failed");
                    let latest = cursor.resume_token().or(token);
                    self.persist_token(collection, latest);
                    stats.record_error(&err.to_string());
                    return Err(err);
                }
            }
        }
    }

    fn persist_token(&self, collection: &str, token: Option<Document>) {
        if let Some(token) = token {
            if let Err(err) = self.checkpoints.save_resume_token(collection, &token) {
                error!(collection, %err, "failed to save resume token");
            }
        }
    }
}
