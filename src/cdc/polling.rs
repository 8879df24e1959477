//! The polling change-capture worker.
//!
//! Used when the source offers no change log, or when streaming fails
//! permanently. Each cycle fetches source documents whose mutation timestamp
//! passed the saved watermark, upserts the ones whose content actually
//! drifted (last-writer-wins by `updatedAt`), then reconciles deletions by
//! sampling. Collections without an `updatedAt` field fall back to the
//! time-sortable id as the watermark.

use std::fs::{self, OpenOptions};
use std::io::Write as _;

use bson::{Bson, Document};
use chrono::{SecondsFormat, Utc};
use separator::Separatable as _;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::reconcile::{self, DEFAULT_SAMPLE, ESCALATED_SAMPLE};
use crate::checkpoint::CheckpointStore;
use crate::codec;
use crate::config::{CollectionMapping, Config};
use crate::conn::ConnectionManager;
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;
use crate::stats::ReplicationStats;
use crate::store::{CollectionHandle, Filter};

/// Field carrying the semantic last-modified stamp.
const UPDATED_AT: &str = "updatedAt";

/// Target documents re-checked against the source during a force-refresh
/// pass.
const REFRESH_SAMPLE: usize = 500;

/// Documents verified per applied batch.
const VERIFY_SAMPLE: usize = 10;

pub struct PollingWorker<'a> {
    cfg: &'a Config,
    conn: &'a ConnectionManager,
    checkpoints: &'a CheckpointStore,
    shutdown: Shutdown,
}

impl<'a> PollingWorker<'a> {
    pub fn new(
        cfg: &'a Config,
        conn: &'a ConnectionManager,
        checkpoints: &'a CheckpointStore,
        shutdown: Shutdown,
    ) -> PollingWorker<'a> {
        PollingWorker {
            cfg,
            conn,
            checkpoints,
            shutdown,
        }
    }

    /// Run one polling cycle: drain the watermark query batch by batch, then
    /// reconcile deletions. Returns when the source is drained or shutdown
    /// is requested.
    pub fn run_once(&self, mapping: &CollectionMapping, stats: &ReplicationStats) -> Result<()> {
        let collection = mapping.collection.as_str();
        info!(collection, "polling cycle starting");

        let source = self.conn.session(&self.cfg.source_uri)?;
        let target = self.conn.session(&self.cfg.target_uri)?;
        let src = source.collection(&mapping.source_db, collection);
        let tgt = target.collection(&mapping.target_db, collection);
        let retry = &self.conn.retry;

        // A target holding more documents than the source is the signature
        // of missed deletions; reconcile aggressively before anything else.
        let src_count = retry.run(&self.shutdown, "source count", || src.count())?;
        let tgt_count = retry.run(&self.shutdown, "target count", || tgt.count())?;
        if tgt_count > src_count {
            info!(
                collection,
                src_count, tgt_count, "target exceeds source, reconciling deletions"
            );
            let removed = reconcile::run(
                src.as_ref(),
                tgt.as_ref(),
                self.checkpoints,
                retry,
                &self.shutdown,
                collection,
                ESCALATED_SAMPLE,
            )?;
            stats.add_deleted(removed);
        }

        let checkpoint = if self.cfg.force_refresh {
            info!(collection, "force refresh enabled, ignoring saved watermarks");
            Default::default()
        } else {
            self.checkpoints.load_polling(collection).unwrap_or_default()
        };

        if self.cfg.force_refresh {
            self.refresh_from_target(src.as_ref(), tgt.as_ref(), collection, stats)?;
        }

        // Watermark axis: mutation timestamps when the source carries them,
        // otherwise the time-sortable id. Force refresh scans everything.
        let probe = retry.run(&self.shutdown, "source probe", || src.sample(1))?;
        let probe_stamp = probe.first().and_then(|doc| doc.get(UPDATED_AT));
        let use_updated_at = !self.cfg.force_refresh && probe_stamp.is_some();
        // The query bound must stay in the field's native type: a date bound
        // never matches string-typed stamps, they live in different sort
        // brackets.
        let stamp_is_date = matches!(probe_stamp, Some(Bson::DateTime(_)));
        if !use_updated_at && !self.cfg.force_refresh {
            warn!(
                collection,
                "source carries no {} field, using id as the watermark", UPDATED_AT
            );
        }

        let mut saved_updated_at = checkpoint.last_updated_at.clone();
        let mut saved_operation_time = checkpoint.last_operation_time.clone();
        let mut after_updated_at: Option<Bson> = if use_updated_at {
            saved_updated_at.as_deref().map(|raw| {
                if stamp_is_date {
                    parse_watermark(raw)
                } else {
                    Bson::String(raw.to_owned())
                }
            })
        } else {
            None
        };
        let mut after_id: Option<Bson> = if use_updated_at || self.cfg.force_refresh {
            None
        } else {
            checkpoint.last_operation_time_bson()
        };

        let mut total_synced: u64 = 0;
        loop {
            if self.shutdown.is_triggered() {
                info!(collection, total_synced, "polling interrupted by shutdown");
                return Ok(());
            }

            let filter = if use_updated_at {
                Filter::ByField {
                    field: UPDATED_AT.into(),
                    after: after_updated_at.clone(),
                }
            } else {
                Filter::ById {
                    after: after_id.clone(),
                }
            };
            let batch = retry.run(&self.shutdown, "poll fetch", || {
                src.find(&filter, self.cfg.batch_size)
            })?;

            if batch.is_empty() {
                self.reconcile_at_end(src.as_ref(), tgt.as_ref(), collection, stats)?;
                info!(
                    collection,
                    total = %total_synced.separated_string(),
                    "polling cycle complete"
                );
                return Ok(());
            }

            let staged = self.stage_batch(&batch, tgt.as_ref(), collection)?;
            let staged_count = staged.len() as u64;
            if !staged.is_empty() {
                let written = retry.run(&self.shutdown, "poll bulk write", || {
                    tgt.bulk_upsert(&staged)
                });
                if let Err(err) = written {
                    self.log_failed_batch(collection, &staged, &err);
                    return Err(err);
                }
                stats.add_updated(staged_count);
            }

            let failures = self.verify_sample(src.as_ref(), tgt.as_ref(), &batch, collection)?;
            if failures > 0 {
                stats.add_verification_failures(failures);
                error!(collection, failures, "documents failed batch verification");
            }

            // Advance the watermark to the highest value in the batch.
            let tail = match batch.last() {
                Some(doc) => doc,
                None => return Ok(()),
            };
            if use_updated_at {
                if let Some(stamp) = tail.get(UPDATED_AT) {
                    after_updated_at = Some(stamp.clone());
                    saved_updated_at = Some(watermark_text(stamp));
                }
            } else if let Some(id) = codec::document_id(tail) {
                after_id = Some(id.clone());
                saved_operation_time = Some(id.clone().into_relaxed_extjson());
            }
            self.checkpoints.save_polling(
                collection,
                saved_updated_at.clone(),
                saved_operation_time.clone(),
                staged_count,
                0,
            )?;

            total_synced += batch.len() as u64;
            info!(
                collection,
                synced = %total_synced.separated_string(),
                "polling progress"
            );
        }
    }

    /// Decide, document by document, what actually needs to be written.
    fn stage_batch(
        &self,
        batch: &[Document],
        tgt: &dyn CollectionHandle,
        collection: &str,
    ) -> Result<Vec<Document>> {
        let retry = &self.conn.retry;
        let mut staged = Vec::new();
        for doc in batch {
            let id = match codec::document_id(doc) {
                Some(id) => id.clone(),
                None => {
                    warn!(collection, "source document is missing _id, skipping");
                    continue;
                }
            };
            let existing = retry.run(&self.shutdown, "target lookup", || tgt.find_by_id(&id))?;
            let tgt_doc = match existing {
                Some(tgt_doc) => tgt_doc,
                None => {
                    if self.cfg.cdc_debug {
                        debug!(collection, id = %codec::display_id(&id), "not in target, staging");
                    }
                    staged.push(doc.clone());
                    continue;
                }
            };

            let src_hash = codec::document_hash(doc);
            let tgt_hash = codec::document_hash(&tgt_doc);
            if src_hash == tgt_hash {
                if self.cfg.cdc_debug {
                    debug!(collection, id = %codec::display_id(&id), "content identical, skipping");
                }
                continue;
            }
            if self.cfg.cdc_debug {
                debug!(
                    collection,
                    id = %codec::display_id(&id),
                    %src_hash,
                    %tgt_hash,
                    "content differs"
                );
            }

            if self.cfg.force_refresh || source_wins(doc, &tgt_doc) {
                staged.push(doc.clone());
            } else if self.cfg.cdc_debug {
                debug!(
                    collection,
                    id = %codec::display_id(&id),
                    "target is not older, skipping"
                );
            }
        }
        Ok(staged)
    }

    /// The force-refresh auxiliary pass: re-read the source counterpart of a
    /// bounded target sample and upsert whatever drifted. Closes the gap
    /// when the source's `updatedAt` is unreliable.
    fn refresh_from_target(
        &self,
        src: &dyn CollectionHandle,
        tgt: &dyn CollectionHandle,
        collection: &str,
        stats: &ReplicationStats,
    ) -> Result<()> {
        let retry = &self.conn.retry;
        let targets = retry.run(&self.shutdown, "target sample", || {
            tgt.sample(REFRESH_SAMPLE)
        })?;

        let mut staged = Vec::new();
        for tgt_doc in &targets {
            if self.shutdown.is_triggered() {
                break;
            }
            let id = match codec::document_id(tgt_doc) {
                Some(id) => id.clone(),
                None => continue,
            };
            let src_doc = retry.run(&self.shutdown, "source lookup", || src.find_by_id(&id))?;
            if let Some(src_doc) = src_doc {
                if codec::document_hash(&src_doc) != codec::document_hash(tgt_doc) {
                    if self.cfg.cdc_debug {
                        debug!(collection, id = %codec::display_id(&id), "refresh found drift");
                    }
                    staged.push(src_doc);
                }
            }
        }
        if staged.is_empty() {
            return Ok(());
        }

        let refreshed = staged.len() as u64;
        retry.run(&self.shutdown, "refresh bulk write", || {
            tgt.bulk_upsert(&staged)
        })?;
        self.checkpoints.add_updates(collection, refreshed)?;
        stats.add_updated(refreshed);
        info!(collection, refreshed, "targeted refresh applied");
        Ok(())
    }

    /// Reconciliation at the end of a drained cycle. Escalates when the
    /// target still exceeds the source or a full check is forced.
    fn reconcile_at_end(
        &self,
        src: &dyn CollectionHandle,
        tgt: &dyn CollectionHandle,
        collection: &str,
        stats: &ReplicationStats,
    ) -> Result<()> {
        let retry = &self.conn.retry;
        let src_count = retry.run(&self.shutdown, "source count", || src.count())?;
        let tgt_count = retry.run(&self.shutdown, "target count", || tgt.count())?;
        let sample = if self.cfg.force_refresh || tgt_count > src_count {
            ESCALATED_SAMPLE
        } else {
            DEFAULT_SAMPLE
        };
        let removed = reconcile::run(
            src,
            tgt,
            self.checkpoints,
            retry,
            &self.shutdown,
            collection,
            sample,
        )?;
        stats.add_deleted(removed);
        Ok(())
    }

    /// Hash-compare a strided sample of the batch against the target.
    /// Failures are counted, never fatal.
    fn verify_sample(
        &self,
        src: &dyn CollectionHandle,
        tgt: &dyn CollectionHandle,
        batch: &[Document],
        collection: &str,
    ) -> Result<u64> {
        let sample = VERIFY_SAMPLE.min(batch.len());
        let mut failures = 0;
        for i in 0..sample {
            let index = if sample > 1 { i * (batch.len() / sample) } else { 0 };
            let doc = match batch.get(index) {
                Some(doc) => doc,
                None => continue,
            };
            let id = match codec::document_id(doc) {
                Some(id) => id,
                None => continue,
            };
            if !verify_doc(src, tgt, id)? {
                failures += 1;
                warn!(
                    collection,
                    id = %codec::display_id(id),
                    "verification failed for document"
                );
            }
        }
        Ok(failures)
    }

    /// Record every document of a failed batch for manual recovery.
    fn log_failed_batch(&self, collection: &str, docs: &[Document], error: &Error) {
        if let Err(err) = self.append_failure_log(collection, docs, error) {
            error!(collection, %err, "could not write failure log");
        }
    }

    fn append_failure_log(
        &self,
        collection: &str,
        docs: &[Document],
        error: &Error,
    ) -> Result<()> {
        fs::create_dir_all(&self.cfg.log_dir)?;
        let path = self
            .cfg
            .log_dir
            .join(format!("{}_failed_docs.log", collection));
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for doc in docs {
            let id = codec::document_id(doc)
                .map(codec::display_id)
                .unwrap_or_else(|| "<missing>".into());
            let line: Value = serde_json::json!({
                "doc_id": id,
                "error": error.to_string(),
                "timestamp": Utc::now().to_rfc3339(),
            });
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }
}

/// Compare one document between source and target. Both absent counts as a
/// match; one side absent does not.
fn verify_doc(
    src: &dyn CollectionHandle,
    tgt: &dyn CollectionHandle,
    id: &Bson,
) -> Result<bool> {
    let src_doc = src.find_by_id(id)?;
    let tgt_doc = tgt.find_by_id(id)?;
    Ok(match (src_doc, tgt_doc) {
        (None, None) => true,
        (Some(src_doc), Some(tgt_doc)) => {
            codec::document_hash(&src_doc) == codec::document_hash(&tgt_doc)
        }
        _ => false,
    })
}

/// Last-writer-wins: the source prevails only when its `updatedAt` is
/// strictly newer. A missing stamp on either side forces the overwrite;
/// stamps that fail to parse as dates compare lexicographically.
fn source_wins(src: &Document, tgt: &Document) -> bool {
    let (src_stamp, tgt_stamp) = match (src.get(UPDATED_AT), tgt.get(UPDATED_AT)) {
        (Some(src_stamp), Some(tgt_stamp)) => (src_stamp, tgt_stamp),
        _ => return true,
    };
    match (parse_stamp(src_stamp), parse_stamp(tgt_stamp)) {
        (Some(src_at), Some(tgt_at)) => src_at > tgt_at,
        _ => watermark_text(src_stamp) > watermark_text(tgt_stamp),
    }
}

fn parse_stamp(value: &Bson) -> Option<chrono::DateTime<Utc>> {
    match value {
        Bson::DateTime(stamp) => Some(stamp.to_chrono()),
        Bson::String(raw) => chrono::DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        _ => None,
    }
}

/// A saved watermark string, decoded back into a date query bound. Only
/// used when the source field is date-typed; string-typed stamps keep their
/// raw form.
fn parse_watermark(raw: &str) -> Bson {
    match chrono::DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => Bson::DateTime(bson::DateTime::from_chrono(parsed.with_timezone(&Utc))),
        Err(_) => Bson::String(raw.to_owned()),
    }
}

/// The string form a watermark is persisted under.
fn watermark_text(value: &Bson) -> String {
    match value {
        Bson::DateTime(stamp) => stamp
            .to_chrono()
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        Bson::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}
