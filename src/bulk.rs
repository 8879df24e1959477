//! Resumable bulk copy of whole collections, ordered by primary id.
//!
//! The loader reads source documents with ids strictly greater than the
//! saved checkpoint, applies each batch as one unordered upsert, verifies a
//! sample of the batch, and advances the checkpoint. Restarting after a
//! crash re-reads at most one batch; upserts keyed on id make the overlap
//! harmless.

use bson::Bson;
use separator::Separatable as _;
use tracing::{info, warn};

use crate::checkpoint::{BulkCheckpoint, CheckpointStore};
use crate::codec;
use crate::config::{CollectionMapping, Config};
use crate::conn::ConnectionManager;
use crate::error::Result;
use crate::shutdown::Shutdown;
use crate::stats::ReplicationStats;
use crate::store::{CollectionHandle, Filter};

/// Documents verified per copied batch.
const VERIFY_SAMPLE: usize = 10;

pub struct BulkLoader<'a> {
    cfg: &'a Config,
    conn: &'a ConnectionManager,
    checkpoints: &'a CheckpointStore,
    shutdown: Shutdown,
}

impl<'a> BulkLoader<'a> {
    pub fn new(
        cfg: &'a Config,
        conn: &'a ConnectionManager,
        checkpoints: &'a CheckpointStore,
        shutdown: Shutdown,
    ) -> BulkLoader<'a> {
        BulkLoader {
            cfg,
            conn,
            checkpoints,
            shutdown,
        }
    }

    /// Copy every source document the checkpoint has not seen yet. Returns
    /// the number of documents copied by this run.
    pub fn copy(&self, mapping: &CollectionMapping, stats: &ReplicationStats) -> Result<u64> {
        let collection = mapping.collection.as_str();
        info!(collection, "starting bulk copy");

        let source = self.conn.session(&self.cfg.source_uri)?;
        let target = self.conn.session(&self.cfg.target_uri)?;
        let src = source.collection(&mapping.source_db, collection);
        let tgt = target.collection(&mapping.target_db, collection);
        let retry = &self.conn.retry;

        self.replicate_indexes(src.as_ref(), tgt.as_ref(), collection);

        let checkpoint = self.checkpoints.load_bulk(collection);
        let mut last_id: Option<Bson> = checkpoint.as_ref().and_then(|c| c.last_id_bson());
        let mut count: u64 = checkpoint.as_ref().map_or(0, |c| c.count);
        if let Some(id) = &last_id {
            info!(collection, last_id = %codec::display_id(id), "resuming from checkpoint");
        }

        let mut copied: u64 = 0;
        loop {
            if self.shutdown.is_triggered() {
                info!(collection, "shutdown requested, stopping after checkpointed batch");
                break;
            }

            let filter = Filter::ById {
                after: last_id.clone(),
            };
            let batch = retry.run(&self.shutdown, "bulk fetch", || {
                src.find(&filter, self.cfg.batch_size)
            })?;
            if batch.is_empty() {
                info!(
                    collection,
                    total = %count.separated_string(),
                    "bulk copy complete"
                );
                break;
            }

            retry.run(&self.shutdown, "bulk write", || tgt.bulk_upsert(&batch))?;

            // Advisory only: the stream-level verifier is the authoritative
            // gate, so the checkpoint advances either way.
            let failures = self.verify_batch(src.as_ref(), tgt.as_ref(), &batch, collection)?;
            if failures > 0 {
                stats.add_verification_failures(failures);
            }

            let tail = match batch.last() {
                Some(doc) => doc,
                None => break,
            };
            last_id = codec::document_id(tail).cloned();
            count += batch.len() as u64;
            copied += batch.len() as u64;
            stats.add_synced(batch.len() as u64);

            if let Some(id) = &last_id {
                self.checkpoints
                    .save_bulk(collection, &BulkCheckpoint::new(id, count))?;
                info!(
                    collection,
                    migrated = %count.separated_string(),
                    last_id = %codec::display_id(id),
                    "bulk progress"
                );
            }
        }

        Ok(copied)
    }

    /// Mirror the source's secondary indexes onto the target. Per-index
    /// failures are logged and skipped; the copy itself proceeds.
    fn replicate_indexes(
        &self,
        src: &dyn CollectionHandle,
        tgt: &dyn CollectionHandle,
        collection: &str,
    ) {
        let specs = match src.indexes() {
            Ok(specs) => specs,
            Err(err) => {
                warn!(collection, %err, "could not enumerate source indexes");
                return;
            }
        };
        for spec in specs.iter().filter(|spec| !spec.is_primary()) {
            match tgt.create_index(spec) {
                Ok(()) => info!(collection, index = spec.name.as_str(), "created index"),
                Err(err) => {
                    warn!(collection, index = spec.name.as_str(), %err, "could not create index")
                }
            }
        }
    }

    /// Hash-compare a strided sample of the batch against the target.
    fn verify_batch(
        &self,
        src: &dyn CollectionHandle,
        tgt: &dyn CollectionHandle,
        batch: &[bson::Document],
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
            let mirrored = src
                .find_by_id(id)?
                .and_then(|src_doc| {
                    tgt.find_by_id(id)
                        .ok()
                        .flatten()
                        .map(|tgt_doc| (src_doc, tgt_doc))
                })
                .map_or(false, |(src_doc, tgt_doc)| {
                    codec::document_hash(&src_doc) == codec::document_hash(&tgt_doc)
                });
            if !mirrored {
                failures += 1;
                warn!(
                    collection,
                    id = %codec::display_id(id),
                    "batch verification failed for document"
                );
            }
        }
        Ok(failures)
    }
}
