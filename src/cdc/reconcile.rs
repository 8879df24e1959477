//! Delete reconciliation.
//!
//! The polling path cannot observe deletions directly, so it samples the
//! target and probes the source for each sampled id. Sampling keeps the cost
//! bounded; the escalated sample size kicks in when the target holds more
//! documents than the source, which is the signature of missed deletions.

use bson::Bson;
use tracing::{debug, info};

use crate::checkpoint::CheckpointStore;
use crate::codec;
use crate::conn::RetryPolicy;
use crate::error::Result;
use crate::shutdown::Shutdown;
use crate::store::CollectionHandle;

/// Sample size for routine reconciliation passes.
pub const DEFAULT_SAMPLE: usize = 100;

/// Sample size when the target count exceeds the source count, or when a
/// thorough check is forced.
pub const ESCALATED_SAMPLE: usize = 1000;

/// Probe up to `sample_size` target documents against the source and remove
/// the ones the source no longer has. Every store access runs under the
/// retry policy. Deletes are idempotent, so overlapping passes are harmless.
/// Returns the number removed.
pub fn run(
    src: &dyn CollectionHandle,
    tgt: &dyn CollectionHandle,
    checkpoints: &CheckpointStore,
    retry: &RetryPolicy,
    shutdown: &Shutdown,
    collection: &str,
    sample_size: usize,
) -> Result<u64> {
    debug!(collection, sample_size, "checking for deletions");

    let sample = retry.run(shutdown, "reconcile sample", || tgt.sample(sample_size))?;
    let mut staged: Vec<Bson> = Vec::new();
    for doc in &sample {
        if let Some(id) = codec::document_id(doc) {
            let in_source = retry
                .run(shutdown, "reconcile source probe", || src.find_by_id(id))?
                .is_some();
            if !in_source {
                info!(
                    collection,
                    id = %codec::display_id(id),
                    "document deleted in source, removing from target"
                );
                staged.push(id.clone());
            }
        }
    }
    if staged.is_empty() {
        return Ok(0);
    }

    let removed = retry.run(shutdown, "reconcile bulk delete", || {
        tgt.bulk_delete(&staged)
    })?;
    checkpoints.add_deletions(collection, removed)?;
    info!(collection, removed, "removed deleted documents");
    Ok(removed)
}
