//! Change data capture: propagating source mutations to the target as they
//! occur.
//!
//! Two strategies share this module. [`stream`] tails the source's change
//! log and is preferred wherever the store supports one; [`polling`] is the
//! fallback that walks a mutation-timestamp watermark and reconciles
//! deletions by sampling ([`reconcile`]).

pub mod polling;
pub mod reconcile;
pub mod stream;

use tracing::{debug, warn};

use crate::codec;
use crate::error::Result;
use crate::stats::ReplicationStats;
use crate::store::{ChangeEvent, CollectionHandle, OperationKind};

/// Apply one change event to the target collection.
///
/// Idempotent: replaying an event converges to the same target state, so
/// callers may re-deliver freely after a resume.
pub fn apply_event(
    target: &dyn CollectionHandle,
    event: &ChangeEvent,
    collection: &str,
    stats: &ReplicationStats,
) -> Result<()> {
    match &event.operation {
        OperationKind::Insert | OperationKind::Update | OperationKind::Replace => {
            match &event.full_document {
                Some(doc) => {
                    target.bulk_upsert(std::slice::from_ref(doc))?;
                    stats.add_synced(1);
                    if let Some(id) = codec::document_id(doc) {
                        debug!(collection, id = %codec::display_id(id), "applied post-image");
                    }
                }
                None => {
                    warn!(collection, "change event carried no post-image, skipping");
                }
            }
        }
        OperationKind::Delete => {
            match event.document_key.as_ref().and_then(|key| key.get("_id")) {
                Some(id) => {
                    let removed = target.bulk_delete(std::slice::from_ref(id))?;
                    stats.add_deleted(removed);
                    debug!(collection, id = %codec::display_id(id), removed, "applied delete");
                }
                None => {
                    warn!(collection, "delete event carried no document key, skipping");
                }
            }
        }
        OperationKind::Other(kind) => {
            debug!(collection, kind = kind.as_str(), "ignoring unhandled operation kind");
        }
    }
    Ok(())
}
