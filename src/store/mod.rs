//! The wire contract between the replication engine and a document store.
//!
//! The engine never talks to a concrete store directly; every operation it
//! needs — ranged finds, per-id lookups, unordered bulk writes, index
//! management, counts, and a change-log subscription with resume-by-token
//! semantics — is expressed through the traits here. The crate ships one
//! backend, the embedded in-process store in [`memory`], reachable through
//! `mem://` URIs.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Backend-independent connection options resolved from configuration.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Deadline for establishing a connection.
    pub connection_timeout: Duration,
    /// Deadline for individual operations on an established connection.
    pub socket_timeout: Duration,
}

/// Resolve a connection string to a store client.
pub fn connect(uri: &str, options: &ConnectOptions) -> Result<Arc<dyn StoreClient>> {
    if uri.starts_with(memory::SCHEME_PREFIX) {
        // Network deadlines do not apply to the in-process store.
        tracing::debug!(uri, options = ?options, "opening embedded store");
        let store = memory::MemoryStore::open(uri)?;
        return Ok(Arc::new(store));
    }
    Err(Error::Unsupported(format!("connection scheme of {:?}", uri)))
}

/// A client for one store endpoint. The connection manager keeps one
/// long-lived client per endpoint.
pub trait StoreClient: Send + Sync {
    /// Health probe. Must succeed on both endpoints before workers start.
    fn ping(&self) -> Result<()>;

    /// Names of the collections that exist in `db`.
    fn collection_names(&self, db: &str) -> Result<Vec<String>>;

    /// A handle to a named collection. Taking a handle does not create the
    /// collection; writes do.
    fn collection(&self, db: &str, name: &str) -> Box<dyn CollectionHandle>;
}

/// Ranged predicates the engine issues against a collection.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Ascending by id, optionally after an exclusive bound.
    ById { after: Option<Bson> },
    /// Ascending by a named field, optionally after an exclusive bound.
    /// Documents missing the field are skipped.
    ByField { field: String, after: Option<Bson> },
}

/// An index on a collection: a name plus `(field, direction)` key pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<(String, i32)>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    /// Whether this is the mandatory primary-id index.
    pub fn is_primary(&self) -> bool {
        self.name == "_id_"
    }
}

/// Operations against one collection.
pub trait CollectionHandle: Send {
    /// Whether the collection exists (has been written to).
    fn exists(&self) -> Result<bool>;

    fn count(&self) -> Result<u64>;

    fn find_by_id(&self, id: &Bson) -> Result<Option<Document>>;

    /// Up to `limit` documents matching `filter`, in its ascending order.
    fn find(&self, filter: &Filter, limit: usize) -> Result<Vec<Document>>;

    /// The document at `offset` in ascending id order, if any.
    fn find_at_offset(&self, offset: u64) -> Result<Option<Document>>;

    /// Up to `limit` documents in unspecified order, for sampling.
    fn sample(&self, limit: usize) -> Result<Vec<Document>>;

    /// Insert-or-replace each document, keyed by its id. Unordered: writes
    /// within the batch may be applied in any order. Returns the count
    /// applied.
    fn bulk_upsert(&self, docs: &[Document]) -> Result<u64>;

    /// Remove each id that is present. Unordered and idempotent. Returns the
    /// count actually removed.
    fn bulk_delete(&self, ids: &[Bson]) -> Result<u64>;

    fn indexes(&self) -> Result<Vec<IndexSpec>>;

    fn create_index(&self, spec: &IndexSpec) -> Result<()>;

    /// Subscribe to the collection's change log, optionally resuming just
    /// after the event identified by `resume_after`.
    fn watch(&self, resume_after: Option<&Document>) -> Result<Box<dyn ChangeLogCursor>>;
}

/// One entry of a collection's change log.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Opaque token that resumes the log just after this event.
    pub resume_token: Document,
    pub operation: OperationKind,
    /// The id of the affected document. Always present for deletes.
    pub document_key: Option<Document>,
    /// Post-image of the document. Present for inserts, updates, and
    /// replaces.
    pub full_document: Option<Document>,
}

/// Change-log operation kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Replace,
    Delete,

    /// Kinds this engine does not know. Ignored on apply, so new stores stay
    /// compatible.
    Other(String),
}

/// A change-log subscription.
pub trait ChangeLogCursor: Send {
    /// The next event, or `None` when the log is currently drained. Drained
    /// is not closed: later calls may yield more events.
    fn try_next(&mut self) -> Result<Option<ChangeEvent>>;

    /// A token that resumes just after the most recently delivered event.
    fn resume_token(&self) -> Option<Document>;
}
