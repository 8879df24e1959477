//! The embedded in-process store.
//!
//! Implements the full wire contract, including the change log, for tests
//! and single-process deployments. Stores are shared by URI: every
//! `connect("mem://fixtures")` in the process resolves to the same instance,
//! which is what lets a source and a target live side by side in one test.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bson::{doc, Bson, Document};
use lazy_static::lazy_static;

use super::{
    ChangeEvent, ChangeLogCursor, CollectionHandle, Filter, IndexSpec, OperationKind, StoreClient,
};
use crate::codec;
use crate::error::{Error, Result};

pub const SCHEME_PREFIX: &str = "mem://";

/// Events pulled from the log per cursor refill.
const CURSOR_BATCH: usize = 100;

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<String, MemoryStore>> = Mutex::new(HashMap::new());
}

/// Wrapper giving `_id` values the store's total order.
#[derive(Debug, Clone)]
struct IdKey(Bson);

impl PartialEq for IdKey {
    fn eq(&self, other: &IdKey) -> bool {
        codec::compare_ids(&self.0, &other.0) == std::cmp::Ordering::Equal
    }
}

impl Eq for IdKey {}

impl PartialOrd for IdKey {
    fn partial_cmp(&self, other: &IdKey) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IdKey {
    fn cmp(&self, other: &IdKey) -> std::cmp::Ordering {
        codec::compare_ids(&self.0, &other.0)
    }
}

struct LogRecord {
    seq: u64,
    operation: OperationKind,
    key: Document,
    post_image: Option<Document>,
}

impl LogRecord {
    fn to_event(&self) -> ChangeEvent {
        ChangeEvent {
            resume_token: token_for(self.seq),
            operation: self.operation.clone(),
            document_key: Some(self.key.clone()),
            full_document: self.post_image.clone(),
        }
    }
}

fn token_for(seq: u64) -> Document {
    doc! { "seq": seq as i64 }
}

#[derive(Default)]
struct CollectionState {
    docs: BTreeMap<IdKey, Document>,
    indexes: Vec<IndexSpec>,
    log: Vec<LogRecord>,
    /// Collections come into existence on first write, not on first handle.
    created: bool,
}

impl CollectionState {
    fn append_log(&mut self, operation: OperationKind, id: &Bson, post_image: Option<Document>) {
        let seq = self.log.len() as u64 + 1;
        self.log.push(LogRecord {
            seq,
            operation,
            key: doc! { "_id": id.clone() },
            post_image,
        });
    }
}

struct Inner {
    uri: String,
    collections: Mutex<HashMap<(String, String), Arc<Mutex<CollectionState>>>>,
    /// Remaining injected transient failures; mimics a server fail point.
    fault_budget: AtomicU32,
    /// Like `fault_budget`, but consumed only by bulk writes.
    write_fault_budget: AtomicU32,
    streaming: AtomicBool,
}

/// An in-process document store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Resolve `uri` to the process-shared store of that name, creating it
    /// on first use.
    pub fn open(uri: &str) -> Result<MemoryStore> {
        if !uri.starts_with(SCHEME_PREFIX) {
            return Err(Error::Argument(format!(
                "not an embedded store URI: {:?}",
                uri
            )));
        }
        let mut registry = REGISTRY
            .lock()
            .map_err(|_| Error::Operation("store registry lock poisoned".into()))?;
        let store = registry.entry(uri.to_owned()).or_insert_with(|| MemoryStore {
            inner: Arc::new(Inner {
                uri: uri.to_owned(),
                collections: Mutex::new(HashMap::new()),
                fault_budget: AtomicU32::new(0),
                write_fault_budget: AtomicU32::new(0),
                streaming: AtomicBool::new(true),
            }),
        });
        Ok(store.clone())
    }

    /// Make the next `n` operations fail with a transient connection error.
    pub fn inject_transient_faults(&self, n: u32) {
        self.inner.fault_budget.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` bulk writes fail with a transient connection error,
    /// leaving reads untouched.
    pub fn inject_write_faults(&self, n: u32) {
        self.inner.write_fault_budget.store(n, Ordering::SeqCst);
    }

    /// Make `watch` report the change log as unsupported, forcing callers
    /// onto the polling path.
    pub fn disable_streaming(&self) {
        self.inner.streaming.store(false, Ordering::SeqCst);
    }

    fn consume_fault(&self) -> Result<()> {
        self.consume_from(&self.inner.fault_budget)
    }

    fn consume_write_fault(&self) -> Result<()> {
        self.consume_from(&self.inner.write_fault_budget)?;
        self.consume_fault()
    }

    fn consume_from(&self, budget: &AtomicU32) -> Result<()> {
        let mut remaining = budget.load(Ordering::SeqCst);
        while remaining > 0 {
            match budget.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Err(Error::Connection(format!(
                        "injected transient fault on {}",
                        self.inner.uri
                    )))
                }
                Err(actual) => remaining = actual,
            }
        }
        Ok(())
    }

    fn state(&self, db: &str, name: &str) -> Result<Arc<Mutex<CollectionState>>> {
        let mut collections = self
            .inner
            .collections
            .lock()
            .map_err(|_| Error::Operation("store state lock poisoned".into()))?;
        Ok(collections
            .entry((db.to_owned(), name.to_owned()))
            .or_insert_with(Default::default)
            .clone())
    }
}

impl StoreClient for MemoryStore {
    fn ping(&self) -> Result<()> {
        self.consume_fault()
    }

    fn collection_names(&self, db: &str) -> Result<Vec<String>> {
        self.consume_fault()?;
        let collections = self
            .inner
            .collections
            .lock()
            .map_err(|_| Error::Operation("store state lock poisoned".into()))?;
        let mut names = Vec::new();
        for ((state_db, name), state) in collections.iter() {
            if state_db == db && lock_state(state)?.created {
                names.push(name.clone());
            }
        }
        names.sort();
        Ok(names)
    }

    fn collection(&self, db: &str, name: &str) -> Box<dyn CollectionHandle> {
        Box::new(MemoryCollection {
            store: self.clone(),
            db: db.to_owned(),
            name: name.to_owned(),
        })
    }
}

fn lock_state(state: &Arc<Mutex<CollectionState>>) -> Result<MutexGuard<'_, CollectionState>> {
    state
        .lock()
        .map_err(|_| Error::Operation("collection lock poisoned".into()))
}

struct MemoryCollection {
    store: MemoryStore,
    db: String,
    name: String,
}

impl MemoryCollection {
    fn state(&self) -> Result<Arc<Mutex<CollectionState>>> {
        self.store.state(&self.db, &self.name)
    }

    fn scalar_id(doc: &Document) -> Result<Bson> {
        match codec::document_id(doc) {
            Some(Bson::Document(_)) | Some(Bson::Array(_)) => Err(Error::Malformed(
                "compound _id values are not supported".into(),
            )),
            Some(id) => Ok(id.clone()),
            None => Err(Error::Malformed("document is missing _id".into())),
        }
    }
}

impl CollectionHandle for MemoryCollection {
    fn exists(&self) -> Result<bool> {
        self.store.consume_fault()?;
        let state = self.state()?;
        let guard = lock_state(&state)?;
        Ok(guard.created)
    }

    fn count(&self) -> Result<u64> {
        self.store.consume_fault()?;
        let state = self.state()?;
        let guard = lock_state(&state)?;
        Ok(guard.docs.len() as u64)
    }

    fn find_by_id(&self, id: &Bson) -> Result<Option<Document>> {
        self.store.consume_fault()?;
        let state = self.state()?;
        let guard = lock_state(&state)?;
        Ok(guard.docs.get(&IdKey(id.clone())).cloned())
    }

    fn find(&self, filter: &Filter, limit: usize) -> Result<Vec<Document>> {
        self.store.consume_fault()?;
        let state = self.state()?;
        let guard = lock_state(&state)?;
        match filter {
            Filter::ById { after: None } => {
                Ok(guard.docs.values().take(limit).cloned().collect())
            }
            Filter::ById { after: Some(bound) } => {
                let range = (
                    Bound::Excluded(IdKey(bound.clone())),
                    Bound::Unbounded,
                );
                Ok(guard
                    .docs
                    .range(range)
                    .take(limit)
                    .map(|(_, doc)| doc.clone())
                    .collect())
            }
            Filter::ByField { field, after } => {
                let mut matched: Vec<&Document> = guard
                    .docs
                    .values()
                    .filter(|doc| match (doc.get(field), after) {
                        (None, _) => false,
                        (Some(_), None) => true,
                        (Some(value), Some(bound)) => {
                            codec::compare_ids(value, bound) == std::cmp::Ordering::Greater
                        }
                    })
                    .collect();
                matched.sort_by(|a, b| {
                    let va = a.get(field).unwrap_or(&Bson::Null);
                    let vb = b.get(field).unwrap_or(&Bson::Null);
                    codec::compare_ids(va, vb)
                });
                Ok(matched.into_iter().take(limit).cloned().collect())
            }
        }
    }

    fn find_at_offset(&self, offset: u64) -> Result<Option<Document>> {
        self.store.consume_fault()?;
        let state = self.state()?;
        let guard = lock_state(&state)?;
        Ok(guard.docs.values().nth(offset as usize).cloned())
    }

    fn sample(&self, limit: usize) -> Result<Vec<Document>> {
        self.store.consume_fault()?;
        let state = self.state()?;
        let guard = lock_state(&state)?;
        Ok(guard.docs.values().take(limit).cloned().collect())
    }

    fn bulk_upsert(&self, docs: &[Document]) -> Result<u64> {
        self.store.consume_write_fault()?;
        let state = self.state()?;
        let mut guard = lock_state(&state)?;
        for doc in docs {
            let id = Self::scalar_id(doc)?;
            let replaced = guard.docs.insert(IdKey(id.clone()), doc.clone()).is_some();
            let operation = if replaced {
                OperationKind::Replace
            } else {
                OperationKind::Insert
            };
            guard.append_log(operation, &id, Some(doc.clone()));
        }
        guard.created = true;
        Ok(docs.len() as u64)
    }

    fn bulk_delete(&self, ids: &[Bson]) -> Result<u64> {
        self.store.consume_write_fault()?;
        let state = self.state()?;
        let mut guard = lock_state(&state)?;
        let mut removed = 0;
        for id in ids {
            if guard.docs.remove(&IdKey(id.clone())).is_some() {
                guard.append_log(OperationKind::Delete, id, None);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn indexes(&self) -> Result<Vec<IndexSpec>> {
        self.store.consume_fault()?;
        let state = self.state()?;
        let guard = lock_state(&state)?;
        let mut specs = vec![IndexSpec {
            name: "_id_".into(),
            keys: vec![("_id".into(), 1)],
            unique: true,
        }];
        specs.extend(guard.indexes.iter().cloned());
        Ok(specs)
    }

    fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        self.store.consume_fault()?;
        let state = self.state()?;
        let mut guard = lock_state(&state)?;
        if !spec.is_primary() && !guard.indexes.iter().any(|have| have.name == spec.name) {
            guard.indexes.push(spec.clone());
        }
        guard.created = true;
        Ok(())
    }

    fn watch(&self, resume_after: Option<&Document>) -> Result<Box<dyn ChangeLogCursor>> {
        self.store.consume_fault()?;
        if !self.store.inner.streaming.load(Ordering::SeqCst) {
            return Err(Error::Unsupported("the change log".into()));
        }
        let state = self.state()?;
        let next_seq = match resume_after {
            Some(token) => {
                let seq = token
                    .get_i64("seq")
                    .map_err(|_| Error::Corrupt("resume token is missing its sequence".into()))?;
                seq as u64 + 1
            }
            // A fresh subscription starts after the current log tail.
            None => lock_state(&state)?.log.len() as u64 + 1,
        };
        Ok(Box::new(MemoryChangeCursor {
            store: self.store.clone(),
            state,
            next_seq,
            buffer: VecDeque::new(),
            last_token: resume_after.cloned(),
        }))
    }
}

/// A buffered cursor over a collection's change log.
///
/// Events are pulled from the shared log in small batches; the buffer must
/// drain completely before the next refill so resume tokens always identify
/// a delivered event.
struct MemoryChangeCursor {
    store: MemoryStore,
    state: Arc<Mutex<CollectionState>>,
    next_seq: u64,
    buffer: VecDeque<ChangeEvent>,
    last_token: Option<Document>,
}

impl MemoryChangeCursor {
    fn refill(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            return Ok(());
        }
        let guard = lock_state(&self.state)?;
        let start = (self.next_seq - 1) as usize;
        for record in guard.log.iter().skip(start).take(CURSOR_BATCH) {
            self.buffer.push_back(record.to_event());
            self.next_seq = record.seq + 1;
        }
        Ok(())
    }
}

impl ChangeLogCursor for MemoryChangeCursor {
    fn try_next(&mut self) -> Result<Option<ChangeEvent>> {
        self.store.consume_fault()?;
        self.refill()?;
        match self.buffer.pop_front() {
            Some(event) => {
                self.last_token = Some(event.resume_token.clone());
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    fn resume_token(&self) -> Option<Document> {
        self.last_token.clone()
    }
}
