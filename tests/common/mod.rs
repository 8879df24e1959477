//! Shared fixtures for the integration tests: embedded stores addressed by
//! unique URIs, a fast-retry configuration, and small document builders.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bson::{doc, Document};
use mongomirror::config::{CollectionMapping, Config};
use mongomirror::store::memory::MemoryStore;
use mongomirror::store::{ChangeEvent, CollectionHandle, Filter, StoreClient as _};

static NEXT_FIXTURE: AtomicUsize = AtomicUsize::new(0);

/// A pair of store URIs unique to this test.
pub fn fixture_uris(tag: &str) -> (String, String) {
    let n = NEXT_FIXTURE.fetch_add(1, Ordering::SeqCst);
    (
        format!("mem://{}-src-{}", tag, n),
        format!("mem://{}-tgt-{}", tag, n),
    )
}

/// Documented defaults with retry and polling delays shrunk so failure paths
/// finish quickly.
pub fn fast_config(source: &str, target: &str, root: &Path) -> Config {
    let mut cfg = Config::defaults(source, target, root);
    cfg.retry_delay = Duration::from_millis(5);
    cfg.polling_interval = Duration::from_millis(50);
    cfg
}

pub fn mapping(collection: &str) -> CollectionMapping {
    CollectionMapping {
        source_db: "app".into(),
        target_db: "app".into(),
        collection: collection.into(),
    }
}

pub fn open(uri: &str) -> MemoryStore {
    MemoryStore::open(uri).unwrap()
}

pub fn collection(uri: &str, name: &str) -> Box<dyn CollectionHandle> {
    open(uri).collection("app", name)
}

pub fn simple_docs(range: std::ops::RangeInclusive<i32>) -> Vec<Document> {
    range
        .map(|id| doc! { "_id": id, "v": format!("value-{}", id) })
        .collect()
}

pub fn ids_of(coll: &dyn CollectionHandle) -> Vec<i32> {
    coll.find(&Filter::ById { after: None }, 10_000)
        .unwrap()
        .iter()
        .map(|doc| doc.get_i32("_id").unwrap())
        .collect()
}

/// Every event the collection's change log has ever recorded.
pub fn log_events(coll: &dyn CollectionHandle) -> Vec<ChangeEvent> {
    let origin = doc! { "seq": 0_i64 };
    let mut cursor = coll.watch(Some(&origin)).unwrap();
    let mut events = Vec::new();
    while let Some(event) = cursor.try_next().unwrap() {
        events.push(event);
    }
    events
}

/// Poll `predicate` until it holds or the deadline passes.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut predicate: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
