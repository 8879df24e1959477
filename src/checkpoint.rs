//! Durable per-collection progress markers.
//!
//! Each workload persists its own checkpoint file under the progress
//! directory: `<collection>.json` for the bulk loader, `<collection>_cdc.json`
//! for the polling worker, and `<collection>_resume_token.json` for the
//! streaming worker. Saves write a sibling temporary file, flush it, and
//! atomically rename it over the final path, so a crash mid-write leaves
//! either the previous state or the new one — never a torn file. A file that
//! fails to parse is treated as absent; workers restart from zero, which is
//! safe because every apply path is idempotent.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use bson::{Bson, Document};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::Result;

/// Progress of the bulk loader: the highest id already copied and verified.
/// Resumption reads strictly greater ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkCheckpoint {
    /// Highest copied id, as relaxed extended JSON so opaque ids survive the
    /// file round trip.
    pub last_id: Value,
    /// Documents copied so far.
    pub count: u64,
    /// Seconds since the epoch at the time of the save.
    pub timestamp: f64,
}

impl BulkCheckpoint {
    pub fn new(last_id: &Bson, count: u64) -> BulkCheckpoint {
        BulkCheckpoint {
            last_id: last_id.clone().into_relaxed_extjson(),
            count,
            timestamp: epoch_seconds(),
        }
    }

    /// The persisted id bound, decoded back into its store form.
    pub fn last_id_bson(&self) -> Option<Bson> {
        Bson::try_from(self.last_id.clone()).ok()
    }
}

/// Progress of the polling worker: the watermark already observed plus
/// cumulative counter totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollingCheckpoint {
    /// Highest `updatedAt` already observed, RFC 3339 (or the raw string
    /// when the source value does not parse as a date).
    pub last_updated_at: Option<String>,
    /// Highest id observed when `updatedAt` is absent, as relaxed extended
    /// JSON.
    pub last_operation_time: Option<Value>,
    /// Cumulative documents upserted by polling cycles.
    #[serde(default)]
    pub updates: u64,
    /// Cumulative documents removed by delete reconciliation.
    #[serde(default)]
    pub deletions: u64,
    /// RFC 3339 stamp of the save.
    pub timestamp: Option<String>,
}

impl PollingCheckpoint {
    /// The persisted id bound, decoded back into its store form.
    pub fn last_operation_time_bson(&self) -> Option<Bson> {
        let value = self.last_operation_time.clone()?;
        Bson::try_from(value).ok()
    }
}

/// Resume position of the streaming worker: an opaque cursor token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResumePoint {
    pub token: Value,
    pub timestamp: String,
}

/// Durable store of per-collection progress markers.
///
/// At most one writer exists per file, so no locking is needed beyond the
/// atomic replacement itself.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<CheckpointStore> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(CheckpointStore { dir })
    }

    pub fn load_bulk(&self, collection: &str) -> Option<BulkCheckpoint> {
        self.load(&self.bulk_path(collection))
    }

    pub fn save_bulk(&self, collection: &str, state: &BulkCheckpoint) -> Result<()> {
        self.save_atomic(&self.bulk_path(collection), state)
    }

    pub fn load_polling(&self, collection: &str) -> Option<PollingCheckpoint> {
        self.load(&self.polling_path(collection))
    }

    /// Persist new watermarks, folding counter increments into the totals
    /// already on disk so the counters stay cumulative across saves.
    pub fn save_polling(
        &self,
        collection: &str,
        last_updated_at: Option<String>,
        last_operation_time: Option<Value>,
        updates: u64,
        deletions: u64,
    ) -> Result<PollingCheckpoint> {
        let prior = self.load_polling(collection).unwrap_or_default();
        let state = PollingCheckpoint {
            last_updated_at,
            last_operation_time,
            updates: prior.updates + updates,
            deletions: prior.deletions + deletions,
            timestamp: Some(Utc::now().to_rfc3339()),
        };
        self.save_atomic(&self.polling_path(collection), &state)?;
        Ok(state)
    }

    /// Fold an update count into the totals without touching watermarks.
    pub fn add_updates(&self, collection: &str, updates: u64) -> Result<()> {
        let prior = self.load_polling(collection).unwrap_or_default();
        let state = PollingCheckpoint {
            updates: prior.updates + updates,
            timestamp: Some(Utc::now().to_rfc3339()),
            ..prior
        };
        self.save_atomic(&self.polling_path(collection), &state)
    }

    /// Fold a deletion count into the totals without touching watermarks.
    pub fn add_deletions(&self, collection: &str, deletions: u64) -> Result<()> {
        let prior = self.load_polling(collection).unwrap_or_default();
        let state = PollingCheckpoint {
            deletions: prior.deletions + deletions,
            timestamp: Some(Utc::now().to_rfc3339()),
            ..prior
        };
        self.save_atomic(&self.polling_path(collection), &state)
    }

    pub fn load_resume_token(&self, collection: &str) -> Option<Document> {
        let point: StreamResumePoint = self.load(&self.resume_path(collection))?;
        match Bson::try_from(point.token) {
            Ok(Bson::Document(token)) => Some(token),
            _ => {
                warn!(collection, "resume token has an unexpected shape, starting fresh");
                None
            }
        }
    }

    pub fn save_resume_token(&self, collection: &str, token: &Document) -> Result<()> {
        let point = StreamResumePoint {
            token: Bson::Document(token.clone()).into_relaxed_extjson(),
            timestamp: Utc::now().to_rfc3339(),
        };
        self.save_atomic(&self.resume_path(collection), &point)
    }

    fn bulk_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.json", collection))
    }

    fn polling_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}_cdc.json", collection))
    }

    fn resume_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}_resume_token.json", collection))
    }

    fn load<T: DeserializeOwned>(&self, path: &Path) -> Option<T> {
        let data = fs::read(path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(path = %path.display(), %err, "corrupt checkpoint file, starting fresh");
                None
            }
        }
    }

    /// Write-then-rename. The temporary file lives next to the final path so
    /// the rename stays on one filesystem and is atomic.
    fn save_atomic<T: Serialize>(&self, path: &Path, state: &T) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        serde_json::to_writer(&mut file, state)?;
        file.flush()?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Entries of the checkpoint-history ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: f64,
    pub count: u64,
}

/// Ring length per collection in `checkpoint_history.json`.
const HISTORY_LEN: usize = 10;

/// Reader-side observability: folds bulk checkpoint counts into a ring
/// buffer that external monitors use for ETA estimation.
///
/// The recorder only ever reads the checkpoint files the workers emit; the
/// atomic-replace guarantee is the whole contract between them.
pub struct HistoryRecorder<'a> {
    store: &'a CheckpointStore,
}

impl<'a> HistoryRecorder<'a> {
    pub fn new(store: &'a CheckpointStore) -> HistoryRecorder<'a> {
        HistoryRecorder { store }
    }

    fn path(&self) -> PathBuf {
        self.store.dir.join("checkpoint_history.json")
    }

    fn read(&self) -> BTreeMap<String, Vec<HistoryEntry>> {
        fs::read(self.path())
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_default()
    }

    /// Append one ring entry per collection from its current bulk checkpoint.
    pub fn record(&self, collections: &[String]) -> Result<()> {
        let mut history = self.read();
        for name in collections {
            if let Some(checkpoint) = self.store.load_bulk(name) {
                let entries = history.entry(name.clone()).or_insert_with(Vec::new);
                entries.push(HistoryEntry {
                    timestamp: checkpoint.timestamp,
                    count: checkpoint.count,
                });
                if entries.len() > HISTORY_LEN {
                    let excess = entries.len() - HISTORY_LEN;
                    entries.drain(..excess);
                }
            }
        }
        self.store.save_atomic(&self.path(), &history)
    }

    /// Estimated seconds until `total` documents are copied, from the
    /// throughput between the oldest and newest ring entries.
    pub fn estimate_eta(&self, collection: &str, total: u64) -> Option<f64> {
        let history = self.read();
        let entries = history.get(collection)?;
        let first = entries.first()?;
        let last = entries.last()?;
        if last.count <= first.count || last.timestamp <= first.timestamp {
            return None;
        }
        let rate = (last.count - first.count) as f64 / (last.timestamp - first.timestamp);
        Some(total.saturating_sub(last.count) as f64 / rate)
    }
}

fn epoch_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
