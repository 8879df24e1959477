//! Collection-level verification: does the target faithfully mirror the
//! source?
//!
//! Four checks per collection: the collection exists on the target, the
//! counts agree within tolerance, the index sets match, and a uniformly
//! strided document sample hashes equal on both sides. The result is a
//! machine-readable record for downstream reporting.

use std::fs::{self, File};
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::codec;
use crate::config::{CollectionMapping, Config};
use crate::conn::ConnectionManager;
use crate::error::Result;
use crate::shutdown::Shutdown;
use crate::store::{CollectionHandle, IndexSpec};

/// Documents sampled per collection; the stride between samples is
/// `src_count / SAMPLE_TARGET`, floored at one.
const SAMPLE_TARGET: u64 = 100;

/// Minimum sampled match ratio, in percent, for the document check to pass.
const MATCH_THRESHOLD: f64 = 99.0;

/// Allowed absolute count divergence: max(5, 1% of the source count).
fn count_tolerance(src_count: u64) -> u64 {
    (src_count / 100).max(5)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAILED")]
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CountCheck {
    pub source: u64,
    pub target: u64,
    pub matched: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentCheck {
    pub checked: u64,
    pub mismatches: u64,
    pub match_percentage: f64,
    pub matched: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checks {
    pub exists: bool,
    pub count: CountCheck,
    pub indexes: bool,
    pub documents: DocumentCheck,
}

/// One collection's verification outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub collection: String,
    pub source_db: String,
    pub target_db: String,
    pub timestamp: String,
    pub checks: Checks,
    pub status: Status,
}

pub struct Verifier<'a> {
    cfg: &'a Config,
    conn: &'a ConnectionManager,
    shutdown: Shutdown,
}

impl<'a> Verifier<'a> {
    pub fn new(cfg: &'a Config, conn: &'a ConnectionManager, shutdown: Shutdown) -> Verifier<'a> {
        Verifier {
            cfg,
            conn,
            shutdown,
        }
    }

    /// Verify every mapping and persist the records under the verification
    /// directory. Returns the records together with the file they were
    /// written to.
    pub fn verify_all(
        &self,
        mappings: &[CollectionMapping],
    ) -> Result<(Vec<VerificationRecord>, PathBuf)> {
        let mut records = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            if self.shutdown.is_triggered() {
                break;
            }
            records.push(self.verify_collection(mapping)?);
        }

        fs::create_dir_all(&self.cfg.verification_dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = self
            .cfg
            .verification_dir
            .join(format!("verification_{}.json", stamp));
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(file, &records)?;
        info!(path = %path.display(), "verification records saved");

        Ok((records, path))
    }

    /// Run the four checks against one collection.
    pub fn verify_collection(&self, mapping: &CollectionMapping) -> Result<VerificationRecord> {
        let collection = mapping.collection.as_str();
        info!(collection, "verifying collection");

        let source = self.conn.session(&self.cfg.source_uri)?;
        let target = self.conn.session(&self.cfg.target_uri)?;
        let src = source.collection(&mapping.source_db, collection);
        let tgt = target.collection(&mapping.target_db, collection);
        let retry = &self.conn.retry;

        let mut checks = Checks::default();

        checks.exists = retry.run(&self.shutdown, "target exists", || tgt.exists())?;
        if !checks.exists {
            warn!(collection, "collection does not exist in target");
            return Ok(self.record(mapping, checks, Status::Failed));
        }

        let src_count = retry.run(&self.shutdown, "source count", || src.count())?;
        let tgt_count = retry.run(&self.shutdown, "target count", || tgt.count())?;
        let divergence = if src_count > tgt_count {
            src_count - tgt_count
        } else {
            tgt_count - src_count
        };
        checks.count = CountCheck {
            source: src_count,
            target: tgt_count,
            matched: divergence <= count_tolerance(src_count),
        };
        if !checks.count.matched {
            warn!(collection, src_count, tgt_count, "document count mismatch");
        }

        let src_indexes = retry.run(&self.shutdown, "source indexes", || src.indexes())?;
        let tgt_indexes = retry.run(&self.shutdown, "target indexes", || tgt.indexes())?;
        checks.indexes = indexes_match(&src_indexes, &tgt_indexes, collection);

        checks.documents = self.sample_documents(src.as_ref(), tgt.as_ref(), src_count, collection)?;

        let passed = checks.exists
            && checks.count.matched
            && checks.indexes
            && checks.documents.matched;
        let status = if passed { Status::Ok } else { Status::Failed };
        info!(collection, ?status, "verification finished");
        Ok(self.record(mapping, checks, status))
    }

    /// Hash-compare a uniformly strided sample of source documents against
    /// their target counterparts.
    fn sample_documents(
        &self,
        src: &dyn CollectionHandle,
        tgt: &dyn CollectionHandle,
        src_count: u64,
        collection: &str,
    ) -> Result<DocumentCheck> {
        if src_count == 0 {
            info!(collection, "source collection is empty");
            return Ok(DocumentCheck {
                checked: 0,
                mismatches: 0,
                match_percentage: 100.0,
                matched: true,
            });
        }

        let stride = (src_count / SAMPLE_TARGET).max(1);
        let limit = src_count.min(SAMPLE_TARGET * stride);
        let mut checked: u64 = 0;
        let mut mismatches: u64 = 0;
        let mut offset: u64 = 0;

        while offset < limit {
            if self.shutdown.is_triggered() {
                break;
            }
            let src_doc = match src.find_at_offset(offset)? {
                Some(doc) => doc,
                None => {
                    offset += stride;
                    continue;
                }
            };
            let id = match codec::document_id(&src_doc) {
                Some(id) => id.clone(),
                None => {
                    offset += stride;
                    continue;
                }
            };
            match tgt.find_by_id(&id)? {
                None => {
                    warn!(collection, id = %codec::display_id(&id), "document missing in target");
                    mismatches += 1;
                }
                Some(tgt_doc) => {
                    if codec::document_hash(&src_doc) != codec::document_hash(&tgt_doc) {
                        warn!(collection, id = %codec::display_id(&id), "document content mismatch");
                        mismatches += 1;
                    }
                }
            }
            checked += 1;
            offset += stride;
        }

        let match_percentage = if checked > 0 {
            100.0 - (mismatches as f64 / checked as f64 * 100.0)
        } else {
            100.0
        };
        info!(
            collection,
            checked, mismatches, match_percentage, "document sample finished"
        );
        Ok(DocumentCheck {
            checked,
            mismatches,
            match_percentage,
            matched: match_percentage >= MATCH_THRESHOLD,
        })
    }

    fn record(
        &self,
        mapping: &CollectionMapping,
        checks: Checks,
        status: Status,
    ) -> VerificationRecord {
        VerificationRecord {
            collection: mapping.collection.clone(),
            source_db: mapping.source_db.clone(),
            target_db: mapping.target_db.clone(),
            timestamp: Utc::now().to_rfc3339(),
            checks,
            status,
        }
    }
}

/// Index name sets must be equal, and every shared name must carry the same
/// key pattern.
fn indexes_match(src: &[IndexSpec], tgt: &[IndexSpec], collection: &str) -> bool {
    if src.len() != tgt.len() {
        warn!(
            collection,
            source = src.len(),
            target = tgt.len(),
            "index count mismatch"
        );
        return false;
    }
    for spec in src {
        match tgt.iter().find(|have| have.name == spec.name) {
            Some(have) if have.keys == spec.keys => {}
            Some(_) => {
                warn!(collection, index = spec.name.as_str(), "index key pattern mismatch");
                return false;
            }
            None => {
                warn!(collection, index = spec.name.as_str(), "index missing in target");
                return false;
            }
        }
    }
    true
}
