//! Machine-readable run reports.
//!
//! The migrate mode summarizes its outcome as one JSON record; rendering it
//! for humans is somebody else's job.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::verify::VerificationRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedCollection {
    pub collection: String,
    pub error: String,
}

/// The outcome of one migrate run: bulk results, the drift pass, and the
/// closing verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateReport {
    pub started_at: String,
    pub finished_at: String,
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedCollection>,
    pub documents_copied: u64,
    pub documents_updated: u64,
    pub verification: Vec<VerificationRecord>,
}

/// Persist the report under the report directory. Returns the file path.
pub fn write_migrate_report(dir: &Path, report: &MigrateReport) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("migrate_report_{}.json", stamp));
    let file = File::create(&path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(path)
}
