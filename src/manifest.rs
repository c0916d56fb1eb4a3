//! JSON manifest of a capture run
//!
//! Written with `--manifest`: what was run, how it ended, and every path
//! recorded into the output root.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::collector::{DependencyRecord, FileKind};
use crate::interceptor::InterceptStats;
use crate::materializer::MaterializeStats;
use crate::session::CaptureSummary;
use crate::supervisor::RunOutcome;

/// One recorded path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    /// Absolute source path (lossy UTF-8)
    pub path: String,
    pub kind: FileKind,
    /// Literal symlink target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Size in bytes at recording time, for regular files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl From<&DependencyRecord> for ManifestEntry {
    fn from(record: &DependencyRecord) -> Self {
        Self {
            path: record.path.to_string_lossy().into_owned(),
            kind: record.kind,
            target: record
                .target
                .as_ref()
                .map(|t| t.to_string_lossy().into_owned()),
            size: (record.kind == FileKind::Regular).then_some(record.size),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestSummary {
    pub exit_code: i32,
    pub processes: usize,
    pub records: usize,
    pub materialized: MaterializeStats,
    pub intercepted: InterceptStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub version: String,
    pub format: String,
    pub command: Vec<String>,
    pub output_root: String,
    pub summary: ManifestSummary,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(command: &[String], outcome: &RunOutcome, capture: &CaptureSummary) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: "cde-manifest-v1".to_string(),
            command: command.to_vec(),
            output_root: capture.output_root.to_string_lossy().into_owned(),
            summary: ManifestSummary {
                exit_code: outcome.exit_code,
                processes: outcome.processes,
                records: capture.records.len(),
                materialized: capture.materialized,
                intercepted: outcome.intercept,
            },
            entries: capture.records.iter().map(ManifestEntry::from).collect(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write manifest {}", path.display()))
    }
}
