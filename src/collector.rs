//! Dependency collection
//!
//! Every path the traced tree touches is recorded here exactly once, with
//! its ancestors recorded first. Recording classifies the path by an `lstat`
//! of the original location and hands a materialization job to the worker
//! over an unbounded channel, so the interception path never waits on a copy.

use crossbeam::channel::Sender;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use crate::config::CaptureConfig;
use crate::paths;
use crate::resolver::ResolvedPath;

/// File type of a recorded path, as seen on the source filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    /// Sockets, FIFOs and device nodes: recorded but never copied
    Special,
    Missing,
}

/// A captured path and what it was at recording time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyRecord {
    pub path: PathBuf,
    pub kind: FileKind,
    /// Literal link target, for symlinks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
    /// Size in bytes, for regular files
    pub size: u64,
    #[serde(skip)]
    pub modified: Option<SystemTime>,
}

impl DependencyRecord {
    /// Classify `path` by an `lstat` of the source filesystem
    pub fn classify(path: &Path) -> Self {
        let mut record = Self {
            path: path.to_path_buf(),
            kind: FileKind::Missing,
            target: None,
            size: 0,
            modified: None,
        };

        let Ok(metadata) = fs::symlink_metadata(path) else {
            return record;
        };

        let file_type = metadata.file_type();
        record.modified = metadata.modified().ok();
        if file_type.is_symlink() {
            match fs::read_link(path) {
                Ok(target) => {
                    record.kind = FileKind::Symlink;
                    record.target = Some(target);
                }
                // Replaced between lstat and readlink
                Err(_) => record.kind = FileKind::Missing,
            }
        } else if file_type.is_dir() {
            record.kind = FileKind::Directory;
        } else if file_type.is_file() {
            record.kind = FileKind::Regular;
            record.size = metadata.len();
        } else {
            record.kind = FileKind::Special;
        }
        record
    }
}

/// Result of a `record` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First sight of this path; a job was queued
    Recorded(FileKind),
    AlreadyRecorded,
    /// Excluded by configuration or inside the output root
    Ignored,
    /// Does not exist on the source filesystem; not cached
    Missing,
}

#[derive(Debug, Default)]
struct CollectorState {
    index: HashMap<PathBuf, usize>,
    records: Vec<DependencyRecord>,
}

impl CollectorState {
    fn insert(&mut self, record: DependencyRecord) {
        self.index.insert(record.path.clone(), self.records.len());
        self.records.push(record);
    }
}

/// Deduplicating record set shared by every traced process
#[derive(Debug)]
pub struct DependencyCollector {
    state: Mutex<CollectorState>,
    jobs: Sender<DependencyRecord>,
    config: CaptureConfig,
    output_root: PathBuf,
}

impl DependencyCollector {
    /// `output_root` must be absolute; paths inside it are never recorded
    pub fn new(config: CaptureConfig, output_root: PathBuf, jobs: Sender<DependencyRecord>) -> Self {
        Self {
            state: Mutex::new(CollectorState::default()),
            jobs,
            config,
            output_root: paths::normalize(&output_root),
        }
    }

    /// Record an absolute path and, before it, every missing ancestor
    pub fn record(&self, path: &Path) -> RecordOutcome {
        let path = paths::normalize(path);
        if path.parent().is_none() {
            // `/` is the output root itself
            return RecordOutcome::AlreadyRecorded;
        }
        if self.excluded(&path) {
            return RecordOutcome::Ignored;
        }

        // Held across classification and send: concurrent callers for the
        // same path serialize here, and jobs enter the channel ancestors first
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.index.contains_key(&path) {
            return RecordOutcome::AlreadyRecorded;
        }

        // Existing ancestors are kept even when the leaf is absent
        for ancestor in paths::ancestors_top_down(&path) {
            if state.index.contains_key(&ancestor) {
                continue;
            }
            let record = DependencyRecord::classify(&ancestor);
            if record.kind == FileKind::Missing {
                tracing::debug!(path = %ancestor.display(), "ancestor does not exist");
                return RecordOutcome::Missing;
            }
            self.enqueue(&record);
            state.insert(record);
        }

        let leaf = DependencyRecord::classify(&path);
        if leaf.kind == FileKind::Missing {
            return RecordOutcome::Missing;
        }
        let kind = leaf.kind;
        tracing::debug!(path = %path.display(), ?kind, "recorded dependency");
        self.enqueue(&leaf);
        state.insert(leaf);
        RecordOutcome::Recorded(kind)
    }

    /// Record the symlinks crossed while resolving, then the resolved path
    pub fn record_resolved(&self, resolved: &ResolvedPath) -> RecordOutcome {
        for link in &resolved.traversed {
            self.record(link);
        }
        self.record(&resolved.path)
    }

    /// Re-classify a path that a syscall may just have replaced
    ///
    /// An already-recorded path whose kind, link target or metadata changed
    /// is queued again; an unseen path is recorded as usual. A path that no
    /// longer exists keeps its last record.
    pub fn refresh(&self, path: &Path) -> RecordOutcome {
        let path = paths::normalize(path);
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(&slot) = state.index.get(&path) {
                let fresh = DependencyRecord::classify(&path);
                if fresh.kind == FileKind::Missing || fresh == state.records[slot] {
                    return RecordOutcome::AlreadyRecorded;
                }
                let kind = fresh.kind;
                tracing::debug!(path = %path.display(), ?kind, "dependency replaced");
                self.enqueue(&fresh);
                state.records[slot] = fresh;
                return RecordOutcome::Recorded(kind);
            }
        }
        self.record(&path)
    }

    /// Record the symlinks crossed while resolving, then refresh the
    /// resolved path
    pub fn refresh_resolved(&self, resolved: &ResolvedPath) -> RecordOutcome {
        for link in &resolved.traversed {
            self.record(link);
        }
        self.refresh(&resolved.path)
    }

    /// Queue every regular file and symlink again with fresh metadata
    ///
    /// Files written after their first copy converge on the final content
    /// and replaced links on their final target; the materializer skips
    /// entries that already match.
    pub fn requeue_files(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut requeued = 0;
        for record in state.records.iter_mut() {
            if !matches!(record.kind, FileKind::Regular | FileKind::Symlink) {
                continue;
            }
            let fresh = DependencyRecord::classify(&record.path);
            if !matches!(fresh.kind, FileKind::Regular | FileKind::Symlink) {
                continue;
            }
            *record = fresh;
            self.enqueue(record);
            requeued += 1;
        }
        requeued
    }

    /// All records, in insertion order
    pub fn snapshot(&self) -> Vec<DependencyRecord> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .clone()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    fn excluded(&self, path: &Path) -> bool {
        path == self.output_root
            || paths::is_within_dir(path, &self.output_root)
            || self.config.is_ignored(path)
    }

    fn enqueue(&self, record: &DependencyRecord) {
        if self.jobs.send(record.clone()).is_err() {
            tracing::warn!(path = %record.path.display(), "materializer stopped; dependency not written");
        }
    }
}
