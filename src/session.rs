//! Capture session
//!
//! Everything one run needs, owned in one place: configuration, the
//! resolver, the shared collector, the materializer worker and the
//! cancellation handle. Nothing here is global, so several sessions can
//! run in one process (the tests do).

use crossbeam::channel::unbounded;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::cancel::Cancellation;
use crate::collector::{DependencyCollector, DependencyRecord};
use crate::config::CaptureConfig;
use crate::interceptor::Interceptor;
use crate::materializer::{MaterializeStats, Materializer, MaterializerWorker};
use crate::paths;
use crate::resolver::PathResolver;
use crate::tracee::ProcessMemory;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Cannot create output root {}: {source}", .path.display())]
    OutputRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot start materializer thread: {0}")]
    Worker(#[source] io::Error),
}

/// What a finished session produced
#[derive(Debug, Clone)]
pub struct CaptureSummary {
    pub output_root: PathBuf,
    pub records: Vec<DependencyRecord>,
    pub materialized: MaterializeStats,
    /// Regular files queued again by the end-of-run refresh
    pub requeued: usize,
}

pub struct CaptureSession {
    config: CaptureConfig,
    resolver: PathResolver,
    collector: Arc<DependencyCollector>,
    worker: MaterializerWorker,
    cancel: Arc<Cancellation>,
}

impl CaptureSession {
    /// Create the output root and start the materializer
    ///
    /// A relative `output_dir` is taken relative to the current directory.
    /// The root is canonicalized so paths resolved through symlinks are
    /// still recognized as lying inside it.
    pub fn start(config: CaptureConfig) -> Result<Self, SessionError> {
        let requested = config.output_dir.clone();
        let output_error = |source| SessionError::OutputRoot {
            path: requested.clone(),
            source,
        };

        let cwd = std::env::current_dir().map_err(output_error)?;
        let output_root = paths::absolutize(&config.output_dir, &cwd);
        fs::create_dir_all(&output_root).map_err(output_error)?;
        let output_root = output_root.canonicalize().map_err(output_error)?;

        let materializer = Materializer::new(output_root.clone());
        materializer.prepare().map_err(output_error)?;

        let cancel = Arc::new(Cancellation::new());
        let (jobs, queue) = unbounded();
        let worker = MaterializerWorker::spawn(materializer, queue, Arc::clone(&cancel))
            .map_err(SessionError::Worker)?;
        let collector = Arc::new(DependencyCollector::new(
            config.clone(),
            output_root.clone(),
            jobs,
        ));

        tracing::info!(output_root = %output_root.display(), "capture session started");
        Ok(Self {
            resolver: PathResolver::new(config.max_symlink_hops),
            config,
            collector,
            worker,
            cancel,
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn output_root(&self) -> &Path {
        self.collector.output_root()
    }

    pub fn collector(&self) -> &DependencyCollector {
        &self.collector
    }

    pub fn cancellation(&self) -> &Arc<Cancellation> {
        &self.cancel
    }

    /// An interceptor feeding this session's collector
    ///
    /// Must be dropped before [`finish`](Self::finish).
    pub fn interceptor(&self) -> Interceptor<ProcessMemory> {
        Interceptor::new(
            self.resolver.clone(),
            Arc::clone(&self.collector),
            ProcessMemory,
            self.config.record_exec_interpreters,
        )
    }

    /// Refresh file contents, drain the job queue and stop the worker
    pub fn finish(self) -> CaptureSummary {
        let requeued = if self.cancel.is_cancelled() {
            0
        } else {
            self.collector.requeue_files()
        };
        let records = self.collector.snapshot();
        let output_root = self.collector.output_root().to_path_buf();

        // Last sender gone: the worker drains what is queued and returns
        drop(self.collector);
        let materialized = self.worker.join();

        tracing::info!(
            records = records.len(),
            copied = materialized.copied,
            failed = materialized.failed,
            "capture session finished"
        );
        CaptureSummary {
            output_root,
            records,
            materialized,
            requeued,
        }
    }
}
