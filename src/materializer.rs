//! Tree materialization
//!
//! Writes recorded dependencies into the output root as tagged operations:
//! create a directory, copy a regular file, or create a symlink carrying the
//! literal target string of the source link. Nothing here follows a symlink
//! in either tree.
//!
//! Every write is atomic from the point of view of a reader of the output
//! tree: file contents go to a hidden sibling that is renamed into place, and
//! symlinks are created under a temporary name and renamed over the entry.
//!
//! # Worker
//!
//! ```text
//! interceptor ── record() ──► collector ── channel ──► MaterializerWorker
//!   (tracer thread, never blocks)                      (own thread, copies)
//! ```

use crossbeam::channel::Receiver;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

use crate::cancel::Cancellation;
use crate::collector::{DependencyRecord, FileKind};
use crate::paths;

/// Why a single record could not be written
#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("Permission denied reading {}", .path.display())]
    PermissionDenied { path: PathBuf },

    #[error("Source vanished before it could be copied: {}", .path.display())]
    SourceVanished { path: PathBuf },

    #[error("Cannot create {expected} at {}: a {found} is already there", .path.display())]
    TypeCollision {
        path: PathBuf,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Skipped {}: ancestor {} conflicts in the output tree", .path.display(), .ancestor.display())]
    AncestorConflict { path: PathBuf, ancestor: PathBuf },

    #[error("I/O error materializing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The operation a record maps to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeOp {
    CreateDir,
    CopyFile,
    /// Create a link whose target is this exact string
    CreateSymlink { target: PathBuf },
    /// Nothing meaningful to write (special files, vanished paths)
    Skip,
}

impl MaterializeOp {
    pub fn for_record(record: &DependencyRecord) -> Self {
        match (record.kind, &record.target) {
            (FileKind::Directory, _) => Self::CreateDir,
            (FileKind::Regular, _) => Self::CopyFile,
            (FileKind::Symlink, Some(target)) => Self::CreateSymlink {
                target: target.clone(),
            },
            _ => Self::Skip,
        }
    }
}

/// What a successful `materialize` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeOutcome {
    Created,
    Copied,
    /// Destination already matched the source
    UpToDate,
    Skipped,
}

/// Writes records beneath one output root
#[derive(Debug)]
pub struct Materializer {
    output_root: PathBuf,
    /// Source directories whose output subtree is unusable
    blocked: HashSet<PathBuf>,
}

impl Materializer {
    pub fn new(output_root: PathBuf) -> Self {
        Self {
            output_root,
            blocked: HashSet::new(),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Create the output root itself
    pub fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.output_root)
    }

    /// Write one record into the output root
    pub fn materialize(
        &mut self,
        record: &DependencyRecord,
    ) -> Result<MaterializeOutcome, MaterializeError> {
        let op = MaterializeOp::for_record(record);
        if op == MaterializeOp::Skip {
            return Ok(MaterializeOutcome::Skipped);
        }

        self.check_ancestors(&record.path)?;
        let dest = paths::reroot(&self.output_root, &record.path);

        let result = match op {
            MaterializeOp::CreateDir => create_dir(&dest),
            MaterializeOp::CopyFile => copy_file(&record.path, &dest),
            MaterializeOp::CreateSymlink { target } => create_symlink(&target, &dest),
            MaterializeOp::Skip => Ok(MaterializeOutcome::Skipped),
        };

        if let Err(MaterializeError::TypeCollision { .. }) = &result {
            self.blocked.insert(record.path.clone());
        }
        result
    }

    /// Make sure every ancestor of `source` exists as a real directory in
    /// the output tree, creating missing ones
    fn check_ancestors(&mut self, source: &Path) -> Result<(), MaterializeError> {
        if let Some(ancestor) = self
            .blocked
            .iter()
            .find(|blocked| paths::is_within_dir(source, blocked))
        {
            return Err(MaterializeError::AncestorConflict {
                path: source.to_path_buf(),
                ancestor: ancestor.clone(),
            });
        }

        for ancestor in paths::ancestors_top_down(source) {
            let dest = paths::reroot(&self.output_root, &ancestor);
            match fs::symlink_metadata(&dest) {
                Ok(meta) if meta.is_dir() => {}
                // Writing beneath a link would escape into whatever it names
                Ok(_) => {
                    self.blocked.insert(ancestor.clone());
                    return Err(MaterializeError::AncestorConflict {
                        path: source.to_path_buf(),
                        ancestor,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    create_dir(&dest)?;
                }
                Err(source_err) => {
                    return Err(MaterializeError::Io {
                        path: dest,
                        source: source_err,
                    })
                }
            }
        }
        Ok(())
    }
}

fn create_dir(dest: &Path) -> Result<MaterializeOutcome, MaterializeError> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => return Ok(MaterializeOutcome::UpToDate),
        Ok(meta) => {
            return Err(MaterializeError::TypeCollision {
                path: dest.to_path_buf(),
                expected: "directory",
                found: describe(&meta),
            })
        }
        Err(_) => {}
    }

    match fs::create_dir(dest) {
        Ok(()) => Ok(MaterializeOutcome::Created),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dest.is_dir() => {
            Ok(MaterializeOutcome::UpToDate)
        }
        Err(e) => Err(MaterializeError::Io {
            path: dest.to_path_buf(),
            source: e,
        }),
    }
}

fn copy_file(source: &Path, dest: &Path) -> Result<MaterializeOutcome, MaterializeError> {
    let source_meta = fs::symlink_metadata(source).map_err(|e| source_error(source, e))?;
    if !source_meta.is_file() {
        // Replaced by something else since it was recorded
        return Err(MaterializeError::SourceVanished {
            path: source.to_path_buf(),
        });
    }

    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_file() => {
            let same_mtime = match (meta.modified(), source_meta.modified()) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            };
            if meta.len() == source_meta.len() && same_mtime {
                return Ok(MaterializeOutcome::UpToDate);
            }
        }
        Ok(meta) if meta.is_dir() => {
            return Err(MaterializeError::TypeCollision {
                path: dest.to_path_buf(),
                expected: "file",
                found: "directory",
            })
        }
        // Stale links from an earlier capture are replaced by the rename
        Ok(_) | Err(_) => {}
    }

    let mut reader = File::open(source).map_err(|e| source_error(source, e))?;
    let partial = temp_sibling(dest, "partial");
    let result = (|| -> io::Result<()> {
        let mut writer = File::create(&partial)?;
        io::copy(&mut reader, &mut writer)?;
        if let Ok(mtime) = source_meta.modified() {
            writer.set_modified(mtime)?;
        }
        drop(writer);
        fs::set_permissions(&partial, source_meta.permissions())?;
        fs::rename(&partial, dest)
    })();

    match result {
        Ok(()) => Ok(MaterializeOutcome::Copied),
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(MaterializeError::Io {
                path: dest.to_path_buf(),
                source: e,
            })
        }
    }
}

fn create_symlink(target: &Path, dest: &Path) -> Result<MaterializeOutcome, MaterializeError> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.file_type().is_symlink() => {
            // Byte comparison: `Path` equality ignores `.` and repeated `/`
            if fs::read_link(dest)
                .is_ok_and(|existing| existing.as_os_str() == target.as_os_str())
            {
                return Ok(MaterializeOutcome::UpToDate);
            }
        }
        Ok(meta) if meta.is_dir() => {
            return Err(MaterializeError::TypeCollision {
                path: dest.to_path_buf(),
                expected: "symlink",
                found: describe(&meta),
            })
        }
        // A file replaced by a link in the source is replaced by the rename
        Ok(_) | Err(_) => {}
    }

    let staged = temp_sibling(dest, "link");
    let _ = fs::remove_file(&staged);
    symlink(target, &staged)
        .and_then(|()| fs::rename(&staged, dest))
        .map(|()| MaterializeOutcome::Created)
        .map_err(|e| {
            let _ = fs::remove_file(&staged);
            MaterializeError::Io {
                path: dest.to_path_buf(),
                source: e,
            }
        })
}

/// Hidden name next to `dest` for staging an atomic rename
fn temp_sibling(dest: &Path, tag: &str) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.cde-{}", name, tag))
}

fn source_error(path: &Path, err: io::Error) -> MaterializeError {
    match err.kind() {
        io::ErrorKind::NotFound => MaterializeError::SourceVanished {
            path: path.to_path_buf(),
        },
        io::ErrorKind::PermissionDenied => MaterializeError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => MaterializeError::Io {
            path: path.to_path_buf(),
            source: err,
        },
    }
}

fn describe(meta: &fs::Metadata) -> &'static str {
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        "symlink"
    } else if file_type.is_dir() {
        "directory"
    } else if file_type.is_file() {
        "file"
    } else {
        "special file"
    }
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    copied: AtomicU64,
    up_to_date: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Materializer counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MaterializeStats {
    pub created: u64,
    pub copied: u64,
    pub up_to_date: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Background thread draining the job channel into a [`Materializer`]
pub struct MaterializerWorker {
    handle: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl MaterializerWorker {
    /// Start the worker; it runs until every sender is dropped or the run
    /// is cancelled
    pub fn spawn(
        mut materializer: Materializer,
        jobs: Receiver<DependencyRecord>,
        cancel: Arc<Cancellation>,
    ) -> io::Result<Self> {
        let counters = Arc::new(Counters::default());
        let worker_counters = Arc::clone(&counters);

        let handle = thread::Builder::new()
            .name("cde-materializer".into())
            .spawn(move || {
                for record in jobs.iter() {
                    if cancel.is_cancelled() {
                        tracing::info!("capture cancelled; dropping pending materialization jobs");
                        break;
                    }
                    let counter = match materializer.materialize(&record) {
                        Ok(MaterializeOutcome::Created) => &worker_counters.created,
                        Ok(MaterializeOutcome::Copied) => &worker_counters.copied,
                        Ok(MaterializeOutcome::UpToDate) => &worker_counters.up_to_date,
                        Ok(MaterializeOutcome::Skipped) => &worker_counters.skipped,
                        Err(e) => {
                            tracing::warn!("{}", e);
                            &worker_counters.failed
                        }
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })?;

        Ok(Self {
            handle: Some(handle),
            counters,
        })
    }

    pub fn stats(&self) -> MaterializeStats {
        MaterializeStats {
            created: self.counters.created.load(Ordering::Relaxed),
            copied: self.counters.copied.load(Ordering::Relaxed),
            up_to_date: self.counters.up_to_date.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Wait for the channel to drain; all senders must be gone
    pub fn join(mut self) -> MaterializeStats {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("materializer thread panicked");
            }
        }
        self.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        src: PathBuf,
        root: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        let src = base.join("src");
        let root = base.join("cde-root");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&root).unwrap();
        Fixture {
            _tmp: tmp,
            src,
            root,
        }
    }

    fn materialize_all(m: &mut Materializer, paths: &[PathBuf]) {
        for path in paths {
            for ancestor in paths::ancestors_top_down(path) {
                m.materialize(&DependencyRecord::classify(&ancestor)).unwrap();
            }
            m.materialize(&DependencyRecord::classify(path)).unwrap();
        }
    }

    #[test]
    fn test_op_for_record_is_tagged_by_kind() {
        let f = fixture();
        fs::write(f.src.join("a"), "x").unwrap();
        symlink("a", f.src.join("l")).unwrap();

        assert_eq!(
            MaterializeOp::for_record(&DependencyRecord::classify(&f.src)),
            MaterializeOp::CreateDir
        );
        assert_eq!(
            MaterializeOp::for_record(&DependencyRecord::classify(&f.src.join("a"))),
            MaterializeOp::CopyFile
        );
        assert_eq!(
            MaterializeOp::for_record(&DependencyRecord::classify(&f.src.join("l"))),
            MaterializeOp::CreateSymlink {
                target: PathBuf::from("a")
            }
        );
        assert_eq!(
            MaterializeOp::for_record(&DependencyRecord::classify(&f.src.join("none"))),
            MaterializeOp::Skip
        );
    }

    #[test]
    fn test_regular_file_is_byte_identical() {
        let f = fixture();
        let file = f.src.join("tests/test_file.txt");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"\x00binary\xffcontent").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o750)).unwrap();

        let mut m = Materializer::new(f.root.clone());
        materialize_all(&mut m, &[file.clone()]);

        let out = paths::reroot(&f.root, &file);
        assert_eq!(fs::read(&out).unwrap(), b"\x00binary\xffcontent");
        assert_eq!(fs::metadata(&out).unwrap().permissions().mode() & 0o777, 0o750);
    }

    #[test]
    fn test_symlink_target_is_literal() {
        let f = fixture();
        fs::create_dir(f.src.join("tests")).unwrap();
        fs::write(f.src.join("tests/test_file.txt"), "x").unwrap();
        let link = f.src.join("tests/test_file.symlink");
        symlink("test_file.txt", &link).unwrap();
        let dangling = f.src.join("tests/dangling");
        symlink("../../nowhere/at/all", &dangling).unwrap();

        let mut m = Materializer::new(f.root.clone());
        materialize_all(&mut m, &[link.clone(), dangling.clone()]);

        let out = paths::reroot(&f.root, &link);
        assert!(fs::symlink_metadata(&out).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&out).unwrap(), PathBuf::from("test_file.txt"));
        assert_eq!(
            fs::read_link(paths::reroot(&f.root, &dangling)).unwrap(),
            PathBuf::from("../../nowhere/at/all")
        );
    }

    #[test]
    fn test_second_pass_copies_nothing() {
        let f = fixture();
        let file = f.src.join("data.bin");
        fs::write(&file, vec![7u8; 4096]).unwrap();
        let link = f.src.join("data.link");
        symlink("data.bin", &link).unwrap();

        let mut m = Materializer::new(f.root.clone());
        materialize_all(&mut m, &[file.clone(), link.clone()]);
        let before = fs::metadata(paths::reroot(&f.root, &file)).unwrap();

        let mut again = Materializer::new(f.root.clone());
        assert_eq!(
            again.materialize(&DependencyRecord::classify(&file)).unwrap(),
            MaterializeOutcome::UpToDate
        );
        assert_eq!(
            again.materialize(&DependencyRecord::classify(&link)).unwrap(),
            MaterializeOutcome::UpToDate
        );
        assert_eq!(
            again.materialize(&DependencyRecord::classify(&f.src)).unwrap(),
            MaterializeOutcome::UpToDate
        );
        let after = fs::metadata(paths::reroot(&f.root, &file)).unwrap();
        assert_eq!(before.modified().unwrap(), after.modified().unwrap());
    }

    #[test]
    fn test_changed_file_is_recopied() {
        let f = fixture();
        let file = f.src.join("log");
        fs::write(&file, "one").unwrap();

        let mut m = Materializer::new(f.root.clone());
        materialize_all(&mut m, &[file.clone()]);
        fs::write(&file, "one two").unwrap();
        assert_eq!(
            m.materialize(&DependencyRecord::classify(&file)).unwrap(),
            MaterializeOutcome::Copied
        );
        assert_eq!(fs::read_to_string(paths::reroot(&f.root, &file)).unwrap(), "one two");
    }

    #[test]
    fn test_changed_symlink_target_is_replaced() {
        let f = fixture();
        let link = f.src.join("current");
        symlink("v1", &link).unwrap();
        let mut m = Materializer::new(f.root.clone());
        materialize_all(&mut m, &[link.clone()]);

        fs::remove_file(&link).unwrap();
        symlink("v2", &link).unwrap();
        assert_eq!(
            m.materialize(&DependencyRecord::classify(&link)).unwrap(),
            MaterializeOutcome::Created
        );
        assert_eq!(
            fs::read_link(paths::reroot(&f.root, &link)).unwrap(),
            PathBuf::from("v2")
        );
    }

    #[test]
    fn test_symlink_target_compared_byte_for_byte() {
        let f = fixture();
        let link = f.src.join("l");
        symlink("dir/x", &link).unwrap();
        let mut m = Materializer::new(f.root.clone());
        materialize_all(&mut m, &[link.clone()]);

        fs::remove_file(&link).unwrap();
        symlink("dir/./x", &link).unwrap();
        assert_eq!(
            m.materialize(&DependencyRecord::classify(&link)).unwrap(),
            MaterializeOutcome::Created
        );
        assert_eq!(
            fs::read_link(paths::reroot(&f.root, &link)).unwrap().as_os_str(),
            "dir/./x"
        );
    }

    #[test]
    fn test_file_replaced_by_symlink() {
        let f = fixture();
        let entry = f.src.join("config");
        fs::write(&entry, "old").unwrap();
        let mut m = Materializer::new(f.root.clone());
        materialize_all(&mut m, &[entry.clone()]);

        fs::remove_file(&entry).unwrap();
        symlink("config.d/current", &entry).unwrap();
        assert_eq!(
            m.materialize(&DependencyRecord::classify(&entry)).unwrap(),
            MaterializeOutcome::Created
        );
        assert_eq!(
            fs::read_link(paths::reroot(&f.root, &entry)).unwrap(),
            PathBuf::from("config.d/current")
        );
    }

    #[test]
    fn test_vanished_source_is_reported() {
        let f = fixture();
        let file = f.src.join("temp");
        fs::write(&file, "x").unwrap();
        let record = DependencyRecord::classify(&file);
        fs::remove_file(&file).unwrap();

        let mut m = Materializer::new(f.root.clone());
        let err = m.materialize(&record).unwrap_err();
        assert!(matches!(err, MaterializeError::SourceVanished { .. }));
    }

    #[test]
    fn test_type_collision_blocks_subtree() {
        let f = fixture();
        let dir = f.src.join("lib");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("x.so"), "elf").unwrap();

        let mut m = Materializer::new(f.root.clone());
        materialize_all(&mut m, &[f.src.clone()]);
        // A file squats where the directory must go
        fs::write(paths::reroot(&f.root, &dir), "squatter").unwrap();

        let err = m.materialize(&DependencyRecord::classify(&dir)).unwrap_err();
        assert!(matches!(err, MaterializeError::TypeCollision { expected: "directory", .. }));

        let err = m
            .materialize(&DependencyRecord::classify(&dir.join("x.so")))
            .unwrap_err();
        assert!(matches!(err, MaterializeError::AncestorConflict { .. }));
        // Sibling subtrees are unaffected
        fs::write(f.src.join("ok.txt"), "fine").unwrap();
        assert_eq!(
            m.materialize(&DependencyRecord::classify(&f.src.join("ok.txt"))).unwrap(),
            MaterializeOutcome::Copied
        );
    }

    #[test]
    fn test_never_writes_through_output_symlink() {
        let f = fixture();
        let escape = f.src.join("escape-target");
        fs::create_dir(&escape).unwrap();
        let dir = f.src.join("d");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("file"), "payload").unwrap();

        let mut m = Materializer::new(f.root.clone());
        materialize_all(&mut m, &[f.src.clone()]);
        symlink(&escape, paths::reroot(&f.root, &dir)).unwrap();

        let err = m
            .materialize(&DependencyRecord::classify(&dir.join("file")))
            .unwrap_err();
        assert!(matches!(err, MaterializeError::AncestorConflict { .. }));
        assert!(!escape.join("file").exists());
    }

    #[test]
    fn test_missing_ancestors_are_created() {
        let f = fixture();
        let file = f.src.join("deep/er/file");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, "x").unwrap();

        let mut m = Materializer::new(f.root.clone());
        m.materialize(&DependencyRecord::classify(&file)).unwrap();
        assert!(paths::reroot(&f.root, &file).is_file());
    }

    #[test]
    fn test_worker_drains_channel_and_counts() {
        let f = fixture();
        fs::write(f.src.join("a"), "a").unwrap();
        symlink("a", f.src.join("b")).unwrap();

        let (tx, rx) = unbounded();
        let worker = MaterializerWorker::spawn(
            Materializer::new(f.root.clone()),
            rx,
            Arc::new(Cancellation::new()),
        )
        .unwrap();

        for path in paths::ancestors_top_down(&f.src.join("a")) {
            tx.send(DependencyRecord::classify(&path)).unwrap();
        }
        tx.send(DependencyRecord::classify(&f.src.join("a"))).unwrap();
        tx.send(DependencyRecord::classify(&f.src.join("b"))).unwrap();
        tx.send(DependencyRecord::classify(&f.src.join("a"))).unwrap();
        drop(tx);

        let stats = worker.join();
        assert_eq!(stats.copied, 1);
        assert_eq!(stats.failed, 0);
        assert!(stats.up_to_date >= 1);
        assert!(paths::reroot(&f.root, &f.src.join("b")).symlink_metadata().is_ok());
    }

    #[test]
    fn test_cancelled_worker_stops_early() {
        let f = fixture();
        fs::write(f.src.join("a"), "a").unwrap();
        let cancel = Arc::new(Cancellation::new());
        cancel.cancel();

        let (tx, rx) = unbounded();
        let worker =
            MaterializerWorker::spawn(Materializer::new(f.root.clone()), rx, cancel).unwrap();
        tx.send(DependencyRecord::classify(&f.src.join("a"))).unwrap();
        drop(tx);

        let stats = worker.join();
        assert_eq!(stats, MaterializeStats::default());
        assert!(!paths::reroot(&f.root, &f.src.join("a")).exists());
    }
}
