//! Lexical path manipulation
//!
//! String-level operations on absolute paths. Nothing in this module touches
//! the filesystem; symlink-aware resolution lives in [`crate::resolver`].

use std::path::{Component, Path, PathBuf};

/// Collapse repeated separators, `.` and `..` of an absolute path
///
/// `..` at the root stays at the root, as it does in the kernel. Relative
/// inputs are treated as if they were anchored at `/`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}

/// Resolve `relative` against the absolute directory `base`, lexically
pub fn join_relative(relative: &Path, base: &Path) -> PathBuf {
    normalize(&base.join(relative))
}

/// Make `path` absolute with respect to `base` and normalize it
pub fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        join_relative(path, base)
    }
}

/// Return true iff `path` lies strictly beneath `dir`
///
/// Both sides are normalized first. The comparison is per component, so
/// `/home/a/hello.txt` is not within `/home/a/hello`, and a directory is not
/// within itself.
pub fn is_within_dir(path: &Path, dir: &Path) -> bool {
    let path = normalize(path);
    let dir = normalize(dir);
    path != dir && path.starts_with(&dir)
}

/// Map an absolute source path to its location beneath `output_root`
pub fn reroot(output_root: &Path, source: &Path) -> PathBuf {
    let source = normalize(source);
    match source.strip_prefix("/") {
        Ok(rest) if !rest.as_os_str().is_empty() => output_root.join(rest),
        _ => output_root.to_path_buf(),
    }
}

/// Every proper ancestor of `path` below `/`, outermost first
///
/// `/a/b/c` yields `/a`, `/a/b`.
pub fn ancestors_top_down(path: &Path) -> Vec<PathBuf> {
    let path = normalize(path);
    let mut ancestors: Vec<PathBuf> = path
        .ancestors()
        .skip(1)
        .filter(|p| p.parent().is_some())
        .map(Path::to_path_buf)
        .collect();
    ancestors.reverse();
    ancestors
}
