//! Kernel-style path resolution
//!
//! Resolves the path argument of an intercepted syscall the way the kernel's
//! path walk does: component by component, dereferencing every symlink met
//! before the final component, with `..` applied to the real location of the
//! directory reached so far. Whether the final component is followed is left
//! to the caller, because `lstat`-class calls act on the link itself while
//! `open`-class calls act on its target.

use serde::Serialize;
use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::paths;

/// Default symlink hop budget, matching Linux `MAXSYMLINKS`
pub const DEFAULT_MAX_SYMLINK_HOPS: u32 = 40;

/// Longest single path component accepted (`NAME_MAX`)
pub const NAME_MAX: usize = 255;

/// Longest raw path accepted, including the terminating NUL (`PATH_MAX`)
pub const PATH_MAX: usize = 4096;

/// Why a path could not be resolved
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Too many levels of symbolic links resolving {} (limit {limit})", .path.display())]
    SymlinkLoop { path: PathBuf, limit: u32 },

    #[error("Path component of {len} bytes exceeds NAME_MAX in {}", .path.display())]
    NameTooLong { path: PathBuf, len: usize },

    #[error("Path of {len} bytes exceeds PATH_MAX")]
    PathTooLong { len: usize },

    #[error("Empty path")]
    Empty,
}

/// Class of syscall a path argument came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyscallKind {
    Open,
    Exec,
    Stat,
    Link,
    Readlink,
    Chdir,
    Create,
    Remove,
    Rename,
    Other,
}

/// A path argument as the traced process passed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRequest {
    /// Raw path bytes from tracee memory
    pub raw: PathBuf,
    /// Directory relative paths start from: the cwd, or a dirfd's path
    pub base: PathBuf,
    /// The process root (`/` unless the process called `chroot`)
    pub root: PathBuf,
    pub kind: SyscallKind,
    /// Whether the final component is dereferenced
    pub follow: bool,
}

/// An absolute path with every non-final symlink dereferenced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: PathBuf,
    /// The final component is itself a symlink (only possible when not followed)
    pub final_is_symlink: bool,
    /// Every symlink crossed on the way, in the order they were met
    pub traversed: Vec<PathBuf>,
    /// Hops spent so far; a later `dereference` keeps counting from here
    pub hops: u32,
}

/// Symlink-aware resolver over the host filesystem
#[derive(Debug, Clone)]
pub struct PathResolver {
    max_hops: u32,
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SYMLINK_HOPS)
    }
}

impl PathResolver {
    pub fn new(max_hops: u32) -> Self {
        Self { max_hops }
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    /// Resolve `raw` relative to `cwd` inside the process root `root`
    ///
    /// The final component is not dereferenced unless the path ends with a
    /// slash (or `/.`), which the kernel treats as a demand for a directory.
    pub fn resolve(
        &self,
        raw: &Path,
        cwd: &Path,
        root: &Path,
    ) -> Result<ResolvedPath, ResolutionError> {
        let bytes = raw.as_os_str().as_bytes();
        if bytes.is_empty() {
            return Err(ResolutionError::Empty);
        }
        if bytes.len() >= PATH_MAX {
            return Err(ResolutionError::PathTooLong { len: bytes.len() });
        }

        let root = paths::normalize(root);
        let start = if raw.is_absolute() {
            root.clone()
        } else {
            paths::normalize(cwd)
        };

        self.walk(
            raw,
            start,
            split_components(raw.as_os_str()),
            &root,
            0,
            false,
            Vec::new(),
        )
    }

    /// Follow a final symlink left unresolved by [`resolve`](Self::resolve)
    ///
    /// The hop budget is shared with the original walk, so a chain of links
    /// cannot reset the cycle limit.
    pub fn dereference(
        &self,
        resolved: &ResolvedPath,
        root: &Path,
    ) -> Result<ResolvedPath, ResolutionError> {
        if !resolved.final_is_symlink {
            return Ok(resolved.clone());
        }

        let root = paths::normalize(root);
        let link = &resolved.path;
        let target = match fs::read_link(link) {
            Ok(target) => target,
            // Changed under us; keep what we have
            Err(_) => return Ok(resolved.clone()),
        };

        let hops = resolved.hops + 1;
        if hops > self.max_hops {
            return Err(ResolutionError::SymlinkLoop {
                path: link.clone(),
                limit: self.max_hops,
            });
        }

        let start = if target.is_absolute() {
            root.clone()
        } else {
            link.parent().map(Path::to_path_buf).unwrap_or_else(|| root.clone())
        };

        let mut traversed = resolved.traversed.clone();
        traversed.push(link.clone());

        self.walk(
            link,
            start,
            split_components(target.as_os_str()),
            &root,
            hops,
            true,
            traversed,
        )
    }

    /// Resolve a request, following the final component when it asks to
    pub fn resolve_request(&self, request: &PathRequest) -> Result<ResolvedPath, ResolutionError> {
        let resolved = self.resolve(&request.raw, &request.base, &request.root)?;
        if request.follow {
            self.dereference(&resolved, &request.root)
        } else {
            Ok(resolved)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn walk(
        &self,
        origin: &Path,
        mut current: PathBuf,
        mut pending: VecDeque<OsString>,
        root: &Path,
        mut hops: u32,
        follow_last: bool,
        mut traversed: Vec<PathBuf>,
    ) -> Result<ResolvedPath, ResolutionError> {
        let mut final_is_symlink = false;

        while let Some(component) = pending.pop_front() {
            let is_last = pending.is_empty();
            match component.as_bytes() {
                b"" | b"." => {}
                b".." => {
                    // Never climb out of the process root
                    if current != root {
                        current.pop();
                    }
                }
                name => {
                    if name.len() > NAME_MAX {
                        return Err(ResolutionError::NameTooLong {
                            path: origin.to_path_buf(),
                            len: name.len(),
                        });
                    }

                    let candidate = current.join(&component);
                    let link_target = read_symlink(&candidate);

                    if is_last && !follow_last {
                        final_is_symlink = link_target.is_some();
                        current = candidate;
                        break;
                    }

                    match link_target {
                        Some(target) => {
                            hops += 1;
                            if hops > self.max_hops {
                                return Err(ResolutionError::SymlinkLoop {
                                    path: origin.to_path_buf(),
                                    limit: self.max_hops,
                                });
                            }
                            traversed.push(candidate);
                            if target.is_absolute() {
                                current = root.to_path_buf();
                            }
                            for part in split_components(target.as_os_str()).into_iter().rev() {
                                pending.push_front(part);
                            }
                        }
                        None => current = candidate,
                    }
                }
            }
        }

        Ok(ResolvedPath {
            path: current,
            final_is_symlink,
            traversed,
            hops,
        })
    }
}

/// Split raw path bytes on `/`, keeping empty and dot components
///
/// A leading slash yields no component of its own; a trailing slash yields a
/// trailing empty component, which makes the walk follow the name before it.
fn split_components(raw: &OsStr) -> VecDeque<OsString> {
    let bytes = raw.as_bytes();
    let bytes = bytes.strip_prefix(b"/").unwrap_or(bytes);
    if bytes.is_empty() {
        return VecDeque::new();
    }
    bytes
        .split(|b| *b == b'/')
        .map(|part| OsString::from_vec(part.to_vec()))
        .collect()
}

/// Read the target of `path` if it is a symlink
fn read_symlink(path: &Path) -> Option<PathBuf> {
    let metadata = fs::symlink_metadata(path).ok()?;
    if metadata.file_type().is_symlink() {
        fs::read_link(path).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn sandbox() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        (tmp, base)
    }

    #[test]
    fn test_relative_path_uses_cwd() {
        let (_tmp, base) = sandbox();
        fs::write(base.join("file.txt"), "x").unwrap();

        let resolver = PathResolver::default();
        let resolved = resolver
            .resolve(Path::new("./file.txt"), &base, Path::new("/"))
            .unwrap();
        assert_eq!(resolved.path, base.join("file.txt"));
        assert!(!resolved.final_is_symlink);
        assert!(resolved.traversed.is_empty());
    }

    #[test]
    fn test_missing_paths_resolve_lexically() {
        let (_tmp, base) = sandbox();
        let resolver = PathResolver::default();
        let resolved = resolver
            .resolve(Path::new("nope/../also-nope"), &base, Path::new("/"))
            .unwrap();
        assert_eq!(resolved.path, base.join("also-nope"));
    }

    #[test]
    fn test_intermediate_symlink_is_dereferenced() {
        let (_tmp, base) = sandbox();
        fs::create_dir(base.join("real")).unwrap();
        fs::write(base.join("real/lib.so"), "elf").unwrap();
        symlink("real", base.join("alias")).unwrap();

        let resolver = PathResolver::default();
        let resolved = resolver
            .resolve(Path::new("alias/lib.so"), &base, Path::new("/"))
            .unwrap();
        assert_eq!(resolved.path, base.join("real/lib.so"));
        assert_eq!(resolved.traversed, vec![base.join("alias")]);
        assert_eq!(resolved.hops, 1);
    }

    #[test]
    fn test_final_symlink_left_for_caller() {
        let (_tmp, base) = sandbox();
        fs::write(base.join("test_file.txt"), "x").unwrap();
        symlink("test_file.txt", base.join("test_file.symlink")).unwrap();

        let resolver = PathResolver::default();
        let link = resolver
            .resolve(Path::new("test_file.symlink"), &base, Path::new("/"))
            .unwrap();
        assert_eq!(link.path, base.join("test_file.symlink"));
        assert!(link.final_is_symlink);

        let target = resolver.dereference(&link, Path::new("/")).unwrap();
        assert_eq!(target.path, base.join("test_file.txt"));
        assert!(!target.final_is_symlink);
        assert_eq!(target.traversed, vec![base.join("test_file.symlink")]);
    }

    #[test]
    fn test_resolve_request_follows_when_asked() {
        let (_tmp, base) = sandbox();
        fs::write(base.join("target"), "x").unwrap();
        symlink(base.join("target"), base.join("abs-link")).unwrap();

        let resolver = PathResolver::default();
        let mut request = PathRequest {
            raw: PathBuf::from("abs-link"),
            base: base.clone(),
            root: PathBuf::from("/"),
            kind: SyscallKind::Open,
            follow: true,
        };
        assert_eq!(
            resolver.resolve_request(&request).unwrap().path,
            base.join("target")
        );

        request.follow = false;
        request.kind = SyscallKind::Readlink;
        assert_eq!(
            resolver.resolve_request(&request).unwrap().path,
            base.join("abs-link")
        );
    }

    #[test]
    fn test_dotdot_through_symlinked_directory_uses_real_parent() {
        let (_tmp, base) = sandbox();
        fs::create_dir_all(base.join("b/inner")).unwrap();
        fs::create_dir(base.join("a")).unwrap();
        symlink(base.join("b/inner"), base.join("a/sub")).unwrap();

        let resolver = PathResolver::default();
        let resolved = resolver
            .resolve(Path::new("a/sub/../x"), &base, Path::new("/"))
            .unwrap();
        assert_eq!(resolved.path, base.join("b/x"));
    }

    #[test]
    fn test_trailing_slash_follows_final_symlink() {
        let (_tmp, base) = sandbox();
        fs::create_dir(base.join("dir")).unwrap();
        symlink("dir", base.join("dirlink")).unwrap();

        let resolver = PathResolver::default();
        let resolved = resolver
            .resolve(Path::new("dirlink/"), &base, Path::new("/"))
            .unwrap();
        assert_eq!(resolved.path, base.join("dir"));
        assert!(!resolved.final_is_symlink);
    }

    #[test]
    fn test_symlink_cycle_is_bounded() {
        let (_tmp, base) = sandbox();
        symlink("loop2", base.join("loop1")).unwrap();
        symlink("loop1", base.join("loop2")).unwrap();

        let resolver = PathResolver::new(8);
        let err = resolver
            .resolve(Path::new("loop1/file"), &base, Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, ResolutionError::SymlinkLoop { limit: 8, .. }));

        let link = resolver
            .resolve(Path::new("loop1"), &base, Path::new("/"))
            .unwrap();
        assert!(resolver.dereference(&link, Path::new("/")).is_err());
    }

    #[test]
    fn test_self_referencing_link_is_bounded() {
        let (_tmp, base) = sandbox();
        symlink("me", base.join("me")).unwrap();

        let resolver = PathResolver::default();
        let err = resolver
            .resolve(Path::new("me/"), &base, Path::new("/"))
            .unwrap_err();
        assert_eq!(
            err,
            ResolutionError::SymlinkLoop {
                path: PathBuf::from("me/"),
                limit: DEFAULT_MAX_SYMLINK_HOPS
            }
        );
    }

    #[test]
    fn test_dotdot_stops_at_process_root() {
        let (_tmp, base) = sandbox();
        let resolver = PathResolver::default();
        let resolved = resolver
            .resolve(Path::new("/../../etc/hosts"), Path::new("/"), &base)
            .unwrap();
        assert_eq!(resolved.path, base.join("etc/hosts"));
    }

    #[test]
    fn test_absolute_link_target_restarts_at_process_root() {
        let (_tmp, base) = sandbox();
        fs::create_dir(base.join("usr")).unwrap();
        symlink("/usr", base.join("lib")).unwrap();

        let resolver = PathResolver::default();
        let resolved = resolver
            .resolve(Path::new("/lib/x"), Path::new("/"), &base)
            .unwrap();
        assert_eq!(resolved.path, base.join("usr/x"));
    }

    #[test]
    fn test_length_limits() {
        let resolver = PathResolver::default();
        let long_name = "n".repeat(NAME_MAX + 1);
        let err = resolver
            .resolve(Path::new(&long_name), Path::new("/tmp"), Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, ResolutionError::NameTooLong { len, .. } if len == NAME_MAX + 1));

        let long_path = "/a".repeat(PATH_MAX);
        assert!(matches!(
            resolver.resolve(Path::new(&long_path), Path::new("/"), Path::new("/")),
            Err(ResolutionError::PathTooLong { .. })
        ));

        assert_eq!(
            resolver.resolve(Path::new(""), Path::new("/"), Path::new("/")),
            Err(ResolutionError::Empty)
        );
    }
}
