//! Capture configuration
//!
//! Settings come from an optional TOML file and are overridden by CLI flags.
//! Ignore rules name exact paths, path prefixes and substrings that are
//! never copied.
//!
//! ```toml
//! output_dir = "cde-root"
//! max_symlink_hops = 40
//! ignore_prefix = ["/proc/", "/sys/", "/dev/", "/home/me/.cache/"]
//! ignore_exact = ["/etc/ld.so.cache"]
//! ignore_substr = [".pyc"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::resolver::DEFAULT_MAX_SYMLINK_HOPS;

/// Default output root, relative to the working directory of the tool
pub const DEFAULT_OUTPUT_DIR: &str = "cde-root";

/// Settings for one capture run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Directory the captured tree is written under
    pub output_dir: PathBuf,
    /// Symlink hop budget for path resolution
    pub max_symlink_hops: u32,
    /// Record ELF and `#!` interpreters of every successful exec
    pub record_exec_interpreters: bool,
    /// Paths that are never captured
    pub ignore_exact: Vec<PathBuf>,
    /// Path prefixes that are never captured (plain string prefixes)
    pub ignore_prefix: Vec<String>,
    /// Substrings that exclude any path containing them
    pub ignore_substr: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            max_symlink_hops: DEFAULT_MAX_SYMLINK_HOPS,
            record_exec_interpreters: true,
            ignore_exact: Vec::new(),
            // Pseudo-filesystems: their entries are not files to package
            ignore_prefix: vec!["/proc/".into(), "/sys/".into(), "/dev/".into()],
            ignore_substr: Vec::new(),
        }
    }
}

impl CaptureConfig {
    /// Load a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        if config.max_symlink_hops == 0 {
            anyhow::bail!("max_symlink_hops must be >= 1");
        }
        Ok(config)
    }

    /// Should `path` be left out of the capture?
    ///
    /// The directories `/proc`, `/sys` themselves still match their
    /// `"/proc/"`-style prefix.
    pub fn is_ignored(&self, path: &Path) -> bool {
        if self.ignore_exact.iter().any(|p| p == path) {
            return true;
        }

        let text = path.to_string_lossy();
        let matches_prefix = self.ignore_prefix.iter().any(|prefix| {
            text.starts_with(prefix.as_str())
                || prefix
                    .strip_suffix('/')
                    .is_some_and(|dir| !dir.is_empty() && text == dir)
        });
        matches_prefix
            || self
                .ignore_substr
                .iter()
                .any(|needle| text.contains(needle.as_str()))
    }
}
