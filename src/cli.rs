//! CLI argument parsing for cde

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use crate::config::CaptureConfig;

#[derive(Parser, Debug)]
#[command(name = "cde")]
#[command(version)]
#[command(
    about = "Run a command and capture every file it touches into a self-contained root",
    long_about = None
)]
pub struct Cli {
    /// Directory the captured tree is written to [default: cde-root]
    #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// TOML configuration file (output directory, ignore rules)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write a JSON manifest of the captured paths
    #[arg(long = "manifest", value_name = "FILE")]
    pub manifest: Option<PathBuf>,

    /// Symlinks followed per path before giving up [default: 40]
    #[arg(
        long = "max-symlink-hops",
        value_name = "N",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_symlink_hops: Option<u32>,

    /// Enable debug tracing output (to stderr)
    #[arg(long = "debug")]
    pub debug: bool,

    /// Command to capture (everything after --)
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Configuration file values with command-line overrides applied
    pub fn capture_config(&self) -> Result<CaptureConfig> {
        let mut config = match &self.config {
            Some(path) => CaptureConfig::from_file(path)?,
            None => CaptureConfig::default(),
        };
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(hops) = self.max_symlink_hops {
            config.max_symlink_hops = hops;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_OUTPUT_DIR;
    use crate::resolver::DEFAULT_MAX_SYMLINK_HOPS;

    #[test]
    fn test_cli_parses_command() {
        let cli = Cli::parse_from(["cde", "--", "echo", "hello"]);
        assert_eq!(cli.command, vec!["echo", "hello"]);
        assert!(!cli.debug);
    }

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["cde"]).is_err());
        assert!(Cli::try_parse_from(["cde", "--debug"]).is_err());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from([
            "cde",
            "-o",
            "/tmp/pkg",
            "--manifest",
            "m.json",
            "--max-symlink-hops",
            "8",
            "--debug",
            "--",
            "ls",
            "-l",
        ]);
        assert_eq!(cli.output_dir, Some(PathBuf::from("/tmp/pkg")));
        assert_eq!(cli.manifest, Some(PathBuf::from("m.json")));
        assert_eq!(cli.max_symlink_hops, Some(8));
        assert!(cli.debug);
        assert_eq!(cli.command, vec!["ls", "-l"]);
    }

    #[test]
    fn test_cli_rejects_zero_hops() {
        assert!(Cli::try_parse_from(["cde", "--max-symlink-hops", "0", "--", "true"]).is_err());
    }

    #[test]
    fn test_defaults_without_overrides() {
        let cli = Cli::parse_from(["cde", "--", "true"]);
        let config = cli.capture_config().unwrap();
        assert_eq!(config.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
        assert_eq!(config.max_symlink_hops, DEFAULT_MAX_SYMLINK_HOPS);
    }

    #[test]
    fn test_flags_override_config_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("cde.toml");
        std::fs::write(
            &path,
            "output_dir = \"from-file\"\nmax_symlink_hops = 12\nignore_substr = [\".pyc\"]\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "cde",
            "-c",
            path.to_str().unwrap(),
            "-o",
            "from-flag",
            "--",
            "true",
        ]);
        let config = cli.capture_config().unwrap();
        assert_eq!(config.output_dir, PathBuf::from("from-flag"));
        assert_eq!(config.max_symlink_hops, 12);
        assert_eq!(config.ignore_substr, vec![".pyc".to_string()]);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["cde", "-c", "/nonexistent/cde.toml", "--", "true"]);
        assert!(cli.capture_config().is_err());
    }
}
