//! cde - capture the files a process tree touches
//!
//! Runs a command under ptrace, follows every process it creates, and
//! mirrors each file, directory and symlink the tree touches into an
//! output root at the same absolute paths. The result can be copied to
//! another machine and the command re-run against it.

pub mod cancel;
pub mod cli;
pub mod collector;
pub mod config;
pub mod exec_deps;
pub mod interceptor;
pub mod manifest;
pub mod materializer;
pub mod paths;
pub mod resolver;
pub mod session;
pub mod supervisor;
pub mod syscalls;
pub mod tracee;
