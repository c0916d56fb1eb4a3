//! Syscall interception
//!
//! Turns syscall stops into recorded dependencies. Each traced process has
//! its own view of the filesystem namespace (cwd, root, open descriptors),
//! which is what relative and descriptor-relative paths resolve against.
//! Paths are resolved and recorded at syscall entry, before the call can
//! change the filesystem, and recorded again at exit for calls that create
//! what they name.

use nix::unistd::Pid;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::collector::DependencyCollector;
use crate::exec_deps;
use crate::resolver::{PathRequest, PathResolver, ResolvedPath, SyscallKind};
use crate::syscalls::{self, Effect, PathArg, SyscallLayout};
use crate::tracee::{SyscallRegs, TraceeMemory};

const AT_FDCWD: i32 = libc::AT_FDCWD;
const AT_EMPTY_PATH: u64 = libc::AT_EMPTY_PATH as u64;
const O_CLOEXEC: u64 = libc::O_CLOEXEC as u64;
const FD_CLOEXEC: u64 = libc::FD_CLOEXEC as u64;
const CLOSE_RANGE_CLOEXEC: u64 = 1 << 2;

/// An open descriptor that names a filesystem path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdEntry {
    pub path: PathBuf,
    pub cloexec: bool,
}

#[derive(Debug, Clone)]
struct PendingSyscall {
    layout: SyscallLayout,
    args: [u64; 6],
    /// One slot per path argument; `None` where it could not be resolved
    resolved: Vec<Option<ResolvedPath>>,
}

impl PendingSyscall {
    fn first_path(&self) -> Option<&Path> {
        self.resolved.first()?.as_ref().map(|r| r.path.as_path())
    }
}

/// Filesystem view of one traced process
#[derive(Debug, Clone)]
pub struct ProcessState {
    pub cwd: PathBuf,
    /// Host path of the process root; `/` unless it called `chroot`
    pub root: PathBuf,
    pub fds: BTreeMap<i32, FdEntry>,
    in_syscall: bool,
    pending: Option<PendingSyscall>,
}

impl ProcessState {
    pub fn new(cwd: PathBuf, root: PathBuf) -> Self {
        Self {
            cwd,
            root,
            fds: BTreeMap::new(),
            in_syscall: false,
            pending: None,
        }
    }

    /// Seed from `/proc/<pid>`, for processes seen before their creator's
    /// fork event or attached mid-flight
    pub fn from_proc(pid: Pid) -> Self {
        let proc_dir = PathBuf::from(format!("/proc/{}", pid));
        let cwd = fs::read_link(proc_dir.join("cwd")).unwrap_or_else(|_| PathBuf::from("/"));
        let root = fs::read_link(proc_dir.join("root")).unwrap_or_else(|_| PathBuf::from("/"));
        let mut state = Self::new(cwd, root);

        let Ok(entries) = fs::read_dir(proc_dir.join("fd")) else {
            return state;
        };
        for entry in entries.flatten() {
            let Some(fd) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            // Pipes, sockets and anonymous inodes read as `type:[inode]`
            let Ok(path) = fs::read_link(entry.path()) else {
                continue;
            };
            if !path.is_absolute() {
                continue;
            }
            let cloexec = proc_fd_flags(pid, fd).is_some_and(|flags| flags & O_CLOEXEC != 0);
            state.fds.insert(fd, FdEntry { path, cloexec });
        }
        state
    }

    pub fn in_syscall(&self) -> bool {
        self.in_syscall
    }

    fn fork_snapshot(&self) -> Self {
        Self {
            cwd: self.cwd.clone(),
            root: self.root.clone(),
            fds: self.fds.clone(),
            in_syscall: false,
            pending: None,
        }
    }

    fn dup_fd(&mut self, old: i32, new: i32, cloexec: bool) {
        match self.fds.get(&old).cloned() {
            Some(entry) => {
                self.fds.insert(
                    new,
                    FdEntry {
                        path: entry.path,
                        cloexec,
                    },
                );
            }
            None => {
                self.fds.remove(&new);
            }
        }
    }
}

/// Counters for the run summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InterceptStats {
    /// Syscalls that named a path or changed descriptor state
    pub decoded_syscalls: u64,
    /// Path arguments resolved and handed to the collector
    pub resolved_paths: u64,
    /// Path arguments skipped on a resolution error
    pub unresolved_paths: u64,
}

/// Per-process syscall decoding feeding the collector
pub struct Interceptor<M: TraceeMemory> {
    resolver: PathResolver,
    collector: Arc<DependencyCollector>,
    memory: M,
    record_interpreters: bool,
    processes: HashMap<Pid, ProcessState>,
    stats: InterceptStats,
}

impl<M: TraceeMemory> Interceptor<M> {
    pub fn new(
        resolver: PathResolver,
        collector: Arc<DependencyCollector>,
        memory: M,
        record_interpreters: bool,
    ) -> Self {
        Self {
            resolver,
            collector,
            memory,
            record_interpreters,
            processes: HashMap::new(),
            stats: InterceptStats::default(),
        }
    }

    /// Start tracking `pid` with an explicit state
    pub fn track(&mut self, pid: Pid, state: ProcessState) {
        self.processes.insert(pid, state);
    }

    /// Track `pid` from `/proc` unless it is already known
    pub fn ensure_tracked(&mut self, pid: Pid) {
        self.processes
            .entry(pid)
            .or_insert_with(|| ProcessState::from_proc(pid));
    }

    pub fn process(&self, pid: Pid) -> Option<&ProcessState> {
        self.processes.get(&pid)
    }

    pub fn stats(&self) -> InterceptStats {
        self.stats
    }

    /// A fork, vfork or clone of `parent` produced `child`
    ///
    /// The child gets a snapshot of the parent's state. If the child already
    /// stopped on its own and was seeded from `/proc`, that state is kept.
    pub fn on_fork(&mut self, parent: Pid, child: Pid) {
        if self.processes.contains_key(&child) {
            return;
        }
        let state = match self.processes.get(&parent) {
            Some(parent_state) => parent_state.fork_snapshot(),
            None => ProcessState::from_proc(child),
        };
        self.processes.insert(child, state);
    }

    /// `PTRACE_EVENT_EXEC`: a non-leader thread that called exec takes over
    /// the thread group id
    pub fn on_exec_event(&mut self, pid: Pid, former: Pid) {
        if former == pid {
            return;
        }
        if let Some(state) = self.processes.remove(&former) {
            self.processes.insert(pid, state);
        }
    }

    pub fn on_exit(&mut self, pid: Pid) {
        self.processes.remove(&pid);
    }

    /// Dispatch a syscall stop to entry or exit handling
    pub fn on_syscall_stop(&mut self, pid: Pid, regs: &SyscallRegs) {
        self.ensure_tracked(pid);
        let entering = self
            .processes
            .get_mut(&pid)
            .map(|state| {
                state.in_syscall = !state.in_syscall;
                state.in_syscall
            })
            .unwrap_or(false);

        if entering {
            self.syscall_entry(pid, regs);
        } else {
            self.syscall_exit(pid, regs);
        }
    }

    /// Record an executed program and its interpreters
    ///
    /// Used for the root command, whose exec happens before tracing starts.
    pub fn record_program(&mut self, pid: Pid, program: &Path) {
        self.ensure_tracked(pid);
        let Some(state) = self.processes.get(&pid) else {
            return;
        };
        let request = PathRequest {
            raw: program.to_path_buf(),
            base: state.cwd.clone(),
            root: state.root.clone(),
            kind: SyscallKind::Exec,
            follow: true,
        };
        match self.resolver.resolve_request(&request) {
            Ok(resolved) => {
                self.collector.record_resolved(&resolved);
                self.stats.resolved_paths += 1;
                self.record_interpreter_chain(pid, &resolved.path);
            }
            Err(e) => {
                tracing::warn!(pid = pid.as_raw(), path = %program.display(), "{}", e);
                self.stats.unresolved_paths += 1;
            }
        }
    }

    fn syscall_entry(&mut self, pid: Pid, regs: &SyscallRegs) {
        let name = syscalls::syscall_name(regs.nr);
        let Some(layout) = syscalls::syscall_layout(name) else {
            if let Some(state) = self.processes.get_mut(&pid) {
                state.pending = None;
            }
            return;
        };
        self.stats.decoded_syscalls += 1;

        let Some(state) = self.processes.get(&pid) else {
            return;
        };
        let mut resolved = Vec::with_capacity(layout.paths.len());
        for arg in layout.paths {
            let outcome = self.resolve_arg(pid, state, layout.kind, arg, &regs.args);
            match &outcome {
                Some(path) => {
                    tracing::debug!(pid = pid.as_raw(), syscall = name, path = %path.path.display(), "path argument");
                    self.collector.record_resolved(path);
                    self.stats.resolved_paths += 1;
                }
                None => self.stats.unresolved_paths += 1,
            }
            resolved.push(outcome);
        }

        if let Some(state) = self.processes.get_mut(&pid) {
            state.pending = Some(PendingSyscall {
                layout,
                args: regs.args,
                resolved,
            });
        }
    }

    fn syscall_exit(&mut self, pid: Pid, regs: &SyscallRegs) {
        let Some(state) = self.processes.get_mut(&pid) else {
            return;
        };
        let Some(pending) = state.pending.take() else {
            return;
        };
        // Negative returns are -errno
        if regs.ret < 0 {
            return;
        }

        if matches!(
            pending.layout.kind,
            SyscallKind::Open | SyscallKind::Create | SyscallKind::Link | SyscallKind::Rename
        ) {
            // The call may have replaced what was recorded at entry
            for path in pending.resolved.iter().flatten() {
                self.collector.refresh_resolved(path);
            }
        }

        if let Some(executable) = apply_effect(pid, state, &pending, regs.ret) {
            self.record_interpreter_chain(pid, &executable);
        }
    }

    fn record_interpreter_chain(&mut self, pid: Pid, executable: &Path) {
        if !self.record_interpreters {
            return;
        }
        let Some(state) = self.processes.get(&pid) else {
            return;
        };
        for interpreter in
            exec_deps::interpreter_chain(&self.resolver, executable, &state.cwd, &state.root)
        {
            tracing::debug!(pid = pid.as_raw(), path = %interpreter.path.display(), "exec interpreter");
            self.collector.record_resolved(&interpreter);
            self.stats.resolved_paths += 1;
        }
    }

    fn resolve_arg(
        &self,
        pid: Pid,
        state: &ProcessState,
        kind: SyscallKind,
        arg: &PathArg,
        args: &[u64; 6],
    ) -> Option<ResolvedPath> {
        let addr = args[arg.path];
        // e.g. utimensat(fd, NULL, ...) acts on the descriptor
        if addr == 0 {
            return None;
        }
        let raw = match self.memory.read_c_string(pid, addr) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(pid = pid.as_raw(), addr, "unreadable path argument: {}", e);
                return None;
            }
        };
        let dirfd = arg.dirfd.map(|i| args[i] as i32);

        if raw.is_empty() {
            let empty_allowed = arg
                .empty_path_flag
                .is_some_and(|i| args[i] & AT_EMPTY_PATH != 0);
            if !empty_allowed {
                return None;
            }
            let path = dir_path(pid, state, dirfd.unwrap_or(AT_FDCWD))?;
            return Some(ResolvedPath {
                path,
                final_is_symlink: false,
                traversed: Vec::new(),
                hops: 0,
            });
        }

        let raw = PathBuf::from(OsStr::from_bytes(&raw));
        let base = match dirfd {
            Some(fd) if !raw.is_absolute() => dir_path(pid, state, fd)?,
            _ => state.cwd.clone(),
        };
        let request = PathRequest {
            raw,
            base,
            root: state.root.clone(),
            kind,
            follow: arg.follow.applies(args),
        };

        match self.resolver.resolve_request(&request) {
            Ok(resolved) => Some(resolved),
            Err(e) => {
                tracing::warn!(pid = pid.as_raw(), path = %request.raw.display(), "{}", e);
                None
            }
        }
    }
}

/// Apply the bookkeeping of a successful syscall
///
/// Returns the executable path after a successful exec.
fn apply_effect(
    pid: Pid,
    state: &mut ProcessState,
    pending: &PendingSyscall,
    ret: i64,
) -> Option<PathBuf> {
    let args = &pending.args;
    match pending.layout.effect {
        Effect::None => {}
        Effect::OpenFd { flags } => {
            let fd = ret as i32;
            match pending.first_path() {
                Some(path) => {
                    let cloexec = flags.is_some_and(|i| args[i] & O_CLOEXEC != 0);
                    state.fds.insert(
                        fd,
                        FdEntry {
                            path: path.to_path_buf(),
                            cloexec,
                        },
                    );
                }
                None => {
                    state.fds.remove(&fd);
                }
            }
        }
        Effect::Close => {
            state.fds.remove(&(args[0] as i32));
        }
        Effect::CloseRange => {
            let (first, last) = (args[0] as u32, args[1] as u32);
            let in_range = |fd: &i32| (first..=last).contains(&(*fd as u32));
            if args[2] & CLOSE_RANGE_CLOEXEC != 0 {
                for (_, entry) in state.fds.iter_mut().filter(|(fd, _)| in_range(fd)) {
                    entry.cloexec = true;
                }
            } else {
                state.fds.retain(|fd, _| !in_range(fd));
            }
        }
        Effect::Dup { flags } => {
            let cloexec = flags.is_some_and(|i| args[i] & O_CLOEXEC != 0);
            state.dup_fd(args[0] as i32, ret as i32, cloexec);
        }
        Effect::Fcntl => {
            let fd = args[0] as i32;
            match args[1] as i32 {
                libc::F_DUPFD => state.dup_fd(fd, ret as i32, false),
                libc::F_DUPFD_CLOEXEC => state.dup_fd(fd, ret as i32, true),
                libc::F_SETFD => {
                    if let Some(entry) = state.fds.get_mut(&fd) {
                        entry.cloexec = args[2] & FD_CLOEXEC != 0;
                    }
                }
                _ => {}
            }
        }
        Effect::Chdir => {
            if let Some(path) = pending.first_path() {
                state.cwd = path.to_path_buf();
            }
        }
        Effect::Fchdir => {
            if let Some(path) = dir_path(pid, state, args[0] as i32) {
                state.cwd = path;
            }
        }
        Effect::Chroot => {
            if let Some(path) = pending.first_path() {
                state.root = path.to_path_buf();
            }
        }
        Effect::Exec => {
            state.fds.retain(|_, entry| !entry.cloexec);
            return pending.first_path().map(Path::to_path_buf);
        }
    }
    None
}

/// Directory a descriptor-relative lookup starts from
fn dir_path(pid: Pid, state: &ProcessState, fd: i32) -> Option<PathBuf> {
    if fd == AT_FDCWD {
        return Some(state.cwd.clone());
    }
    if let Some(entry) = state.fds.get(&fd) {
        return Some(entry.path.clone());
    }
    let path = fs::read_link(format!("/proc/{}/fd/{}", pid, fd)).ok()?;
    path.is_absolute().then_some(path)
}

/// Open flags of a descriptor, from `/proc/<pid>/fdinfo/<fd>`
fn proc_fd_flags(pid: Pid, fd: i32) -> Option<u64> {
    let info = fs::read_to_string(format!("/proc/{}/fdinfo/{}", pid, fd)).ok()?;
    info.lines()
        .find_map(|line| line.strip_prefix("flags:"))
        .and_then(|flags| u64::from_str_radix(flags.trim(), 8).ok())
}
