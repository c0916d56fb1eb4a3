//! Process tree supervision using ptrace
//!
//! Launches the command under `PTRACE_TRACEME`, then runs one event loop
//! over every tracee in the tree. Syscall stops go to the interceptor;
//! fork, clone and exec events keep the process table and per-process
//! state in step; other signal stops are passed back to the tracee.

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::env;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

use crate::interceptor::{InterceptStats, Interceptor};
use crate::session::CaptureSession;
use crate::tracee::{self, ProcessMemory};

/// A ptrace operation failed for one process
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    #[error("Failed to set ptrace options on {pid}: {source}")]
    Options { pid: Pid, source: Errno },

    #[error("Failed to resume {pid}: {source}")]
    Resume { pid: Pid, source: Errno },

    #[error("Failed to read registers of {pid}: {source}")]
    Registers { pid: Pid, source: Errno },

    #[error("Syscall interception is not supported on this architecture")]
    UnsupportedArch,
}

/// The run as a whole could not proceed
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Command is empty")]
    EmptyCommand,

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Traced command did not stop after exec: {status}")]
    InitialStop { status: String },

    #[error("Failed to wait for traced processes: {0}")]
    Wait(Errno),

    #[error(transparent)]
    Attach(#[from] AttachError),
}

/// Lifecycle of one traced process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Created; its first stop has not been seen yet
    Launched,
    Running,
    StoppedAtSyscall,
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracedProcess {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub status: ProcessStatus,
}

/// Result of tracing a command to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// Exit code of the root process, `128 + signal` if it was killed
    pub exit_code: i32,
    /// Processes traced over the whole run, the root included
    pub processes: usize,
    pub intercept: InterceptStats,
}

/// Trace `command` and its descendants until all of them have exited
pub fn trace_command(
    session: &CaptureSession,
    command: &[String],
) -> Result<RunOutcome, SupervisorError> {
    let Some((program, args)) = command.split_first() else {
        return Err(SupervisorError::EmptyCommand);
    };
    if !tracee::SUPPORTED {
        return Err(AttachError::UnsupportedArch.into());
    }

    let mut supervisor = Supervisor::new(session);
    let root = supervisor.launch(program, args)?;
    supervisor.run(root)
}

struct Supervisor<'s> {
    session: &'s CaptureSession,
    interceptor: Interceptor<ProcessMemory>,
    /// Every process seen this run; exited ones stay for the count
    processes: BTreeMap<Pid, TracedProcess>,
    root_exit: Option<i32>,
}

impl<'s> Supervisor<'s> {
    fn new(session: &'s CaptureSession) -> Self {
        Self {
            session,
            interceptor: session.interceptor(),
            processes: BTreeMap::new(),
            root_exit: None,
        }
    }

    /// Fork and exec the command stopped under ptrace, with options set
    fn launch(&mut self, program: &str, args: &[String]) -> Result<Pid, SupervisorError> {
        let mut command = Command::new(program);
        command.args(args);
        // SAFETY: PTRACE_TRACEME is a single syscall, async-signal-safe
        unsafe {
            command.pre_exec(|| ptrace::traceme().map_err(io::Error::from));
        }

        let child = command.spawn().map_err(|source| SupervisorError::Launch {
            program: program.to_string(),
            source,
        })?;
        let root = Pid::from_raw(child.id() as i32);
        self.session.cancellation().track(root);

        // The exec under PTRACE_TRACEME stops the child with SIGTRAP
        match waitpid(root, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {}
            Ok(status) => {
                return Err(SupervisorError::InitialStop {
                    status: format!("{:?}", status),
                })
            }
            Err(e) => return Err(SupervisorError::Wait(e)),
        }

        let options = ptrace::Options::PTRACE_O_TRACESYSGOOD
            | ptrace::Options::PTRACE_O_EXITKILL
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK
            | ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEEXEC;
        ptrace::setoptions(root, options)
            .map_err(|source| AttachError::Options { pid: root, source })?;

        tracing::info!(pid = root.as_raw(), program, "tracing command");
        self.add_process(root, None, ProcessStatus::Running);

        // The root's own exec happened before tracing began
        let executable = locate_program(program).unwrap_or_else(|| {
            std::fs::read_link(format!("/proc/{}/exe", root)).unwrap_or_else(|_| program.into())
        });
        self.interceptor.record_program(root, &executable);

        ptrace::syscall(root, None).map_err(|source| AttachError::Resume { pid: root, source })?;
        Ok(root)
    }

    fn run(mut self, root: Pid) -> Result<RunOutcome, SupervisorError> {
        while self.live() > 0 {
            let status = match waitpid(None, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => return Err(SupervisorError::Wait(e)),
            };

            match status {
                WaitStatus::Exited(pid, code) => {
                    tracing::debug!(pid = pid.as_raw(), code, "process exited");
                    self.process_exited(pid, root, code);
                }
                WaitStatus::Signaled(pid, signal, _) => {
                    tracing::debug!(pid = pid.as_raw(), ?signal, "process killed");
                    self.process_exited(pid, root, 128 + signal as i32);
                }
                WaitStatus::PtraceSyscall(pid) => self.syscall_stop(pid),
                WaitStatus::PtraceEvent(pid, _, event) => self.ptrace_event(pid, event),
                WaitStatus::Stopped(pid, signal) => self.signal_stop(pid, signal),
                _ => {}
            }
        }

        let exit_code = match self.root_exit {
            Some(code) => code,
            None => {
                tracing::warn!("root process exit status was not observed");
                1
            }
        };
        Ok(RunOutcome {
            exit_code,
            processes: self.processes.len(),
            intercept: self.interceptor.stats(),
        })
    }

    fn live(&self) -> usize {
        self.processes
            .values()
            .filter(|p| p.status != ProcessStatus::Exited)
            .count()
    }

    fn add_process(&mut self, pid: Pid, parent: Option<Pid>, status: ProcessStatus) {
        if let Some(existing) = self.processes.get_mut(&pid) {
            if existing.status != ProcessStatus::Exited {
                if existing.parent.is_none() {
                    existing.parent = parent;
                }
                return;
            }
        }
        self.processes.insert(pid, TracedProcess { pid, parent, status });
        self.session.cancellation().track(pid);
    }

    fn set_status(&mut self, pid: Pid, status: ProcessStatus) {
        if let Some(process) = self.processes.get_mut(&pid) {
            process.status = status;
        }
    }

    fn process_exited(&mut self, pid: Pid, root: Pid, code: i32) {
        if pid == root {
            self.root_exit = Some(code);
        }
        self.drop_process(pid);
    }

    fn drop_process(&mut self, pid: Pid) {
        self.set_status(pid, ProcessStatus::Exited);
        self.interceptor.on_exit(pid);
        self.session.cancellation().untrack(pid);
    }

    fn syscall_stop(&mut self, pid: Pid) {
        // A child can report a syscall stop before its creator's event
        self.add_process(pid, None, ProcessStatus::Running);
        let entering = !self
            .interceptor
            .process(pid)
            .is_some_and(|state| state.in_syscall());
        self.set_status(
            pid,
            if entering {
                ProcessStatus::StoppedAtSyscall
            } else {
                ProcessStatus::Running
            },
        );

        match tracee::read_regs(pid) {
            Ok(regs) => self.interceptor.on_syscall_stop(pid, &regs),
            // Killed while stopped; its exit is reported next
            Err(Errno::ESRCH) => {}
            Err(source) => tracing::warn!("{}", AttachError::Registers { pid, source }),
        }
        self.resume(pid, None);
    }

    fn ptrace_event(&mut self, pid: Pid, event: i32) {
        let is_fork = event == ptrace::Event::PTRACE_EVENT_FORK as i32
            || event == ptrace::Event::PTRACE_EVENT_VFORK as i32
            || event == ptrace::Event::PTRACE_EVENT_CLONE as i32;

        if is_fork {
            match ptrace::getevent(pid) {
                Ok(message) => {
                    let child = Pid::from_raw(message as i32);
                    tracing::debug!(parent = pid.as_raw(), child = child.as_raw(), "new process");
                    self.interceptor.on_fork(pid, child);
                    self.add_process(child, Some(pid), ProcessStatus::Launched);
                }
                Err(e) => tracing::warn!(pid = pid.as_raw(), "Failed to read fork event: {}", e),
            }
        } else if event == ptrace::Event::PTRACE_EVENT_EXEC as i32 {
            if let Ok(message) = ptrace::getevent(pid) {
                let former = Pid::from_raw(message as i32);
                self.interceptor.on_exec_event(pid, former);
                if former != pid {
                    self.set_status(former, ProcessStatus::Exited);
                    self.session.cancellation().untrack(former);
                }
            }
        }
        self.resume(pid, None);
    }

    fn signal_stop(&mut self, pid: Pid, signal: Signal) {
        let first_stop = match self.processes.get(&pid) {
            Some(process) => matches!(process.status, ProcessStatus::Launched | ProcessStatus::Exited),
            None => true,
        };

        if first_stop && signal == Signal::SIGSTOP {
            // New tracees start with a SIGSTOP that is not meant for them
            self.interceptor.ensure_tracked(pid);
            self.add_process(pid, None, ProcessStatus::Running);
            self.set_status(pid, ProcessStatus::Running);
            self.resume(pid, None);
        } else {
            tracing::debug!(pid = pid.as_raw(), ?signal, "forwarding signal");
            self.resume(pid, Some(signal));
        }
    }

    /// Resume a stopped tracee until its next syscall boundary
    ///
    /// A failure other than the tracee having died drops only this process.
    fn resume(&mut self, pid: Pid, signal: Option<Signal>) {
        match ptrace::syscall(pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(source) => {
                tracing::warn!("{}", AttachError::Resume { pid, source });
                self.drop_process(pid);
            }
        }
    }
}

/// Find the file `execvp` would run for `program`
///
/// Names containing a slash are used as given (relative ones resolve
/// against the tracee's cwd); bare names are searched in `PATH`.
pub fn locate_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }
    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
