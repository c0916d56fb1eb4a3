//! Run cancellation
//!
//! An interrupt kills every live tracee and tells the materializer to stop
//! taking new jobs. Jobs already in progress finish, so the output tree is
//! left structurally valid.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Cancellation flag plus the set of processes to kill on cancel
#[derive(Debug, Default)]
pub struct Cancellation {
    cancelled: AtomicBool,
    live: Mutex<BTreeSet<Pid>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a Ctrl-C handler that cancels this run
    ///
    /// Fails if the process already has a handler installed (e.g. a test
    /// harness); the run still works, just without interrupt cleanup.
    pub fn install_ctrlc_handler(self: &Arc<Self>) -> Result<(), ctrlc::Error> {
        let cancel = Arc::clone(self);
        ctrlc::set_handler(move || {
            tracing::warn!("interrupted; terminating traced processes");
            cancel.cancel();
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        for pid in live.iter() {
            let _ = kill(*pid, Signal::SIGKILL);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Start tracking a traced process; killed at once if already cancelled
    pub fn track(&self, pid: Pid) {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.insert(pid);
        if self.is_cancelled() {
            let _ = kill(pid, Signal::SIGKILL);
        }
    }

    pub fn untrack(&self, pid: Pid) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
