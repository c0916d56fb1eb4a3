//! Host trace backend
//!
//! Register snapshots and memory reads for a stopped tracee. Only the
//! register layout is architecture-specific; callers see [`SyscallRegs`].

use nix::errno::Errno;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use std::io::IoSliceMut;

use crate::resolver::PATH_MAX;

/// Whether this host has a register layout the interceptor understands
pub const SUPPORTED: bool = cfg!(any(target_arch = "x86_64", target_arch = "aarch64"));

const PAGE_SIZE: usize = 4096;

/// Syscall number, arguments and return value of a syscall stop
///
/// `ret` is only meaningful at syscall exit. On aarch64 the first argument
/// register is overwritten by the return value, so arguments must be taken
/// from the entry stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallRegs {
    pub nr: i64,
    pub args: [u64; 6],
    pub ret: i64,
}

#[cfg(target_arch = "x86_64")]
pub fn read_regs(pid: Pid) -> nix::Result<SyscallRegs> {
    let regs = nix::sys::ptrace::getregs(pid)?;
    Ok(SyscallRegs {
        nr: regs.orig_rax as i64,
        args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
        ret: regs.rax as i64,
    })
}

#[cfg(target_arch = "aarch64")]
pub fn read_regs(pid: Pid) -> nix::Result<SyscallRegs> {
    let regs = nix::sys::ptrace::getregs(pid)?;
    Ok(SyscallRegs {
        nr: regs.regs[8] as i64,
        args: [
            regs.regs[0],
            regs.regs[1],
            regs.regs[2],
            regs.regs[3],
            regs.regs[4],
            regs.regs[5],
        ],
        ret: regs.regs[0] as i64,
    })
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn read_regs(_pid: Pid) -> nix::Result<SyscallRegs> {
    Err(Errno::ENOSYS)
}

/// Read access to a tracee's address space
pub trait TraceeMemory {
    /// Read the NUL-terminated string at `addr`, without the terminator
    ///
    /// Strings longer than `PATH_MAX` are cut at `PATH_MAX` bytes, which the
    /// resolver then rejects as too long.
    fn read_c_string(&self, pid: Pid, addr: u64) -> nix::Result<Vec<u8>>;
}

/// [`TraceeMemory`] over `process_vm_readv`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory;

impl TraceeMemory for ProcessMemory {
    fn read_c_string(&self, pid: Pid, addr: u64) -> nix::Result<Vec<u8>> {
        if addr == 0 {
            return Err(Errno::EFAULT);
        }

        let mut out = Vec::new();
        let mut cursor = addr as usize;
        let mut chunk = [0u8; PAGE_SIZE];

        // One page at a time: a read crossing into an unmapped page fails
        // as a whole, while the string may end before it
        while out.len() < PATH_MAX {
            let to_page_end = PAGE_SIZE - (cursor % PAGE_SIZE);
            let len = to_page_end.min(PATH_MAX - out.len());
            let mut local = [IoSliceMut::new(&mut chunk[..len])];
            let remote = [RemoteIoVec { base: cursor, len }];

            let read = process_vm_readv(pid, &mut local, &remote)?;
            if read == 0 {
                return Err(Errno::EFAULT);
            }
            if let Some(nul) = chunk[..read].iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..read]);
            cursor += read;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_read_own_memory() {
        let text = CString::new("/usr/lib/libc.so.6").unwrap();
        let pid = nix::unistd::getpid();
        let bytes = ProcessMemory
            .read_c_string(pid, text.as_ptr() as u64)
            .unwrap();
        assert_eq!(bytes, b"/usr/lib/libc.so.6");
    }

    #[test]
    fn test_string_spanning_pages() {
        // Place the string so it straddles a page boundary
        let mut buf = vec![b'x'; PAGE_SIZE * 3];
        let base = buf.as_ptr() as usize;
        let start = (base / PAGE_SIZE + 1) * PAGE_SIZE - 10 - base;
        buf[start + 100] = 0;

        let pid = nix::unistd::getpid();
        let bytes = ProcessMemory
            .read_c_string(pid, (base + start) as u64)
            .unwrap();
        assert_eq!(bytes.len(), 100);
    }

    #[test]
    fn test_null_pointer_is_fault() {
        let pid = nix::unistd::getpid();
        assert_eq!(ProcessMemory.read_c_string(pid, 0), Err(Errno::EFAULT));
    }
}
