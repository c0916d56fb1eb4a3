//! Syscall numbers, names and path-argument layouts
//!
//! Numbers are per architecture; everything after name lookup is
//! architecture-neutral. [`syscall_layout`] describes, for each syscall that
//! names a path, where the path and its directory descriptor live in the
//! argument registers, whether the final component is followed, and what the
//! call does to the process's cwd or descriptor table when it succeeds.

use crate::resolver::SyscallKind;

const O_NOFOLLOW: u64 = libc::O_NOFOLLOW as u64;
const O_CREAT_EXCL: u64 = (libc::O_CREAT | libc::O_EXCL) as u64;
const AT_SYMLINK_NOFOLLOW: u64 = libc::AT_SYMLINK_NOFOLLOW as u64;
const AT_SYMLINK_FOLLOW: u64 = libc::AT_SYMLINK_FOLLOW as u64;

/// Resolve a syscall number of the host architecture to its name
///
/// Returns "unknown" for numbers outside the table.
pub fn syscall_name(num: i64) -> &'static str {
    #[cfg(target_arch = "x86_64")]
    {
        x86_64_syscall_name(num)
    }
    #[cfg(target_arch = "aarch64")]
    {
        aarch64_syscall_name(num)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = num;
        "unknown"
    }
}

/// x86_64 syscall table
pub fn x86_64_syscall_name(num: i64) -> &'static str {
    match num {
        0 => "read",
        1 => "write",
        2 => "open",
        3 => "close",
        4 => "stat",
        5 => "fstat",
        6 => "lstat",
        8 => "lseek",
        9 => "mmap",
        12 => "brk",
        21 => "access",
        32 => "dup",
        33 => "dup2",
        39 => "getpid",
        56 => "clone",
        57 => "fork",
        58 => "vfork",
        59 => "execve",
        60 => "exit",
        61 => "wait4",
        72 => "fcntl",
        76 => "truncate",
        78 => "getdents",
        79 => "getcwd",
        80 => "chdir",
        81 => "fchdir",
        82 => "rename",
        83 => "mkdir",
        84 => "rmdir",
        85 => "creat",
        86 => "link",
        87 => "unlink",
        88 => "symlink",
        89 => "readlink",
        90 => "chmod",
        92 => "chown",
        94 => "lchown",
        132 => "utime",
        133 => "mknod",
        137 => "statfs",
        161 => "chroot",
        188 => "setxattr",
        189 => "lsetxattr",
        191 => "getxattr",
        192 => "lgetxattr",
        194 => "listxattr",
        195 => "llistxattr",
        197 => "removexattr",
        198 => "lremovexattr",
        217 => "getdents64",
        231 => "exit_group",
        235 => "utimes",
        254 => "inotify_add_watch",
        257 => "openat",
        258 => "mkdirat",
        259 => "mknodat",
        260 => "fchownat",
        261 => "futimesat",
        262 => "newfstatat",
        263 => "unlinkat",
        264 => "renameat",
        265 => "linkat",
        266 => "symlinkat",
        267 => "readlinkat",
        268 => "fchmodat",
        269 => "faccessat",
        280 => "utimensat",
        292 => "dup3",
        303 => "name_to_handle_at",
        316 => "renameat2",
        322 => "execveat",
        332 => "statx",
        435 => "clone3",
        436 => "close_range",
        437 => "openat2",
        439 => "faccessat2",
        452 => "fchmodat2",
        _ => "unknown",
    }
}

/// aarch64 syscall table (asm-generic numbering, no legacy path calls)
pub fn aarch64_syscall_name(num: i64) -> &'static str {
    match num {
        5 => "setxattr",
        6 => "lsetxattr",
        8 => "getxattr",
        9 => "lgetxattr",
        11 => "listxattr",
        12 => "llistxattr",
        14 => "removexattr",
        15 => "lremovexattr",
        17 => "getcwd",
        23 => "dup",
        24 => "dup3",
        25 => "fcntl",
        27 => "inotify_add_watch",
        33 => "mknodat",
        34 => "mkdirat",
        35 => "unlinkat",
        36 => "symlinkat",
        37 => "linkat",
        38 => "renameat",
        43 => "statfs",
        45 => "truncate",
        48 => "faccessat",
        49 => "chdir",
        50 => "fchdir",
        51 => "chroot",
        53 => "fchmodat",
        54 => "fchownat",
        56 => "openat",
        57 => "close",
        61 => "getdents64",
        63 => "read",
        64 => "write",
        78 => "readlinkat",
        79 => "newfstatat",
        80 => "fstat",
        88 => "utimensat",
        93 => "exit",
        94 => "exit_group",
        220 => "clone",
        221 => "execve",
        222 => "mmap",
        260 => "wait4",
        264 => "name_to_handle_at",
        276 => "renameat2",
        281 => "execveat",
        291 => "statx",
        435 => "clone3",
        436 => "close_range",
        437 => "openat2",
        439 => "faccessat2",
        452 => "fchmodat2",
        _ => "unknown",
    }
}

/// Whether the final component of a path argument is dereferenced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Follow {
    Always,
    Never,
    /// Followed unless `flag` is set in argument `arg`
    UnlessFlag { arg: usize, flag: u64 },
    /// Followed only if `flag` is set in argument `arg`
    IfFlag { arg: usize, flag: u64 },
    /// `open` flags in argument `arg`: not followed under `O_NOFOLLOW` or
    /// `O_CREAT|O_EXCL`
    OpenFlags { arg: usize },
}

impl Follow {
    pub fn applies(&self, args: &[u64; 6]) -> bool {
        match *self {
            Follow::Always => true,
            Follow::Never => false,
            Follow::UnlessFlag { arg, flag } => args[arg] & flag == 0,
            Follow::IfFlag { arg, flag } => args[arg] & flag != 0,
            Follow::OpenFlags { arg } => {
                let flags = args[arg];
                flags & O_NOFOLLOW == 0 && flags & O_CREAT_EXCL != O_CREAT_EXCL
            }
        }
    }
}

/// Where one path lives in a syscall's arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathArg {
    /// Argument holding the path pointer
    pub path: usize,
    /// Argument holding the directory descriptor for `*at` calls
    pub dirfd: Option<usize>,
    pub follow: Follow,
    /// Argument whose `AT_EMPTY_PATH` bit makes an empty path mean the dirfd
    pub empty_path_flag: Option<usize>,
}

impl PathArg {
    const fn plain(path: usize, follow: Follow) -> Self {
        Self {
            path,
            dirfd: None,
            follow,
            empty_path_flag: None,
        }
    }

    const fn at(dirfd: usize, path: usize, follow: Follow) -> Self {
        Self {
            path,
            dirfd: Some(dirfd),
            follow,
            empty_path_flag: None,
        }
    }

    const fn empty_path(mut self, flag_arg: usize) -> Self {
        self.empty_path_flag = Some(flag_arg);
        self
    }
}

/// Bookkeeping a successful call performs on per-process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Returns a new descriptor for the (single) path; `O_CLOEXEC` read
    /// from `flags` when given
    OpenFd { flags: Option<usize> },
    Close,
    CloseRange,
    /// Duplicates argument 0 into the returned descriptor
    Dup { flags: Option<usize> },
    Fcntl,
    Chdir,
    Fchdir,
    Chroot,
    Exec,
}

/// Decoding recipe for one syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallLayout {
    pub kind: SyscallKind,
    pub paths: &'static [PathArg],
    pub effect: Effect,
}

const fn unless_nofollow(arg: usize) -> Follow {
    Follow::UnlessFlag {
        arg,
        flag: AT_SYMLINK_NOFOLLOW,
    }
}

const NO_PATHS: &[PathArg] = &[];
const FOLLOW_0: &[PathArg] = &[PathArg::plain(0, Follow::Always)];
const NOFOLLOW_0: &[PathArg] = &[PathArg::plain(0, Follow::Never)];
const FOLLOW_1: &[PathArg] = &[PathArg::plain(1, Follow::Always)];
const NOFOLLOW_1: &[PathArg] = &[PathArg::plain(1, Follow::Never)];
const AT_FOLLOW: &[PathArg] = &[PathArg::at(0, 1, Follow::Always)];
const AT_NOFOLLOW: &[PathArg] = &[PathArg::at(0, 1, Follow::Never)];
const OPEN: &[PathArg] = &[PathArg::plain(0, Follow::OpenFlags { arg: 1 })];
const OPENAT: &[PathArg] = &[PathArg::at(0, 1, Follow::OpenFlags { arg: 2 })];
const AT_FLAGS_2: &[PathArg] = &[PathArg::at(0, 1, unless_nofollow(2)).empty_path(2)];
const AT_FLAGS_3: &[PathArg] = &[PathArg::at(0, 1, unless_nofollow(3)).empty_path(3)];
const AT_FLAGS_4: &[PathArg] = &[PathArg::at(0, 1, unless_nofollow(4)).empty_path(4)];
const NAME_TO_HANDLE_AT: &[PathArg] = &[PathArg::at(
    0,
    1,
    Follow::IfFlag {
        arg: 4,
        flag: AT_SYMLINK_FOLLOW,
    },
)
.empty_path(4)];
const SYMLINKAT: &[PathArg] = &[PathArg::at(1, 2, Follow::Never)];
const TWO_NOFOLLOW: &[PathArg] = &[
    PathArg::plain(0, Follow::Never),
    PathArg::plain(1, Follow::Never),
];
const LINKAT: &[PathArg] = &[
    PathArg::at(
        0,
        1,
        Follow::IfFlag {
            arg: 4,
            flag: AT_SYMLINK_FOLLOW,
        },
    )
    .empty_path(4),
    PathArg::at(2, 3, Follow::Never),
];
const RENAMEAT: &[PathArg] = &[
    PathArg::at(0, 1, Follow::Never),
    PathArg::at(2, 3, Follow::Never),
];

/// Decoding recipe for `name`, or `None` for syscalls that neither name a
/// path nor change cwd/descriptor state
pub fn syscall_layout(name: &str) -> Option<SyscallLayout> {
    use SyscallKind::{Chdir, Create, Exec, Link, Open, Other, Readlink, Remove, Rename, Stat};

    let layout = |kind, paths, effect| Some(SyscallLayout { kind, paths, effect });

    match name {
        "open" => layout(Open, OPEN, Effect::OpenFd { flags: Some(1) }),
        "creat" => layout(Open, FOLLOW_0, Effect::OpenFd { flags: None }),
        "openat" => layout(Open, OPENAT, Effect::OpenFd { flags: Some(2) }),
        "openat2" => layout(Open, AT_FOLLOW, Effect::OpenFd { flags: None }),

        "execve" => layout(Exec, FOLLOW_0, Effect::Exec),
        "execveat" => layout(Exec, AT_FLAGS_4, Effect::Exec),

        "stat" | "access" | "statfs" | "getxattr" | "listxattr" => {
            layout(Stat, FOLLOW_0, Effect::None)
        }
        "lstat" | "lgetxattr" | "llistxattr" => layout(Stat, NOFOLLOW_0, Effect::None),
        "newfstatat" | "faccessat2" => layout(Stat, AT_FLAGS_3, Effect::None),
        "statx" => layout(Stat, AT_FLAGS_2, Effect::None),
        "faccessat" => layout(Stat, AT_FOLLOW, Effect::None),
        "name_to_handle_at" => layout(Stat, NAME_TO_HANDLE_AT, Effect::None),
        "inotify_add_watch" => layout(Stat, FOLLOW_1, Effect::None),

        "chmod" | "chown" | "truncate" | "utime" | "utimes" | "setxattr" | "removexattr" => {
            layout(Other, FOLLOW_0, Effect::None)
        }
        "lchown" | "lsetxattr" | "lremovexattr" => layout(Other, NOFOLLOW_0, Effect::None),
        "fchmodat" | "futimesat" => layout(Other, AT_FOLLOW, Effect::None),
        "utimensat" | "fchmodat2" => layout(Other, AT_FLAGS_3, Effect::None),
        "fchownat" => layout(Other, AT_FLAGS_4, Effect::None),

        "readlink" => layout(Readlink, NOFOLLOW_0, Effect::None),
        "readlinkat" => layout(Readlink, AT_NOFOLLOW, Effect::None),

        "chdir" => layout(Chdir, FOLLOW_0, Effect::Chdir),
        "fchdir" => layout(Chdir, NO_PATHS, Effect::Fchdir),
        "chroot" => layout(Chdir, FOLLOW_0, Effect::Chroot),

        "mkdir" | "mknod" => layout(Create, NOFOLLOW_0, Effect::None),
        "mkdirat" | "mknodat" => layout(Create, AT_NOFOLLOW, Effect::None),
        // The link target (argument 0) is a literal string, never a lookup
        "symlink" => layout(Create, NOFOLLOW_1, Effect::None),
        "symlinkat" => layout(Create, SYMLINKAT, Effect::None),

        "link" => layout(Link, TWO_NOFOLLOW, Effect::None),
        "linkat" => layout(Link, LINKAT, Effect::None),

        "unlink" | "rmdir" => layout(Remove, NOFOLLOW_0, Effect::None),
        "unlinkat" => layout(Remove, AT_NOFOLLOW, Effect::None),

        "rename" => layout(Rename, TWO_NOFOLLOW, Effect::None),
        "renameat" | "renameat2" => layout(Rename, RENAMEAT, Effect::None),

        "close" => layout(Other, NO_PATHS, Effect::Close),
        "close_range" => layout(Other, NO_PATHS, Effect::CloseRange),
        "dup" | "dup2" => layout(Other, NO_PATHS, Effect::Dup { flags: None }),
        "dup3" => layout(Other, NO_PATHS, Effect::Dup { flags: Some(2) }),
        "fcntl" => layout(Other, NO_PATHS, Effect::Fcntl),

        _ => None,
    }
}
