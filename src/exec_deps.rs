//! Exec-time dependency discovery
//!
//! When `execve` succeeds the kernel itself opens the program interpreter
//! named by the ELF `PT_INTERP` segment, or the interpreter on a `#!` line,
//! without any syscall the tracee makes. Those paths are found here and fed
//! to the collector like any other path. Shared libraries need no special
//! handling: the dynamic loader opens them with ordinary syscalls.

use object::elf::{FileHeader32, FileHeader64};
use object::read::elf::{FileHeader, ProgramHeader};
use object::{Endianness, FileKind};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::resolver::{PathResolver, ResolvedPath};

/// Kernel limit on nested interpreters (`binfmt_script` recursion)
pub const MAX_INTERPRETER_DEPTH: usize = 4;

/// Bytes of a script the kernel inspects for `#!` (`BINPRM_BUF_SIZE`)
const SHEBANG_BUF_SIZE: usize = 256;

const ELF_MAGIC: &[u8] = b"\x7fELF";

/// Interpreter the kernel loads for the file at `path`, if any
///
/// Scripts are read only up to the header the kernel inspects; ELF images
/// are mapped for `object` to walk the program headers.
pub fn interpreter_of(path: &Path) -> Option<PathBuf> {
    let mut file = File::open(path).ok()?;
    let header = read_header(&mut file).ok()?;

    if header.starts_with(b"#!") {
        shebang_interpreter(&header)
    } else if header.starts_with(ELF_MAGIC) {
        // SAFETY: read-only mapping, only parsed while `file` stays open
        let mmap = unsafe { memmap2::Mmap::map(&file) }.ok()?;
        elf_interpreter(&mmap)
    } else {
        None
    }
}

/// First `SHEBANG_BUF_SIZE` bytes of `file`, or fewer for short files
fn read_header(file: &mut File) -> io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(SHEBANG_BUF_SIZE);
    file.by_ref()
        .take(SHEBANG_BUF_SIZE as u64)
        .read_to_end(&mut header)?;
    Ok(header)
}

/// Parse the interpreter path from a `#!` line
pub fn shebang_interpreter(data: &[u8]) -> Option<PathBuf> {
    let rest = data.strip_prefix(b"#!")?;
    let line = &rest[..rest.len().min(SHEBANG_BUF_SIZE - 2)];
    let line = match line.iter().position(|&b| b == b'\n') {
        Some(end) => &line[..end],
        None => line,
    };
    let interpreter = line
        .split(|&b| b == b' ' || b == b'\t' || b == b'\r')
        .find(|word| !word.is_empty())?;
    Some(PathBuf::from(OsStr::from_bytes(interpreter)))
}

/// Read the `PT_INTERP` path of a 32- or 64-bit ELF image
pub fn elf_interpreter(data: &[u8]) -> Option<PathBuf> {
    match FileKind::parse(data).ok()? {
        FileKind::Elf32 => program_interpreter::<FileHeader32<Endianness>>(data),
        FileKind::Elf64 => program_interpreter::<FileHeader64<Endianness>>(data),
        _ => None,
    }
}

fn program_interpreter<Elf: FileHeader<Endian = Endianness>>(data: &[u8]) -> Option<PathBuf> {
    let header = Elf::parse(data).ok()?;
    let endian = header.endian().ok()?;
    header
        .program_headers(endian, data)
        .ok()?
        .iter()
        .find_map(|segment| segment.interpreter(endian, data).ok().flatten())
        .map(|bytes| PathBuf::from(OsStr::from_bytes(bytes)))
}

/// Follow the interpreter chain of an executed file
///
/// `executable` is the resolved path of the program; interpreters named
/// relatively are resolved against `cwd`, as the kernel does. Each returned
/// path has its final symlinks followed, and its traversed links listed.
pub fn interpreter_chain(
    resolver: &PathResolver,
    executable: &Path,
    cwd: &Path,
    root: &Path,
) -> Vec<ResolvedPath> {
    let mut chain = Vec::new();
    let mut current = executable.to_path_buf();

    for _ in 0..MAX_INTERPRETER_DEPTH {
        let Some(interpreter) = interpreter_of(&current) else {
            break;
        };
        let resolved = match resolver
            .resolve(&interpreter, cwd, root)
            .and_then(|r| resolver.dereference(&r, root))
        {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(interpreter = %interpreter.display(), "{}", e);
                break;
            }
        };
        current = resolved.path.clone();
        chain.push(resolved);
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_shebang_plain() {
        assert_eq!(
            shebang_interpreter(b"#!/usr/bin/python3\nprint(1)\n"),
            Some(PathBuf::from("/usr/bin/python3"))
        );
    }

    #[test]
    fn test_shebang_with_space_and_argument() {
        assert_eq!(
            shebang_interpreter(b"#! /usr/bin/env  python -u\r\n"),
            Some(PathBuf::from("/usr/bin/env"))
        );
    }

    #[test]
    fn test_shebang_empty_line() {
        assert_eq!(shebang_interpreter(b"#!\n/bin/sh"), None);
        assert_eq!(shebang_interpreter(b"echo hi"), None);
    }

    #[test]
    fn test_elf_interpreter_rejects_garbage() {
        assert_eq!(elf_interpreter(b"not an elf file at all"), None);
        assert_eq!(elf_interpreter(b"\x7fELF"), None);
    }

    #[test]
    fn test_elf_interpreter_of_dynamic_binary() {
        let exe = std::env::current_exe().unwrap();
        // Statically linked test binaries (musl) carry no PT_INTERP
        if let Some(interp) = interpreter_of(&exe) {
            assert!(interp.is_absolute(), "{:?}", interp);
        }
    }

    #[test]
    fn test_script_header_is_read_not_mapped_whole() {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("big.sh");
        let mut body = b"#!/bin/sh -e\n".to_vec();
        body.resize(1 << 20, b'#');
        fs::write(&script, &body).unwrap();

        let mut file = File::open(&script).unwrap();
        assert_eq!(read_header(&mut file).unwrap().len(), SHEBANG_BUF_SIZE);
        assert_eq!(interpreter_of(&script), Some(PathBuf::from("/bin/sh")));
    }

    #[test]
    fn test_plain_and_empty_files_have_no_interpreter() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("empty"), "").unwrap();
        fs::write(tmp.path().join("data"), "just text").unwrap();
        assert_eq!(interpreter_of(&tmp.path().join("empty")), None);
        assert_eq!(interpreter_of(&tmp.path().join("data")), None);
        assert_eq!(interpreter_of(&tmp.path().join("absent")), None);
    }

    #[test]
    fn test_interpreter_chain_through_scripts() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        fs::write(base.join("inner"), "#!/bin/sh\n").unwrap();
        symlink("inner", base.join("inner-link")).unwrap();
        fs::write(base.join("outer"), "#!inner-link\n").unwrap();

        let chain = interpreter_chain(
            &PathResolver::default(),
            &base.join("outer"),
            &base,
            Path::new("/"),
        );
        assert!(chain.len() >= 2);
        assert_eq!(chain[0].path, base.join("inner"));
        assert_eq!(chain[0].traversed, vec![base.join("inner-link")]);
        assert!(chain[1].path.is_absolute());
    }

    #[test]
    fn test_interpreter_chain_is_bounded() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().canonicalize().unwrap();
        fs::write(base.join("selfish"), format!("#!{}\n", base.join("selfish").display())).unwrap();

        let chain = interpreter_chain(
            &PathResolver::default(),
            &base.join("selfish"),
            &base,
            Path::new("/"),
        );
        assert_eq!(chain.len(), MAX_INTERPRETER_DEPTH);
    }
}
