#![no_main]

use cde::paths::{is_within_dir, normalize};
use cde::resolver::PathResolver;
use libfuzzer_sys::fuzz_target;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

fuzz_target!(|data: &[u8]| {
    // Raw tracee bytes: any sequence may arrive as a path argument
    let raw = Path::new(OsStr::from_bytes(data));

    let resolver = PathResolver::new(8);
    if let Ok(resolved) = resolver.resolve(raw, Path::new("/tmp"), Path::new("/tmp")) {
        assert!(resolved.path.is_absolute());
        assert!(resolved.path == Path::new("/tmp") || is_within_dir(&resolved.path, Path::new("/tmp")));
    }

    let absolute = Path::new("/").join(raw);
    let normalized = normalize(&absolute);
    assert_eq!(normalize(&normalized), normalized);
});
