#![no_main]

use cde::exec_deps::{elf_interpreter, shebang_interpreter};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Executables come from the traced program; parsing must never panic
    let _ = shebang_interpreter(data);
    let _ = elf_interpreter(data);
});
