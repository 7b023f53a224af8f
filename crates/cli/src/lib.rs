/// Testable core of the `xplice` binary: compiles then runs one program
/// against a caller-supplied stdout sink, returning the process exit code.
use std::fmt;
use std::io::Write;

use xplice_compiler::ir::Errcode;
use xplice_compiler::BuildError;
use xplice_vm::Vm;

pub const VERSION_BANNER: &str = concat!(
    "Xplice (runtime) v",
    env!("CARGO_PKG_VERSION_MAJOR"),
    ".",
    env!("CARGO_PKG_VERSION_MINOR"),
    ".",
    env!("CARGO_PKG_VERSION_PATCH"),
);

/// User-facing rendering of an [`Errcode`] reaching the CLI boundary. The
/// semantic pass rejects mismatched-type arithmetic before it ever compiles,
/// so in practice `Arithmetic` only ever means one thing at runtime.
struct RuntimeError(Errcode);

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self.0 {
            Errcode::Normal => "normal",
            Errcode::Arithmetic => "Cannot divide by zero",
            Errcode::Access => "invalid memory access",
            Errcode::TempStack => "operand stack underflow",
            Errcode::CallStack => "call stack corrupted",
            Errcode::HeapError => "heap allocation error",
            Errcode::MemoryExceeded => "memory limit exceeded",
            Errcode::General => "general runtime error",
        };
        write!(f, "{}", msg)
    }
}

/// Compiles and runs `source`, writing program output to `stdout` and
/// returning `(exit_code, diagnostic)`. `diagnostic` is `None` on a normal
/// exit and `Some(message-already-prefixed-for-stderr)` otherwise.
pub fn compile_and_run(source: &str, stdout: Box<dyn Write>) -> (i32, Option<String>) {
    let program = match xplice_compiler::compile(source) {
        Ok(p) => p,
        Err(BuildError::Front(e)) => return (1, Some(format!("Compile Error:\n{}", e))),
        Err(BuildError::Back(e)) => return (1, Some(format!("Compile Error:\n{}", e))),
    };

    let mut vm = Vm::new(program, xplice_vm::builtins::registry(), stdout);
    let status = vm.run();
    if status == Errcode::Normal {
        (0, None)
    } else {
        (1, Some(format!("RuntimeError:\n{}", RuntimeError(status))))
    }
}
