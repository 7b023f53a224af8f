/// Xplice compiler: lowers a checked AST into linear bytecode for the VM.
pub mod emit;
pub mod graph_pass;
pub mod heap;
pub mod ir;

use ir::{Errcode, XpliceProgram};
use xplice_lang::diagnostics::CompileError;

#[derive(Debug)]
pub enum BuildError {
    Front(CompileError),
    Back(Errcode),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::Front(e) => write!(f, "{}", e),
            BuildError::Back(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for BuildError {}

/// Full ahead-of-time pipeline: source text to a runnable [`XpliceProgram`].
pub fn compile(source: &str) -> Result<XpliceProgram, BuildError> {
    let checked = xplice_lang::front_end(source).map_err(BuildError::Front)?;
    let store = graph_pass::lower(&checked.program, &checked.natives).map_err(BuildError::Back)?;
    emit::emit_program(&store).map_err(BuildError::Back)
}
