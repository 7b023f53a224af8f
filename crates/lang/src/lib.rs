pub mod ast;
pub mod diagnostics;
pub mod lexer;
pub mod parser;
pub mod semantic;

use diagnostics::CompileError;
use lexer::Lexer;
use parser::Parser;
use semantic::CheckedProgram;

/// Lexes, parses, and type-checks source text. Front-end errors accumulate
/// across parsing and checking and are reported together.
pub fn front_end(source: &str) -> Result<CheckedProgram, CompileError> {
    log::debug!("parsing {} bytes of source", source.len());
    let mut parser = Parser::new(Lexer::new(source));
    let program = parser.parse_program();
    if !parser.errors.is_empty() {
        log::debug!("parser accumulated {} error(s)", parser.errors.len());
        return Err(CompileError::new(parser.errors));
    }
    log::debug!("parsed {} top-level item(s)", program.items.len());
    semantic::check(program)
}
