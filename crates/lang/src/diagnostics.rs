use thiserror::Error;

/// Accumulated front-end errors, each prefixed with the offending source line.
#[derive(Debug, Error)]
#[error("{}", .messages.join("\n"))]
pub struct CompileError {
    pub messages: Vec<String>,
}

impl CompileError {
    pub fn new(messages: Vec<String>) -> Self {
        CompileError { messages }
    }
}
