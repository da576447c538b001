//! Compile-time diagnostics.

use std::fmt;

#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] compile error: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}
