//! Runtime diagnostics.

use std::fmt;

#[derive(Debug, Clone)]
pub enum RuntimeError {
    TypeMismatch { op: &'static str, detail: String },
    UndefinedGlobal(String),
    WrongArity { expected: u8, got: u8 },
    StackOverflow,
    DivisionByZero,
    IndexOutOfBounds { index: i64, len: usize },
    NotIndexable(&'static str),
    NotCallable,
    Io(String),
    Encoding(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::TypeMismatch { op, detail } => write!(f, "type error in '{op}': {detail}"),
            RuntimeError::UndefinedGlobal(name) => write!(f, "undefined global '{name}'"),
            RuntimeError::WrongArity { expected, got } => {
                write!(f, "wrong number of arguments: expected {expected}, got {got}")
            }
            RuntimeError::StackOverflow => write!(f, "stack overflow"),
            RuntimeError::DivisionByZero => write!(f, "division by zero"),
            RuntimeError::IndexOutOfBounds { index, len } => {
                write!(f, "index {index} out of bounds for length {len}")
            }
            RuntimeError::NotIndexable(ty) => write!(f, "value of type '{ty}' is not indexable"),
            RuntimeError::NotCallable => write!(f, "value is not callable"),
            RuntimeError::Io(msg) => write!(f, "i/o error: {msg}"),
            RuntimeError::Encoding(msg) => write!(f, "encoding error: {msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// A runtime error paired with the bytecode line it happened at, which is
/// what the CLI actually prints (`"[line N] runtime error: ..."`).
#[derive(Debug, Clone)]
pub struct Traced {
    pub line: u32,
    pub error: RuntimeError,
}

impl fmt::Display for Traced {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] runtime error: {}", self.line, self.error)
    }
}

impl std::error::Error for Traced {}
