//! Top-level error wrapper: every failure path in `main` funnels through
//! this type so the exit code table lives in exactly one place.

use std::fmt;

use lumen_compiler::{CompileError, ImportError};
use lumen_runtime::Traced;

pub enum LumenError {
    Usage(String),
    Import(ImportError),
    Compile(Vec<CompileError>),
    Runtime(Traced),
    Io(std::io::Error),
}

impl LumenError {
    pub fn exit_code(&self) -> i32 {
        match self {
            LumenError::Usage(_) => 64,
            LumenError::Import(_) | LumenError::Compile(_) => 65,
            LumenError::Runtime(_) => 70,
            LumenError::Io(_) => 74,
        }
    }
}

impl fmt::Display for LumenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LumenError::Usage(msg) => write!(f, "usage error: {msg}"),
            LumenError::Import(e) => write!(f, "{e}"),
            LumenError::Compile(errors) => {
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{e}")?;
                }
                Ok(())
            }
            LumenError::Runtime(e) => write!(f, "{e}"),
            LumenError::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl From<ImportError> for LumenError {
    fn from(e: ImportError) -> Self {
        LumenError::Import(e)
    }
}

impl From<Vec<CompileError>> for LumenError {
    fn from(e: Vec<CompileError>) -> Self {
        LumenError::Compile(e)
    }
}

impl From<Traced> for LumenError {
    fn from(e: Traced) -> Self {
        LumenError::Runtime(e)
    }
}

impl From<std::io::Error> for LumenError {
    fn from(e: std::io::Error) -> Self {
        LumenError::Io(e)
    }
}
