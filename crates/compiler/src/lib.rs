//! Lexer, `@import` preprocessor, and single-pass Pratt-parser/bytecode
//! emitter for Lumen source.
//!
//! The pipeline a caller drives is: [`import::preprocess`] (optional, only
//! needed when the source may contain `@import` directives) → [`compiler::compile`],
//! which hands back a `lumen_core::Chunk` ready for the runtime crate to run.

pub mod compiler;
pub mod error;
pub mod import;
pub mod lexer;
pub mod token;

pub use compiler::compile;
pub use error::CompileError;
pub use import::{ImportError, preprocess};
pub use lexer::{Lexer, nul_terminate};
pub use token::{Token, TokenKind};
