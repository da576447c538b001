//! The Lumen bytecode interpreter: dispatch loop, built-ins, and tracing JIT.

pub mod builtins;
pub mod error;
pub mod frame;
pub mod interpreter;
pub mod jit;

pub use error::{RuntimeError, Traced};
pub use interpreter::Interpreter;
pub use jit::config::JitConfig;
pub use jit::JitEngine;
