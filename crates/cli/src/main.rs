//! `lumen`: run a script, evaluate an inline snippet, or start the REPL.

mod args;
mod error;
mod repl;

use std::path::Path;

use clap::Parser;
use lumen_core::Heap;
use lumen_runtime::{Interpreter, JitConfig, JitEngine};
use tracing_subscriber::EnvFilter;

use args::Args;
use error::LumenError;

fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "warn" }));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Preprocesses, compiles, and runs one complete source unit against a fresh
/// heap and VM. `base_path` anchors `@import` resolution; for `-e` snippets
/// there is no real file, so the current directory stands in.
fn run_program(source: &str, base_path: &Path, jit: bool) -> Result<(), LumenError> {
    let expanded = lumen_compiler::preprocess(source, base_path)?;
    let mut heap = Heap::new();
    let chunk = lumen_compiler::compile(&expanded, &mut heap)?;
    let mut interp = Interpreter::new(chunk, heap, JitEngine::new(JitConfig::from_env(jit)));
    interp.run()?;
    Ok(())
}

fn run() -> Result<(), LumenError> {
    let args = Args::parse();
    init_logging(args.debug);

    if let Some(code) = &args.eval {
        return run_program(code, &std::env::current_dir().unwrap_or_default(), args.jit);
    }

    if let Some(path) = &args.file {
        let source = std::fs::read_to_string(path)?;
        return run_program(&source, path, args.jit);
    }

    repl::run(args.jit);
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{e}");
        std::process::exit(e.exit_code());
    }
}
