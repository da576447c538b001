//! Command-line flag surface, built with `clap`'s derive API as a single
//! unified binary rather than one binary per concern.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "lumen", version, about = "The Lumen scripting language", disable_version_flag = true)]
pub struct Args {
    /// Print version information and exit.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Evaluate CODE directly instead of reading a file or starting the REPL.
    #[arg(short = 'e', long = "eval", value_name = "CODE")]
    pub eval: Option<String>,

    /// Enable the tracing JIT for hot counting loops.
    #[arg(short = 'j', long = "jit")]
    pub jit: bool,

    /// Emit debug-level logs on stderr (equivalent to RUST_LOG=debug).
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Source file to run. Omitted (with no -e) starts the REPL.
    pub file: Option<PathBuf>,
}
