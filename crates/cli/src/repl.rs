//! Interactive REPL: `>>> ` normally, `... ` while a multi-line block (an
//! unterminated `fn`/`if`/`for`/`while`/`match`) is still open.
//!
//! Each submitted block is compiled and run against a fresh `Chunk`, since
//! a function's bytecode offsets are only meaningful in the chunk they were
//! compiled into. The heap and non-function globals carry forward across
//! blocks so `let x = 10` on one line is visible to `print(x)` on the next;
//! a function defined in one block cannot be called from a later one. This
//! is a deliberate simplification for the REPL, not a hard-core contract.

use std::path::{Path, PathBuf};

use lumen_core::{Heap, ObjString, Value};
use lumen_runtime::{Interpreter, JitConfig, JitEngine};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

const BLOCK_OPENERS: [&str; 5] = ["fn ", "if ", "for ", "while ", "match "];

/// +1 for a line that opens a block, -1 for a bare `end`, 0 otherwise.
/// Lines starting with a string literal are not scanned for keywords, which
/// is enough to keep a string like `"end of line"` from closing a block.
fn depth_delta(line: &str) -> i32 {
    let trimmed = line.trim_start();
    if trimmed.starts_with('"') {
        return 0;
    }
    if trimmed == "end" {
        return -1;
    }
    if BLOCK_OPENERS.iter().any(|kw| trimmed.starts_with(kw)) { 1 } else { 0 }
}

fn help_text() -> String {
    format!(
        "Lumen {}\n\
         .help            show this message\n\
         .version         print the interpreter version\n\
         .clear           reset the session (heap and globals)\n\
         .load <path>     read, preprocess, and run a file\n\
         .quit, .exit     leave the REPL (bare exit/quit also work)",
        env!("CARGO_PKG_VERSION")
    )
}

enum Command {
    Help,
    Version,
    Clear,
    Load(PathBuf),
    Quit,
}

fn parse_command(trimmed: &str) -> Option<Command> {
    match trimmed {
        ".help" => Some(Command::Help),
        ".version" => Some(Command::Version),
        ".clear" => Some(Command::Clear),
        ".quit" | ".exit" | "exit" | "quit" => Some(Command::Quit),
        _ => trimmed.strip_prefix(".load ").map(|rest| Command::Load(PathBuf::from(rest.trim()))),
    }
}

/// Compiles and runs `source` against carried-forward session state,
/// printing diagnostics on failure, and returns the (possibly unchanged)
/// state to carry into the next block.
fn execute(
    mut heap: Heap,
    globals: Vec<(*mut ObjString, Value)>,
    source: &str,
    jit: bool,
) -> (Heap, Vec<(*mut ObjString, Value)>) {
    let chunk = match lumen_compiler::compile(source, &mut heap) {
        Ok(chunk) => chunk,
        Err(errors) => {
            for e in errors {
                eprintln!("{e}");
            }
            return (heap, globals);
        }
    };
    let mut interp = Interpreter::resume(chunk, heap, JitEngine::new(JitConfig::from_env(jit)), globals);
    if let Err(e) = interp.run() {
        eprintln!("{e}");
    }
    let globals = interp.exportable_globals();
    (interp.heap, globals)
}

fn load_file(heap: Heap, globals: Vec<(*mut ObjString, Value)>, path: &Path, jit: bool) -> (Heap, Vec<(*mut ObjString, Value)>) {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("i/o error: {e}");
            return (heap, globals);
        }
    };
    let expanded = match lumen_compiler::preprocess(&source, path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e}");
            return (heap, globals);
        }
    };
    execute(heap, globals, &expanded, jit)
}

pub fn run(jit: bool) {
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("failed to start the line editor: {e}");
            return;
        }
    };

    println!("Lumen {} -- .help for commands", env!("CARGO_PKG_VERSION"));

    let mut heap = Heap::new();
    let mut globals: Vec<(*mut ObjString, Value)> = Vec::new();

    'session: loop {
        let mut buffer = String::new();
        let mut depth = 0i32;
        let mut prompt = ">>> ";

        loop {
            let line = match editor.readline(prompt) {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) => continue 'session,
                Err(ReadlineError::Eof) => break 'session,
                Err(e) => {
                    eprintln!("read error: {e}");
                    break 'session;
                }
            };
            let _ = editor.add_history_entry(line.as_str());

            if depth == 0 {
                if let Some(cmd) = parse_command(line.trim()) {
                    match cmd {
                        Command::Help => println!("{}", help_text()),
                        Command::Version => println!("lumen {}", env!("CARGO_PKG_VERSION")),
                        Command::Clear => {
                            heap = Heap::new();
                            globals.clear();
                            println!("session cleared");
                        }
                        Command::Load(path) => (heap, globals) = load_file(heap, globals, &path, jit),
                        Command::Quit => break 'session,
                    }
                    continue;
                }
            }

            depth += depth_delta(&line);
            buffer.push_str(&line);
            buffer.push('\n');
            if depth <= 0 {
                break;
            }
            prompt = "... ";
        }

        if buffer.trim().is_empty() {
            continue;
        }
        (heap, globals) = execute(heap, globals, &buffer, jit);
    }
}
