//! `@import "path"` preprocessor.
//!
//! Runs on the raw source string before the lexer ever sees it. The core
//! compiler has no notion of modules; by the time [`crate::compiler::Compiler`]
//! starts, everything is one flat source string.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct ImportError {
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "import error in {}: {}", self.path.display(), self.message)
    }
}

impl std::error::Error for ImportError {}

/// Expands every `@import "relative/path"` line in `source` with the
/// preprocessed contents of that file, resolved relative to `base_path`'s
/// directory. A file already on the current import chain is skipped rather
/// than re-expanded, which is what breaks cycles.
pub fn preprocess(source: &str, base_path: &Path) -> Result<String, ImportError> {
    let mut visiting = HashSet::new();
    if let Ok(canon) = base_path.canonicalize() {
        visiting.insert(canon);
    }
    expand(source, base_path, &mut visiting)
}

fn expand(source: &str, base_path: &Path, visiting: &mut HashSet<PathBuf>) -> Result<String, ImportError> {
    let dir = base_path.parent().unwrap_or_else(|| Path::new("."));
    let mut out = String::with_capacity(source.len());
    for line in source.split_inclusive('\n') {
        let trimmed = line.trim_end_matches('\n').trim();
        if let Some(rest) = trimmed.strip_prefix("@import") {
            let rest = rest.trim();
            let target = parse_quoted(rest).ok_or_else(|| ImportError {
                path: base_path.to_path_buf(),
                message: format!("malformed @import directive: {trimmed}"),
            })?;
            let import_path = dir.join(target);
            let canon = import_path.canonicalize().unwrap_or_else(|_| import_path.clone());
            if visiting.contains(&canon) {
                // Already on the current import chain: break the cycle silently.
                continue;
            }
            let contents = fs::read_to_string(&import_path).map_err(|e| ImportError {
                path: import_path.clone(),
                message: e.to_string(),
            })?;
            visiting.insert(canon.clone());
            let expanded = expand(&contents, &import_path, visiting)?;
            visiting.remove(&canon);
            out.push_str(&expanded);
            out.push('\n');
        } else {
            out.push_str(line);
        }
    }
    Ok(out)
}

fn parse_quoted(s: &str) -> Option<&str> {
    let s = s.trim();
    let s = s.strip_prefix('"')?;
    s.strip_suffix('"')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_a_single_import() {
        let dir = tempfile::tempdir().unwrap();
        let lib_path = dir.path().join("lib.lum");
        std::fs::write(&lib_path, "let shared = 1\n").unwrap();
        let main_path = dir.path().join("main.lum");
        let source = "@import \"lib.lum\"\nprint(shared)\n";
        let expanded = preprocess(source, &main_path).unwrap();
        assert!(expanded.contains("let shared = 1"));
        assert!(expanded.contains("print(shared)"));
    }

    #[test]
    fn breaks_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let a_path = dir.path().join("a.lum");
        let b_path = dir.path().join("b.lum");
        std::fs::write(&a_path, "@import \"b.lum\"\nlet a = 1\n").unwrap();
        std::fs::write(&b_path, "@import \"a.lum\"\nlet b = 2\n").unwrap();
        let source = std::fs::read_to_string(&a_path).unwrap();
        // Must terminate rather than recursing forever, and should still
        // pick up both definitions exactly once.
        let expanded = preprocess(&source, &a_path).unwrap();
        assert!(expanded.contains("let b = 2"));
        assert!(expanded.contains("let a = 1"));
    }
}
