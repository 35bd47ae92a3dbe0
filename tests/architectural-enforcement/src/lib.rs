//! Architectural Enforcement Integration Tests
//!
//! Source scans that keep the gateway crates honest:
//! - No blocking `std::thread::sleep` in async code
//! - The core crate stays free of HTTP framework types
//! - No `unwrap()` / `expect()` outside test modules
//!
//! These tests are designed to catch violations early in the development cycle.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A rule violation at a source location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the violation
    pub file: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.file.display(), self.line, self.text)
    }
}

/// Root of the workspace
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// `src/` directory of a gateway crate (`core` or `daemon`)
pub fn crate_src(name: &str) -> PathBuf {
    workspace_root().join("gateway").join(name).join("src")
}

/// All `.rs` files under `dir`
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|entry| entry.into_path())
        .collect()
}

/// Lines of `source` that precede the first `#[cfg(test)]`
///
/// Test modules sit at the bottom of each file in this workspace.
pub fn production_lines(source: &str) -> impl Iterator<Item = (usize, &str)> {
    source
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .map(|(index, line)| (index + 1, line))
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//")
}

/// Scan production code under `dir` for lines matching `predicate`
pub fn scan<P>(dir: &Path, predicate: P) -> Vec<Violation>
where
    P: Fn(&str) -> bool,
{
    let mut violations = Vec::new();
    for file in rust_files(dir) {
        let Ok(source) = fs::read_to_string(&file) else {
            continue;
        };
        for (line, text) in production_lines(&source) {
            if !is_comment(text) && predicate(text) {
                violations.push(Violation {
                    file: file.clone(),
                    line,
                    text: text.trim().to_string(),
                });
            }
        }
    }
    violations
}

/// Render violations for an assertion message
pub fn report(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let source = "fn a() {}\n#[cfg(test)]\nmod tests { fn b() { x.unwrap(); } }\n";
        let lines: Vec<_> = production_lines(source).collect();
        assert_eq!(lines, vec![(1, "fn a() {}")]);
    }

    #[test]
    fn test_comments_are_ignored() {
        assert!(is_comment("    // calls .unwrap() here"));
        assert!(is_comment("/// docs"));
        assert!(!is_comment("let x = y.unwrap();"));
    }

    #[test]
    fn test_gateway_sources_are_found() {
        assert!(!rust_files(&crate_src("core")).is_empty());
        assert!(!rust_files(&crate_src("daemon")).is_empty());
    }
}
