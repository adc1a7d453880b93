//! Architectural Enforcement Integration Tests
//!
//! Source scanners shared by the policy tests under `tests/`:
//! - No sleep calls in production code (waiting happens on channels, timers
//!   and notifications)
//! - No blocking I/O inside async functions
//!
//! Only production code is scanned. Everything after a `#[cfg(test)]`
//! marker and all comment lines are skipped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Production source trees, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["relay/core/src", "relay/daemon/src"];

/// One line of production code
#[derive(Debug, Clone)]
pub struct SourceLine {
    /// File the line came from
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// Code with trailing comments removed
    pub code: String,
    /// Whether the line sits inside an `async fn` body
    pub in_async_fn: bool,
}

impl SourceLine {
    /// `path:line: code` for violation reports
    pub fn describe(&self) -> String {
        format!(
            "{}:{}: {}",
            self.path.display(),
            self.number,
            self.code.trim()
        )
    }
}

/// Workspace root, derived from this package's manifest directory
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Every production line under [`PRODUCTION_DIRS`]
///
/// A missing directory is an error so that a moved crate cannot make the
/// policies pass vacuously.
pub fn production_lines() -> io::Result<Vec<SourceLine>> {
    let root = workspace_root();
    let mut lines = Vec::new();

    for dir in PRODUCTION_DIRS {
        let dir = root.join(dir);
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("production source dir missing: {}", dir.display()),
            ));
        }

        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let content = fs::read_to_string(path)?;
            lines.extend(scan_source(path, &content));
        }
    }

    Ok(lines)
}

/// Split one file into production lines
pub fn scan_source(path: &Path, content: &str) -> Vec<SourceLine> {
    let mut out = Vec::new();
    let mut depth: usize = 0;
    // Outermost fn: (is async, depth of its body)
    let mut current_fn: Option<(bool, usize)> = None;
    let mut pending_fn: Option<bool> = None;

    for (idx, raw) in content.lines().enumerate() {
        let trimmed = raw.trim_start();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }
        let code = strip_trailing_comment(raw);

        if current_fn.is_none() && pending_fn.is_none() && declares_fn(code) {
            pending_fn = Some(code.contains("async fn"));
        }

        for ch in code.chars() {
            match ch {
                '{' => {
                    depth += 1;
                    if let Some(is_async) = pending_fn.take() {
                        current_fn = Some((is_async, depth));
                    }
                }
                '}' => {
                    if let Some((_, body)) = current_fn {
                        if depth == body {
                            current_fn = None;
                        }
                    }
                    depth = depth.saturating_sub(1);
                }
                // Declaration without a body
                ';' if pending_fn.is_some() && current_fn.is_none() => pending_fn = None,
                _ => {}
            }
        }

        if code.trim().is_empty() {
            continue;
        }
        out.push(SourceLine {
            path: path.to_path_buf(),
            number: idx + 1,
            code: code.to_string(),
            in_async_fn: matches!(current_fn, Some((true, _))),
        });
    }

    out
}

fn declares_fn(code: &str) -> bool {
    let code = code.trim_start();
    code.starts_with("fn ") || code.contains(" fn ")
}

fn strip_trailing_comment(line: &str) -> &str {
    match line.find(" // ") {
        Some(pos) => &line[..pos],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(src: &str) -> Vec<SourceLine> {
        scan_source(Path::new("x.rs"), src)
    }

    #[test]
    fn test_async_fn_tracking() {
        let lines = scan(
            "fn sync_one() {\n    read();\n}\n\nasync fn run() {\n    if x {\n        wait().await;\n    }\n}\n",
        );
        let read = lines.iter().find(|l| l.code.contains("read()")).unwrap();
        assert!(!read.in_async_fn);
        let wait = lines.iter().find(|l| l.code.contains("wait()")).unwrap();
        assert!(wait.in_async_fn);
    }

    #[test]
    fn test_trait_declarations_do_not_open_a_body() {
        let lines = scan(
            "trait T {\n    async fn a(&self);\n}\nfn b() {\n    call();\n}\n",
        );
        let call = lines.iter().find(|l| l.code.contains("call()")).unwrap();
        assert!(!call.in_async_fn);
    }

    #[test]
    fn test_test_module_and_comments_skipped() {
        let lines = scan("// std::thread::sleep\nfn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() {}\n}\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].number, 2);
    }

    #[test]
    fn test_trailing_comment_removed() {
        let lines = scan("let url = \"http://x\"; // note\n");
        assert_eq!(lines[0].code, "let url = \"http://x\";");
    }
}
