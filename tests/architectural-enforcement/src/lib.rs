//! Architectural Enforcement
//!
//! Source scanners used by this package's integration tests to enforce
//! architectural rules on the production crates:
//! - No sleep() calls in production code except retry backoff
//!
//! Scanning is line based. Code after a `#[cfg(test)]` attribute is treated
//! as test code.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["socketbus/core/src", "socketbus/daemon/src"];

/// Workspace root, derived from this package's location
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Which sleep uses are tolerated
#[derive(Debug, Clone, Copy)]
pub struct SleepPolicy {
    /// Sleep inside exponential backoff for retries
    pub allow_backoff: bool,
    /// Sleep inside `#[cfg(test)]` code
    pub allow_tests: bool,
}

/// A forbidden sleep found in a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the call
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Scan every `.rs` file under `dir` for forbidden sleep calls
#[must_use]
pub fn check_directory(dir: &Path, policy: &SleepPolicy) -> Vec<Violation> {
    let mut violations = Vec::new();
    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
    {
        if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
            if let Ok(content) = fs::read_to_string(entry.path()) {
                violations.extend(check_source(entry.path(), &content, policy));
            }
        }
    }
    violations
}

/// Scan one file's contents for forbidden sleep calls
#[must_use]
pub fn check_source(path: &Path, content: &str, policy: &SleepPolicy) -> Vec<Violation> {
    let lines: Vec<&str> = content.lines().collect();
    let test_start = lines
        .iter()
        .position(|line| line.trim_start().starts_with("#[cfg(test)]"))
        .unwrap_or(lines.len());

    let mut violations = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        // Skip comments
        let code_part = line.split("//").next().unwrap_or(line);
        if !(code_part.contains("::sleep(") || code_part.contains(".sleep(")) {
            continue;
        }

        if policy.allow_tests && idx >= test_start {
            continue;
        }
        if policy.allow_backoff && is_backoff_context(&lines, idx) {
            continue;
        }

        violations.push(Violation {
            path: path.to_path_buf(),
            line: idx + 1,
            text: line.trim().to_string(),
        });
    }
    violations
}

/// Check if sleep is used for exponential backoff (acceptable for retry logic)
#[must_use]
pub fn is_backoff_context(lines: &[&str], current_idx: usize) -> bool {
    let context_range = current_idx.saturating_sub(15)..std::cmp::min(current_idx + 5, lines.len());

    let mut has_backoff_calc = false;
    let mut has_retry_context = false;

    for line in &lines[context_range] {
        let line = line.to_lowercase();

        // 2^n pattern or bit shift
        if line.contains("<<") || line.contains("pow") || line.contains("* 2") {
            has_backoff_calc = true;
        }

        if line.contains("retry") || line.contains("backoff") || line.contains("attempt") {
            has_retry_context = true;
        }
    }

    has_backoff_calc && has_retry_context
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRICT: SleepPolicy = SleepPolicy {
        allow_backoff: false,
        allow_tests: false,
    };

    const PRODUCTION: SleepPolicy = SleepPolicy {
        allow_backoff: true,
        allow_tests: true,
    };

    #[test]
    fn test_plain_sleep_is_flagged() {
        let source = "fn poll() {\n    tokio::time::sleep(Duration::from_millis(10)).await;\n}\n";
        let violations = check_source(Path::new("poll.rs"), source, &PRODUCTION);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, 2);
    }

    #[test]
    fn test_backoff_detection() {
        let lines = [
            "fn accept() {",
            "    let delay = base_delay * (1 << attempt);",
            "    warn!(\"Accept failed, will retry\");",
            "    tokio::time::sleep(delay).await;",
            "}",
        ];
        assert!(is_backoff_context(&lines, 3));

        let source = lines.join("\n");
        assert!(check_source(Path::new("a.rs"), &source, &PRODUCTION).is_empty());
        assert_eq!(check_source(Path::new("a.rs"), &source, &STRICT).len(), 1);
    }

    #[test]
    fn test_sleep_in_test_module_is_allowed() {
        let source = "fn real() {}\n\n#[cfg(test)]\nmod tests {\n    async fn t() { tokio::time::sleep(d).await; }\n}\n";
        assert!(check_source(Path::new("t.rs"), source, &PRODUCTION).is_empty());
        assert_eq!(check_source(Path::new("t.rs"), source, &STRICT).len(), 1);
    }

    #[test]
    fn test_commented_sleep_is_ignored() {
        let source = "fn f() {\n    // std::thread::sleep(d);\n}\n";
        assert!(check_source(Path::new("c.rs"), source, &STRICT).is_empty());
    }
}
