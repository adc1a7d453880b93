//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: async code in relay-core and relay-daemon MUST NOT block the
//! runtime. Network I/O goes through tokio and reqwest's async client
//! everywhere; filesystem calls are only allowed in synchronous functions
//! (config loading runs before anything is spawned).

use architectural_enforcement::{production_lines, SourceLine};

/// Patterns that are never allowed in production code
const FORBIDDEN_ANYWHERE: &[(&str, &str)] = &[
    ("reqwest::blocking", "use the async reqwest::Client"),
    ("std::net::TcpStream", "use tokio::net::TcpStream"),
    ("std::net::TcpListener", "use tokio::net::TcpListener"),
    ("std::net::UdpSocket", "use tokio::net::UdpSocket"),
    ("block_on(", "never re-enter the runtime"),
];

/// Patterns that are only allowed outside `async fn` bodies
const FORBIDDEN_IN_ASYNC: &[(&str, &str)] = &[
    ("std::fs::", "use tokio::fs or move the call before the runtime work"),
    ("std::io::stdin", "use tokio::io::stdin"),
    (".recv_timeout(", "use tokio channels"),
];

#[test]
fn test_no_blocking_io_in_production_code() {
    let lines = production_lines().expect("failed to scan production sources");
    assert!(!lines.is_empty(), "no production sources found");

    let violations = find_violations(&lines);

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }

        eprintln!("\n✅ ACCEPTABLE:");
        eprintln!("  - tokio::net / tokio::fs / async reqwest");
        eprintln!("  - std::fs in synchronous config loading");
        eprintln!("  - Test code (#[cfg(test)] modules)");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

#[test]
fn test_config_loader_is_the_only_sync_fs_user() {
    let lines = production_lines().expect("failed to scan production sources");

    let users: Vec<&SourceLine> = lines
        .iter()
        .filter(|line| line.code.contains("std::fs::"))
        .collect();

    for line in &users {
        assert!(
            line.path.ends_with("config/mod.rs"),
            "unexpected std::fs use: {}",
            line.describe()
        );
        assert!(!line.in_async_fn, "std::fs inside async fn: {}", line.describe());
    }
}

fn find_violations(lines: &[SourceLine]) -> Vec<String> {
    let mut violations = Vec::new();

    for line in lines {
        for (pattern, hint) in FORBIDDEN_ANYWHERE {
            if line.code.contains(pattern) {
                violations.push(format!("{} ({})", line.describe(), hint));
            }
        }
        if line.in_async_fn {
            for (pattern, hint) in FORBIDDEN_IN_ASYNC {
                if line.code.contains(pattern) {
                    violations.push(format!("{} in async fn ({})", line.describe(), hint));
                }
            }
        }
    }

    violations
}
