//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in relay-core and relay-daemon MUST NOT call
//! sleep methods. Pacing uses `tokio::time::interval`, deadlines use
//! `tokio::time::timeout`, and hand-offs use channels or `Notify`.
//! **Exceptions**: test code only.

use architectural_enforcement::{production_lines, SourceLine};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let lines = production_lines().expect("failed to scan production sources");
    assert!(!lines.is_empty(), "no production sources found");

    let violations: Vec<String> = lines
        .iter()
        .filter(|line| is_sleep_call(line))
        .map(SourceLine::describe)
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }

        eprintln!("\n✅ ACCEPTABLE alternatives:");
        eprintln!("  - tokio::time::interval() for periodic delivery checks");
        eprintln!("  - tokio::time::timeout() for job deadlines");
        eprintln!("  - mpsc / oneshot / Notify to wait for another task");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn is_sleep_call(line: &SourceLine) -> bool {
    let code = &line.code;
    code.contains("::sleep(") || code.contains(".sleep(") || code.contains("sleep_until(")
}
