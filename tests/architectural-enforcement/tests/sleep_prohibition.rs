//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the bus crates MUST NOT call sleep methods.
//! Waiting happens on I/O, channels, timeouts or cancellation.
//! **Exceptions**: exponential backoff (retry logic only), test code

use architectural_enforcement::{
    check_directory, workspace_root, SleepPolicy, Violation, PRODUCTION_DIRS,
};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let root = workspace_root();
    let policy = SleepPolicy {
        allow_backoff: true,
        allow_tests: true,
    };

    let mut scanned = 0;
    let mut violations: Vec<Violation> = Vec::new();
    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        assert!(path.exists(), "production source directory missing: {}", path.display());
        scanned += 1;
        violations.extend(check_directory(&path, &policy));
    }
    assert_eq!(scanned, PRODUCTION_DIRS.len());

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }

        eprintln!("\nAcceptable sleep uses:");
        eprintln!("  - Exponential backoff in retry logic");
        eprintln!("  - Test code (#[cfg(test)] modules)");
        eprintln!("\nForbidden:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization");
        eprintln!("  - Sleep to 'wait' for events (use async I/O, channels or timeouts)");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}
