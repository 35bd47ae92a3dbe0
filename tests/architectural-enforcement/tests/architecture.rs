//! Workspace-wide architecture rules

use architectural_enforcement::{crate_src, report, scan};

#[test]
fn test_no_blocking_sleep_in_gateway() {
    for name in ["core", "daemon"] {
        let violations = scan(&crate_src(name), |line| line.contains("thread::sleep"));
        assert!(
            violations.is_empty(),
            "blocking sleep in async code:\n{}",
            report(&violations)
        );
    }
}

#[test]
fn test_core_has_no_http_framework() {
    let violations = scan(&crate_src("core"), |line| {
        line.contains("axum::") || line.contains("tower_http::") || line.contains("hyper::")
    });
    assert!(
        violations.is_empty(),
        "gateway-core must reach connections through Transport:\n{}",
        report(&violations)
    );
}

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    for name in ["core", "daemon"] {
        let violations = scan(&crate_src(name), |line| {
            line.contains(".unwrap()") || line.contains(".expect(")
        });
        assert!(
            violations.is_empty(),
            "propagate errors instead of panicking:\n{}",
            report(&violations)
        );
    }
}
