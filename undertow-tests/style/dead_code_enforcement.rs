//! Production code carries no `#[allow(dead_code)]`.

use super::source_scan::{report, scan};

fn allows_dead_code(code: &str) -> bool {
    let trimmed = code.trim();
    trimmed.contains("#[allow(") && trimmed.contains("dead_code")
}

#[test]
fn test_dead_code_detection() {
    assert!(allows_dead_code("#[allow(dead_code)]"));
    assert!(allows_dead_code("    #[allow(clippy::missing_docs, dead_code)]"));
    assert!(!allows_dead_code("#[allow(clippy::too_many_arguments)]"));
    assert!(!allows_dead_code("let dead_code = 1;"));
}

#[test]
fn dead_code_enforcement() {
    let (violations, checked) = scan(allows_dead_code).unwrap();
    assert!(checked > 0, "no sources found");
    assert!(
        report("Dead code enforcement", &violations, checked),
        "dead code allowances found in production code, see output above"
    );
}
