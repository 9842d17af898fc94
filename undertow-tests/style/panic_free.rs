//! Production code propagates errors instead of panicking.

use super::source_scan::{report, scan};

const FORBIDDEN: [&str; 5] = [".unwrap()", ".expect(", "panic!(", "todo!(", "unimplemented!("];

fn panics(code: &str) -> bool {
    FORBIDDEN.iter().any(|pattern| code.contains(pattern))
}

#[test]
fn test_panic_detection() {
    assert!(panics("let x = value.unwrap();"));
    assert!(panics("    .expect(\"config\")"));
    assert!(panics("panic!(\"boom\")"));
    assert!(!panics("let x = value.unwrap_or_default();"));
    assert!(!panics("let x = value.unwrap_or(0);"));
}

#[test]
fn panic_free_production_code() {
    let (violations, checked) = scan(panics).unwrap();
    assert!(checked > 0, "no sources found");
    assert!(
        report("Panic-free", &violations, checked),
        "panicking calls found in production code, see output above"
    );
}
