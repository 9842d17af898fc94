//! Walks the core crate sources and yields their production lines.

use std::fs;
use std::path::{Path, PathBuf};

/// A matched line in production code.
#[derive(Debug)]
pub struct Violation {
    pub file_path: PathBuf,
    pub line_number: usize,
    pub context: String,
}

/// Root of the scanned sources.
pub fn core_src() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../undertow-core/src")
}

/// Every `.rs` file below `dir`.
pub fn rust_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect(dir, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect(&path, files)?;
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            files.push(path);
        }
    }
    Ok(())
}

/// Files compiled only for tests, exempt as a whole.
pub fn is_test_only(path: &Path) -> bool {
    matches!(
        path.file_name().and_then(|name| name.to_str()),
        Some("fixture.rs" | "simulated.rs")
    )
}

/// Lines up to the first test-gated item, numbered from 1.
pub fn production_lines(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| {
            let trimmed = line.trim_start();
            !(trimmed.starts_with("#[cfg(test") || trimmed.starts_with("#[cfg(any(test"))
        })
        .map(|(index, line)| (index + 1, line))
}

/// Runs `matches` over every production line of the core crate.
pub fn scan(matches: impl Fn(&str) -> bool) -> std::io::Result<(Vec<Violation>, usize)> {
    let mut violations = Vec::new();
    let mut checked = 0;
    for path in rust_files(&core_src())? {
        if is_test_only(&path) {
            continue;
        }
        let content = fs::read_to_string(&path)?;
        checked += 1;
        for (line_number, line) in production_lines(&content) {
            let code = line.split("//").next().unwrap_or_default();
            if matches(code) {
                violations.push(Violation {
                    file_path: path.clone(),
                    line_number,
                    context: line.trim().to_string(),
                });
            }
        }
    }
    Ok((violations, checked))
}

/// Prints violations; true when there are none.
pub fn report(rule: &str, violations: &[Violation], checked: usize) -> bool {
    if violations.is_empty() {
        println!("{rule}: {checked} files checked, no violations found");
        return true;
    }
    println!("{rule} violations:");
    for violation in violations {
        println!(
            "{}:{}\n  {}",
            violation.file_path.display(),
            violation.line_number,
            violation.context
        );
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let content = "fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() { x.unwrap(); }\n}\n";
        let lines: Vec<_> = production_lines(content).collect();
        assert_eq!(lines, vec![(1, "fn a() {}")]);

        let gated = "fn a() {}\n#[cfg(any(test, feature = \"test-utils\"))]\npub mod testing;\n";
        assert_eq!(production_lines(gated).count(), 1);
    }

    #[test]
    fn test_test_only_files() {
        assert!(is_test_only(Path::new("src/torrent/fixture.rs")));
        assert!(is_test_only(Path::new("src/backend/simulated.rs")));
        assert!(!is_test_only(Path::new("src/torrent/handle.rs")));
    }
}
