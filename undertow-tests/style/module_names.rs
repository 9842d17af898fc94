//! Module names say what the module does.

use super::source_scan::{core_src, rust_files};

/// Catch-all names that hide a module's purpose.
const BANNED_MODULE_NAMES: &[&str] = &[
    "utils", "util", "helpers", "helper", "common", "shared", "misc", "tools",
];

fn module_name(path: &std::path::Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    if stem == "mod" {
        let parent = path.parent()?.file_name()?.to_str()?;
        Some(parent.to_string())
    } else {
        Some(stem.to_string())
    }
}

#[test]
fn test_module_name_from_path() {
    use std::path::Path;
    assert_eq!(module_name(Path::new("src/torrent/mod.rs")).as_deref(), Some("torrent"));
    assert_eq!(module_name(Path::new("src/torrent/queue.rs")).as_deref(), Some("queue"));
}

#[test]
fn no_catch_all_module_names() {
    let files = rust_files(&core_src()).unwrap();
    assert!(!files.is_empty(), "no sources found");
    let offenders: Vec<_> = files
        .iter()
        .filter(|path| {
            module_name(path).is_some_and(|name| BANNED_MODULE_NAMES.contains(&name.as_str()))
        })
        .collect();
    assert!(offenders.is_empty(), "catch-all module names: {offenders:?}");
}
