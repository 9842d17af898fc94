//! Source checks over `undertow-core` that clippy does not cover.
//!
//! - `dead_code_enforcement` - no `#[allow(dead_code)]` in production code
//! - `panic_free` - no `unwrap`, `expect` or `panic!` outside test modules
//! - `module_names` - no catch-all module names such as `utils`

#[path = "style/source_scan.rs"]
mod source_scan;

#[path = "style/dead_code_enforcement.rs"]
mod dead_code_enforcement;

#[path = "style/panic_free.rs"]
mod panic_free;

#[path = "style/module_names.rs"]
mod module_names;
