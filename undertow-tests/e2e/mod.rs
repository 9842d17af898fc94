//! End-to-end playback against a fully started service.
//!
//! Unlike the integration suite these tests run every background loop:
//! the alert pump, resume saving, the progress ticker and the config
//! watcher.

#[path = "playback_workflow.rs"]
mod playback_workflow;
