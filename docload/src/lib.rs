//! The docload document database load generator.
//!
//! This library supports the docload binary found elsewhere in this project.
//! A run renders documents from a template, inserts them into the target
//! database from a pool of writer tasks, re-reads what was inserted from a
//! pool of reader tasks and reports what happened, all for a fixed duration.
//! See [`engine::Engine`] for how the pieces fit together.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![warn(unreachable_pub)]
#![warn(missing_docs)]
#![warn(missing_copy_implementations)]
#![warn(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod document;
pub mod engine;
pub mod queue;
pub mod source;
pub mod target;
pub mod telemetry;
pub mod template;
mod worker;


/// The name of this host, used to tag queue items and pushed telemetry.
///
/// Falls back to `"unknown"` when the hostname cannot be read.
#[must_use]
pub fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name
            .into_string()
            .unwrap_or_else(|name| name.to_string_lossy().into_owned()),
        Err(_) => "unknown".to_string(),
    }
}
