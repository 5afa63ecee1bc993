//! Thin wrappers around process-level kernel facilities.
//!
//! Signal handling for the CLI, and `/proc` scans that find stage processes
//! which left their process group. Group signalling itself sits next to the
//! supervisor in `exec::process`.

pub mod process_tree;
pub mod signal;
