//! Configuration and shared types
//!
//! Engine limits, script runtime locations, and the closed enums used across modules.

pub mod loader;
pub mod types;
