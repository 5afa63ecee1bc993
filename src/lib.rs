//! codebox: a multi-language code execution engine
//!
//! Two independent execution paths share one front door:
//!
//! * **Server path**: a request is validated, admitted through a bounded FIFO
//!   gate, given a private workspace, compiled if the language needs it, run
//!   under a wall-clock deadline and an output ceiling, and normalized into an
//!   [`ExecutionResult`]. The workspace is removed afterwards whatever happened.
//! * **Client path**: JavaScript and Python snippets run in-process inside
//!   WASI guests and stream `log`/`error` events into a [`SandboxSession`]
//!   that the caller can stop at any time.
//!
//! # Architecture
//!
//! ## Language Pipelines ([`judge`])
//! - [`judge::registry`]: static table of compile/run steps per language
//! - [`judge::adapter`]: command templates and the pipeline type
//! - [`judge::languages`]: one pipeline per supported language
//!
//! ## Workspaces ([`safety`])
//! - [`safety::workspace`]: unique run directories with guaranteed release
//!
//! ## Process Sandbox ([`exec`])
//! - [`exec::executor`]: compile-then-run orchestration and outcome mapping
//! - [`exec::process`]: process-group supervision, deadlines, exit codes
//! - [`exec::output`]: bounded combined stdout/stderr collection
//!
//! ## Script Sandbox ([`script`])
//! - [`script::session`]: session state, cancellation, event channel
//! - [`script::sandbox`]: session start-up on worker threads
//! - [`script::host`]: the `ScriptHost` seam and the WASI host
//! - [`script::runtime`]: shared wasmtime engine and module cache
//!
//! ## Coordination ([`session`])
//! - [`session::coordinator`]: validation, dispatch, batch execution
//! - [`session::admission`]: concurrency ceiling with FIFO tickets
//!
//! ## Kernel facilities ([`kernel`])
//! - [`kernel::process_tree`]: finds stage processes that left their group
//! - [`kernel::signal`]: interrupt handling for the CLI
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: shared types, closed enums and the error type
//! - [`config::loader`]: JSON configuration with environment overrides

// Configuration and shared types
pub mod config;

// Language pipelines
pub mod judge;

// Workspaces
pub mod safety;

// Process sandbox
pub mod exec;

// Script sandbox
pub mod script;

// Coordination
pub mod session;

// Process tree scans and signal handling
pub mod kernel;

// Command-line front end
pub mod cli;

pub use config::loader::{AdmissionPolicy, EngineConfig};
pub use config::types::{
    CodeboxError, EventKind, ExecutionRequest, ExecutionResult, LanguageId, Outcome, OutputEvent,
    OutputIntegrity, Result, Stage,
};
pub use script::{SandboxSession, ScriptSandbox, SessionState};
pub use session::Coordinator;
