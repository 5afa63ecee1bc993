//! Client script sandbox
//!
//! Runs JavaScript and Python snippets in-process inside WASI guests. Each
//! run is a `SandboxSession` fed by a worker thread over a channel; the
//! caller polls it for output and stops it at will.

pub mod host;
pub mod javascript;
pub mod python;
pub mod runtime;
pub mod sandbox;
pub mod session;

pub use host::{ScriptHost, ScriptJob, WasiScriptHost};
pub use sandbox::ScriptSandbox;
pub use session::{CancelToken, EventSink, SandboxSession, SessionState};
