//! Process sandbox
//!
//! Runs compile and run stages as supervised host processes with wall-clock
//! deadlines, process-group kills and a combined output ceiling.

pub mod executor;
pub mod output;
pub mod process;

pub use executor::ProcessSandbox;
