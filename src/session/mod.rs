//! Execution session coordination
//!
//! Request validation, bounded FIFO admission and dispatch to the process
//! sandbox or the script sandbox.

pub mod admission;
pub mod coordinator;

pub use admission::{AdmissionGate, Permit};
pub use coordinator::Coordinator;
