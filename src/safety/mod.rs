//! Safety and cleanup
//!
//! Run-scoped workspaces with guaranteed release.

pub mod workspace;
