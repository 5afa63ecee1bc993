//! Language pipelines.
//!
//! The runtime stays language-agnostic. Each language contributes a static
//! pipeline (source file, optional compile step, run step) and the registry
//! maps a `LanguageId` to it.

pub mod adapter;
pub mod languages;
pub mod registry;

pub use adapter::{CommandTemplate, LanguagePipeline};
pub use registry::{resolve, resolve_name, supported};
