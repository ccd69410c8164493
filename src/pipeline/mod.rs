//! Pipeline module - orchestrated, resumable file imports.

mod logger;
mod orchestrator;
mod source;
mod validate;

pub use logger::*;
pub use orchestrator::*;
pub use source::*;
pub use validate::*;
