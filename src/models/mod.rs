//! Core data models for bulkimport.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants with retry/resume strategies

mod config;
mod error;
mod import;

pub use config::*;
pub use error::*;
pub use import::*;
