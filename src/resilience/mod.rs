//! Resilience primitives: backoff, retry and circuit breaking.

mod backoff;
mod circuit_breaker;
mod retry;

pub use backoff::*;
pub use circuit_breaker::*;
pub use retry::*;
