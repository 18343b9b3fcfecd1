//! Configuration models for the allocation scope and protocol timeouts.

pub mod coordination;

pub use coordination::{CoordinationConfig, FALLBACK_SCOPE, SCOPE_VAR};
