//! Tokio integration.

pub mod blocking;

pub use blocking::{await_state_async, call_async};
