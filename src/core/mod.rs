//! Core execution primitives shared by the allocation and task protocols.

pub mod error;
pub mod interrupt;
pub mod worker;

pub use error::{AppResult, CoordinationError};
pub use interrupt::Interrupt;
pub use worker::{JobHandle, SingleWorker};
