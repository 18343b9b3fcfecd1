//! Resource allocation protocol: records, the shared endpoint and the
//! client-side proxy with its timeout fallbacks.

pub mod record;
pub mod remote;
pub mod service;

pub use record::{
    Allocation, AllocationBuilder, AllocationState, Initiator, Interval, Policy, Priority,
};
pub use remote::{ListenerId, RemoteAllocation, SchedulerListener};
pub use service::AllocationService;
