//! # Resource Coordination
//!
//! Exclusive, time-bounded access to named shared resources across
//! independent processes, plus a request/response task protocol built on
//! the same state-synchronization pattern.
//!
//! A client describes the resources and time slot it needs as an
//! [`Allocation`](allocation::Allocation) and hands it to a
//! [`RemoteAllocation`](allocation::RemoteAllocation). The proxy publishes
//! the request to a remote arbiter and keeps a local, authoritative view of
//! the allocation's state as updates arrive. Requests the arbiter never
//! acknowledges are resolved locally after a timeout.
//!
//! ## Core Problem Solved
//!
//! - **Unreliable delivery**: every request carries a watchdog that
//!   synthesizes a fallback state if no acknowledgment arrives in time
//! - **Many observers**: state changes fan out to listeners over a snapshot,
//!   so observers may register or leave while updates are in flight
//! - **Execution tied to grants**: lifecycle wrappers start user work only
//!   once the slot is `ALLOCATED` and interrupt it on revocation
//!
//! ## Allocating and Running Work
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use resource_coordination::allocation::{Allocation, AllocationService};
//! use resource_coordination::config::CoordinationConfig;
//! use resource_coordination::resource::{Completion, Executable, ExecutableResource};
//!
//! let service = AllocationService::new(transport, CoordinationConfig::from_env()?)?;
//! let allocation = Allocation::builder(["robot-arm"])
//!     .slot_in(Duration::ZERO, Duration::from_secs(1))
//!     .build();
//! let resource = ExecutableResource::new(service, allocation, Completion::Expire, |interrupt| {
//!     interrupt.sleep(Duration::from_millis(200))?;
//!     Ok(42)
//! })?;
//! resource.startup()?;
//! let value = resource.result().map(|h| h.wait());
//! ```
//!
//! ## Remote Tasks
//!
//! ```rust,ignore
//! use resource_coordination::task::{ExecutorFactoryTaskHandler, RemoteTask, TaskServer};
//!
//! let server = TaskServer::new(bus.clone(), scope.clone(), Arc::new(handler));
//! std::thread::spawn(move || server.execute());
//! let result = RemoteTask::new(bus, scope.child("job-1")?, "x".into()).call()?;
//! ```
//!
//! The transport itself is a contract ([`infra::Transport`]); the crate
//! ships [`infra::InMemoryBus`] as its in-process implementation.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Allocation records, the transport endpoint and the allocation proxy.
pub mod allocation;
/// Configuration of scopes and protocol timings.
pub mod config;
/// Error types, interruption and the single-thread worker.
pub mod core;
/// Publish/subscribe transport contract and in-process backend.
pub mod infra;
/// Lifecycle wrappers tying user execution to an allocation.
pub mod resource;
/// Async adapters over the blocking waits.
#[cfg(feature = "tokio-runtime")]
pub mod runtime;
/// Task protocol: proxies, server, execution monitor and group scheduling.
pub mod task;
/// Shared utilities.
pub mod util;
