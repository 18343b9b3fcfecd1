//! Lifecycle wrappers tying user execution to an allocation.
//!
//! - [`AllocatableResource`] schedules an allocation and records its states.
//! - [`ExecutableResource`] runs user work exactly while the slot is granted.
//! - [`MonitoredResource`] passively watches every allocation touching a set
//!   of resource names.

pub mod allocatable;
pub mod executable;
pub mod monitored;
pub mod state_log;

pub use allocatable::AllocatableResource;
pub use executable::{Completion, ExecutableResource};
pub use monitored::MonitoredResource;
pub use state_log::StateLog;

use crate::core::CoordinationError;

/// Something that can be started and stopped against the arbiter.
pub trait Executable: Send + Sync {
    /// Begin the lifecycle, usually by scheduling an allocation.
    ///
    /// # Errors
    ///
    /// Spawn or transport failure.
    fn startup(&self) -> Result<(), CoordinationError>;

    /// End the lifecycle, giving up whatever is still held.
    ///
    /// # Errors
    ///
    /// Transport failure.
    fn shutdown(&self) -> Result<(), CoordinationError>;
}
