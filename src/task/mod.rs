//! Request/response task protocol.
//!
//! A submitter publishes a [`TaskState`] in `INITIATED`; a [`TaskServer`]
//! hands it to a [`TaskHandler`], usually an [`ExecutorFactoryTaskHandler`]
//! that runs a [`TaskExecutionMonitor`]. Both sides then exchange updates
//! through their [`TaskProxy`], correlated by the initiating event id.

pub mod group;
pub mod local;
pub mod monitor;
pub mod payload;
pub mod proxy;
pub mod record;
pub mod remote;
pub mod server;

pub use group::ResourceGroup;
pub use local::{FnTask, LocalTask, LocalTaskFactory};
pub use monitor::TaskExecutionMonitor;
pub use payload::{CodecRegistry, JsonCodec, PayloadCodec, Utf8Codec, JSON_SCHEMA, UTF8_SCHEMA};
pub use proxy::{TaskListener, TaskListenerId, TaskProxy};
pub use record::{Origin, TaskState, TaskStatus};
pub use remote::{RemoteTask, DEFAULT_ACCEPT_TIMEOUT};
pub use server::{ExecutorFactoryTaskHandler, TaskHandler, TaskServer};
