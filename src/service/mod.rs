//! # Services
//!
//! Long-running tasks built on the protocol layer.
//!
//! ## Components
//! - **Coordinator**: owns the pool, serves authenticated connections, exposes the stream API
//! - **Scheduler**: emits request tokens over the covert channel while the pool has room
//! - **Remote**: the dialling side of a physical connection

pub mod coordinator;
pub mod remote;
pub mod scheduler;

pub use coordinator::Coordinator;
pub use remote::RemoteLink;
pub use scheduler::RequestScheduler;
