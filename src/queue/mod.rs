//! # Job Queue
//!
//! Multiplexes many waiting clients onto a bounded number of workers.
//!
//! ## Key Components:
//! - **channel**: the `ClientChannel` abstraction the queue talks through
//! - **registry**: FIFO bookkeeping of connected channels and their positions
//! - **admission**: the worker-slot pool and the permit-vs-disconnect race

pub mod admission;
pub mod channel;
pub mod registry;

pub use admission::{Admission, AdmissionController, WorkerPermit};
pub use channel::{ChannelError, ChannelId, ClientChannel, Inbound};
pub use registry::{ChannelRegistry, Registration, RejectReason};
