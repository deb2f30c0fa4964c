//! # Atelier Sync Engine
//!
//! Pushes local mutations to the hosted backend.
//!
//! This crate provides:
//! - The [`RemoteClient`] contract and an [`InMemoryRemote`] reference backend
//! - The [`ConnectivityMonitor`] and the [`ConnectivityProbe`] seam
//! - The durable sync [`queue`], stored next to the records it describes
//! - The [`SyncEngine`]: drain cycles, retries with backoff, conflict policy,
//!   identifier reconciliation and the background service
//!
//! ## Key Invariants
//!
//! - At most one drain cycle runs at a time
//! - Entries for one record reach the remote in enqueue order
//! - A queued write never reaches the remote before the creates it depends on
//! - Every remote write carries an idempotency key that is stable across
//!   retries of the same queue entry
//! - Entries found `InFlight` at startup are treated as `Pending`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod conflict;
mod connectivity;
mod engine;
mod error;
mod memory;
pub mod queue;
mod remote;

pub use config::{RetryConfig, SyncConfig};
pub use conflict::{decide, ConflictCase, ConflictResolution, Decision, ManualReason};
pub use connectivity::{
    run_probe, ConnectivityMonitor, ConnectivityProbe, ConnectivityStatus, Subscription,
};
pub use engine::{CycleReport, ServiceHandle, StopReason, SyncEngine, SyncStats, SyncStatus};
pub use error::{RemoteError, RemoteResult, SyncError, SyncResult};
pub use memory::{InMemoryRemote, RemoteCall, RemoteOp};
pub use queue::{DeadReason, Enqueued, EntryState, QueueEntry, QueueOp};
pub use remote::{CreateRequest, DeleteRequest, RemoteClient, UpdateRequest};
