//! # Atelier DB
//!
//! The offline-first database facade: the single entry point the application
//! uses to read and write users, roles, customers, measurements, orders,
//! invoices and invoice items.
//!
//! Writes are validated, applied to the local store and queued for the remote
//! backend in one transaction, and return at once. The sync engine pushes the
//! queue whenever connectivity allows; its outcomes are visible through each
//! entity's [`SyncState`](atelier_model::SyncState) and
//! [`Database::sync_status`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use atelier_db::{ConnectivityMonitor, Database, DbConfig, InMemoryRemote};
//! use atelier_model::{Customer, EntityBody};
//! use std::sync::Arc;
//!
//! # async fn run() -> atelier_db::DbResult<()> {
//! let db = Database::open(
//!     "shop-data",
//!     DbConfig::default(),
//!     Arc::new(InMemoryRemote::new()),
//!     ConnectivityMonitor::new(true),
//! )?;
//! let service = db.start()?;
//!
//! db.create(EntityBody::Customer(Customer {
//!     name: "Ada".into(),
//!     phone: None,
//!     email: None,
//!     address: None,
//!     notes: None,
//! }))?;
//!
//! let report = db.force_sync().await?;
//! println!("pushed {}", report.pushed);
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! The [`bridge`] module exposes the same calls as serializable messages for
//! a host process.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
mod config;
mod database;
mod error;
mod integrity;

pub use config::DbConfig;
pub use database::Database;
pub use error::{DbError, DbResult};

pub use atelier_core::{Config, ListFilter, ListOrder, StoreStats};
pub use atelier_sync_engine::{
    ConflictResolution, ConnectivityMonitor, ConnectivityProbe, CycleReport, InMemoryRemote,
    RemoteClient, RemoteError, RetryConfig, ServiceHandle, SyncConfig, SyncStats, SyncStatus,
};
