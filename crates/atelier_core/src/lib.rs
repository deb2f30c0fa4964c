//! # Atelier Core
//!
//! The local store: durable, transactional record storage that serves every
//! read of the data layer.
//!
//! Entities and auxiliary values (the sync queue, sync metadata) live in one
//! framed, checksummed record log. Each [`LocalStore::transaction`] commits as
//! exactly one frame, so multi-record updates such as "apply a write and queue
//! it" or "confirm a create and rewrite every reference to its identifier" are
//! atomic on disk and invisible to readers until complete.
//!
//! ## Example
//!
//! ```rust
//! use atelier_core::{ListFilter, LocalStore};
//! use atelier_model::{Customer, Entity, EntityBody, EntityKind, Timestamp};
//!
//! let store = LocalStore::open_in_memory()?;
//! let customer = Entity::new_local(
//!     EntityBody::Customer(Customer {
//!         name: "Ada".into(),
//!         phone: None,
//!         email: None,
//!         address: None,
//!         notes: None,
//!     }),
//!     Timestamp::now(),
//! );
//! store.put(customer.clone())?;
//!
//! assert_eq!(store.list(EntityKind::Customer, &ListFilter::new()), vec![customer]);
//! # Ok::<(), atelier_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
mod config;
mod dir;
mod error;
mod filter;
pub mod log;
mod state;
mod stats;
mod store;
mod transaction;
mod verify;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use filter::{ListFilter, ListOrder};
pub use stats::{RecoveryInfo, StoreStats};
pub use store::LocalStore;
pub use transaction::Transaction;
pub use verify::{verify_store, VerifyReport};
