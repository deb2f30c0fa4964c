//! # Atelier Model
//!
//! Shared record shapes, identity rules and validators for the seven entity
//! kinds of the atelier data layer: users, roles, customers, customer
//! measurements, orders, invoices and invoice line items.
//!
//! Every persisted record is an [`Entity`]: bookkeeping [`EntityMeta`]
//! (identifier, timestamps, [`SyncState`]) around an [`EntityBody`], a closed
//! union over the per-kind field records.
//!
//! Validation is pure and never panics on well-typed input: [`validate`]
//! returns the ordered list of [`Violation`]s, empty when the body is valid.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod id;
mod kind;
mod records;
mod timestamp;
mod validate;

pub use entity::{Entity, EntityBody, EntityMeta, FailureReason, Reference, SyncFailure, SyncState};
pub use id::EntityId;
pub use kind::EntityKind;
pub use records::{
    Customer, CustomerMeasurement, Invoice, InvoiceItem, InvoiceStatus, Order, OrderStatus, Role,
    User,
};
pub use timestamp::Timestamp;
pub use validate::{validate, Violation};
