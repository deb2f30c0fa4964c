//! Per-kind field records.
//!
//! Money amounts are integer minor currency units. Cross-entity references are
//! plain identifiers, never embedded copies.

use crate::id::EntityId;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An application user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Login name.
    pub username: String,
    /// Contact email.
    pub email: String,
    /// Display name.
    pub full_name: String,
    /// Assigned role, if any.
    pub role_id: Option<EntityId>,
    /// Whether the account may sign in.
    pub active: bool,
}

/// A named set of permissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    /// Role name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Permission keys granted by this role.
    pub permissions: Vec<String>,
}

/// A shop customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    /// Customer name.
    pub name: String,
    /// Phone number.
    pub phone: Option<String>,
    /// Email address.
    pub email: Option<String>,
    /// Postal address.
    pub address: Option<String>,
    /// Free-form notes.
    pub notes: Option<String>,
}

/// A set of body measurements taken for a customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerMeasurement {
    /// Measured customer.
    pub customer_id: EntityId,
    /// What the measurements are for, e.g. "suit jacket".
    pub label: String,
    /// Measurement name to value, e.g. "chest" -> 96.5.
    pub values: BTreeMap<String, f64>,
    /// Unit of every value, e.g. "cm".
    pub unit: String,
    /// Free-form notes.
    pub notes: Option<String>,
}

/// Lifecycle of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Accepted, not started.
    Pending,
    /// Being made.
    InProgress,
    /// Ready for pickup.
    Ready,
    /// Handed to the customer.
    Delivered,
    /// Cancelled.
    Cancelled,
}

/// A customer order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Ordering customer.
    pub customer_id: EntityId,
    /// Human-facing order number.
    pub order_number: String,
    /// Current status.
    pub status: OrderStatus,
    /// Order total.
    pub total: i64,
    /// Deposit paid up front.
    pub deposit: i64,
    /// Promised completion date.
    pub due_date: Option<Timestamp>,
    /// Free-form notes.
    pub notes: Option<String>,
}

/// Payment status of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Nothing paid yet.
    Pending,
    /// Partially paid.
    Partial,
    /// Fully paid.
    Paid,
    /// Voided.
    Cancelled,
}

/// An invoice issued to a customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    /// Billed customer.
    pub customer_id: EntityId,
    /// Order this invoice bills, if any.
    pub order_id: Option<EntityId>,
    /// Human-facing invoice number.
    pub invoice_number: String,
    /// Payment status.
    pub status: InvoiceStatus,
    /// Invoice total.
    pub total: i64,
    /// Amount paid so far.
    pub paid_amount: i64,
    /// Payment due date.
    pub due_date: Option<Timestamp>,
}

/// One line of an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    /// Owning invoice.
    pub invoice_id: EntityId,
    /// Line description.
    pub description: String,
    /// Number of units.
    pub quantity: i64,
    /// Price per unit.
    pub unit_price: i64,
    /// Line total; must equal `quantity * unit_price`.
    pub total_price: i64,
}

impl InvoiceItem {
    /// Builds a line item with `total_price` computed from quantity and unit
    /// price (saturating on overflow, which validation then reports).
    pub fn priced(
        invoice_id: EntityId,
        description: impl Into<String>,
        quantity: i64,
        unit_price: i64,
    ) -> Self {
        Self {
            invoice_id,
            description: description.into(),
            quantity,
            unit_price,
            total_price: quantity.saturating_mul(unit_price),
        }
    }
}
