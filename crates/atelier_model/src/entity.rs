//! The entity envelope and its sync bookkeeping.

use crate::id::EntityId;
use crate::kind::EntityKind;
use crate::records::{
    Customer, CustomerMeasurement, Invoice, InvoiceItem, Order, Role, User,
};
use crate::timestamp::Timestamp;
use crate::validate::{validate, Violation};
use serde::{Deserialize, Serialize};

/// Replication state of a local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Local and remote agree.
    Synced,
    /// Created locally, not yet confirmed by the remote.
    PendingCreate,
    /// Updated locally, not yet confirmed by the remote.
    PendingUpdate,
    /// Deleted locally; the record stays until the remote confirms.
    PendingDelete,
    /// Local and remote diverged and need manual review.
    Conflict,
}

impl SyncState {
    /// Returns true while a local mutation awaits remote confirmation.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(
            self,
            SyncState::PendingCreate | SyncState::PendingUpdate | SyncState::PendingDelete
        )
    }
}

/// Why the last sync attempt for an entity gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The remote refused the write (business rule or validation).
    Rejected,
    /// The remote refused our credentials.
    Unauthorized,
    /// Transport kept failing until the retry budget ran out.
    RetriesExhausted,
}

/// A terminal sync failure attached to an entity so readers can surface it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    /// Failure class.
    pub reason: FailureReason,
    /// Message reported by the remote or transport.
    pub message: String,
    /// When the failure was recorded.
    pub at: Timestamp,
}

/// Bookkeeping shared by every entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMeta {
    /// Stable identifier.
    pub id: EntityId,
    /// Local creation time.
    pub created_at: Timestamp,
    /// Time of the last local or remote modification.
    pub updated_at: Option<Timestamp>,
    /// Replication state.
    pub sync_state: SyncState,
    /// Remote `updated_at` the local version was derived from; `None` until
    /// the remote has confirmed the record once.
    pub base_version: Option<Timestamp>,
    /// Set when the pending mutation was dead-lettered.
    pub sync_failure: Option<SyncFailure>,
}

/// A reference from one entity to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Field holding the identifier.
    pub field: &'static str,
    /// Kind of the referenced entity.
    pub kind: EntityKind,
    /// Referenced identifier.
    pub id: EntityId,
}

/// The kind-specific field record of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "fields", rename_all = "snake_case")]
pub enum EntityBody {
    /// A user.
    User(User),
    /// A role.
    Role(Role),
    /// A customer.
    Customer(Customer),
    /// A customer measurement set.
    CustomerMeasurement(CustomerMeasurement),
    /// An order.
    Order(Order),
    /// An invoice.
    Invoice(Invoice),
    /// An invoice line item.
    InvoiceItem(InvoiceItem),
}

impl EntityBody {
    /// Returns the kind of this body.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            EntityBody::User(_) => EntityKind::User,
            EntityBody::Role(_) => EntityKind::Role,
            EntityBody::Customer(_) => EntityKind::Customer,
            EntityBody::CustomerMeasurement(_) => EntityKind::CustomerMeasurement,
            EntityBody::Order(_) => EntityKind::Order,
            EntityBody::Invoice(_) => EntityKind::Invoice,
            EntityBody::InvoiceItem(_) => EntityKind::InvoiceItem,
        }
    }

    /// Validates the fields; see [`validate`].
    #[must_use]
    pub fn validate(&self) -> Vec<Violation> {
        validate(self)
    }

    /// Lists the identifiers this body points at.
    #[must_use]
    pub fn references(&self) -> Vec<Reference> {
        let reference = |field, kind, id| Reference { field, kind, id };
        match self {
            EntityBody::User(user) => user
                .role_id
                .map(|id| reference("role_id", EntityKind::Role, id))
                .into_iter()
                .collect(),
            EntityBody::Role(_) | EntityBody::Customer(_) => Vec::new(),
            EntityBody::CustomerMeasurement(m) => {
                vec![reference("customer_id", EntityKind::Customer, m.customer_id)]
            }
            EntityBody::Order(order) => {
                vec![reference("customer_id", EntityKind::Customer, order.customer_id)]
            }
            EntityBody::Invoice(invoice) => {
                let mut refs = vec![reference(
                    "customer_id",
                    EntityKind::Customer,
                    invoice.customer_id,
                )];
                if let Some(order_id) = invoice.order_id {
                    refs.push(reference("order_id", EntityKind::Order, order_id));
                }
                refs
            }
            EntityBody::InvoiceItem(item) => {
                vec![reference("invoice_id", EntityKind::Invoice, item.invoice_id)]
            }
        }
    }

    /// Replaces every reference to `(kind, from)` with `to`.
    ///
    /// Returns true if anything changed.
    pub fn rewrite_reference(&mut self, kind: EntityKind, from: EntityId, to: EntityId) -> bool {
        fn swap(slot: &mut EntityId, from: EntityId, to: EntityId) -> bool {
            if *slot == from {
                *slot = to;
                true
            } else {
                false
            }
        }

        match (self, kind) {
            (EntityBody::User(user), EntityKind::Role) => match user.role_id.as_mut() {
                Some(slot) => swap(slot, from, to),
                None => false,
            },
            (EntityBody::CustomerMeasurement(m), EntityKind::Customer) => {
                swap(&mut m.customer_id, from, to)
            }
            (EntityBody::Order(order), EntityKind::Customer) => {
                swap(&mut order.customer_id, from, to)
            }
            (EntityBody::Invoice(invoice), EntityKind::Customer) => {
                swap(&mut invoice.customer_id, from, to)
            }
            (EntityBody::Invoice(invoice), EntityKind::Order) => match invoice.order_id.as_mut() {
                Some(slot) => swap(slot, from, to),
                None => false,
            },
            (EntityBody::InvoiceItem(item), EntityKind::Invoice) => {
                swap(&mut item.invoice_id, from, to)
            }
            _ => false,
        }
    }
}

/// A persisted record: metadata plus kind-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Identity and sync bookkeeping.
    pub meta: EntityMeta,
    /// Kind-specific fields.
    pub body: EntityBody,
}

impl Entity {
    /// Wraps a freshly created body with a new local identifier.
    #[must_use]
    pub fn new_local(body: EntityBody, now: Timestamp) -> Self {
        Self {
            meta: EntityMeta {
                id: EntityId::new(),
                created_at: now,
                updated_at: None,
                sync_state: SyncState::PendingCreate,
                base_version: None,
                sync_failure: None,
            },
            body,
        }
    }

    /// Returns the identifier.
    #[must_use]
    pub fn id(&self) -> EntityId {
        self.meta.id
    }

    /// Returns the kind.
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.body.kind()
    }

    /// Returns the sync state.
    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        self.meta.sync_state
    }

    /// Time of the latest write, used for last-writer-wins comparison.
    #[must_use]
    pub fn last_modified(&self) -> Timestamp {
        self.meta.updated_at.unwrap_or(self.meta.created_at)
    }

    /// Rewrites references to a renamed entity; returns true if any changed.
    pub fn rewrite_reference(&mut self, kind: EntityKind, from: EntityId, to: EntityId) -> bool {
        self.body.rewrite_reference(kind, from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{InvoiceStatus, OrderStatus};

    fn invoice(customer_id: EntityId, order_id: Option<EntityId>) -> EntityBody {
        EntityBody::Invoice(Invoice {
            customer_id,
            order_id,
            invoice_number: "INV-1".into(),
            status: InvoiceStatus::Pending,
            total: 100_000,
            paid_amount: 0,
            due_date: None,
        })
    }

    #[test]
    fn invoice_references_customer_and_order() {
        let customer = EntityId::new();
        let order = EntityId::new();
        let refs = invoice(customer, Some(order)).references();

        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].kind, EntityKind::Customer);
        assert_eq!(refs[0].id, customer);
        assert_eq!(refs[1].field, "order_id");
        assert!(invoice(customer, None).references().len() == 1);
    }

    #[test]
    fn rewrite_only_touches_matching_kind() {
        let customer = EntityId::new();
        let replacement = EntityId::new();
        let mut body = EntityBody::Order(Order {
            customer_id: customer,
            order_number: "ORD-1".into(),
            status: OrderStatus::Pending,
            total: 10,
            deposit: 0,
            due_date: None,
            notes: None,
        });

        assert!(!body.rewrite_reference(EntityKind::Invoice, customer, replacement));
        assert!(body.rewrite_reference(EntityKind::Customer, customer, replacement));
        assert_eq!(body.references()[0].id, replacement);
        assert!(!body.rewrite_reference(EntityKind::Customer, customer, replacement));
    }

    #[test]
    fn new_local_is_pending_create() {
        let now = Timestamp::from_millis(42);
        let entity = Entity::new_local(invoice(EntityId::new(), None), now);

        assert_eq!(entity.sync_state(), SyncState::PendingCreate);
        assert_eq!(entity.kind(), EntityKind::Invoice);
        assert_eq!(entity.last_modified(), now);
        assert!(entity.meta.base_version.is_none());
    }

    #[test]
    fn body_serializes_with_kind_tag() {
        let json = serde_json::to_value(invoice(EntityId::new(), None)).unwrap();
        assert_eq!(json["kind"], "invoice");
        assert_eq!(json["fields"]["status"], "pending");
        assert_eq!(json["fields"]["total"], 100_000);
    }
}
