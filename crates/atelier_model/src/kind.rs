//! Entity kinds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The seven kinds of record managed by the data layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Application user.
    User,
    /// Permission role assigned to users.
    Role,
    /// Shop customer.
    Customer,
    /// Body measurements recorded for a customer.
    CustomerMeasurement,
    /// Customer order.
    Order,
    /// Invoice issued to a customer.
    Invoice,
    /// Line item of an invoice.
    InvoiceItem,
}

impl EntityKind {
    /// All kinds, in dependency order (referenced kinds first).
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Role,
        EntityKind::User,
        EntityKind::Customer,
        EntityKind::CustomerMeasurement,
        EntityKind::Order,
        EntityKind::Invoice,
        EntityKind::InvoiceItem,
    ];

    /// Returns the stable snake_case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Role => "role",
            EntityKind::Customer => "customer",
            EntityKind::CustomerMeasurement => "customer_measurement",
            EntityKind::Order => "order",
            EntityKind::Invoice => "invoice",
            EntityKind::InvoiceItem => "invoice_item",
        }
    }

    /// Kinds whose records keep a record of this kind from being deleted
    /// while they reference it.
    #[must_use]
    pub const fn delete_blockers(self) -> &'static [EntityKind] {
        match self {
            EntityKind::Customer => &[EntityKind::Order, EntityKind::Invoice],
            EntityKind::Order => &[EntityKind::Invoice],
            EntityKind::Role => &[EntityKind::User],
            _ => &[],
        }
    }

    /// Kinds whose records are deleted together with the record of this
    /// kind they reference.
    #[must_use]
    pub const fn cascade_dependents(self) -> &'static [EntityKind] {
        match self {
            EntityKind::Customer => &[EntityKind::CustomerMeasurement],
            EntityKind::Invoice => &[EntityKind::InvoiceItem],
            _ => &[],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown entity kind: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("invoice_line".parse::<EntityKind>().is_err());
    }

    #[test]
    fn delete_rules_never_overlap() {
        for kind in EntityKind::ALL {
            for dependent in kind.cascade_dependents() {
                assert!(!kind.delete_blockers().contains(dependent));
                assert!(dependent.cascade_dependents().is_empty());
            }
        }
        assert_eq!(EntityKind::Invoice.cascade_dependents(), &[EntityKind::InvoiceItem]);
        assert!(EntityKind::InvoiceItem.delete_blockers().is_empty());
    }
}
