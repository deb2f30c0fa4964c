//! Field validators.
//!
//! Violations are reported in field declaration order so callers can show them
//! next to the offending inputs.

use crate::entity::EntityBody;
use crate::records::{
    Customer, CustomerMeasurement, Invoice, InvoiceItem, Order, Role, User,
};
use std::collections::HashSet;
use std::fmt;

/// One broken field rule.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Violation {
    /// Offending field.
    pub field: String,
    /// Human-readable rule description.
    pub message: String,
}

impl Violation {
    /// Creates a violation for `field`.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validates an entity body, returning every violation in field order.
///
/// An empty vector means the body is valid.
#[must_use]
pub fn validate(body: &EntityBody) -> Vec<Violation> {
    let mut out = Checker::default();
    match body {
        EntityBody::User(user) => check_user(&mut out, user),
        EntityBody::Role(role) => check_role(&mut out, role),
        EntityBody::Customer(customer) => check_customer(&mut out, customer),
        EntityBody::CustomerMeasurement(m) => check_measurement(&mut out, m),
        EntityBody::Order(order) => check_order(&mut out, order),
        EntityBody::Invoice(invoice) => check_invoice(&mut out, invoice),
        EntityBody::InvoiceItem(item) => check_invoice_item(&mut out, item),
    }
    out.violations
}

#[derive(Default)]
struct Checker {
    violations: Vec<Violation>,
}

impl Checker {
    fn ensure(&mut self, ok: bool, field: &str, message: &str) {
        if !ok {
            self.violations.push(Violation::new(field, message));
        }
    }

    fn not_blank(&mut self, value: &str, field: &str) {
        self.ensure(!value.trim().is_empty(), field, "must not be empty");
    }

    fn email(&mut self, value: &str, field: &str) {
        self.ensure(value.contains('@'), field, "must be an email address");
    }
}

fn check_user(c: &mut Checker, user: &User) {
    c.not_blank(&user.username, "username");
    c.email(&user.email, "email");
}

fn check_role(c: &mut Checker, role: &Role) {
    c.not_blank(&role.name, "name");
    let mut seen = HashSet::new();
    for permission in &role.permissions {
        if permission.trim().is_empty() {
            c.ensure(false, "permissions", "must not contain empty entries");
        } else if !seen.insert(permission.as_str()) {
            c.violations.push(Violation::new(
                "permissions",
                format!("duplicate permission '{permission}'"),
            ));
        }
    }
}

fn check_customer(c: &mut Checker, customer: &Customer) {
    c.not_blank(&customer.name, "name");
    if let Some(email) = &customer.email {
        c.email(email, "email");
    }
}

fn check_measurement(c: &mut Checker, m: &CustomerMeasurement) {
    c.not_blank(&m.label, "label");
    for (name, value) in &m.values {
        if !(value.is_finite() && *value > 0.0) {
            c.violations.push(Violation::new(
                format!("values.{name}"),
                "must be a positive number",
            ));
        }
    }
}

fn check_order(c: &mut Checker, order: &Order) {
    c.not_blank(&order.order_number, "order_number");
    c.ensure(order.total >= 0, "total", "must not be negative");
    c.ensure(
        order.deposit >= 0 && order.deposit <= order.total,
        "deposit",
        "must be between 0 and total",
    );
}

fn check_invoice(c: &mut Checker, invoice: &Invoice) {
    c.not_blank(&invoice.invoice_number, "invoice_number");
    c.ensure(invoice.total >= 0, "total", "must not be negative");
    c.ensure(
        invoice.paid_amount >= 0 && invoice.paid_amount <= invoice.total,
        "paid_amount",
        "must be between 0 and total",
    );
}

fn check_invoice_item(c: &mut Checker, item: &InvoiceItem) {
    c.not_blank(&item.description, "description");
    c.ensure(item.quantity > 0, "quantity", "must be positive");
    c.ensure(item.unit_price >= 0, "unit_price", "must not be negative");
    match item.quantity.checked_mul(item.unit_price) {
        Some(expected) => c.ensure(
            item.total_price == expected,
            "total_price",
            "must equal quantity * unit_price",
        ),
        None => c.ensure(false, "total_price", "quantity * unit_price overflows"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::EntityId;
    use crate::records::InvoiceStatus;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn invoice(total: i64, paid_amount: i64) -> EntityBody {
        EntityBody::Invoice(Invoice {
            customer_id: EntityId::new(),
            order_id: None,
            invoice_number: "INV-7".into(),
            status: InvoiceStatus::Pending,
            total,
            paid_amount,
            due_date: None,
        })
    }

    fn fields(violations: &[Violation]) -> Vec<&str> {
        violations.iter().map(|v| v.field.as_str()).collect()
    }

    #[test]
    fn valid_invoice_has_no_violations() {
        assert!(validate(&invoice(100_000, 0)).is_empty());
        assert!(validate(&invoice(100_000, 100_000)).is_empty());
    }

    #[test]
    fn negative_total_reports_total_then_paid_amount() {
        let violations = validate(&invoice(-5, 0));
        assert_eq!(fields(&violations), vec!["total", "paid_amount"]);
    }

    #[test]
    fn overpaid_invoice() {
        let violations = validate(&invoice(10, 11));
        assert_eq!(fields(&violations), vec!["paid_amount"]);
    }

    #[test]
    fn invoice_item_total_must_match() {
        let mut item = InvoiceItem::priced(EntityId::new(), "Hemming", 3, 1_500);
        assert!(validate(&EntityBody::InvoiceItem(item.clone())).is_empty());

        item.total_price = 4_000;
        let violations = validate(&EntityBody::InvoiceItem(item));
        assert_eq!(fields(&violations), vec!["total_price"]);
    }

    #[test]
    fn invoice_item_overflow_is_a_violation() {
        let item = InvoiceItem {
            invoice_id: EntityId::new(),
            description: "Bulk".into(),
            quantity: i64::MAX,
            unit_price: 2,
            total_price: 0,
        };
        let violations = validate(&EntityBody::InvoiceItem(item));
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("overflows"));
    }

    #[test]
    fn role_permissions_rules() {
        let role = EntityBody::Role(Role {
            name: " ".into(),
            description: None,
            permissions: vec!["invoices.read".into(), "".into(), "invoices.read".into()],
        });
        let violations = validate(&role);
        assert_eq!(fields(&violations), vec!["name", "permissions", "permissions"]);
        assert!(violations[2].message.contains("duplicate"));
    }

    #[test]
    fn measurement_values_must_be_positive_and_finite() {
        let mut values = BTreeMap::new();
        values.insert("chest".to_string(), 96.5);
        values.insert("sleeve".to_string(), f64::NAN);
        values.insert("waist".to_string(), 0.0);
        let body = EntityBody::CustomerMeasurement(CustomerMeasurement {
            customer_id: EntityId::new(),
            label: "Suit".into(),
            values,
            unit: "cm".into(),
            notes: None,
        });

        assert_eq!(
            fields(&validate(&body)),
            vec!["values.sleeve", "values.waist"]
        );
    }

    #[test]
    fn customer_email_is_optional() {
        let mut customer = Customer {
            name: "Ada".into(),
            phone: None,
            email: None,
            address: None,
            notes: None,
        };
        assert!(validate(&EntityBody::Customer(customer.clone())).is_empty());

        customer.email = Some("not-an-email".into());
        assert_eq!(
            fields(&validate(&EntityBody::Customer(customer))),
            vec!["email"]
        );
    }

    proptest! {
        #[test]
        fn invoice_amount_rules(total in -1_000i64..1_000, paid_amount in -1_000i64..1_000) {
            let mut expected = Vec::new();
            if total < 0 {
                expected.push("total");
            }
            if paid_amount < 0 || paid_amount > total {
                expected.push("paid_amount");
            }
            let violations = validate(&invoice(total, paid_amount));
            prop_assert_eq!(fields(&violations), expected);
        }

        #[test]
        fn priced_items_only_break_sign_rules(quantity in -5i64..50, unit_price in -5i64..10_000) {
            let item = InvoiceItem::priced(EntityId::new(), "Alteration", quantity, unit_price);
            let mut expected = Vec::new();
            if quantity <= 0 {
                expected.push("quantity");
            }
            if unit_price < 0 {
                expected.push("unit_price");
            }
            let violations = validate(&EntityBody::InvoiceItem(item));
            prop_assert_eq!(fields(&violations), expected);
        }

        #[test]
        fn blank_names_are_always_reported(name in "[ \t]{0,6}", email in "[a-z]{1,8}") {
            let body = EntityBody::Customer(Customer {
                name,
                phone: None,
                email: Some(email),
                address: None,
                notes: None,
            });
            let violations = validate(&body);
            prop_assert_eq!(fields(&violations), vec!["name", "email"]);
        }
    }
}
