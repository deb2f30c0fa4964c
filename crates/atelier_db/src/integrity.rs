//! Referential rules checked inside the write transaction.
//!
//! - a reference must point at an existing record that is not being deleted
//! - deleting a customer removes its measurements, deleting an invoice
//!   removes its items
//! - a customer referenced by orders or invoices, an order referenced by
//!   invoices and a role referenced by users cannot be deleted

use crate::error::{DbError, DbResult};
use atelier_core::Transaction;
use atelier_model::{Entity, EntityBody, EntityId, EntityKind, SyncState, Violation};

pub(crate) fn check_references(txn: &Transaction<'_>, body: &EntityBody) -> Vec<Violation> {
    body.references()
        .into_iter()
        .filter_map(|reference| match txn.get(reference.kind, &reference.id) {
            None => Some(Violation::new(
                reference.field,
                format!("references unknown {} {}", reference.kind, reference.id),
            )),
            Some(target) if target.sync_state() == SyncState::PendingDelete => Some(Violation::new(
                reference.field,
                format!("references {} {} which is being deleted", reference.kind, reference.id),
            )),
            Some(_) => None,
        })
        .collect()
}

fn live_referrers(
    txn: &Transaction<'_>,
    among: EntityKind,
    kind: EntityKind,
    id: EntityId,
) -> Vec<Entity> {
    txn.list_where(among, |e| {
        e.sync_state() != SyncState::PendingDelete
            && e.body
                .references()
                .iter()
                .any(|r| r.kind == kind && r.id == id)
    })
}

/// Returns the records to delete, dependents first and `root` last.
pub(crate) fn deletion_plan(txn: &Transaction<'_>, root: Entity) -> DbResult<Vec<Entity>> {
    let (kind, id) = (root.kind(), root.id());

    let violations: Vec<Violation> = kind.delete_blockers()
        .iter()
        .filter_map(|&among| {
            let count = live_referrers(txn, among, kind, id).len();
            (count > 0).then(|| {
                Violation::new("id", format!("{kind} is referenced by {count} {among} record(s)"))
            })
        })
        .collect();
    if !violations.is_empty() {
        return Err(DbError::Validation(violations));
    }

    let mut plan: Vec<Entity> = kind.cascade_dependents()
        .iter()
        .flat_map(|&among| live_referrers(txn, among, kind, id))
        .collect();
    plan.push(root);

    if let Some(conflicted) = plan.iter().find(|e| e.sync_state() == SyncState::Conflict) {
        return Err(DbError::InvalidState {
            kind: conflicted.kind(),
            id: conflicted.id(),
            state: SyncState::Conflict,
            message: "resolve the sync conflict before deleting".into(),
        });
    }
    Ok(plan)
}
