//! Atomic multi-record updates.

use crate::error::{CoreError, CoreResult};
use crate::filter::ListFilter;
use crate::log::LogOp;
use crate::state::{State, Undo};
use atelier_model::{validate, Entity, EntityId, EntityKind};

/// A write transaction.
///
/// Operations apply to the store image immediately, so later reads inside the
/// same transaction see earlier writes. Nothing is visible to other readers
/// until [`crate::LocalStore::transaction`] commits, and everything is rolled
/// back if the closure fails or the commit cannot be made durable.
///
/// The store's own read methods must not be called from inside the closure;
/// use the transaction's.
pub struct Transaction<'a> {
    state: &'a mut State,
    ops: Vec<LogOp>,
    undo: Vec<Undo>,
    start_seq: u64,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(state: &'a mut State) -> Self {
        let start_seq = state.next_seq();
        Self {
            state,
            ops: Vec::new(),
            undo: Vec::new(),
            start_seq,
        }
    }

    fn record(&mut self, op: LogOp) -> CoreResult<()> {
        let undo = self.state.apply(&op)?;
        self.undo.extend(undo);
        self.ops.push(op);
        Ok(())
    }

    /// Reads an entity, including this transaction's writes.
    #[must_use]
    pub fn get(&self, kind: EntityKind, id: &EntityId) -> Option<Entity> {
        self.state.get(kind, id).cloned()
    }

    /// Lists entities of `kind`, including this transaction's writes.
    #[must_use]
    pub fn list(&self, kind: EntityKind, filter: &ListFilter) -> Vec<Entity> {
        self.state.list(kind, filter)
    }

    /// Lists entities of `kind` matching `pred`, in insertion order.
    pub fn list_where<P>(&self, kind: EntityKind, pred: P) -> Vec<Entity>
    where
        P: Fn(&Entity) -> bool,
    {
        self.state.list_where(kind, pred, &ListFilter::default())
    }

    /// Inserts or replaces an entity after checking its fields.
    ///
    /// # Errors
    ///
    /// [`CoreError::Validation`] if the body breaks a field rule.
    pub fn put(&mut self, entity: Entity) -> CoreResult<()> {
        let violations = validate(&entity.body);
        if !violations.is_empty() {
            return Err(CoreError::Validation {
                kind: entity.kind(),
                id: entity.id(),
                violations,
            });
        }
        self.record(LogOp::Put(entity))
    }

    /// Physically removes an entity.
    ///
    /// # Errors
    ///
    /// [`crate::CoreError::NotFound`] if it does not exist.
    pub fn remove(&mut self, kind: EntityKind, id: EntityId) -> CoreResult<()> {
        self.record(LogOp::Remove { kind, id })
    }

    /// Moves an entity to a new identifier, keeping its list position.
    ///
    /// References held by other entities are not touched.
    ///
    /// # Errors
    ///
    /// Fails if `from` is missing or `to` is already taken.
    pub fn rename(&mut self, kind: EntityKind, from: EntityId, to: EntityId) -> CoreResult<()> {
        self.record(LogOp::Rename { kind, from, to })
    }

    /// Reads an auxiliary value.
    #[must_use]
    pub fn aux_get(&self, ns: &str, key: u64) -> Option<Vec<u8>> {
        self.state.aux_get(ns, key).cloned()
    }

    /// Lists an auxiliary keyspace in ascending key order.
    #[must_use]
    pub fn aux_list(&self, ns: &str) -> Vec<(u64, Vec<u8>)> {
        self.state
            .aux_iter(ns)
            .map(|(k, v)| (k, v.clone()))
            .collect()
    }

    /// Sets an auxiliary value.
    ///
    /// # Errors
    ///
    /// Propagates image errors.
    pub fn put_aux(&mut self, ns: &str, key: u64, value: Vec<u8>) -> CoreResult<()> {
        self.record(LogOp::PutAux {
            ns: ns.to_string(),
            key,
            value,
        })
    }

    /// Removes an auxiliary value; missing keys are ignored.
    ///
    /// # Errors
    ///
    /// Propagates image errors.
    pub fn remove_aux(&mut self, ns: &str, key: u64) -> CoreResult<()> {
        self.record(LogOp::RemoveAux {
            ns: ns.to_string(),
            key,
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn ops(&self) -> &[LogOp] {
        &self.ops
    }

    pub(crate) fn rollback(self) {
        let Transaction {
            state,
            undo,
            start_seq,
            ..
        } = self;
        for step in undo.into_iter().rev() {
            state.revert(step);
        }
        state.set_next_seq(start_seq);
    }
}
