//! In-memory image of the log.
//!
//! The image is rebuilt by replaying frames on open and updated in place by
//! transactions. Every mutation goes through [`State::apply`], which returns
//! the undo step that reverses it.

use crate::error::{CoreError, CoreResult};
use crate::filter::ListFilter;
use crate::log::LogOp;
use atelier_model::{Entity, EntityId, EntityKind};
use std::collections::{BTreeMap, HashMap};

/// A stored entity and its insertion position.
#[derive(Debug, Clone)]
pub(crate) struct Row {
    pub(crate) seq: u64,
    pub(crate) entity: Entity,
}

/// Rows of one entity kind.
#[derive(Debug, Default)]
pub(crate) struct Table {
    rows: HashMap<EntityId, Row>,
    order: BTreeMap<u64, EntityId>,
}

impl Table {
    pub(crate) fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.rows.get(id).map(|row| &row.entity)
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    /// Rows in insertion order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Row> + '_ {
        self.order.values().filter_map(|id| self.rows.get(id))
    }

    fn set(&mut self, id: EntityId, row: Option<Row>) {
        if let Some(old) = self.rows.remove(&id) {
            if self.order.get(&old.seq) == Some(&id) {
                self.order.remove(&old.seq);
            }
        }
        if let Some(row) = row {
            self.order.insert(row.seq, id);
            self.rows.insert(id, row);
        }
    }
}

/// Reverses one applied operation.
#[derive(Debug)]
pub(crate) enum Undo {
    Row {
        kind: EntityKind,
        id: EntityId,
        prev: Option<Row>,
    },
    Aux {
        ns: String,
        key: u64,
        prev: Option<Vec<u8>>,
    },
}

/// The full store image.
#[derive(Debug, Default)]
pub(crate) struct State {
    tables: HashMap<EntityKind, Table>,
    aux: HashMap<String, BTreeMap<u64, Vec<u8>>>,
    next_seq: u64,
}

impl State {
    pub(crate) fn table(&self, kind: EntityKind) -> Option<&Table> {
        self.tables.get(&kind)
    }

    pub(crate) fn get(&self, kind: EntityKind, id: &EntityId) -> Option<&Entity> {
        self.tables.get(&kind).and_then(|t| t.get(id))
    }

    pub(crate) fn list(&self, kind: EntityKind, filter: &ListFilter) -> Vec<Entity> {
        self.list_where(kind, |e| filter.matches(e), filter)
    }

    pub(crate) fn list_where<P>(&self, kind: EntityKind, pred: P, filter: &ListFilter) -> Vec<Entity>
    where
        P: Fn(&Entity) -> bool,
    {
        let matched = self
            .tables
            .get(&kind)
            .map(|t| {
                t.iter()
                    .map(|row| &row.entity)
                    .filter(|e| pred(e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        filter.finish(matched)
    }

    pub(crate) fn aux_get(&self, ns: &str, key: u64) -> Option<&Vec<u8>> {
        self.aux.get(ns).and_then(|m| m.get(&key))
    }

    pub(crate) fn aux_iter<'a>(&'a self, ns: &str) -> impl Iterator<Item = (u64, &'a Vec<u8>)> + 'a {
        self.aux
            .get(ns)
            .into_iter()
            .flat_map(|m| m.iter().map(|(k, v)| (*k, v)))
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub(crate) fn set_next_seq(&mut self, seq: u64) {
        self.next_seq = seq;
    }

    /// Applies one operation and returns what undoes it.
    pub(crate) fn apply(&mut self, op: &LogOp) -> CoreResult<Vec<Undo>> {
        match op {
            LogOp::Put(entity) => {
                let kind = entity.kind();
                let id = entity.id();
                let table = self.tables.entry(kind).or_default();
                let prev = table.rows.get(&id).cloned();
                let seq = match &prev {
                    Some(row) => row.seq,
                    None => {
                        let seq = self.next_seq;
                        self.next_seq += 1;
                        seq
                    }
                };
                table.set(
                    id,
                    Some(Row {
                        seq,
                        entity: entity.clone(),
                    }),
                );
                Ok(vec![Undo::Row { kind, id, prev }])
            }
            LogOp::Remove { kind, id } => {
                let table = self.tables.entry(*kind).or_default();
                let prev = table.rows.get(id).cloned();
                if prev.is_none() {
                    return Err(CoreError::NotFound { kind: *kind, id: *id });
                }
                table.set(*id, None);
                Ok(vec![Undo::Row {
                    kind: *kind,
                    id: *id,
                    prev,
                }])
            }
            LogOp::Rename { kind, from, to } => {
                let table = self.tables.entry(*kind).or_default();
                if table.rows.contains_key(to) {
                    return Err(CoreError::invalid_operation(format!(
                        "cannot rename {kind} {from} to {to}: target exists"
                    )));
                }
                let Some(prev) = table.rows.get(from).cloned() else {
                    return Err(CoreError::NotFound {
                        kind: *kind,
                        id: *from,
                    });
                };
                let mut moved = prev.clone();
                moved.entity.meta.id = *to;
                table.set(*from, None);
                table.set(*to, Some(moved));
                // Undo runs in reverse: drop `to` first, then restore `from`.
                Ok(vec![
                    Undo::Row {
                        kind: *kind,
                        id: *from,
                        prev: Some(prev),
                    },
                    Undo::Row {
                        kind: *kind,
                        id: *to,
                        prev: None,
                    },
                ])
            }
            LogOp::PutAux { ns, key, value } => {
                let prev = self
                    .aux
                    .entry(ns.clone())
                    .or_default()
                    .insert(*key, value.clone());
                Ok(vec![Undo::Aux {
                    ns: ns.clone(),
                    key: *key,
                    prev,
                }])
            }
            LogOp::RemoveAux { ns, key } => {
                let prev = self.aux.get_mut(ns).and_then(|m| m.remove(key));
                Ok(vec![Undo::Aux {
                    ns: ns.clone(),
                    key: *key,
                    prev,
                }])
            }
        }
    }

    /// Reverts one undo step.
    pub(crate) fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Row { kind, id, prev } => {
                self.tables.entry(kind).or_default().set(id, prev);
            }
            Undo::Aux { ns, key, prev } => {
                let space = self.aux.entry(ns).or_default();
                match prev {
                    Some(value) => {
                        space.insert(key, value);
                    }
                    None => {
                        space.remove(&key);
                    }
                }
            }
        }
    }

    /// Operations that rebuild this image from scratch, in insertion order.
    pub(crate) fn snapshot(&self) -> Vec<LogOp> {
        let mut rows: Vec<&Row> = self.tables.values().flat_map(|t| t.rows.values()).collect();
        rows.sort_by_key(|row| row.seq);

        let mut ops: Vec<LogOp> = rows
            .into_iter()
            .map(|row| LogOp::Put(row.entity.clone()))
            .collect();
        let mut spaces: Vec<(&String, &BTreeMap<u64, Vec<u8>>)> = self.aux.iter().collect();
        spaces.sort_by(|a, b| a.0.cmp(b.0));
        for (ns, values) in spaces {
            ops.extend(values.iter().map(|(key, value)| LogOp::PutAux {
                ns: ns.clone(),
                key: *key,
                value: value.clone(),
            }));
        }
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_model::{Customer, EntityBody, Timestamp};

    fn customer(name: &str) -> Entity {
        Entity::new_local(
            EntityBody::Customer(Customer {
                name: name.into(),
                phone: None,
                email: None,
                address: None,
                notes: None,
            }),
            Timestamp::from_millis(1),
        )
    }

    fn names(state: &State) -> Vec<String> {
        state
            .table(EntityKind::Customer)
            .map(|t| {
                t.iter()
                    .map(|row| match &row.entity.body {
                        EntityBody::Customer(c) => c.name.clone(),
                        _ => unreachable!(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn rename_keeps_position() {
        let mut state = State::default();
        let a = customer("a");
        let b = customer("b");
        state.apply(&LogOp::Put(a.clone())).unwrap();
        state.apply(&LogOp::Put(b.clone())).unwrap();

        let new_id = EntityId::new();
        state
            .apply(&LogOp::Rename {
                kind: EntityKind::Customer,
                from: a.id(),
                to: new_id,
            })
            .unwrap();

        assert_eq!(names(&state), vec!["a", "b"]);
        assert!(state.get(EntityKind::Customer, &a.id()).is_none());
        assert_eq!(
            state.get(EntityKind::Customer, &new_id).unwrap().id(),
            new_id
        );
    }

    #[test]
    fn undo_restores_everything() {
        let mut state = State::default();
        let a = customer("a");
        state.apply(&LogOp::Put(a.clone())).unwrap();

        let mut undo = Vec::new();
        let mut renamed = customer("b");
        let new_id = renamed.id();
        undo.extend(state.apply(&LogOp::Put(renamed.clone())).unwrap());
        renamed.meta.id = EntityId::new();
        undo.extend(
            state
                .apply(&LogOp::Rename {
                    kind: EntityKind::Customer,
                    from: a.id(),
                    to: renamed.id(),
                })
                .unwrap(),
        );
        undo.extend(
            state
                .apply(&LogOp::PutAux {
                    ns: "q".into(),
                    key: 1,
                    value: vec![7],
                })
                .unwrap(),
        );
        undo.extend(
            state
                .apply(&LogOp::Remove {
                    kind: EntityKind::Customer,
                    id: new_id,
                })
                .unwrap(),
        );

        for step in undo.into_iter().rev() {
            state.revert(step);
        }

        assert_eq!(names(&state), vec!["a"]);
        assert!(state.get(EntityKind::Customer, &a.id()).is_some());
        assert!(state.aux_get("q", 1).is_none());
    }

    #[test]
    fn remove_missing_is_not_found() {
        let mut state = State::default();
        let err = state
            .apply(&LogOp::Remove {
                kind: EntityKind::Order,
                id: EntityId::new(),
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let mut state = State::default();
        for name in ["x", "y", "z"] {
            state.apply(&LogOp::Put(customer(name))).unwrap();
        }

        let mut rebuilt = State::default();
        for op in state.snapshot() {
            rebuilt.apply(&op).unwrap();
        }
        assert_eq!(names(&rebuilt), vec!["x", "y", "z"]);
    }
}
