//! List filters.

use atelier_model::{Entity, EntityId, EntityKind, SyncState};

/// Sort order for [`ListFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrder {
    /// Order of first insertion (the default).
    #[default]
    Insertion,
    /// Oldest `created_at` first.
    CreatedAsc,
    /// Newest `created_at` first.
    CreatedDesc,
    /// Most recently modified first.
    ModifiedDesc,
}

/// Narrows and orders a `list` call.
///
/// ```rust
/// use atelier_core::{ListFilter, ListOrder};
/// use atelier_model::SyncState;
///
/// let filter = ListFilter::new()
///     .sync_state(SyncState::PendingCreate)
///     .order(ListOrder::CreatedDesc)
///     .limit(20);
/// assert_eq!(filter.limit, Some(20));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only entities in this sync state.
    pub sync_state: Option<SyncState>,
    /// Only entities referencing this entity.
    pub references: Option<(EntityKind, EntityId)>,
    /// Whether entities pending deletion are included (default: yes).
    pub exclude_pending_delete: bool,
    /// Result order.
    pub order: ListOrder,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl ListFilter {
    /// Creates an empty filter matching everything in insertion order.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps only entities in `state`.
    #[must_use]
    pub fn sync_state(mut self, state: SyncState) -> Self {
        self.sync_state = Some(state);
        self
    }

    /// Keeps only entities holding a reference to `(kind, id)`.
    #[must_use]
    pub fn referencing(mut self, kind: EntityKind, id: EntityId) -> Self {
        self.references = Some((kind, id));
        self
    }

    /// Drops entities whose deletion is still pending.
    #[must_use]
    pub fn live_only(mut self) -> Self {
        self.exclude_pending_delete = true;
        self
    }

    /// Sets the result order.
    #[must_use]
    pub fn order(mut self, order: ListOrder) -> Self {
        self.order = order;
        self
    }

    /// Caps the number of results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if `entity` passes the predicates (order and limit aside).
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        if self
            .sync_state
            .is_some_and(|state| entity.sync_state() != state)
        {
            return false;
        }
        if self.exclude_pending_delete && entity.sync_state() == SyncState::PendingDelete {
            return false;
        }
        if let Some((kind, id)) = self.references {
            if !entity
                .body
                .references()
                .iter()
                .any(|r| r.kind == kind && r.id == id)
            {
                return false;
            }
        }
        true
    }

    /// Orders and truncates already-matched entities given in insertion order.
    pub(crate) fn finish(&self, mut entities: Vec<Entity>) -> Vec<Entity> {
        match self.order {
            ListOrder::Insertion => {}
            ListOrder::CreatedAsc => entities.sort_by_key(|e| e.meta.created_at),
            ListOrder::CreatedDesc => {
                entities.sort_by(|a, b| b.meta.created_at.cmp(&a.meta.created_at));
            }
            ListOrder::ModifiedDesc => {
                entities.sort_by(|a, b| b.last_modified().cmp(&a.last_modified()));
            }
        }
        if let Some(limit) = self.limit {
            entities.truncate(limit);
        }
        entities
    }
}
