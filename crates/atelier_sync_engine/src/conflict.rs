//! Conflict detection and resolution policy.
//!
//! The engine asks [`decide`] what to do once the remote answers `Conflict`
//! and the current remote version has been fetched. The decision is pure so
//! the policy can be tested without a store or a remote.

use crate::config::SyncConfig;
use atelier_model::{Entity, EntityKind, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a manually flagged conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Keep the local version and push it again on top of the remote one.
    KeepLocal,
    /// Discard the local write and adopt the remote version.
    AcceptRemote,
}

/// Outcome of the automatic policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The remote version is newer: overwrite the local record.
    AcceptRemote,
    /// The local write is newer: retry it based on the remote version.
    Rebase,
    /// No safe automatic answer: flag the entity for manual review.
    Manual(ManualReason),
}

/// Why a conflict could not be resolved automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualReason {
    /// The remote record disappeared, or did not move past the base version.
    RemoteMissing,
    /// Both versions carry the same timestamp.
    Ambiguous,
    /// The kind never lets a local write override a remote one.
    NoAutoMerge,
    /// The write was already rebased too many times.
    RebaseBudget,
}

impl fmt::Display for ManualReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ManualReason::RemoteMissing => "remote version missing or not newer than base",
            ManualReason::Ambiguous => "local and remote versions carry the same timestamp",
            ManualReason::NoAutoMerge => "kind requires manual review of concurrent edits",
            ManualReason::RebaseBudget => "rebase budget exhausted",
        })
    }
}

/// The facts the policy looks at.
#[derive(Debug, Clone, Copy)]
pub struct ConflictCase<'a> {
    /// Kind of the conflicting record.
    pub kind: EntityKind,
    /// Remote version the local write was based on.
    pub base_version: Option<Timestamp>,
    /// Time of the local write.
    pub written_at: Timestamp,
    /// Current remote record, if any.
    pub remote: Option<&'a Entity>,
    /// Rebases already spent on this write.
    pub rebases: u32,
}

/// Applies last-writer-wins with the safety exceptions.
///
/// A strictly newer remote version always wins, also for no-auto-merge kinds:
/// accepting it never discards data the remote does not already hold.
pub fn decide(case: &ConflictCase<'_>, config: &SyncConfig) -> Decision {
    let Some(remote) = case.remote else {
        return Decision::Manual(ManualReason::RemoteMissing);
    };
    let remote_version = remote.last_modified();
    if case.base_version.is_some_and(|base| remote_version <= base) {
        return Decision::Manual(ManualReason::RemoteMissing);
    }

    if remote_version > case.written_at {
        Decision::AcceptRemote
    } else if remote_version == case.written_at {
        Decision::Manual(ManualReason::Ambiguous)
    } else if config.is_no_auto_merge(case.kind) {
        Decision::Manual(ManualReason::NoAutoMerge)
    } else if case.rebases >= config.max_conflict_rebases {
        Decision::Manual(ManualReason::RebaseBudget)
    } else {
        Decision::Rebase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_model::{Customer, EntityBody};

    fn remote_at(millis: i64) -> Entity {
        let mut entity = Entity::new_local(
            EntityBody::Customer(Customer {
                name: "remote".into(),
                phone: None,
                email: None,
                address: None,
                notes: None,
            }),
            Timestamp::from_millis(1),
        );
        entity.meta.updated_at = Some(Timestamp::from_millis(millis));
        entity
    }

    fn case(kind: EntityKind, remote: Option<&Entity>, written_at: i64) -> ConflictCase<'_> {
        ConflictCase {
            kind,
            base_version: Some(Timestamp::from_millis(10)),
            written_at: Timestamp::from_millis(written_at),
            remote,
            rebases: 0,
        }
    }

    #[test]
    fn newer_remote_wins() {
        let config = SyncConfig::default();
        let remote = remote_at(50);
        assert_eq!(
            decide(&case(EntityKind::Customer, Some(&remote), 40), &config),
            Decision::AcceptRemote
        );
        assert_eq!(
            decide(&case(EntityKind::Invoice, Some(&remote), 40), &config),
            Decision::AcceptRemote
        );
    }

    #[test]
    fn newer_local_rebases_unless_no_auto_merge() {
        let config = SyncConfig::default();
        let remote = remote_at(30);
        assert_eq!(
            decide(&case(EntityKind::Customer, Some(&remote), 40), &config),
            Decision::Rebase
        );
        assert_eq!(
            decide(&case(EntityKind::Invoice, Some(&remote), 40), &config),
            Decision::Manual(ManualReason::NoAutoMerge)
        );
    }

    #[test]
    fn equal_timestamps_are_ambiguous() {
        let remote = remote_at(40);
        assert_eq!(
            decide(&case(EntityKind::Order, Some(&remote), 40), &SyncConfig::default()),
            Decision::Manual(ManualReason::Ambiguous)
        );
    }

    #[test]
    fn missing_or_stale_remote_needs_review() {
        let config = SyncConfig::default();
        assert_eq!(
            decide(&case(EntityKind::Customer, None, 40), &config),
            Decision::Manual(ManualReason::RemoteMissing)
        );
        let stale = remote_at(10);
        assert_eq!(
            decide(&case(EntityKind::Customer, Some(&stale), 40), &config),
            Decision::Manual(ManualReason::RemoteMissing)
        );
    }

    #[test]
    fn rebase_budget_is_bounded() {
        let config = SyncConfig::default().with_max_conflict_rebases(2);
        let remote = remote_at(30);
        let mut spent = case(EntityKind::Customer, Some(&remote), 40);
        spent.rebases = 2;
        assert_eq!(
            decide(&spent, &config),
            Decision::Manual(ManualReason::RebaseBudget)
        );
    }
}
