// Entity State & Action - change-tracking state machine vocabulary

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    Detached,
    Added,
    Modified,
    Deleted,
    Unchanged,
}

impl EntityState {
    pub fn is_detached(self) -> bool {
        self == EntityState::Detached
    }

    pub fn is_added(self) -> bool {
        self == EntityState::Added
    }

    pub fn is_modified(self) -> bool {
        self == EntityState::Modified
    }

    pub fn is_deleted(self) -> bool {
        self == EntityState::Deleted
    }

    pub fn is_unchanged(self) -> bool {
        self == EntityState::Unchanged
    }

    pub fn is_unchanged_or_modified(self) -> bool {
        matches!(self, EntityState::Unchanged | EntityState::Modified)
    }

    pub fn is_added_modified_or_deleted(self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            EntityState::Detached => "Detached",
            EntityState::Added => "Added",
            EntityState::Modified => "Modified",
            EntityState::Deleted => "Deleted",
            EntityState::Unchanged => "Unchanged",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Detached" => Some(EntityState::Detached),
            "Added" => Some(EntityState::Added),
            "Modified" => Some(EntityState::Modified),
            "Deleted" => Some(EntityState::Deleted),
            "Unchanged" => Some(EntityState::Unchanged),
            _ => None,
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why an entity changed; the tag on manager-wide change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityAction {
    Attach,
    AttachOnQuery,
    AttachOnImport,
    Detach,
    MergeOnQuery,
    MergeOnImport,
    MergeOnSave,
    PropertyChange,
    EntityStateChange,
    AcceptChanges,
    RejectChanges,
    Clear,
}

impl EntityAction {
    pub fn is_attach(self) -> bool {
        matches!(
            self,
            EntityAction::Attach | EntityAction::AttachOnQuery | EntityAction::AttachOnImport
        )
    }

    pub fn is_detach(self) -> bool {
        matches!(self, EntityAction::Detach | EntityAction::Clear)
    }

    pub fn is_merge(self) -> bool {
        matches!(
            self,
            EntityAction::MergeOnQuery | EntityAction::MergeOnImport | EntityAction::MergeOnSave
        )
    }

    /// Changes originating from local edits rather than server or import data.
    pub fn is_modification(self) -> bool {
        matches!(
            self,
            EntityAction::PropertyChange
                | EntityAction::EntityStateChange
                | EntityAction::AcceptChanges
                | EntityAction::RejectChanges
        )
    }
}
