// Strong Types - handles for entities and managers
// Entities are addressed by handle; the owning manager's arena holds the data.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_MANAGER_ID: AtomicU32 = AtomicU32::new(1);

/// Strongly-typed manager identifier - every `EntityManager` gets a fresh one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManagerId(pub u32);

impl ManagerId {
    /// Allocate the next process-unique manager id
    pub fn next() -> Self {
        Self(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "em{}", self.0)
    }
}

/// Strongly-typed entity handle.
///
/// Layout: `[manager:32][arena index:32]`. The handle stays valid across
/// attach, detach and key changes; only the arena slot it points at changes
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn from_parts(manager: ManagerId, index: u32) -> Self {
        Self(((manager.0 as u64) << 32) | index as u64)
    }

    pub fn manager_id(self) -> ManagerId {
        ManagerId((self.0 >> 32) as u32)
    }

    pub fn index(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.manager_id(), self.index())
    }
}

impl From<u64> for EntityId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_parts() {
        let manager = ManagerId(7);
        let id = EntityId::from_parts(manager, 42);
        assert_eq!(id.manager_id(), manager);
        assert_eq!(id.index(), 42);
        assert_eq!(id.to_string(), "em7#42");
    }

    #[test]
    fn test_manager_ids_are_unique() {
        let a = ManagerId::next();
        let b = ManagerId::next();
        assert_ne!(a, b);
    }
}
