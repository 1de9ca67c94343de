// Unattached Children - entities waiting for a parent that is not cached yet

use std::collections::HashMap;

use crate::core::entity_key::EntityKey;
use crate::core::strong_types::EntityId;

/// How a waiting child gets linked once its parent shows up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingLink {
    /// The child's scalar navigation to the parent.
    ChildNavigation(String),
    /// The parent's collection navigation; the child only carries a foreign key.
    ParentCollection(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnattachedChild {
    pub link: PendingLink,
    pub child: EntityId,
}

/// parent key -> children waiting on it
#[derive(Debug, Default)]
pub struct UnattachedChildrenMap {
    map: HashMap<EntityKey, Vec<UnattachedChild>>,
}

impl UnattachedChildrenMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_child(&mut self, parent_key: EntityKey, link: PendingLink, child: EntityId) {
        let waiting = self.map.entry(parent_key).or_default();
        if !waiting.iter().any(|w| w.child == child && w.link == link) {
            waiting.push(UnattachedChild { link, child });
        }
    }

    /// Consume every child waiting on this parent.
    pub fn take_children(&mut self, parent_key: &EntityKey) -> Vec<UnattachedChild> {
        self.map.remove(parent_key).unwrap_or_default()
    }

    /// Forget a child wherever it is waiting (it was detached or relinked).
    pub fn remove_child(&mut self, child: EntityId) {
        self.map.retain(|_, waiting| {
            waiting.retain(|w| w.child != child);
            !waiting.is_empty()
        });
    }

    pub fn is_waiting(&self, parent_key: &EntityKey) -> bool {
        self.map.contains_key(parent_key)
    }

    pub fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_wait_until_taken() {
        let mut map = UnattachedChildrenMap::new();
        let parent = EntityKey::single("Customer", 5);
        let link = PendingLink::ChildNavigation("Customer".into());
        map.add_child(parent.clone(), link.clone(), EntityId::new(1));
        map.add_child(parent.clone(), link.clone(), EntityId::new(1));
        map.add_child(parent.clone(), link, EntityId::new(2));
        assert_eq!(map.len(), 2);

        map.remove_child(EntityId::new(2));
        let taken = map.take_children(&parent);
        assert_eq!(taken.len(), 1);
        assert!(!map.is_waiting(&parent));
        assert!(map.is_empty());
    }
}
