// Relation Index - navigation edges between cached entities
// The "other side" of a relationship is always looked up here, never stored on the entity.

use std::collections::HashMap;

use crate::core::strong_types::EntityId;

/// Members of a collection navigation plus the entities currently being
/// added to it (guards against mutual re-entry with the inverse scalar).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationArray {
    items: Vec<EntityId>,
    adds_in_process: Vec<EntityId>,
}

impl RelationArray {
    pub fn items(&self) -> &[EntityId] {
        &self.items
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.items.contains(&entity)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn is_adding(&self, entity: EntityId) -> bool {
        self.adds_in_process.contains(&entity)
    }

    pub(crate) fn begin_adds(&mut self, entities: &[EntityId]) {
        self.adds_in_process.extend_from_slice(entities);
    }

    pub(crate) fn end_adds(&mut self, entities: &[EntityId]) {
        self.adds_in_process.retain(|e| !entities.contains(e));
    }

    /// Insert at `position` (clamped to the length).
    pub(crate) fn insert_all(&mut self, position: usize, entities: &[EntityId]) {
        let at = position.min(self.items.len());
        self.items.splice(at..at, entities.iter().copied());
    }

    pub(crate) fn remove_range(&mut self, start: usize, count: usize) -> Vec<EntityId> {
        let start = start.min(self.items.len());
        let end = start.saturating_add(count).min(self.items.len());
        self.items.drain(start..end).collect()
    }

    pub(crate) fn remove(&mut self, entity: EntityId) -> bool {
        match self.items.iter().position(|e| *e == entity) {
            Some(ix) => {
                self.items.remove(ix);
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) -> Vec<EntityId> {
        std::mem::take(&mut self.items)
    }
}

/// entity -> navigation property -> related entity (or entities)
#[derive(Debug, Default)]
pub struct RelationIndex {
    scalars: HashMap<EntityId, HashMap<String, EntityId>>,
    collections: HashMap<EntityId, HashMap<String, RelationArray>>,
}

impl RelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(&self, entity: EntityId, nav: &str) -> Option<EntityId> {
        self.scalars
            .get(&entity)
            .and_then(|navs| navs.get(nav))
            .copied()
    }

    pub fn collection(&self, entity: EntityId, nav: &str) -> &[EntityId] {
        self.array(entity, nav).map(RelationArray::items).unwrap_or(&[])
    }

    pub fn array(&self, entity: EntityId, nav: &str) -> Option<&RelationArray> {
        self.collections.get(&entity).and_then(|navs| navs.get(nav))
    }

    pub(crate) fn set_scalar(&mut self, entity: EntityId, nav: &str, target: Option<EntityId>) {
        match target {
            Some(target) => {
                self.scalars
                    .entry(entity)
                    .or_default()
                    .insert(nav.to_string(), target);
            }
            None => {
                if let Some(navs) = self.scalars.get_mut(&entity) {
                    navs.remove(nav);
                }
            }
        }
    }

    pub(crate) fn array_mut(&mut self, entity: EntityId, nav: &str) -> &mut RelationArray {
        self.collections
            .entry(entity)
            .or_default()
            .entry(nav.to_string())
            .or_default()
    }

    pub(crate) fn remove_entity(&mut self, entity: EntityId) {
        self.scalars.remove(&entity);
        self.collections.remove(&entity);
    }

    pub fn clear(&mut self) {
        self.scalars.clear();
        self.collections.clear();
    }
}
