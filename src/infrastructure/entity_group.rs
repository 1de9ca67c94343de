// Entity Group - per-type slot storage with a key index and reusable slots

use std::collections::HashMap;

use crate::core::entity_key::EntityKey;
use crate::core::strong_types::EntityId;
use crate::error::{AppError, AppResult};

/// Slots never shift: detaching nulls a slot and records it for reuse, so
/// every other slot index stays stable.
#[derive(Debug, Clone)]
pub struct EntityGroup {
    entity_type: String,
    entities: Vec<Option<EntityId>>,
    index_map: HashMap<String, usize>,
    empty_indexes: Vec<usize>,
}

impl EntityGroup {
    pub fn new(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entities: Vec::new(),
            index_map: HashMap::new(),
            empty_indexes: Vec::new(),
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Returns the slot used. Re-attaching the same entity under the same
    /// key is a no-op; a different entity under that key is an error.
    pub fn attach_entity(&mut self, entity: EntityId, key: &EntityKey) -> AppResult<usize> {
        if let Some(&ix) = self.index_map.get(key.key_string()) {
            if self.entities.get(ix).copied().flatten() == Some(entity) {
                return Ok(ix);
            }
            return Err(AppError::DuplicateKey(key.to_string()));
        }
        let ix = match self.empty_indexes.pop() {
            Some(ix) => {
                self.entities[ix] = Some(entity);
                ix
            }
            None => {
                self.entities.push(Some(entity));
                self.entities.len() - 1
            }
        };
        self.index_map.insert(key.key_string().to_string(), ix);
        Ok(ix)
    }

    pub fn detach_entity(&mut self, key: &EntityKey) -> Option<EntityId> {
        let ix = self.index_map.remove(key.key_string())?;
        let entity = self.entities.get_mut(ix)?.take();
        self.empty_indexes.push(ix);
        entity
    }

    pub fn find_entity_by_key(&self, key: &EntityKey) -> Option<EntityId> {
        self.index_map
            .get(key.key_string())
            .and_then(|&ix| self.entities.get(ix).copied().flatten())
    }

    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.index_map.contains_key(key.key_string())
    }

    /// Move a slot's index entry to a new key without moving the slot.
    pub fn replace_key(&mut self, old_key: &EntityKey, new_key: &EntityKey) -> AppResult<()> {
        if old_key.key_string() == new_key.key_string() {
            return Ok(());
        }
        if self.index_map.contains_key(new_key.key_string()) {
            return Err(AppError::KeyCollision(new_key.to_string()));
        }
        let ix = self
            .index_map
            .remove(old_key.key_string())
            .ok_or_else(|| AppError::Internal(format!("{} is not in its group", old_key)))?;
        self.index_map.insert(new_key.key_string().to_string(), ix);
        Ok(())
    }

    /// Attached entities in slot order.
    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.iter().filter_map(|e| *e)
    }

    pub fn slot_of(&self, key: &EntityKey) -> Option<usize> {
        self.index_map.get(key.key_string()).copied()
    }

    pub fn len(&self) -> usize {
        self.index_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_map.is_empty()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.index_map.clear();
        self.empty_indexes.clear();
    }
}
