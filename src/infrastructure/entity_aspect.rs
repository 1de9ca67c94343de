// Entity Aspect - per-entity change-tracking record
// Holds the state, original-value snapshot, validation errors and the two aspect-level event streams.

use std::collections::HashMap;

use crate::core::data_value::DataValue;
use crate::core::entity_key::EntityKey;
use crate::core::entity_state::EntityState;
use crate::core::strong_types::EntityId;
use crate::ent_framework::validators::ValidationError;
use crate::infrastructure::events::{Event, PropertyChangedArgs, ValidationErrorsChangedArgs};

#[derive(Debug)]
pub struct EntityAspect {
    entity: EntityId,
    pub(crate) entity_state: EntityState,
    pub(crate) original_values: HashMap<String, DataValue>,
    pub(crate) has_temp_key: bool,
    pub(crate) is_being_saved: bool,
    pub(crate) key: Option<EntityKey>,
    /// Collection navigations that have been fully loaded from the server.
    pub(crate) loaded_navigations: Vec<String>,
    validation_errors: HashMap<String, ValidationError>,
    validation_depth: usize,
    pending_added: Vec<ValidationError>,
    pending_removed: Vec<ValidationError>,
    pub property_changed: Event<PropertyChangedArgs>,
    pub validation_errors_changed: Event<ValidationErrorsChangedArgs>,
}

impl EntityAspect {
    pub fn new(entity: EntityId) -> Self {
        Self {
            entity,
            entity_state: EntityState::Detached,
            original_values: HashMap::new(),
            has_temp_key: false,
            is_being_saved: false,
            key: None,
            loaded_navigations: Vec::new(),
            validation_errors: HashMap::new(),
            validation_depth: 0,
            pending_added: Vec::new(),
            pending_removed: Vec::new(),
            property_changed: Event::new("propertyChanged"),
            validation_errors_changed: Event::new("validationErrorsChanged"),
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn entity_state(&self) -> EntityState {
        self.entity_state
    }

    pub fn is_attached(&self) -> bool {
        !self.entity_state.is_detached()
    }

    pub fn original_values(&self) -> &HashMap<String, DataValue> {
        &self.original_values
    }

    pub fn has_temp_key(&self) -> bool {
        self.has_temp_key
    }

    pub fn is_being_saved(&self) -> bool {
        self.is_being_saved
    }

    /// Cached key; refreshed by the manager whenever a key property changes.
    pub fn key(&self) -> Option<&EntityKey> {
        self.key.as_ref()
    }

    pub fn was_loaded(&self, navigation_property: &str) -> bool {
        self.loaded_navigations.iter().any(|n| n == navigation_property)
    }

    pub(crate) fn mark_loaded(&mut self, navigation_property: &str) {
        if !self.was_loaded(navigation_property) {
            self.loaded_navigations.push(navigation_property.to_string());
        }
    }

    /// Snapshot the pre-change value the first time a property changes.
    pub(crate) fn snapshot_original(&mut self, property_name: &str, old_value: &DataValue) -> bool {
        if self.original_values.contains_key(property_name) {
            return false;
        }
        self.original_values
            .insert(property_name.to_string(), old_value.clone());
        true
    }

    pub fn has_validation_errors(&self) -> bool {
        !self.validation_errors.is_empty()
    }

    /// All errors, or only those for one property.
    pub fn get_validation_errors(&self, property_name: Option<&str>) -> Vec<ValidationError> {
        let mut errors: Vec<ValidationError> = self
            .validation_errors
            .values()
            .filter(|e| property_name.is_none() || e.property_name.as_deref() == property_name)
            .cloned()
            .collect();
        errors.sort_by_key(|e| e.key());
        errors
    }

    /// Open a validation batch; nested batches only publish from the outermost.
    pub(crate) fn begin_validation(&mut self) {
        self.validation_depth += 1;
    }

    /// Close a validation batch, returning the accumulated change when this
    /// was the outermost batch and something changed.
    pub(crate) fn end_validation(&mut self) -> Option<ValidationErrorsChangedArgs> {
        self.validation_depth = self.validation_depth.saturating_sub(1);
        if self.validation_depth > 0 {
            return None;
        }
        if self.pending_added.is_empty() && self.pending_removed.is_empty() {
            return None;
        }
        Some(ValidationErrorsChangedArgs {
            entity: self.entity,
            added: std::mem::take(&mut self.pending_added),
            removed: std::mem::take(&mut self.pending_removed),
        })
    }

    pub(crate) fn record_validation_error(&mut self, error: ValidationError) {
        let key = error.key();
        if self.validation_errors.get(&key) == Some(&error) {
            return;
        }
        if let Some(previous) = self.validation_errors.insert(key, error.clone()) {
            self.pending_removed.push(previous);
        }
        self.pending_added.push(error);
    }

    pub(crate) fn drop_validation_error(&mut self, key: &str) {
        if let Some(previous) = self.validation_errors.remove(key) {
            self.pending_removed.push(previous);
        }
    }

    /// Remove every error that the given (validator, property) pairs did not
    /// re-report; used after a property or entity validation pass.
    pub(crate) fn retain_validation_errors<F>(&mut self, mut keep: F)
    where
        F: FnMut(&ValidationError) -> bool,
    {
        let stale: Vec<String> = self
            .validation_errors
            .iter()
            .filter(|(_, e)| !keep(e))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.drop_validation_error(&key);
        }
    }

    pub(crate) fn reset_for_detach(&mut self) {
        self.entity_state = EntityState::Detached;
        self.original_values.clear();
        self.is_being_saved = false;
        self.has_temp_key = false;
        self.loaded_navigations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_original_snapshot_is_first_write_only() {
        let mut aspect = EntityAspect::new(EntityId::new(1));
        assert!(aspect.snapshot_original("Name", &"Foo".into()));
        assert!(!aspect.snapshot_original("Name", &"Bar".into()));
        assert_eq!(aspect.original_values()["Name"], "Foo".into());
    }

    #[test]
    fn test_nested_validation_publishes_once() {
        let mut aspect = EntityAspect::new(EntityId::new(1));
        aspect.begin_validation();
        aspect.begin_validation();
        aspect.record_validation_error(ValidationError::new("required", Some("Name"), "x"));
        assert!(aspect.end_validation().is_none());
        aspect.record_validation_error(ValidationError::new("maxLength", Some("Name"), "y"));
        let args = aspect.end_validation().unwrap();
        assert_eq!(args.added.len(), 2);
        assert!(args.removed.is_empty());

        aspect.begin_validation();
        aspect.retain_validation_errors(|e| e.validator_name == "required");
        let args = aspect.end_validation().unwrap();
        assert_eq!(args.removed.len(), 1);
        assert_eq!(aspect.get_validation_errors(Some("Name")).len(), 1);
    }

    #[test]
    fn test_unchanged_error_is_not_republished() {
        let mut aspect = EntityAspect::new(EntityId::new(1));
        let err = ValidationError::new("required", Some("Name"), "x");
        aspect.begin_validation();
        aspect.record_validation_error(err.clone());
        aspect.end_validation();
        aspect.begin_validation();
        aspect.record_validation_error(err);
        assert!(aspect.end_validation().is_none());
    }
}
