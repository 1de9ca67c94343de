// State transitions, accept/reject and validation

use tracing::debug;

use super::{EntityManager, PendingEvent, WriteContext};
use crate::core::data_value::DataValue;
use crate::core::entity_state::{EntityAction, EntityState};
use crate::core::strong_types::EntityId;
use crate::ent_framework::validators::{ValidationContext, ValidationError};
use crate::error::{AppError, AppResult};
use crate::infrastructure::entity_aspect::EntityAspect;

impl EntityManager {
    pub fn set_unchanged(&mut self, id: EntityId) -> AppResult<()> {
        let aspect = &mut self.record_mut(id)?.aspect;
        if aspect.entity_state.is_detached() {
            return Err(AppError::InvalidOperation(
                "A detached entity cannot be marked Unchanged; attach it first".to_string(),
            ));
        }
        if aspect.entity_state.is_unchanged() {
            return Ok(());
        }
        aspect.original_values.clear();
        aspect.entity_state = EntityState::Unchanged;
        self.clear_temp_key(id)?;
        self.publish_entity_changed(EntityAction::EntityStateChange, id, None);
        self.update_has_changes(false, WriteContext::user());
        Ok(())
    }

    /// The entity's current key stops being temporary, both on the entity
    /// and in the generator's registry.
    pub(crate) fn clear_temp_key(&mut self, id: EntityId) -> AppResult<()> {
        let key = self.get_key(id)?;
        self.record_mut(id)?.aspect.has_temp_key = false;
        self.key_generator.remove_temp_key(&key);
        Ok(())
    }

    pub fn set_modified(&mut self, id: EntityId) -> AppResult<()> {
        let aspect = &mut self.record_mut(id)?.aspect;
        if aspect.entity_state.is_detached() {
            return Err(AppError::InvalidOperation(
                "A detached entity cannot be marked Modified".to_string(),
            ));
        }
        if aspect.entity_state.is_modified() {
            return Ok(());
        }
        aspect.entity_state = EntityState::Modified;
        self.publish_entity_changed(EntityAction::EntityStateChange, id, None);
        self.update_has_changes(true, WriteContext::user());
        Ok(())
    }

    /// Mark for deletion. An `Added` entity has nothing to delete on the
    /// server and is detached instead.
    pub fn set_deleted(&mut self, id: EntityId) -> AppResult<()> {
        let state = self.entity_state(id)?;
        match state {
            EntityState::Detached => Err(AppError::InvalidOperation(
                "A detached entity cannot be deleted".to_string(),
            )),
            EntityState::Deleted => Ok(()),
            EntityState::Added => self.detach_entity(id).map(|_| ()),
            _ => {
                let outer = self.begin_batch();
                self.record_mut(id)?.aspect.entity_state = EntityState::Deleted;
                let result = self.isolate_deleted(id);
                self.publish_entity_changed(EntityAction::EntityStateChange, id, None);
                self.update_has_changes(true, WriteContext::user());
                self.end_batch(outer);
                result
            }
        }
    }

    pub fn set_detached(&mut self, id: EntityId) -> AppResult<bool> {
        self.detach_entity(id)
    }

    /// Treat current values as saved: `Deleted` entities leave the cache,
    /// everything else becomes `Unchanged`.
    pub fn accept_changes(&mut self, id: EntityId) -> AppResult<()> {
        let state = self.entity_state(id)?;
        let outer = self.begin_batch();
        let result = match state {
            EntityState::Detached => Ok(()),
            EntityState::Deleted => self.detach_entity(id).map(|_| ()),
            _ => self.set_unchanged(id),
        };
        if result.is_ok() {
            self.publish_entity_changed(EntityAction::AcceptChanges, id, None);
        }
        self.end_batch(outer);
        result
    }

    /// Restore original values; `Added` entities are detached and `Deleted`
    /// ones are relinked to their related entities.
    pub fn reject_entity_changes(&mut self, id: EntityId) -> AppResult<()> {
        let outer = self.begin_batch();
        let result = self.reject_entity_changes_with(id, WriteContext::user());
        self.end_batch(outer);
        result
    }

    fn reject_entity_changes_with(&mut self, id: EntityId, notify: WriteContext) -> AppResult<()> {
        let state = self.entity_state(id)?;
        if state.is_detached() {
            return Ok(());
        }
        let originals: Vec<(String, DataValue)> = self
            .record(id)?
            .aspect
            .original_values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, value) in originals {
            self.write_data_property(id, &name, value, WriteContext::rejecting())?;
        }

        if state.is_added() {
            self.detach_entity_with(id, notify)?;
        } else {
            {
                let aspect = &mut self.record_mut(id)?.aspect;
                aspect.original_values.clear();
                aspect.entity_state = EntityState::Unchanged;
            }
            if state.is_deleted() {
                self.link_related_entities(id)?;
            }
            self.publish_entity_changed(EntityAction::EntityStateChange, id, None);
            self.update_has_changes(false, notify);
        }
        self.publish_entity_changed(EntityAction::RejectChanges, id, None);
        Ok(())
    }

    /// Reject every pending change in the cache. The dirty flag is
    /// recomputed once at the end.
    pub fn reject_changes(&mut self) -> AppResult<Vec<EntityId>> {
        let changes = self.get_changes(None);
        let outer = self.begin_batch();
        let mut result = Ok(());
        for id in &changes {
            if let Err(e) = self.reject_entity_changes_with(*id, WriteContext::rejecting()) {
                result = Err(e);
                break;
            }
        }
        self.recompute_has_changes();
        self.end_batch(outer);
        debug!(count = changes.len(), "changes rejected");
        result.map(|_| changes)
    }

    // ---- validation ----

    /// Run every property, navigation and entity-level validator. Returns
    /// true when the entity has no errors afterwards.
    pub fn validate_entity(&mut self, id: EntityId) -> AppResult<bool> {
        let outcomes = self.run_validators(id, None)?;
        self.apply_validation(id, outcomes)
    }

    /// Run the validators of a single data or navigation property.
    pub fn validate_property(&mut self, id: EntityId, property_name: &str) -> AppResult<bool> {
        let et = self.entity_type_of(id)?;
        if et.data_property(property_name).is_none()
            && et.navigation_property(property_name).is_none()
        {
            return Err(AppError::unknown_property(&et.short_name, property_name));
        }
        let outcomes = self.run_validators(id, Some(property_name))?;
        self.apply_validation(id, outcomes)
    }

    /// (error key, error) per validator run; `None` means it passed.
    fn run_validators(
        &self,
        id: EntityId,
        only: Option<&str>,
    ) -> AppResult<Vec<(String, Option<ValidationError>)>> {
        let et = self.entity_type_of(id)?;
        let view = self.view(id);
        let mut outcomes = Vec::new();

        for dp in &et.data_properties {
            if only.map_or(false, |p| p != dp.name) {
                continue;
            }
            let value = self.raw_value(id, &dp.name)?;
            let context = ValidationContext {
                entity_type: &et.short_name,
                property_name: Some(&dp.name),
                display_name: &dp.name,
                entity: Some(&view),
            };
            for validator in &dp.validators {
                let key = ValidationError::key_for(validator.name(), Some(&dp.name));
                outcomes.push((key, validator.validate(&value, &context)?));
            }
        }

        for np in &et.navigation_properties {
            if only.map_or(false, |p| p != np.name) || np.validators.is_empty() {
                continue;
            }
            let value = if np.is_scalar {
                match self.relations.scalar(id, &np.name) {
                    Some(target) => DataValue::String(self.get_key(target)?.to_string()),
                    None => DataValue::Null,
                }
            } else {
                DataValue::Int(self.relations.collection(id, &np.name).len() as i64)
            };
            let context = ValidationContext {
                entity_type: &et.short_name,
                property_name: Some(&np.name),
                display_name: &np.name,
                entity: Some(&view),
            };
            for validator in &np.validators {
                let key = ValidationError::key_for(validator.name(), Some(&np.name));
                outcomes.push((key, validator.validate(&value, &context)?));
            }
        }

        if only.is_none() {
            let context = ValidationContext {
                entity_type: &et.short_name,
                property_name: None,
                display_name: &et.short_name,
                entity: Some(&view),
            };
            for validator in &et.validators {
                let key = ValidationError::key_for(validator.name(), None);
                outcomes.push((key, validator.validate(&DataValue::Null, &context)?));
            }
        }
        Ok(outcomes)
    }

    fn apply_validation(
        &mut self,
        id: EntityId,
        outcomes: Vec<(String, Option<ValidationError>)>,
    ) -> AppResult<bool> {
        let aspect = &mut self.record_mut(id)?.aspect;
        aspect.begin_validation();
        for (key, outcome) in outcomes {
            match outcome {
                Some(error) => aspect.record_validation_error(error),
                None => aspect.drop_validation_error(&key),
            }
        }
        let changed = aspect.end_validation();
        let valid = !aspect.has_validation_errors();
        if let Some(args) = changed {
            self.publish(PendingEvent::ValidationErrorsChanged(args));
        }
        Ok(valid)
    }

    pub fn add_validation_error(&mut self, id: EntityId, error: ValidationError) -> AppResult<()> {
        self.edit_validation_errors(id, |aspect| aspect.record_validation_error(error))
    }

    /// Remove one error by validator name and property.
    pub fn remove_validation_error(
        &mut self,
        id: EntityId,
        validator_name: &str,
        property_name: Option<&str>,
    ) -> AppResult<()> {
        let key = ValidationError::key_for(validator_name, property_name);
        self.edit_validation_errors(id, |aspect| aspect.drop_validation_error(&key))
    }

    pub fn clear_validation_errors(&mut self, id: EntityId) -> AppResult<()> {
        self.edit_validation_errors(id, |aspect| aspect.retain_validation_errors(|_| false))
    }

    fn edit_validation_errors<F>(&mut self, id: EntityId, edit: F) -> AppResult<()>
    where
        F: FnOnce(&mut EntityAspect),
    {
        let aspect = &mut self.record_mut(id)?.aspect;
        aspect.begin_validation();
        edit(aspect);
        if let Some(args) = aspect.end_validation() {
            self.publish(PendingEvent::ValidationErrorsChanged(args));
        }
        Ok(())
    }
}
