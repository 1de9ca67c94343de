// Attach / detach and relationship linking

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::{EntityManager, PendingEvent, WriteContext};
use crate::core::data_value::DataValue;
use crate::core::entity_key::EntityKey;
use crate::core::entity_state::{EntityAction, EntityState};
use crate::core::strong_types::EntityId;
use crate::ent_framework::ent_schema::{AutoGeneratedKeyType, EntityType};
use crate::error::{AppError, AppResult};
use crate::infrastructure::entity_group::EntityGroup;
use crate::infrastructure::events::{ArrayChangedArgs, PropertyChangedArgs, PropertyValue};
use crate::infrastructure::unattached_children::PendingLink;

impl EntityManager {
    /// Attach a detached entity (and every entity reachable through its
    /// navigations) in the given state. Attaching an already attached entity
    /// is a no-op.
    pub fn attach_entity(&mut self, id: EntityId, state: EntityState) -> AppResult<()> {
        self.attach_entity_with(id, state, WriteContext::user(), EntityAction::Attach)
    }

    pub fn add_entity(&mut self, id: EntityId) -> AppResult<()> {
        self.attach_entity(id, EntityState::Added)
    }

    pub(crate) fn attach_entity_with(
        &mut self,
        id: EntityId,
        state: EntityState,
        ctx: WriteContext,
        action: EntityAction,
    ) -> AppResult<()> {
        if state.is_detached() {
            return Err(AppError::InvalidOperation(
                "An entity cannot be attached in the Detached state".to_string(),
            ));
        }
        if !self.record(id)?.aspect.entity_state.is_detached() {
            return Ok(());
        }
        let outer = self.begin_batch();
        let result = self.attach_inner(id, state, ctx, action);
        self.end_batch(outer);
        result
    }

    fn attach_inner(
        &mut self,
        id: EntityId,
        state: EntityState,
        ctx: WriteContext,
        action: EntityAction,
    ) -> AppResult<()> {
        let et = self.entity_type_of(id)?;
        self.check_entity_key(id, &et)?;
        let key = self.compute_key(id)?;
        self.groups
            .entry(et.short_name.clone())
            .or_insert_with(|| EntityGroup::new(&et.short_name))
            .attach_entity(id, &key)?;
        {
            let aspect = &mut self.record_mut(id)?.aspect;
            aspect.entity_state = state;
            aspect.key = Some(key.clone());
        }
        debug!(entity = %id, key = %key, state = %state, "entity attached");

        for related in self.related_entities(id, &et) {
            if self.record(related)?.aspect.entity_state.is_detached() {
                self.attach_entity_with(related, state, ctx, action)?;
            }
        }
        self.link_related_entities(id)?;

        if self.config.validation_options.validate_on_attach && !ctx.loading {
            self.validate_entity(id)?;
        }
        self.publish_entity_changed(action, id, None);
        if state.is_added_modified_or_deleted() {
            self.update_has_changes(true, ctx);
        }
        Ok(())
    }

    fn related_entities(&self, id: EntityId, et: &EntityType) -> Vec<EntityId> {
        let mut related = Vec::new();
        for np in &et.navigation_properties {
            if np.is_scalar {
                related.extend(self.relations.scalar(id, &np.name));
            } else {
                related.extend_from_slice(self.relations.collection(id, &np.name));
            }
        }
        related
    }

    /// Generate a temporary key when the key is unset and the type allows it.
    fn check_entity_key(&mut self, id: EntityId, et: &Arc<EntityType>) -> AppResult<()> {
        let key_props = et.key_properties();
        let mut is_default = true;
        for kp in &key_props {
            let value = self.raw_value(id, &kp.name)?;
            if !(value.is_null() || value.loosely_equals(&kp.default_value)) {
                is_default = false;
                break;
            }
        }
        if !is_default {
            return Ok(());
        }
        if et.auto_generated_key_type == AutoGeneratedKeyType::None {
            return Err(AppError::MissingKey(format!(
                "'{}' has no key value and its key is not auto-generated",
                et.short_name
            )));
        }
        self.assign_temp_key(id, et).map(|_| ())
    }

    fn assign_temp_key(&mut self, id: EntityId, et: &Arc<EntityType>) -> AppResult<DataValue> {
        let key_props = et.key_properties();
        let [kp] = key_props.as_slice() else {
            return Err(AppError::InvalidOperation(format!(
                "Temporary keys require a single key property on '{}'",
                et.short_name
            )));
        };
        let value = self
            .key_generator
            .generate_temp_key_value(&et.short_name, kp.data_type)?;
        let record = self.record_mut(id)?;
        record.store.set(&kp.name, value.clone());
        record.aspect.has_temp_key = true;
        record.aspect.key = None;
        Ok(value)
    }

    /// Assign a fresh temporary key. Attached entities are re-keyed in
    /// their group and their dependents' foreign keys follow.
    pub fn generate_temp_key_value(&mut self, id: EntityId) -> AppResult<DataValue> {
        let et = self.entity_type_of(id)?;
        if !self.record(id)?.aspect.entity_state.is_detached() {
            let key_props = et.key_properties();
            let [kp] = key_props.as_slice() else {
                return Err(AppError::InvalidOperation(format!(
                    "Temporary keys require a single key property on '{}'",
                    et.short_name
                )));
            };
            let value = self
                .key_generator
                .generate_temp_key_value(&et.short_name, kp.data_type)?;
            self.write_data_property(id, &kp.name, value.clone(), WriteContext::user())?;
            self.record_mut(id)?.aspect.has_temp_key = true;
            return Ok(value);
        }
        self.assign_temp_key(id, &et)
    }

    /// Detach an entity; its handle stays valid and it can be re-attached.
    pub fn detach_entity(&mut self, id: EntityId) -> AppResult<bool> {
        self.detach_entity_with(id, WriteContext::user())
    }

    pub(crate) fn detach_entity_with(&mut self, id: EntityId, ctx: WriteContext) -> AppResult<bool> {
        if self.record(id)?.aspect.entity_state.is_detached() {
            return Ok(false);
        }
        let outer = self.begin_batch();
        let result = self.detach_inner(id, ctx);
        self.end_batch(outer);
        result.map(|_| true)
    }

    fn detach_inner(&mut self, id: EntityId, ctx: WriteContext) -> AppResult<()> {
        let et = self.entity_type_of(id)?;
        let key = self.get_key(id)?;
        if let Some(group) = self.groups.get_mut(&et.short_name) {
            group.detach_entity(&key);
        }
        self.remove_from_relations(id, false)?;
        self.relations.remove_entity(id);
        self.record_mut(id)?.aspect.reset_for_detach();
        self.unattached.remove_child(id);
        self.key_generator.remove_temp_key(&key);
        debug!(entity = %id, key = %key, "entity detached");
        self.publish_entity_changed(EntityAction::Detach, id, None);
        self.update_has_changes(false, ctx);
        Ok(())
    }

    fn live_entity_by_key(&self, key: &EntityKey) -> Option<EntityId> {
        self.get_entity_by_key(key).filter(|id| {
            self.record(*id)
                .map_or(false, |r| !r.aspect.entity_state.is_deleted())
        })
    }

    /// Cut a deleted entity out of the graph, including any parent it was
    /// still waiting on.
    pub(crate) fn isolate_deleted(&mut self, id: EntityId) -> AppResult<()> {
        self.unattached.remove_child(id);
        self.remove_from_relations(id, true)
    }

    /// Sever an entity from its relationships.
    ///
    /// On delete, parents drop it from their collections and dependents
    /// either lose their reference (nullable foreign key) or are detached.
    /// On detach, edges are removed without touching foreign keys or state.
    pub(crate) fn remove_from_relations(&mut self, id: EntityId, is_deleted: bool) -> AppResult<()> {
        let et = self.entity_type_of(id)?;
        let metadata = self.metadata.clone();
        for np in &et.navigation_properties {
            let Some(inverse_name) = &np.inverse else {
                continue;
            };
            let target_type = metadata.entity_type(&np.entity_type_name)?;
            let Some(inverse) = target_type.navigation_property(inverse_name) else {
                continue;
            };
            if np.is_scalar {
                let Some(target) = self.relations.scalar(id, &np.name) else {
                    continue;
                };
                if is_deleted {
                    if inverse.is_scalar {
                        self.clear_navigation(target, inverse_name, true)?;
                    }
                    self.write_scalar_navigation(id, &np.name, None, WriteContext::user())?;
                } else {
                    if inverse.is_scalar {
                        self.clear_navigation(target, inverse_name, false)?;
                    } else if self.relations.array_mut(target, inverse_name).remove(id) {
                        self.publish(PendingEvent::ArrayChanged(ArrayChangedArgs {
                            parent: target,
                            navigation_property: inverse_name.clone(),
                            added: Vec::new(),
                            removed: vec![id],
                        }));
                    }
                    self.unlink_scalar(id, &np.name);
                }
            } else {
                let members = self.relations.collection(id, &np.name).to_vec();
                for member in &members {
                    if inverse.is_scalar {
                        self.clear_navigation(*member, inverse_name, is_deleted)?;
                    }
                }
                let leftover = self.relations.array_mut(id, &np.name).clear();
                if !leftover.is_empty() {
                    self.publish(PendingEvent::ArrayChanged(ArrayChangedArgs {
                        parent: id,
                        navigation_property: np.name.clone(),
                        added: Vec::new(),
                        removed: leftover,
                    }));
                }
            }
        }
        Ok(())
    }

    fn clear_navigation(&mut self, entity: EntityId, nav: &str, related_is_deleted: bool) -> AppResult<()> {
        if self.relations.scalar(entity, nav).is_none() {
            return Ok(());
        }
        if !related_is_deleted {
            self.unlink_scalar(entity, nav);
            return Ok(());
        }
        let et = self.entity_type_of(entity)?;
        let non_nullable_fk = et
            .navigation_property(nav)
            .and_then(|np| np.foreign_key_names.first())
            .and_then(|fk| et.data_property(fk))
            .map(|dp| !dp.is_nullable)
            .unwrap_or(false);
        if non_nullable_fk {
            self.detach_entity(entity)?;
        } else {
            self.write_scalar_navigation(entity, nav, None, WriteContext::user())?;
        }
        Ok(())
    }

    /// Drop a scalar edge without foreign-key or state side effects.
    fn unlink_scalar(&mut self, entity: EntityId, nav: &str) {
        let old = self.relations.scalar(entity, nav);
        if old.is_none() {
            return;
        }
        self.relations.set_scalar(entity, nav, None);
        self.publish(PendingEvent::PropertyChanged(PropertyChangedArgs {
            entity,
            property_name: nav.to_string(),
            old_value: PropertyValue::Entity(old),
            new_value: PropertyValue::Entity(None),
        }));
    }

    /// Wire an entity to whatever cached entities its keys and foreign keys
    /// refer to, and register it as waiting for parents that are not cached.
    ///
    /// Deleted entities stay out of the graph: they are not linked, and
    /// children of a deleted parent keep waiting until it is restored.
    pub(crate) fn link_related_entities(&mut self, id: EntityId) -> AppResult<()> {
        if self.record(id)?.aspect.entity_state.is_deleted() {
            return Ok(());
        }
        let ctx = WriteContext::loading();
        let et = self.entity_type_of(id)?;
        let metadata = self.metadata.clone();
        let key = self.get_key(id)?;

        for waiting in self.unattached.take_children(&key) {
            let child = waiting.child;
            match self.record(child) {
                Ok(record)
                    if record.aspect.is_attached() && !record.aspect.entity_state.is_deleted() => {}
                _ => continue,
            }
            match waiting.link {
                PendingLink::ChildNavigation(nav) => {
                    self.write_scalar_navigation(child, &nav, Some(id), ctx)?;
                }
                PendingLink::ParentCollection(nav) => {
                    self.add_to_collection(id, &nav, vec![child], None, ctx)?;
                }
            }
        }

        for np in et.navigation_properties.iter().filter(|np| np.is_scalar) {
            if self.relations.scalar(id, &np.name).is_some() {
                continue;
            }
            let Some(parent_key) = self.parent_key(id, np)? else {
                continue;
            };
            if parent_key.is_empty() {
                continue;
            }
            match self.live_entity_by_key(&parent_key) {
                Some(parent) => self.write_scalar_navigation(id, &np.name, Some(parent), ctx)?,
                None => self.unattached.add_child(
                    parent_key,
                    PendingLink::ChildNavigation(np.name.clone()),
                    id,
                ),
            }
        }

        let mut visited = HashSet::new();
        for dp in et.inverse_foreign_key_properties() {
            let Some((parent_type_name, parent_nav)) = &dp.inverse_navigation_property else {
                continue;
            };
            if !visited.insert((parent_type_name.clone(), parent_nav.clone())) {
                continue;
            }
            let parent_type = metadata.entity_type(parent_type_name)?;
            let Some(parent_np) = parent_type.navigation_property(parent_nav) else {
                continue;
            };
            let values = parent_np
                .inv_foreign_key_names
                .iter()
                .map(|fk| self.raw_value(id, fk))
                .collect::<AppResult<Vec<_>>>()?;
            let parent_key = EntityKey::new(parent_type.short_name.clone(), values);
            if parent_key.is_empty() {
                continue;
            }
            match self.live_entity_by_key(&parent_key) {
                Some(parent) => {
                    if !self.relations.collection(parent, parent_nav).contains(&id) {
                        self.add_to_collection(parent, parent_nav, vec![id], None, ctx)?;
                    }
                }
                None => self.unattached.add_child(
                    parent_key,
                    PendingLink::ParentCollection(parent_nav.clone()),
                    id,
                ),
            }
        }
        Ok(())
    }
}
