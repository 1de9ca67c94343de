// Property write pipeline
// Every write runs through explicit stages: coerce, re-key, snapshot, store,
// relationship maintenance, state transition, validation, notification.

use std::sync::Arc;
use tracing::trace;

use super::{EntityManager, PendingEvent, WriteContext};
use crate::core::data_value::DataValue;
use crate::core::entity_key::EntityKey;
use crate::core::entity_state::{EntityAction, EntityState};
use crate::core::strong_types::EntityId;
use crate::ent_framework::ent_schema::{DataProperty, EntityType, NavigationProperty};
use crate::error::{AppError, AppResult};
use crate::infrastructure::events::{PropertyChangedArgs, PropertyValue};
use crate::infrastructure::unattached_children::PendingLink;

impl EntityManager {
    pub fn set_value(
        &mut self,
        id: EntityId,
        name: &str,
        value: impl Into<DataValue>,
    ) -> AppResult<()> {
        self.write_data_property(id, name, value.into(), WriteContext::user())
    }

    pub fn set_navigation(
        &mut self,
        id: EntityId,
        nav: &str,
        target: Option<EntityId>,
    ) -> AppResult<()> {
        self.write_scalar_navigation(id, nav, target, WriteContext::user())
    }

    pub fn set_property(&mut self, id: EntityId, name: &str, value: PropertyValue) -> AppResult<()> {
        match value {
            PropertyValue::Data(v) => self.set_value(id, name, v),
            PropertyValue::Entity(target) => self.set_navigation(id, name, target),
            PropertyValue::Entities(_) => Err(AppError::InvalidOperation(format!(
                "Collection navigation '{}' cannot be assigned; use the collection operations",
                name
            ))),
        }
    }

    /// Run `write` unless the same (entity, property) write is already on
    /// the stack, inside a notification batch.
    fn guarded<F>(&mut self, id: EntityId, name: &str, write: F) -> AppResult<()>
    where
        F: FnOnce(&mut Self) -> AppResult<()>,
    {
        let guard = (id, name.to_string());
        if !self.in_process.insert(guard.clone()) {
            trace!(entity = %id, property = name, "re-entrant write skipped");
            return Ok(());
        }
        let outer = self.begin_batch();
        let result = write(self);
        self.in_process.remove(&guard);
        self.end_batch(outer);
        result
    }

    pub(crate) fn write_data_property(
        &mut self,
        id: EntityId,
        name: &str,
        value: DataValue,
        ctx: WriteContext,
    ) -> AppResult<()> {
        let et = self.entity_type_of(id)?;
        if et.data_property(name).is_none() {
            return Err(AppError::unknown_property(&et.short_name, name));
        }
        self.guarded(id, name, |em| {
            let dp = et
                .data_property(name)
                .ok_or_else(|| AppError::unknown_property(&et.short_name, name))?;
            em.write_data_stages(id, &et, dp, value, ctx)
        })
    }

    fn write_data_stages(
        &mut self,
        id: EntityId,
        et: &Arc<EntityType>,
        dp: &DataProperty,
        value: DataValue,
        ctx: WriteContext,
    ) -> AppResult<()> {
        let new_value = dp.data_type.parse(value);
        let old_value = self.raw_value(id, &dp.name)?;
        if old_value.loosely_equals(&new_value) {
            return Ok(());
        }
        let state = self.record(id)?.aspect.entity_state;
        let attached = !state.is_detached();

        // re-key check happens before anything is mutated
        let rekey = if dp.is_part_of_key && attached && (!ctx.loading || ctx.key_fixup) {
            let old_key = self.get_key(id)?;
            let new_key = self.key_with(id, et, &dp.name, &new_value)?;
            if let Some(existing) = self.get_entity_by_key(&new_key) {
                if existing != id {
                    return Err(AppError::KeyCollision(new_key.to_string()));
                }
            }
            Some((old_key, new_key))
        } else {
            None
        };

        let track = attached && ctx.tracks_changes() && !dp.is_unmapped;
        if track && state.is_unchanged_or_modified() {
            self.record_mut(id)?
                .aspect
                .snapshot_original(&dp.name, &old_value);
        }

        self.record_mut(id)?.store.set(&dp.name, new_value.clone());

        if let Some((old_key, new_key)) = rekey {
            if let Some(group) = self.groups.get_mut(&et.short_name) {
                group.replace_key(&old_key, &new_key)?;
            }
            self.record_mut(id)?.aspect.key = Some(new_key);
            self.propagate_key_change(id, et, dp, &new_value, ctx)?;
        } else if dp.is_part_of_key {
            self.record_mut(id)?.aspect.key = None;
        }

        if attached && !ctx.key_fixup {
            if let Some(nav) = &dp.related_navigation_property {
                self.sync_navigation_from_foreign_key(id, et, nav, ctx)?;
            } else if let Some((parent_type, parent_nav)) = &dp.inverse_navigation_property {
                self.sync_parent_collection(id, dp, parent_type, parent_nav, &old_value, ctx)?;
            }
        }

        if track && state.is_unchanged() {
            self.transition_to_modified(id, ctx)?;
        }
        if track && self.config.validation_options.validate_on_property_change {
            self.validate_property(id, &dp.name)?;
        }

        self.publish(PendingEvent::PropertyChanged(PropertyChangedArgs {
            entity: id,
            property_name: dp.name.clone(),
            old_value: PropertyValue::Data(old_value),
            new_value: PropertyValue::Data(new_value),
        }));
        if attached && !ctx.loading {
            self.publish_entity_changed(EntityAction::PropertyChange, id, Some(&dp.name));
        }
        Ok(())
    }

    fn transition_to_modified(&mut self, id: EntityId, ctx: WriteContext) -> AppResult<()> {
        self.record_mut(id)?.aspect.entity_state = EntityState::Modified;
        self.publish_entity_changed(EntityAction::EntityStateChange, id, None);
        self.update_has_changes(true, ctx);
        Ok(())
    }

    fn key_with(
        &self,
        id: EntityId,
        et: &EntityType,
        name: &str,
        value: &DataValue,
    ) -> AppResult<EntityKey> {
        let values = et
            .key_properties()
            .iter()
            .map(|kp| {
                if kp.name == name {
                    Ok(value.clone())
                } else {
                    self.raw_value(id, &kp.name)
                }
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(EntityKey::new(et.short_name.clone(), values))
    }

    /// A key value changed: every related entity whose foreign key holds
    /// this key follows it.
    fn propagate_key_change(
        &mut self,
        id: EntityId,
        et: &EntityType,
        dp: &DataProperty,
        new_value: &DataValue,
        ctx: WriteContext,
    ) -> AppResult<()> {
        let Some(key_index) = et.key_properties().iter().position(|kp| kp.name == dp.name) else {
            return Ok(());
        };
        let metadata = self.metadata.clone();
        for np in &et.navigation_properties {
            let fk_names = match &np.inverse {
                Some(inverse) => metadata
                    .entity_type(&np.entity_type_name)?
                    .navigation_property(inverse)
                    .map(|inv| inv.foreign_key_names.clone())
                    .unwrap_or_default(),
                None => np.inv_foreign_key_names.clone(),
            };
            let Some(fk_name) = fk_names.get(key_index) else {
                continue;
            };
            let related: Vec<EntityId> = if np.is_scalar {
                self.relations.scalar(id, &np.name).into_iter().collect()
            } else {
                self.relations.collection(id, &np.name).to_vec()
            };
            for child in related {
                self.write_data_property(child, fk_name, new_value.clone(), ctx)?;
            }
        }
        Ok(())
    }

    /// A foreign key changed: point the related navigation at the entity it
    /// now identifies, or wait for that entity to arrive.
    fn sync_navigation_from_foreign_key(
        &mut self,
        id: EntityId,
        et: &EntityType,
        nav: &str,
        ctx: WriteContext,
    ) -> AppResult<()> {
        let Some(np) = et.navigation_property(nav) else {
            return Ok(());
        };
        let parent = match self.parent_key(id, np)? {
            Some(key) if !key.is_empty() => match self.get_entity_by_key(&key) {
                Some(parent) => Some(parent),
                None => {
                    self.unattached
                        .add_child(key, PendingLink::ChildNavigation(nav.to_string()), id);
                    None
                }
            },
            _ => None,
        };
        self.write_scalar_navigation(id, nav, parent, ctx)
    }

    /// A foreign key for a parent-only (unidirectional) collection changed:
    /// move the entity between the old and new parents' collections.
    fn sync_parent_collection(
        &mut self,
        id: EntityId,
        dp: &DataProperty,
        parent_type_name: &str,
        parent_nav: &str,
        old_value: &DataValue,
        ctx: WriteContext,
    ) -> AppResult<()> {
        let parent_type = self.metadata.entity_type(parent_type_name)?;
        let Some(parent_np) = parent_type.navigation_property(parent_nav) else {
            return Ok(());
        };
        let mut old_values = Vec::new();
        let mut new_values = Vec::new();
        for fk in &parent_np.inv_foreign_key_names {
            let current = self.raw_value(id, fk)?;
            old_values.push(if fk == &dp.name { old_value.clone() } else { current.clone() });
            new_values.push(current);
        }
        let old_key = EntityKey::new(parent_type.short_name.clone(), old_values);
        let new_key = EntityKey::new(parent_type.short_name.clone(), new_values);
        if let Some(old_parent) = self.get_entity_by_key(&old_key) {
            self.remove_from_collection(old_parent, parent_nav, &[id], ctx)?;
        }
        if new_key.is_empty() {
            return Ok(());
        }
        match self.get_entity_by_key(&new_key) {
            Some(new_parent) => {
                self.add_to_collection(new_parent, parent_nav, vec![id], None, ctx)?;
            }
            None => self.unattached.add_child(
                new_key,
                PendingLink::ParentCollection(parent_nav.to_string()),
                id,
            ),
        }
        Ok(())
    }

    pub(crate) fn write_scalar_navigation(
        &mut self,
        id: EntityId,
        nav: &str,
        target: Option<EntityId>,
        ctx: WriteContext,
    ) -> AppResult<()> {
        let et = self.entity_type_of(id)?;
        let np = et
            .navigation_property(nav)
            .ok_or_else(|| AppError::unknown_property(&et.short_name, nav))?;
        if !np.is_scalar {
            return Err(AppError::InvalidOperation(format!(
                "'{}' is a collection navigation property",
                nav
            )));
        }
        if let Some(target) = target {
            if target.manager_id() != self.id {
                return Err(AppError::CrossManager(format!(
                    "{} cannot reference {} from another entity manager",
                    id, target
                )));
            }
            let target_type = self.entity_type_of(target)?;
            if target_type.short_name != np.entity_type_name {
                return Err(AppError::InvalidOperation(format!(
                    "'{}' expects a {} but got a {}",
                    nav, np.entity_type_name, target_type.short_name
                )));
            }
        }
        self.guarded(id, nav, |em| em.write_navigation_stages(id, &et, np, target, ctx))
    }

    fn write_navigation_stages(
        &mut self,
        id: EntityId,
        et: &EntityType,
        np: &NavigationProperty,
        target: Option<EntityId>,
        ctx: WriteContext,
    ) -> AppResult<()> {
        let old = self.relations.scalar(id, &np.name);
        if old == target {
            return Ok(());
        }

        // attach whichever side is still detached
        if let Some(target) = target {
            let self_attached = self.record(id)?.aspect.is_attached();
            let target_attached = self.record(target)?.aspect.is_attached();
            if self_attached && !target_attached {
                let state = if ctx.loading {
                    EntityState::Unchanged
                } else {
                    EntityState::Added
                };
                self.attach_entity_with(target, state, ctx, EntityAction::Attach)?;
            } else if !self_attached && target_attached {
                self.attach_entity_with(id, EntityState::Added, ctx, EntityAction::Attach)?;
            }
        }
        let state = self.record(id)?.aspect.entity_state;
        let attached = !state.is_detached();

        if let Some(inverse_name) = &np.inverse {
            let target_type = self.metadata.entity_type(&np.entity_type_name)?;
            let inverse_is_scalar = target_type
                .navigation_property(inverse_name)
                .map(|inv| inv.is_scalar)
                .unwrap_or(false);
            if inverse_is_scalar {
                if let Some(old) = old {
                    self.write_scalar_navigation(old, inverse_name, None, ctx)?;
                }
                if let Some(target) = target {
                    self.write_scalar_navigation(target, inverse_name, Some(id), ctx)?;
                }
            } else {
                if let Some(old) = old {
                    self.remove_from_collection(old, inverse_name, &[id], ctx)?;
                }
                if let Some(target) = target {
                    self.add_to_collection(target, inverse_name, vec![id], None, ctx)?;
                }
            }
        }

        self.relations.set_scalar(id, &np.name, target);

        if !np.foreign_key_names.is_empty() && !state.is_deleted() {
            let target_key = match target {
                Some(t) => Some(self.get_key(t)?),
                None => None,
            };
            for (i, fk) in np.foreign_key_names.iter().enumerate() {
                let Some(fk_dp) = et.data_property(fk) else {
                    continue;
                };
                match &target_key {
                    Some(key) => {
                        let value = key.values().get(i).cloned().unwrap_or(DataValue::Null);
                        self.write_data_property(id, fk, value, ctx)?;
                    }
                    None if !fk_dp.is_part_of_key => {
                        self.write_data_property(id, fk, fk_dp.default_value.clone(), ctx)?;
                    }
                    None => {}
                }
            }
        }

        let state = self.record(id)?.aspect.entity_state;
        if attached && ctx.tracks_changes() && state.is_unchanged() {
            self.transition_to_modified(id, ctx)?;
        }

        self.publish(PendingEvent::PropertyChanged(PropertyChangedArgs {
            entity: id,
            property_name: np.name.clone(),
            old_value: PropertyValue::Entity(old),
            new_value: PropertyValue::Entity(target),
        }));
        if attached && !ctx.loading {
            self.publish_entity_changed(EntityAction::PropertyChange, id, Some(&np.name));
        }
        Ok(())
    }

    /// Point a child's foreign keys at a parent that only knows the child
    /// through a collection.
    pub(crate) fn set_inverse_foreign_keys(
        &mut self,
        parent: EntityId,
        np: &NavigationProperty,
        child: EntityId,
        ctx: WriteContext,
    ) -> AppResult<()> {
        let key = self.get_key(parent)?;
        for (i, fk) in np.inv_foreign_key_names.iter().enumerate() {
            let value = key.values().get(i).cloned().unwrap_or(DataValue::Null);
            self.write_data_property(child, fk, value, ctx)?;
        }
        Ok(())
    }
}
