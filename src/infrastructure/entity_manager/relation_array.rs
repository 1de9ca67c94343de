// Collection navigation operations
// Adds and removes keep the inverse scalar (or the child's foreign keys) in step.

use super::{EntityManager, PendingEvent, WriteContext};
use crate::core::entity_state::{EntityAction, EntityState};
use crate::core::strong_types::EntityId;
use crate::ent_framework::ent_schema::NavigationProperty;
use crate::error::{AppError, AppResult};
use crate::infrastructure::events::ArrayChangedArgs;

impl EntityManager {
    pub fn push_related(&mut self, parent: EntityId, nav: &str, items: &[EntityId]) -> AppResult<()> {
        self.add_to_collection(parent, nav, items.to_vec(), None, WriteContext::user())
            .map(|_| ())
    }

    pub fn unshift_related(
        &mut self,
        parent: EntityId,
        nav: &str,
        items: &[EntityId],
    ) -> AppResult<()> {
        self.add_to_collection(parent, nav, items.to_vec(), Some(0), WriteContext::user())
            .map(|_| ())
    }

    /// Remove `delete_count` members at `start`, then insert `items` there.
    /// Returns the removed members.
    pub fn splice_related(
        &mut self,
        parent: EntityId,
        nav: &str,
        start: usize,
        delete_count: usize,
        items: &[EntityId],
    ) -> AppResult<Vec<EntityId>> {
        let np = self.collection_property(parent, nav)?;
        let outer = self.begin_batch();
        let removed = self.relations.array_mut(parent, nav).remove_range(start, delete_count);
        let result = self
            .process_removes(parent, &np, &removed, WriteContext::user())
            .and_then(|_| {
                self.add_to_collection(parent, nav, items.to_vec(), Some(start), WriteContext::user())
            });
        self.end_batch(outer);
        result.map(|_| removed)
    }

    pub fn pop_related(&mut self, parent: EntityId, nav: &str) -> AppResult<Option<EntityId>> {
        match self.relations.collection(parent, nav).last().copied() {
            Some(last) => Ok(self
                .remove_from_collection(parent, nav, &[last], WriteContext::user())?
                .first()
                .copied()),
            None => {
                self.collection_property(parent, nav)?;
                Ok(None)
            }
        }
    }

    pub fn shift_related(&mut self, parent: EntityId, nav: &str) -> AppResult<Option<EntityId>> {
        match self.relations.collection(parent, nav).first().copied() {
            Some(first) => Ok(self
                .remove_from_collection(parent, nav, &[first], WriteContext::user())?
                .first()
                .copied()),
            None => {
                self.collection_property(parent, nav)?;
                Ok(None)
            }
        }
    }

    pub fn remove_related(&mut self, parent: EntityId, nav: &str, item: EntityId) -> AppResult<bool> {
        let removed = self.remove_from_collection(parent, nav, &[item], WriteContext::user())?;
        Ok(!removed.is_empty())
    }

    fn collection_property(&self, parent: EntityId, nav: &str) -> AppResult<NavigationProperty> {
        let et = self.entity_type_of(parent)?;
        match et.navigation_property(nav) {
            Some(np) if !np.is_scalar => Ok(np.clone()),
            Some(_) => Err(AppError::InvalidOperation(format!(
                "'{}' is a scalar navigation property",
                nav
            ))),
            None => Err(AppError::unknown_property(&et.short_name, nav)),
        }
    }

    /// Insert members not already present (or mid-add), attaching detached
    /// ones and wiring each to the parent. Returns the members actually added.
    pub(crate) fn add_to_collection(
        &mut self,
        parent: EntityId,
        nav: &str,
        adds: Vec<EntityId>,
        position: Option<usize>,
        ctx: WriteContext,
    ) -> AppResult<Vec<EntityId>> {
        let np = self.collection_property(parent, nav)?;
        for add in &adds {
            if add.manager_id() != self.id {
                return Err(AppError::CrossManager(format!(
                    "{} cannot hold {} from another entity manager",
                    parent, add
                )));
            }
            let add_type = self.entity_type_of(*add)?;
            if add_type.short_name != np.entity_type_name {
                return Err(AppError::InvalidOperation(format!(
                    "'{}' holds {} entities, not {}",
                    nav, np.entity_type_name, add_type.short_name
                )));
            }
        }

        let mut good: Vec<EntityId> = Vec::new();
        {
            let array = self.relations.array(parent, nav);
            for add in adds {
                let present = array.map_or(false, |a| a.contains(add) || a.is_adding(add));
                if !present && !good.contains(&add) {
                    good.push(add);
                }
            }
        }
        if good.is_empty() {
            return Ok(good);
        }

        let outer = self.begin_batch();
        let result = self.insert_members(parent, &np, &good, position, ctx);
        self.end_batch(outer);
        result.map(|_| good)
    }

    fn insert_members(
        &mut self,
        parent: EntityId,
        np: &NavigationProperty,
        good: &[EntityId],
        position: Option<usize>,
        ctx: WriteContext,
    ) -> AppResult<()> {
        let parent_attached = self.record(parent)?.aspect.is_attached();
        if parent_attached && !ctx.loading {
            for add in good {
                if !self.record(*add)?.aspect.is_attached() {
                    self.attach_entity_with(*add, EntityState::Added, ctx, EntityAction::Attach)?;
                }
            }
        }

        {
            let array = self.relations.array_mut(parent, &np.name);
            array.begin_adds(good);
            let at = position.unwrap_or(array.len());
            array.insert_all(at, good);
        }
        let linked = self.link_members(parent, np, good, ctx);
        self.relations.array_mut(parent, &np.name).end_adds(good);
        linked?;

        self.publish(PendingEvent::ArrayChanged(ArrayChangedArgs {
            parent,
            navigation_property: np.name.clone(),
            added: good.to_vec(),
            removed: Vec::new(),
        }));
        Ok(())
    }

    fn link_members(
        &mut self,
        parent: EntityId,
        np: &NavigationProperty,
        members: &[EntityId],
        ctx: WriteContext,
    ) -> AppResult<()> {
        for member in members {
            match &np.inverse {
                Some(inverse) => {
                    self.write_scalar_navigation(*member, inverse, Some(parent), ctx)?
                }
                None => self.set_inverse_foreign_keys(parent, np, *member, ctx)?,
            }
        }
        Ok(())
    }

    pub(crate) fn remove_from_collection(
        &mut self,
        parent: EntityId,
        nav: &str,
        removes: &[EntityId],
        ctx: WriteContext,
    ) -> AppResult<Vec<EntityId>> {
        let np = self.collection_property(parent, nav)?;
        let removed: Vec<EntityId> = removes
            .iter()
            .copied()
            .filter(|r| self.relations.array_mut(parent, nav).remove(*r))
            .collect();
        if removed.is_empty() {
            return Ok(removed);
        }
        let outer = self.begin_batch();
        let result = self.process_removes(parent, &np, &removed, ctx);
        self.end_batch(outer);
        result.map(|_| removed)
    }

    fn process_removes(
        &mut self,
        parent: EntityId,
        np: &NavigationProperty,
        removed: &[EntityId],
        ctx: WriteContext,
    ) -> AppResult<()> {
        if removed.is_empty() {
            return Ok(());
        }
        for member in removed {
            match &np.inverse {
                Some(inverse) => {
                    if self.relations.scalar(*member, inverse) == Some(parent) {
                        self.write_scalar_navigation(*member, inverse, None, ctx)?;
                    }
                }
                None if !ctx.loading => {
                    let member_type = self.entity_type_of(*member)?;
                    for fk in &np.inv_foreign_key_names {
                        if let Some(dp) = member_type.data_property(fk) {
                            if dp.is_nullable && !dp.is_part_of_key {
                                self.write_data_property(*member, fk, dp.default_value.clone(), ctx)?;
                            }
                        }
                    }
                }
                None => {}
            }
        }
        self.publish(PendingEvent::ArrayChanged(ArrayChangedArgs {
            parent,
            navigation_property: np.name.clone(),
            added: Vec::new(),
            removed: removed.to_vec(),
        }));
        Ok(())
    }
}
