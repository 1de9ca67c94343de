// Save pipeline
// begin_save prepares the bundle and flags the entities, complete_save
// reconciles keys and merges the result, abort_save undoes the preparation.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::merge::MergeSession;
use super::{EntityManager, WriteContext};
use crate::core::data_value::{DataType, DataValue};
use crate::core::entity_key::EntityKey;
use crate::core::entity_state::{EntityAction, EntityState};
use crate::core::strong_types::EntityId;
use crate::ent_framework::ent_schema::{AutoGeneratedKeyType, DataProperty};
use crate::error::{AppError, AppResult, TransportContext};
use crate::infrastructure::traits::{DataServiceAdapter, KeyMapping, SaveResult};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveOutcome {
    /// Entities that were saved; deleted ones are now detached.
    pub entities: Vec<EntityId>,
    pub key_mappings: Vec<KeyMapping>,
}

/// A concurrency value bumped for this save, kept so a failed save can
/// put it back.
struct BumpedValue {
    entity: EntityId,
    property: String,
    old_value: DataValue,
    had_original: bool,
}

pub(crate) struct PreparedSave {
    pub(crate) entities: Vec<EntityId>,
    pub(crate) bundle: Value,
    pub(crate) adapter: Option<Arc<dyn DataServiceAdapter>>,
    bumped: Vec<BumpedValue>,
}

impl EntityManager {
    /// Save the given entities, or every pending change when `None`.
    #[instrument(skip(self, entities), fields(manager = %self.id))]
    pub async fn save_changes(&mut self, entities: Option<&[EntityId]>) -> AppResult<SaveOutcome> {
        let prepared = self.begin_save(entities)?;
        let Some(adapter) = prepared.adapter.clone() else {
            return Ok(SaveOutcome::default());
        };
        let raw = adapter.save_changes(&prepared.bundle).await;
        self.complete_save(prepared, raw)
    }

    /// Everything up to the transport call. An empty save set yields an
    /// empty preparation with no adapter and no side effects.
    pub(crate) fn begin_save(&mut self, entities: Option<&[EntityId]>) -> AppResult<PreparedSave> {
        let candidates: Vec<EntityId> = match entities {
            Some(list) => {
                let mut picked = Vec::new();
                for id in list {
                    if id.manager_id() != self.id || picked.contains(id) {
                        continue;
                    }
                    if self.entity_state(*id)?.is_added_modified_or_deleted() {
                        picked.push(*id);
                    }
                }
                picked
            }
            None => self.get_changes(None),
        };
        if candidates.is_empty() {
            return Ok(PreparedSave {
                entities: candidates,
                bundle: Value::Null,
                adapter: None,
                bumped: Vec::new(),
            });
        }
        let adapter = self.require_data_service()?;

        if !self.config.save_options.allow_concurrent_saves {
            let in_flight: Vec<EntityId> = candidates
                .iter()
                .copied()
                .filter(|id| self.record(*id).map_or(false, |r| r.aspect.is_being_saved))
                .collect();
            if !in_flight.is_empty() {
                warn!(count = in_flight.len(), "save rejected, entities already being saved");
                return Err(AppError::ConcurrentSave(in_flight));
            }
        }

        if self.config.validation_options.validate_on_save {
            let mut failed = Vec::new();
            for id in &candidates {
                if self.entity_state(*id)?.is_deleted() {
                    continue;
                }
                if !self.validate_entity(*id)? {
                    failed.push(*id);
                }
            }
            if !failed.is_empty() {
                warn!(count = failed.len(), "save rejected by validation");
                return Err(AppError::Validation {
                    message: "client side validation errors encountered".to_string(),
                    entities: failed,
                });
            }
        }

        let mut bumped = Vec::new();
        for id in &candidates {
            if !self.entity_state(*id)?.is_modified() {
                continue;
            }
            if let Err(e) = self.bump_concurrency_values(*id, &mut bumped) {
                self.restore_bumped(&bumped);
                return Err(e);
            }
        }

        let bundle = match self.build_save_bundle(&candidates) {
            Ok(bundle) => bundle,
            Err(e) => {
                self.restore_bumped(&bumped);
                return Err(e);
            }
        };
        for id in &candidates {
            self.record_mut(*id)?.aspect.is_being_saved = true;
        }
        info!(count = candidates.len(), "saving changes");
        Ok(PreparedSave {
            entities: candidates,
            bundle,
            adapter: Some(adapter),
            bumped,
        })
    }

    fn bump_concurrency_values(&mut self, id: EntityId, bumped: &mut Vec<BumpedValue>) -> AppResult<()> {
        let et = self.entity_type_of(id)?;
        for dp in et.concurrency_properties() {
            let old_value = self.raw_value(id, &dp.name)?;
            let Some(new_value) = next_concurrency_value(dp, &old_value) else {
                continue;
            };
            let had_original = self.record(id)?.aspect.original_values.contains_key(&dp.name);
            self.write_data_property(id, &dp.name, new_value, WriteContext::user())?;
            bumped.push(BumpedValue {
                entity: id,
                property: dp.name.clone(),
                old_value,
                had_original,
            });
        }
        Ok(())
    }

    fn restore_bumped(&mut self, bumped: &[BumpedValue]) {
        for bump in bumped.iter().rev() {
            let restored = self
                .write_data_property(
                    bump.entity,
                    &bump.property,
                    bump.old_value.clone(),
                    WriteContext::rejecting(),
                )
                .and_then(|_| self.record_mut(bump.entity));
            match restored {
                Ok(record) => {
                    if !bump.had_original {
                        record.aspect.original_values.remove(&bump.property);
                    }
                }
                Err(e) => warn!(entity = %bump.entity, error = %e, "could not restore concurrency value"),
            }
        }
    }

    /// `{ entities: [ {values…, entityAspect: {…}} ], saveOptions }`.
    pub(crate) fn build_save_bundle(&self, entities: &[EntityId]) -> AppResult<Value> {
        let mut rows = Vec::with_capacity(entities.len());
        for id in entities {
            let record = self.record(*id)?;
            let et = &record.entity_type;
            let mut row = Map::new();
            for dp in et.data_properties.iter().filter(|dp| !dp.is_unmapped) {
                let value = record.store.get(&dp.name).cloned().unwrap_or(DataValue::Null);
                row.insert(dp.name.clone(), value.to_json());
            }
            let state = record.aspect.entity_state;
            let originals: Map<String, Value> = if state.is_added() {
                Map::new()
            } else {
                record
                    .aspect
                    .original_values
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect()
            };
            let auto_key = match (et.auto_generated_key_type, et.key_properties().first()) {
                (AutoGeneratedKeyType::None, _) | (_, None) => Value::Null,
                (key_type, Some(kp)) => json!({
                    "propertyName": kp.name,
                    "autoGeneratedKeyType": key_type,
                }),
            };
            row.insert(
                "entityAspect".to_string(),
                json!({
                    "entityTypeName": et.full_name(),
                    "entityState": state.name(),
                    "originalValuesMap": originals,
                    "autoGeneratedKey": auto_key,
                }),
            );
            rows.push(Value::Object(row));
        }
        Ok(json!({
            "entities": rows,
            "saveOptions": {
                "allowConcurrentSaves": self.config.save_options.allow_concurrent_saves,
            },
        }))
    }

    /// Reconcile the transport's answer. A failure leaves every entity as it
    /// was before `begin_save`.
    pub(crate) fn complete_save(
        &mut self,
        prepared: PreparedSave,
        raw: anyhow::Result<SaveResult>,
    ) -> AppResult<SaveOutcome> {
        for id in &prepared.entities {
            if let Ok(record) = self.record_mut(*id) {
                record.aspect.is_being_saved = false;
            }
        }
        let result = match raw {
            Ok(result) => result,
            Err(e) => {
                self.abort_save(&prepared);
                warn!(error = %e, "save failed");
                return Err(AppError::transport(
                    TransportContext::Save {
                        bundle: prepared.bundle.to_string(),
                    },
                    e,
                ));
            }
        };

        let outer = self.begin_batch();
        let applied = self.apply_save_result(&prepared, result);
        self.end_batch(outer);
        let outcome = applied?;
        info!(
            saved = outcome.entities.len(),
            key_mappings = outcome.key_mappings.len(),
            "save completed"
        );
        Ok(outcome)
    }

    /// Undo the preparation of a save that never reached the server or failed there.
    pub(crate) fn abort_save(&mut self, prepared: &PreparedSave) {
        for id in &prepared.entities {
            if let Ok(record) = self.record_mut(*id) {
                record.aspect.is_being_saved = false;
            }
        }
        self.restore_bumped(&prepared.bumped);
    }

    fn apply_save_result(
        &mut self,
        prepared: &PreparedSave,
        result: SaveResult,
    ) -> AppResult<SaveOutcome> {
        for mapping in &result.key_mappings {
            self.apply_key_mapping(mapping)?;
        }

        let mut session = MergeSession::for_save();
        self.merge_payload_rows(result.entities, &mut session)?;

        for id in &prepared.entities {
            match self.entity_state(*id)? {
                EntityState::Deleted => {
                    self.detach_entity_with(*id, WriteContext::loading())?;
                }
                EntityState::Added | EntityState::Modified => {
                    {
                        let aspect = &mut self.record_mut(*id)?.aspect;
                        aspect.entity_state = EntityState::Unchanged;
                        aspect.original_values.clear();
                    }
                    self.clear_temp_key(*id)?;
                    self.publish_entity_changed(EntityAction::EntityStateChange, *id, None);
                }
                _ => {}
            }
        }
        self.recompute_has_changes();
        Ok(SaveOutcome {
            entities: prepared.entities.clone(),
            key_mappings: result.key_mappings,
        })
    }

    /// Replace a temporary key with the server's value everywhere it is used.
    fn apply_key_mapping(&mut self, mapping: &KeyMapping) -> AppResult<()> {
        let et = self
            .metadata
            .entity_type_from_type_string(&mapping.entity_type_name)
            .or_else(|| self.metadata.get_entity_type(&mapping.entity_type_name))
            .ok_or_else(|| AppError::UnknownEntityType(mapping.entity_type_name.clone()))?;
        let key_props = et.key_properties();
        let [kp] = key_props.as_slice() else {
            return Err(AppError::InvalidOperation(format!(
                "key mapping for '{}' needs a single key property",
                et.short_name
            )));
        };
        let temp_value = kp.data_type.from_json(&mapping.temp_value)?;
        let real_value = kp.data_type.from_json(&mapping.real_value)?;
        let temp_key = EntityKey::new(et.short_name.clone(), vec![temp_value]);
        let Some(id) = self.get_entity_by_key(&temp_key) else {
            warn!(key = %temp_key, "key mapping for an entity that is not cached");
            return Ok(());
        };
        let name = kp.name.clone();
        self.write_data_property(id, &name, real_value, WriteContext::key_fixup())?;
        self.record_mut(id)?.aspect.has_temp_key = false;
        self.key_generator.remove_temp_key(&temp_key);
        debug!(entity = %id, from = %temp_key, "temporary key replaced");
        Ok(())
    }
}

/// Next optimistic-concurrency value; `None` when the server computes it.
fn next_concurrency_value(dp: &DataProperty, current: &DataValue) -> Option<DataValue> {
    match dp.data_type {
        dt if dt.is_integer() => Some(DataValue::Int(current.as_i64().unwrap_or(0).wrapping_add(1))),
        dt if dt.is_numeric() => Some(DataValue::Float(current.as_f64().unwrap_or(0.0) + 1.0)),
        dt if dt.is_date() => {
            let mut now = Utc::now();
            while let DataValue::DateTime(previous) = current {
                if *previous != now {
                    break;
                }
                now = Utc::now();
            }
            Some(DataValue::DateTime(now))
        }
        DataType::Guid => Some(DataValue::Guid(Uuid::new_v4())),
        DataType::Binary => None,
        other => {
            warn!(property = %dp.name, data_type = %other, "unable to bump concurrency value");
            None
        }
    }
}
