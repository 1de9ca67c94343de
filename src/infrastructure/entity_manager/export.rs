// Export / import of cached entities
// The document carries the metadata snapshot, manager options, outstanding
// temporary keys and one group per entity type.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{EntityManager, WriteContext};
use crate::config::{ManagerConfig, MergeStrategy};
use crate::core::data_value::DataValue;
use crate::core::entity_key::EntityKey;
use crate::core::entity_state::{EntityAction, EntityState};
use crate::core::strong_types::EntityId;
use crate::ent_framework::ent_schema::{DataProperty, EntityType};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata_store: Option<Value>,
    #[serde(default)]
    config: Option<ManagerConfig>,
    #[serde(default)]
    temp_keys: Vec<ExportedKey>,
    entity_group_map: BTreeMap<String, ExportedGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportedKey {
    entity_type: String,
    values: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ExportedGroup {
    entities: Vec<ExportedEntity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportedEntity {
    entity_aspect: ExportedAspect,
    #[serde(flatten)]
    values: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportedAspect {
    entity_state: EntityState,
    #[serde(default)]
    original_values_map: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Falls back to the exported manager options, then this manager's.
    pub merge_strategy: Option<MergeStrategy>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportResult {
    pub entities: Vec<EntityId>,
    /// Exported temporary key and the fresh key that replaced it.
    pub temp_key_map: Vec<(EntityKey, EntityKey)>,
}

impl EntityManager {
    /// Serialise the given entities, or every attached one.
    pub fn export_entities(
        &self,
        entities: Option<&[EntityId]>,
        include_metadata: bool,
    ) -> AppResult<Value> {
        let ids: Vec<EntityId> = match entities {
            Some(list) => {
                let mut ids = Vec::new();
                for id in list {
                    if self.record(*id)?.aspect.is_attached() && !ids.contains(id) {
                        ids.push(*id);
                    }
                }
                ids
            }
            None => self.get_entities(None, None),
        };

        let mut groups: BTreeMap<String, ExportedGroup> = BTreeMap::new();
        let mut exported_keys = HashSet::new();
        for id in &ids {
            let record = self.record(*id)?;
            let values: Map<String, Value> = self
                .values_of(*id)?
                .into_iter()
                .map(|(k, v)| (k, v.to_json()))
                .collect();
            let original_values_map = record
                .aspect
                .original_values
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            exported_keys.insert(self.get_key(*id)?);
            groups
                .entry(record.entity_type.short_name.clone())
                .or_default()
                .entities
                .push(ExportedEntity {
                    entity_aspect: ExportedAspect {
                        entity_state: record.aspect.entity_state,
                        original_values_map,
                    },
                    values,
                });
        }

        let mut temp_keys: Vec<ExportedKey> = self
            .key_generator
            .temp_keys()
            .into_iter()
            .filter(|key| exported_keys.contains(key))
            .map(|key| ExportedKey {
                entity_type: key.entity_type().to_string(),
                values: key.values().iter().map(DataValue::to_json).collect(),
            })
            .collect();
        temp_keys.sort_by_key(|k| (k.entity_type.clone(), Value::Array(k.values.clone()).to_string()));

        let document = ExportDocument {
            metadata_store: include_metadata.then(|| self.metadata.export_metadata()),
            config: Some(self.config.clone()),
            temp_keys,
            entity_group_map: groups,
        };
        debug!(entities = ids.len(), "entities exported");
        Ok(serde_json::to_value(document)?)
    }

    pub async fn export_to_file(
        &self,
        path: impl AsRef<Path>,
        entities: Option<&[EntityId]>,
        include_metadata: bool,
    ) -> AppResult<()> {
        let document = self.export_entities(entities, include_metadata)?;
        let text = serde_json::to_string_pretty(&document)?;
        tokio::fs::write(path.as_ref(), text).await.map_err(|e| {
            AppError::Serialization(format!("writing {}: {}", path.as_ref().display(), e))
        })
    }

    pub async fn import_from_file(
        &mut self,
        path: impl AsRef<Path>,
        options: ImportOptions,
    ) -> AppResult<ImportResult> {
        let text = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            AppError::Deserialization(format!("reading {}: {}", path.as_ref().display(), e))
        })?;
        let document: Value = serde_json::from_str(&text)?;
        self.import_entities(&document, options)
    }

    /// Replay an exported document into this manager. Temporary keys are
    /// replaced by fresh ones from this manager's generator.
    pub fn import_entities(&mut self, document: &Value, options: ImportOptions) -> AppResult<ImportResult> {
        let document: ExportDocument = serde_json::from_value(document.clone())?;
        if let Some(metadata) = &document.metadata_store {
            self.metadata_mut().import_metadata(metadata)?;
        }
        let strategy = options
            .merge_strategy
            .or(document.config.as_ref().map(|c| c.query_options.merge_strategy))
            .unwrap_or(self.config.query_options.merge_strategy);

        let remap = self.remap_temp_keys(&document.temp_keys)?;
        let outer = self.begin_batch();
        let result = self.import_groups(&document.entity_group_map, &remap, strategy);
        self.recompute_has_changes();
        self.end_batch(outer);
        let entities = result?;

        let mut temp_key_map: Vec<(EntityKey, EntityKey)> = remap
            .values()
            .map(|(old, new)| (old.clone(), new.clone()))
            .collect();
        temp_key_map.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        info!(
            entities = entities.len(),
            temp_keys = temp_key_map.len(),
            "entities imported"
        );
        Ok(ImportResult {
            entities,
            temp_key_map,
        })
    }

    /// (type, old key string) -> (old key, new key)
    fn remap_temp_keys(
        &mut self,
        temp_keys: &[ExportedKey],
    ) -> AppResult<HashMap<(String, String), (EntityKey, EntityKey)>> {
        let mut remap = HashMap::new();
        for exported in temp_keys {
            let et = self.metadata.entity_type(&exported.entity_type)?;
            let key_props = et.key_properties();
            let ([kp], [raw]) = (key_props.as_slice(), exported.values.as_slice()) else {
                return Err(AppError::Deserialization(format!(
                    "temporary key for '{}' must have exactly one value",
                    et.short_name
                )));
            };
            let old_value = kp.data_type.from_json(raw)?;
            let new_value = self
                .key_generator
                .generate_temp_key_value(&et.short_name, kp.data_type)?;
            let old_key = EntityKey::new(et.short_name.clone(), vec![old_value]);
            let new_key = EntityKey::new(et.short_name.clone(), vec![new_value]);
            remap.insert(
                (et.short_name.clone(), old_key.key_string().to_string()),
                (old_key, new_key),
            );
        }
        Ok(remap)
    }

    fn import_groups(
        &mut self,
        groups: &BTreeMap<String, ExportedGroup>,
        remap: &HashMap<(String, String), (EntityKey, EntityKey)>,
        strategy: MergeStrategy,
    ) -> AppResult<Vec<EntityId>> {
        let mut imported = Vec::new();
        for (type_name, group) in groups {
            let et = self.metadata.entity_type(type_name)?;
            for exported in &group.entities {
                let id = self.import_entity(&et, exported, remap, strategy)?;
                imported.push(id);
            }
        }
        // Deleted entities are cut loose only once every group is in, so a
        // parent replayed after its deleted child cannot pick it back up.
        for id in &imported {
            if self.entity_state(*id)?.is_deleted() {
                self.isolate_deleted(*id)?;
            }
        }
        Ok(imported)
    }

    fn import_entity(
        &mut self,
        et: &EntityType,
        exported: &ExportedEntity,
        remap: &HashMap<(String, String), (EntityKey, EntityKey)>,
        strategy: MergeStrategy,
    ) -> AppResult<EntityId> {
        let mut values = Vec::with_capacity(et.data_properties.len());
        for dp in &et.data_properties {
            let Some(raw) = exported.values.get(&dp.name) else {
                continue;
            };
            let value = dp.data_type.from_json(raw)?;
            values.push((dp.name.clone(), remapped(et, dp, value, remap)));
        }
        let mut originals = HashMap::new();
        for (name, raw) in &exported.entity_aspect.original_values_map {
            let dp = et
                .data_property(name)
                .ok_or_else(|| AppError::unknown_property(&et.short_name, name))?;
            originals.insert(name.clone(), dp.data_type.from_json(raw)?);
        }
        let state = exported.entity_aspect.entity_state;
        if state.is_detached() {
            return Err(AppError::Deserialization(format!(
                "exported '{}' entity is detached",
                et.short_name
            )));
        }

        let key_values = et
            .key_properties()
            .iter()
            .map(|kp| {
                values
                    .iter()
                    .find(|(n, _)| n == &kp.name)
                    .map(|(_, v)| v.clone())
                    .unwrap_or(DataValue::Null)
            })
            .collect();
        let key = EntityKey::new(et.short_name.clone(), key_values);
        let is_temp = remap.values().any(|(_, new_key)| new_key == &key);

        let id = match self.get_entity_by_key(&key) {
            Some(id) => {
                let local_state = self.entity_state(id)?;
                if strategy == MergeStrategy::PreserveChanges
                    && local_state.is_added_modified_or_deleted()
                {
                    return Ok(id);
                }
                self.merge_entity_values(id, &values)?;
                {
                    let aspect = &mut self.record_mut(id)?.aspect;
                    aspect.entity_state = state;
                    aspect.original_values = originals;
                }
                if local_state.is_deleted() && !state.is_deleted() {
                    self.link_related_entities(id)?;
                }
                self.publish_entity_changed(EntityAction::MergeOnImport, id, None);
                id
            }
            None => {
                let id = self.create_entity(&et.short_name, values, EntityState::Detached)?;
                self.attach_entity_with(id, state, WriteContext::loading(), EntityAction::AttachOnImport)?;
                self.record_mut(id)?.aspect.original_values = originals;
                id
            }
        };
        if is_temp {
            self.record_mut(id)?.aspect.has_temp_key = true;
            self.key_generator.register_temp_key(key);
        }
        Ok(id)
    }
}

/// Key and foreign-key values that held an exported temporary key take the
/// replacement key's value.
fn remapped(
    et: &EntityType,
    dp: &DataProperty,
    value: DataValue,
    remap: &HashMap<(String, String), (EntityKey, EntityKey)>,
) -> DataValue {
    let target_type = if dp.is_part_of_key {
        Some(et.short_name.clone())
    } else if let Some(nav) = &dp.related_navigation_property {
        et.navigation_property(nav).map(|np| np.entity_type_name.clone())
    } else {
        dp.inverse_navigation_property
            .as_ref()
            .map(|(parent_type, _)| parent_type.clone())
    };
    let Some(target_type) = target_type else {
        return value;
    };
    let lookup = (target_type, EntityKey::create_key_string(std::slice::from_ref(&value)));
    match remap.get(&lookup) {
        Some((_, new_key)) => new_key.values().first().cloned().unwrap_or(value),
        None => value,
    }
}
