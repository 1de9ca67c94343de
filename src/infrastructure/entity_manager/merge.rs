// Merge pipeline - reconciles server or imported rows with the cache
// Rows resolve to cached entities by key or attach as new `Unchanged`
// entities; `$ref` nodes go through a per-merge reference map and forward
// references wait in a deferred table flushed after the main pass.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{EntityManager, WriteContext};
use crate::config::MergeStrategy;
use crate::core::data_value::DataValue;
use crate::core::entity_key::EntityKey;
use crate::core::entity_state::{EntityAction, EntityState};
use crate::core::strong_types::EntityId;
use crate::ent_framework::ent_schema::EntityType;
use crate::error::{AppError, AppResult};
use crate::infrastructure::traits::NodeContext;
use crate::query::entity_query::QueryRow;
use crate::query::select::ProjectedValue;

/// A merged payload node before back-references are resolved.
#[derive(Debug, Clone)]
enum Merged {
    Entity(EntityId),
    Object(BTreeMap<String, Merged>),
    List(Vec<Merged>),
    Value(DataValue),
    Ref(String),
}

/// Navigation waiting for a node that appears later in the payload.
#[derive(Debug, Clone)]
enum DeferredTarget {
    ScalarNav { entity: EntityId, nav: String },
    CollectionNav { entity: EntityId, nav: String },
}

/// State of one merge: options plus the reference map and deferred table.
pub(crate) struct MergeSession {
    strategy: MergeStrategy,
    merge_action: EntityAction,
    attach_action: EntityAction,
    query_entity_type: Option<String>,
    skip_deleted: bool,
    ref_map: HashMap<String, Merged>,
    deferred: Vec<(String, DeferredTarget)>,
    entities: Vec<EntityId>,
    seen: HashSet<EntityId>,
}

impl MergeSession {
    pub(crate) fn for_query(strategy: MergeStrategy, query_entity_type: Option<String>) -> Self {
        Self::new(
            strategy,
            EntityAction::MergeOnQuery,
            EntityAction::AttachOnQuery,
            query_entity_type,
            false,
        )
    }

    /// Save results always overwrite; rows for deleted entities are left alone.
    pub(crate) fn for_save() -> Self {
        Self::new(
            MergeStrategy::OverwriteChanges,
            EntityAction::MergeOnSave,
            EntityAction::AttachOnQuery,
            None,
            true,
        )
    }

    fn new(
        strategy: MergeStrategy,
        merge_action: EntityAction,
        attach_action: EntityAction,
        query_entity_type: Option<String>,
        skip_deleted: bool,
    ) -> Self {
        Self {
            strategy,
            merge_action,
            attach_action,
            query_entity_type,
            skip_deleted,
            ref_map: HashMap::new(),
            deferred: Vec::new(),
            entities: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Every entity the merge touched, in first-seen order.
    pub(crate) fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    fn note(&mut self, id: EntityId) {
        if self.seen.insert(id) {
            self.entities.push(id);
        }
    }
}

impl EntityManager {
    /// Merge extracted payload rows. Earlier rows stay merged if a later row fails.
    pub(crate) fn merge_payload_rows(
        &mut self,
        rows: Vec<Value>,
        session: &mut MergeSession,
    ) -> AppResult<Vec<QueryRow>> {
        let outer = self.begin_batch();
        let result = self.merge_rows_inner(rows, session);
        self.end_batch(outer);
        result
    }

    fn merge_rows_inner(
        &mut self,
        rows: Vec<Value>,
        session: &mut MergeSession,
    ) -> AppResult<Vec<QueryRow>> {
        let mut merged = Vec::with_capacity(rows.len());
        for row in &rows {
            merged.push(self.merge_node(row, session, true, None)?);
        }
        self.flush_deferred(session)?;

        let mut results = Vec::with_capacity(merged.len());
        for node in merged {
            let node = resolve_refs(node, &session.ref_map, &mut Vec::new());
            push_row(&mut results, node);
        }
        debug!(
            rows = results.len(),
            entities = session.entities.len(),
            "payload merged"
        );
        Ok(results)
    }

    fn merge_node(
        &mut self,
        node: &Value,
        session: &mut MergeSession,
        is_top_level: bool,
        navigation_target: Option<&str>,
    ) -> AppResult<Merged> {
        match node {
            Value::Array(items) => {
                let mut merged = Vec::with_capacity(items.len());
                for item in items {
                    merged.push(self.merge_node(item, session, is_top_level, navigation_target)?);
                }
                Ok(Merged::List(merged))
            }
            Value::Object(map) => {
                let metadata = self.metadata.clone();
                let adapter = self.results_adapter.clone();
                let meta = adapter.visit_node(
                    node,
                    &NodeContext {
                        metadata: &metadata,
                        is_top_level,
                        navigation_target,
                        query_entity_type: session.query_entity_type.as_deref(),
                    },
                );
                if meta.ignore {
                    return Ok(Merged::Value(DataValue::Null));
                }
                if let Some(ref_id) = meta.node_ref_id {
                    return Ok(session
                        .ref_map
                        .get(&ref_id)
                        .cloned()
                        .unwrap_or(Merged::Ref(ref_id)));
                }
                let merged = match meta.entity_type {
                    Some(et) => {
                        let id = self.merge_entity_node(map, &et, session, meta.node_id.as_deref())?;
                        Merged::Entity(id)
                    }
                    None => {
                        let mut fields = BTreeMap::new();
                        for (name, value) in map.iter().filter(|(k, _)| !k.starts_with('$')) {
                            fields.insert(name.clone(), self.merge_node(value, session, false, None)?);
                        }
                        Merged::Object(fields)
                    }
                };
                if let Some(node_id) = meta.node_id {
                    session.ref_map.entry(node_id).or_insert_with(|| merged.clone());
                }
                Ok(merged)
            }
            other => Ok(Merged::Value(DataValue::from_json_untyped(other))),
        }
    }

    fn merge_entity_node(
        &mut self,
        map: &Map<String, Value>,
        et: &EntityType,
        session: &mut MergeSession,
        node_id: Option<&str>,
    ) -> AppResult<EntityId> {
        let mut values: Vec<(String, DataValue)> = Vec::new();
        for dp in &et.data_properties {
            if let Some(raw) = map.get(&dp.name) {
                values.push((dp.name.clone(), dp.data_type.from_json(raw)?));
            }
        }
        let key_values: Vec<DataValue> = et
            .key_properties()
            .iter()
            .map(|kp| {
                values
                    .iter()
                    .find(|(name, _)| name == &kp.name)
                    .map(|(_, v)| v.clone())
                    .unwrap_or(DataValue::Null)
            })
            .collect();
        if key_values.iter().any(DataValue::is_null) {
            return Err(AppError::Deserialization(format!(
                "'{}' row is missing key values",
                et.short_name
            )));
        }
        let key = EntityKey::new(et.short_name.clone(), key_values);

        let (id, overwritten) = match self.get_entity_by_key(&key) {
            Some(id) => {
                let state = self.entity_state(id)?;
                if session.skip_deleted && state.is_deleted() {
                    (id, false)
                } else if session.strategy == MergeStrategy::OverwriteChanges || state.is_unchanged() {
                    self.overwrite_entity(id, &values, state, session.merge_action)?;
                    (id, true)
                } else {
                    (id, false)
                }
            }
            None => {
                let id = self.create_entity(&et.short_name, values, EntityState::Detached)?;
                self.attach_entity_with(
                    id,
                    EntityState::Unchanged,
                    WriteContext::loading(),
                    session.attach_action,
                )?;
                (id, true)
            }
        };
        session.note(id);
        if let Some(node_id) = node_id {
            session
                .ref_map
                .entry(node_id.to_string())
                .or_insert(Merged::Entity(id));
        }

        for np in &et.navigation_properties {
            let Some(raw) = map.get(&np.name) else {
                continue;
            };
            if raw.is_null() {
                continue;
            }
            let ctx = WriteContext::loading();
            if np.is_scalar {
                match self.merge_node(raw, session, false, Some(&np.entity_type_name))? {
                    Merged::Entity(target) if overwritten => {
                        self.write_scalar_navigation(id, &np.name, Some(target), ctx)?;
                    }
                    Merged::Ref(ref_id) if overwritten => session.deferred.push((
                        ref_id,
                        DeferredTarget::ScalarNav {
                            entity: id,
                            nav: np.name.clone(),
                        },
                    )),
                    _ => {}
                }
            } else {
                let Merged::List(items) =
                    self.merge_node(raw, session, false, Some(&np.entity_type_name))?
                else {
                    continue;
                };
                let mut members = Vec::new();
                for item in items {
                    match item {
                        Merged::Entity(member) => members.push(member),
                        Merged::Ref(ref_id) => session.deferred.push((
                            ref_id,
                            DeferredTarget::CollectionNav {
                                entity: id,
                                nav: np.name.clone(),
                            },
                        )),
                        _ => {}
                    }
                }
                self.add_to_collection(id, &np.name, members, None, ctx)?;
                self.record_mut(id)?.aspect.mark_loaded(&np.name);
            }
        }
        Ok(id)
    }

    /// Replace cached values with incoming ones and settle as `Unchanged`.
    /// Notifies only when something actually changed.
    fn overwrite_entity(
        &mut self,
        id: EntityId,
        values: &[(String, DataValue)],
        state: EntityState,
        action: EntityAction,
    ) -> AppResult<()> {
        let changed = self.merge_entity_values(id, values)?;
        if !state.is_unchanged() {
            {
                let aspect = &mut self.record_mut(id)?.aspect;
                aspect.entity_state = EntityState::Unchanged;
                aspect.original_values.clear();
            }
            if state.is_deleted() {
                self.link_related_entities(id)?;
            }
            self.publish_entity_changed(EntityAction::EntityStateChange, id, None);
            self.update_has_changes(false, WriteContext::loading());
        }
        if changed || !state.is_unchanged() {
            self.publish_entity_changed(action, id, None);
        }
        Ok(())
    }

    /// Write incoming values in loading mode; returns true if any differed.
    pub(crate) fn merge_entity_values(
        &mut self,
        id: EntityId,
        values: &[(String, DataValue)],
    ) -> AppResult<bool> {
        let mut changed = false;
        for (name, value) in values {
            if self.raw_value(id, name)?.loosely_equals(value) {
                continue;
            }
            self.write_data_property(id, name, value.clone(), WriteContext::loading())?;
            changed = true;
        }
        Ok(changed)
    }

    fn flush_deferred(&mut self, session: &mut MergeSession) -> AppResult<()> {
        let ctx = WriteContext::loading();
        for (ref_id, target) in std::mem::take(&mut session.deferred) {
            let Some(Merged::Entity(related)) = session.ref_map.get(&ref_id).cloned() else {
                warn!(node_ref = %ref_id, "unresolved payload reference");
                continue;
            };
            match target {
                DeferredTarget::ScalarNav { entity, nav } => {
                    self.write_scalar_navigation(entity, &nav, Some(related), ctx)?;
                }
                DeferredTarget::CollectionNav { entity, nav } => {
                    self.add_to_collection(entity, &nav, vec![related], None, ctx)?;
                }
            }
        }
        Ok(())
    }
}

fn resolve_refs(node: Merged, ref_map: &HashMap<String, Merged>, path: &mut Vec<String>) -> Merged {
    match node {
        Merged::Ref(ref_id) => {
            if path.contains(&ref_id) {
                return Merged::Value(DataValue::Null);
            }
            match ref_map.get(&ref_id) {
                Some(target) => {
                    path.push(ref_id);
                    let resolved = resolve_refs(target.clone(), ref_map, path);
                    path.pop();
                    resolved
                }
                None => {
                    warn!(node_ref = %ref_id, "unresolved payload reference");
                    Merged::Value(DataValue::Null)
                }
            }
        }
        Merged::Object(fields) => Merged::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, resolve_refs(v, ref_map, path)))
                .collect(),
        ),
        Merged::List(items) => Merged::List(
            items
                .into_iter()
                .map(|v| resolve_refs(v, ref_map, path))
                .collect(),
        ),
        other => other,
    }
}

fn push_row(results: &mut Vec<QueryRow>, node: Merged) {
    match node {
        Merged::Entity(id) => results.push(QueryRow::Entity(id)),
        Merged::Object(fields) => results.push(QueryRow::Projection(
            fields.into_iter().map(|(k, v)| (k, projected(v))).collect(),
        )),
        Merged::List(items) => {
            for item in items {
                push_row(results, item);
            }
        }
        Merged::Value(value) => results.push(QueryRow::Value(value)),
        Merged::Ref(_) => results.push(QueryRow::Value(DataValue::Null)),
    }
}

fn projected(node: Merged) -> ProjectedValue {
    match node {
        Merged::Entity(id) => ProjectedValue::Entity(Some(id)),
        Merged::Object(fields) => {
            ProjectedValue::Object(fields.into_iter().map(|(k, v)| (k, projected(v))).collect())
        }
        Merged::List(items) if items.iter().all(|i| matches!(i, Merged::Entity(_))) && !items.is_empty() => {
            ProjectedValue::Entities(
                items
                    .into_iter()
                    .filter_map(|i| match i {
                        Merged::Entity(id) => Some(id),
                        _ => None,
                    })
                    .collect(),
            )
        }
        Merged::List(items) => ProjectedValue::List(items.into_iter().map(projected).collect()),
        Merged::Value(value) => ProjectedValue::Value(value),
        Merged::Ref(_) => ProjectedValue::Value(DataValue::Null),
    }
}
