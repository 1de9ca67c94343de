// Entity Manager - identity-mapped entity cache with change tracking
// Owns the entity arena, per-type groups, the relation index and the unattached-children map.

mod attach;
mod export;
mod interceptor;
mod merge;
mod query;
mod relation_array;
mod save;
mod shared;
mod state;

pub use export::{ImportOptions, ImportResult};
pub use query::{FetchByKeyResult, QueryOutcome};
pub use save::SaveOutcome;
pub use shared::SharedEntityManager;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::ManagerConfig;
use crate::core::data_value::{DataValue, PropertySource};
use crate::core::entity_key::EntityKey;
use crate::core::entity_state::{EntityAction, EntityState};
use crate::core::key_generator::{KeyGenerator, TempKeyGenerator};
use crate::core::strong_types::{EntityId, ManagerId};
use crate::ent_framework::ent_schema::{EntityType, MetadataStore, NavigationProperty};
use crate::error::{AppError, AppResult, TransportContext};
use crate::infrastructure::entity_aspect::EntityAspect;
use crate::infrastructure::entity_group::EntityGroup;
use crate::infrastructure::events::{
    ArrayChangedArgs, EntityChangedArgs, Event, HasChangesChangedArgs, PropertyChangedArgs,
    PropertyValue, ValidationErrorsChangedArgs,
};
use crate::infrastructure::relation_index::RelationIndex;
use crate::infrastructure::traits::{
    BackingStoreLibrary, DataServiceAdapter, JsonResultsAdapter, ModelLibrary, PropertyStore,
    WebApiJsonResultsAdapter,
};
use crate::infrastructure::unattached_children::UnattachedChildrenMap;
use crate::query::fn_node::FnNode;

/// How a property write should treat its side effects.
///
/// `loading` marks bulk materialisation (query/import/save merges): no dirty
/// tracking, no validation, related entities attach as `Unchanged`.
/// `rejecting` restores original values without re-tracking them.
/// `key_fixup` propagates server keys after a save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteContext {
    pub loading: bool,
    pub rejecting: bool,
    pub key_fixup: bool,
}

impl WriteContext {
    pub fn user() -> Self {
        Self::default()
    }

    pub fn loading() -> Self {
        Self {
            loading: true,
            ..Self::default()
        }
    }

    pub fn rejecting() -> Self {
        Self {
            rejecting: true,
            ..Self::default()
        }
    }

    pub fn key_fixup() -> Self {
        Self {
            loading: true,
            key_fixup: true,
            ..Self::default()
        }
    }

    fn tracks_changes(self) -> bool {
        !self.loading && !self.rejecting
    }
}

pub(crate) struct EntityRecord {
    pub(crate) entity_type: Arc<EntityType>,
    pub(crate) store: Box<dyn PropertyStore>,
    pub(crate) aspect: EntityAspect,
}

/// Notifications queued while a bulk operation is in progress.
#[derive(Debug, Clone)]
pub(crate) enum PendingEvent {
    PropertyChanged(PropertyChangedArgs),
    ArrayChanged(ArrayChangedArgs),
    EntityChanged(EntityChangedArgs),
    ValidationErrorsChanged(ValidationErrorsChangedArgs),
    HasChangesChanged(HasChangesChangedArgs),
}

pub struct EntityManager {
    id: ManagerId,
    config: ManagerConfig,
    metadata: Arc<MetadataStore>,
    data_service: Option<Arc<dyn DataServiceAdapter>>,
    results_adapter: Arc<dyn JsonResultsAdapter>,
    model_library: Arc<dyn ModelLibrary>,
    key_generator: Box<dyn KeyGenerator>,
    /// Slots are never reused; a released slot is `None`.
    records: Vec<Option<Box<EntityRecord>>>,
    groups: HashMap<String, EntityGroup>,
    relations: RelationIndex,
    unattached: UnattachedChildrenMap,
    has_changes: bool,
    in_process: HashSet<(EntityId, String)>,
    pending_pubs: Option<Vec<PendingEvent>>,
    pub entity_changed: Event<EntityChangedArgs>,
    pub has_changes_changed: Event<HasChangesChangedArgs>,
    pub validation_errors_changed: Event<ValidationErrorsChangedArgs>,
    pub array_changed: Event<ArrayChangedArgs>,
}

/// Builder for `EntityManager`; every adapter is chosen explicitly.
pub struct EntityManagerBuilder {
    config: ManagerConfig,
    metadata: Option<Arc<MetadataStore>>,
    data_service: Option<Arc<dyn DataServiceAdapter>>,
    results_adapter: Option<Arc<dyn JsonResultsAdapter>>,
    model_library: Option<Arc<dyn ModelLibrary>>,
    key_generator: Option<Box<dyn KeyGenerator>>,
}

impl EntityManagerBuilder {
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn service_name(mut self, service_name: &str) -> Self {
        self.config.service_name = service_name.to_string();
        self
    }

    pub fn metadata(mut self, metadata: MetadataStore) -> Self {
        self.metadata = Some(Arc::new(metadata));
        self
    }

    pub fn shared_metadata(mut self, metadata: Arc<MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn data_service(mut self, data_service: Arc<dyn DataServiceAdapter>) -> Self {
        self.data_service = Some(data_service);
        self
    }

    pub fn results_adapter(mut self, adapter: Arc<dyn JsonResultsAdapter>) -> Self {
        self.results_adapter = Some(adapter);
        self
    }

    pub fn model_library(mut self, library: Arc<dyn ModelLibrary>) -> Self {
        self.model_library = Some(library);
        self
    }

    pub fn key_generator(mut self, generator: Box<dyn KeyGenerator>) -> Self {
        self.key_generator = Some(generator);
        self
    }

    pub fn build(self) -> AppResult<EntityManager> {
        if self.data_service.is_some() && self.config.service_name.trim().is_empty() {
            return Err(AppError::Configuration(
                "A data service requires a service name".to_string(),
            ));
        }
        FnNode::set_cache_capacity(self.config.expression_cache_capacity);
        let id = ManagerId::next();
        debug!(manager = %id, service = %self.config.service_name, "entity manager created");
        Ok(EntityManager {
            id,
            config: self.config,
            metadata: self.metadata.unwrap_or_default(),
            data_service: self.data_service,
            results_adapter: self
                .results_adapter
                .unwrap_or_else(|| Arc::new(WebApiJsonResultsAdapter)),
            model_library: self
                .model_library
                .unwrap_or_else(|| Arc::new(BackingStoreLibrary)),
            key_generator: self
                .key_generator
                .unwrap_or_else(|| Box::new(TempKeyGenerator::new())),
            records: Vec::new(),
            groups: HashMap::new(),
            relations: RelationIndex::new(),
            unattached: UnattachedChildrenMap::new(),
            has_changes: false,
            in_process: HashSet::new(),
            pending_pubs: None,
            entity_changed: Event::new("entityChanged"),
            has_changes_changed: Event::new("hasChangesChanged"),
            validation_errors_changed: Event::new("validationErrorsChanged"),
            array_changed: Event::new("arrayChanged"),
        })
    }
}

impl EntityManager {
    pub fn builder() -> EntityManagerBuilder {
        EntityManagerBuilder {
            config: ManagerConfig::default(),
            metadata: None,
            data_service: None,
            results_adapter: None,
            model_library: None,
            key_generator: None,
        }
    }

    /// Manager over existing metadata with default adapters and no data service.
    pub fn new(metadata: MetadataStore) -> AppResult<Self> {
        Self::builder().metadata(metadata).build()
    }

    pub fn id(&self) -> ManagerId {
        self.id
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: ManagerConfig) {
        FnNode::set_cache_capacity(config.expression_cache_capacity);
        self.config = config;
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataStore {
        Arc::make_mut(&mut self.metadata)
    }

    pub fn key_generator(&self) -> &dyn KeyGenerator {
        self.key_generator.as_ref()
    }

    /// A new manager sharing this one's metadata, configuration and adapters
    /// but none of its entities.
    pub fn create_empty_copy(&self) -> AppResult<EntityManager> {
        let mut builder = Self::builder()
            .config(self.config.clone())
            .shared_metadata(self.metadata.clone())
            .results_adapter(self.results_adapter.clone())
            .model_library(self.model_library.clone());
        if let Some(ds) = &self.data_service {
            builder = builder.data_service(ds.clone());
        }
        builder.build()
    }

    pub(crate) fn require_data_service(&self) -> AppResult<Arc<dyn DataServiceAdapter>> {
        self.data_service.clone().ok_or_else(|| {
            AppError::Configuration(format!(
                "No data service adapter configured for '{}'",
                self.config.service_name
            ))
        })
    }

    // ---- arena access ----

    pub(crate) fn record(&self, id: EntityId) -> AppResult<&EntityRecord> {
        if id.manager_id() != self.id {
            return Err(AppError::CrossManager(format!(
                "{} belongs to another entity manager than {}",
                id, self.id
            )));
        }
        self.records
            .get(id.index())
            .and_then(|slot| slot.as_deref())
            .ok_or(AppError::UnknownEntity(id))
    }

    pub(crate) fn record_mut(&mut self, id: EntityId) -> AppResult<&mut EntityRecord> {
        if id.manager_id() != self.id {
            return Err(AppError::CrossManager(format!(
                "{} belongs to another entity manager than {}",
                id, self.id
            )));
        }
        self.records
            .get_mut(id.index())
            .and_then(|slot| slot.as_deref_mut())
            .ok_or(AppError::UnknownEntity(id))
    }

    /// True for any entity in this manager's arena, attached or not.
    pub fn contains(&self, id: EntityId) -> bool {
        self.record(id).is_ok()
    }

    pub fn aspect(&self, id: EntityId) -> AppResult<&EntityAspect> {
        Ok(&self.record(id)?.aspect)
    }

    /// Mutable aspect access, for subscribing to its events.
    pub fn aspect_mut(&mut self, id: EntityId) -> AppResult<&mut EntityAspect> {
        Ok(&mut self.record_mut(id)?.aspect)
    }

    pub fn entity_state(&self, id: EntityId) -> AppResult<EntityState> {
        Ok(self.record(id)?.aspect.entity_state)
    }

    pub fn entity_type_of(&self, id: EntityId) -> AppResult<Arc<EntityType>> {
        Ok(self.record(id)?.entity_type.clone())
    }

    pub(crate) fn raw_value(&self, id: EntityId, name: &str) -> AppResult<DataValue> {
        Ok(self
            .record(id)?
            .store
            .get(name)
            .cloned()
            .unwrap_or(DataValue::Null))
    }

    pub fn get_value(&self, id: EntityId, name: &str) -> AppResult<DataValue> {
        let record = self.record(id)?;
        if record.entity_type.data_property(name).is_none() {
            return Err(AppError::unknown_property(&record.entity_type.short_name, name));
        }
        self.raw_value(id, name)
    }

    pub fn get_navigation(&self, id: EntityId, nav: &str) -> AppResult<Option<EntityId>> {
        let np = self.navigation_property(id, nav)?;
        if !np.is_scalar {
            return Err(AppError::InvalidOperation(format!(
                "'{}' is a collection navigation property",
                nav
            )));
        }
        Ok(self.relations.scalar(id, nav))
    }

    pub fn get_collection(&self, id: EntityId, nav: &str) -> AppResult<Vec<EntityId>> {
        let np = self.navigation_property(id, nav)?;
        if np.is_scalar {
            return Err(AppError::InvalidOperation(format!(
                "'{}' is a scalar navigation property",
                nav
            )));
        }
        Ok(self.relations.collection(id, nav).to_vec())
    }

    pub fn get_property(&self, id: EntityId, name: &str) -> AppResult<PropertyValue> {
        let et = self.entity_type_of(id)?;
        if et.data_property(name).is_some() {
            return Ok(PropertyValue::Data(self.raw_value(id, name)?));
        }
        match et.navigation_property(name) {
            Some(np) if np.is_scalar => Ok(PropertyValue::Entity(self.relations.scalar(id, name))),
            Some(_) => Ok(PropertyValue::Entities(
                self.relations.collection(id, name).to_vec(),
            )),
            None => Err(AppError::unknown_property(&et.short_name, name)),
        }
    }

    /// Dotted-path read through scalar navigations (`Customer.CompanyName`).
    /// A missing intermediate entity yields `Null`.
    pub fn get_property_value(&self, id: EntityId, path: &str) -> AppResult<DataValue> {
        let mut current = id;
        let segments: Vec<&str> = path.split(['.', '/']).collect();
        for (i, segment) in segments.iter().enumerate() {
            let et = self.entity_type_of(current)?;
            if i + 1 == segments.len() {
                if et.data_property(segment).is_none() {
                    return Err(AppError::unknown_property(&et.short_name, path));
                }
                return self.raw_value(current, segment);
            }
            match et.navigation_property(segment) {
                Some(np) if np.is_scalar => match self.relations.scalar(current, segment) {
                    Some(next) => current = next,
                    None => return Ok(DataValue::Null),
                },
                _ => return Err(AppError::unknown_property(&et.short_name, path)),
            }
        }
        Err(AppError::unknown_property("", path))
    }

    pub fn view(&self, id: EntityId) -> EntityView<'_> {
        EntityView {
            manager: self,
            entity: id,
        }
    }

    /// Values of every data property, in declaration order.
    pub fn values_of(&self, id: EntityId) -> AppResult<BTreeMap<String, DataValue>> {
        let record = self.record(id)?;
        Ok(record
            .entity_type
            .data_properties
            .iter()
            .map(|dp| {
                (
                    dp.name.clone(),
                    record.store.get(&dp.name).cloned().unwrap_or(DataValue::Null),
                )
            })
            .collect())
    }

    fn navigation_property(&self, id: EntityId, nav: &str) -> AppResult<NavigationProperty> {
        let et = self.entity_type_of(id)?;
        et.navigation_property(nav)
            .cloned()
            .ok_or_else(|| AppError::unknown_property(&et.short_name, nav))
    }

    // ---- keys ----

    pub(crate) fn compute_key(&self, id: EntityId) -> AppResult<EntityKey> {
        let record = self.record(id)?;
        let values = record
            .entity_type
            .key_properties()
            .iter()
            .map(|kp| record.store.get(&kp.name).cloned().unwrap_or(DataValue::Null))
            .collect();
        Ok(EntityKey::new(record.entity_type.short_name.clone(), values))
    }

    /// Cached key, computed on demand.
    pub fn get_key(&self, id: EntityId) -> AppResult<EntityKey> {
        match &self.record(id)?.aspect.key {
            Some(key) => Ok(key.clone()),
            None => self.compute_key(id),
        }
    }

    /// Recompute and cache the key from current values.
    pub fn refresh_key(&mut self, id: EntityId) -> AppResult<EntityKey> {
        let key = self.compute_key(id)?;
        self.record_mut(id)?.aspect.key = Some(key.clone());
        Ok(key)
    }

    /// Key of the parent a scalar navigation points at, built from the
    /// foreign keys; `None` when the navigation has no foreign keys.
    pub fn get_parent_key(&self, id: EntityId, nav: &str) -> AppResult<Option<EntityKey>> {
        let np = self.navigation_property(id, nav)?;
        self.parent_key(id, &np)
    }

    pub(crate) fn parent_key(
        &self,
        id: EntityId,
        np: &NavigationProperty,
    ) -> AppResult<Option<EntityKey>> {
        if !np.is_scalar || np.foreign_key_names.is_empty() {
            return Ok(None);
        }
        let values = np
            .foreign_key_names
            .iter()
            .map(|fk| self.raw_value(id, fk))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Some(EntityKey::new(np.entity_type_name.clone(), values)))
    }

    pub fn get_entity_by_key(&self, key: &EntityKey) -> Option<EntityId> {
        self.groups
            .get(key.entity_type())
            .and_then(|g| g.find_entity_by_key(key))
    }

    pub fn get_entity_by_key_values(
        &self,
        entity_type: &str,
        values: Vec<DataValue>,
    ) -> AppResult<Option<EntityId>> {
        let et = self.metadata.entity_type(entity_type)?;
        let values = et
            .key_properties()
            .iter()
            .zip(values)
            .map(|(kp, v)| kp.data_type.parse(v))
            .collect();
        Ok(self.get_entity_by_key(&EntityKey::new(et.short_name.clone(), values)))
    }

    // ---- creation ----

    /// Create an entity of `entity_type` with the given values. Unless
    /// `state` is `Detached` it is attached in that state immediately.
    pub fn create_entity<I, S>(
        &mut self,
        entity_type: &str,
        values: I,
        state: EntityState,
    ) -> AppResult<EntityId>
    where
        I: IntoIterator<Item = (S, DataValue)>,
        S: AsRef<str>,
    {
        let et = self.metadata.entity_type(entity_type)?;
        let mut store = self.model_library.create_store(&et);
        for (name, value) in values {
            let name = name.as_ref();
            let dp = et
                .data_property(name)
                .ok_or_else(|| AppError::unknown_property(&et.short_name, name))?;
            store.set(name, dp.data_type.parse(value));
        }
        let id = self.push_record(et, store)?;
        if !state.is_detached() {
            self.attach_entity(id, state)?;
        }
        Ok(id)
    }

    /// A detached entity with default values.
    pub fn new_entity(&mut self, entity_type: &str) -> AppResult<EntityId> {
        self.create_entity(entity_type, Vec::<(String, DataValue)>::new(), EntityState::Detached)
    }

    pub(crate) fn push_record(
        &mut self,
        entity_type: Arc<EntityType>,
        store: Box<dyn PropertyStore>,
    ) -> AppResult<EntityId> {
        let index = u32::try_from(self.records.len())
            .map_err(|_| AppError::Internal("entity arena is full".to_string()))?;
        let id = EntityId::from_parts(self.id, index);
        self.records.push(Some(Box::new(EntityRecord {
            entity_type,
            store,
            aspect: EntityAspect::new(id),
        })));
        Ok(id)
    }

    // ---- group scans ----

    /// Attached entities, optionally restricted to some types and states,
    /// grouped by type name then slot order.
    pub fn get_entities(
        &self,
        entity_types: Option<&[&str]>,
        states: Option<&[EntityState]>,
    ) -> Vec<EntityId> {
        let mut names: Vec<&String> = self
            .groups
            .keys()
            .filter(|n| entity_types.map_or(true, |types| types.contains(&n.as_str())))
            .collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|n| self.groups.get(n))
            .flat_map(|g| g.entity_ids())
            .filter(|id| {
                let state = self
                    .records
                    .get(id.index())
                    .and_then(|slot| slot.as_deref())
                    .map(|r| r.aspect.entity_state)
                    .unwrap_or(EntityState::Detached);
                !state.is_detached() && states.map_or(true, |s| s.contains(&state))
            })
            .collect()
    }

    pub fn get_changes(&self, entity_types: Option<&[&str]>) -> Vec<EntityId> {
        self.get_entities(
            entity_types,
            Some(&[EntityState::Added, EntityState::Modified, EntityState::Deleted]),
        )
    }

    pub fn has_changes(&self) -> bool {
        self.has_changes
    }

    pub fn has_changes_for(&self, entity_types: &[&str]) -> bool {
        !self.get_changes(Some(entity_types)).is_empty()
    }

    fn compute_has_changes(&self) -> bool {
        self.groups.values().flat_map(|g| g.entity_ids()).any(|id| {
            self.records
                .get(id.index())
                .and_then(|slot| slot.as_deref())
                .map(|r| r.aspect.entity_state.is_added_modified_or_deleted())
                .unwrap_or(false)
        })
    }

    /// Cheap path when an entity became dirty; rescan only when something
    /// may have become clean. Bulk rejects defer to one final recompute.
    pub(crate) fn update_has_changes(&mut self, needs_save: bool, ctx: WriteContext) {
        if ctx.rejecting {
            return;
        }
        if needs_save {
            if !self.has_changes {
                self.has_changes = true;
                self.publish(PendingEvent::HasChangesChanged(HasChangesChangedArgs {
                    has_changes: true,
                }));
            }
        } else if self.has_changes {
            self.recompute_has_changes();
        }
    }

    pub(crate) fn recompute_has_changes(&mut self) {
        let now = self.compute_has_changes();
        if now != self.has_changes {
            self.has_changes = now;
            self.publish(PendingEvent::HasChangesChanged(HasChangesChangedArgs {
                has_changes: now,
            }));
        }
    }

    /// Detach everything and reset temporary keys.
    pub fn clear(&mut self) {
        let outer = self.begin_batch();
        for record in self.records.iter_mut().flatten() {
            if record.aspect.is_attached() {
                record.aspect.reset_for_detach();
            }
        }
        self.groups.clear();
        self.relations.clear();
        self.unattached.clear();
        self.key_generator.clear();
        self.in_process.clear();
        self.publish(PendingEvent::EntityChanged(EntityChangedArgs {
            action: EntityAction::Clear,
            entity: None,
            property_name: None,
        }));
        if self.has_changes {
            self.has_changes = false;
            self.publish(PendingEvent::HasChangesChanged(HasChangesChangedArgs {
                has_changes: false,
            }));
        }
        debug!(manager = %self.id, "cache cleared");
        self.end_batch(outer);
    }

    /// Free every detached entity. Their handles stop resolving and report
    /// `UnknownEntity`; slots are never handed out again, so a stale handle
    /// cannot reach a newer entity.
    pub fn release_detached(&mut self) -> usize {
        let mut released = 0;
        for slot in self.records.iter_mut() {
            if slot.as_ref().map_or(false, |r| !r.aspect.is_attached()) {
                *slot = None;
                released += 1;
            }
        }
        debug!(manager = %self.id, released, "detached entities released");
        released
    }

    // ---- notifications ----

    /// Start collecting notifications; returns true for the outermost batch.
    pub(crate) fn begin_batch(&mut self) -> bool {
        if self.pending_pubs.is_none() {
            self.pending_pubs = Some(Vec::new());
            true
        } else {
            false
        }
    }

    pub(crate) fn end_batch(&mut self, outer: bool) {
        if !outer {
            return;
        }
        if let Some(events) = self.pending_pubs.take() {
            for event in events {
                self.fire(event);
            }
        }
    }

    pub(crate) fn publish(&mut self, event: PendingEvent) {
        match &mut self.pending_pubs {
            Some(pending) => pending.push(event),
            None => self.fire(event),
        }
    }

    fn fire(&self, event: PendingEvent) {
        match event {
            PendingEvent::PropertyChanged(args) => {
                if let Some(record) = self.records.get(args.entity.index()).and_then(|slot| slot.as_deref()) {
                    record.aspect.property_changed.publish(&args);
                }
            }
            PendingEvent::ArrayChanged(args) => {
                self.array_changed.publish(&args);
            }
            PendingEvent::EntityChanged(args) => {
                self.entity_changed.publish(&args);
            }
            PendingEvent::ValidationErrorsChanged(args) => {
                if let Some(record) = self.records.get(args.entity.index()).and_then(|slot| slot.as_deref()) {
                    record.aspect.validation_errors_changed.publish(&args);
                }
                self.validation_errors_changed.publish(&args);
            }
            PendingEvent::HasChangesChanged(args) => {
                self.has_changes_changed.publish(&args);
            }
        }
    }

    pub(crate) fn publish_entity_changed(
        &mut self,
        action: EntityAction,
        entity: EntityId,
        property_name: Option<&str>,
    ) {
        self.publish(PendingEvent::EntityChanged(EntityChangedArgs {
            action,
            entity: Some(entity),
            property_name: property_name.map(str::to_string),
        }));
    }

    // ---- metadata ----

    /// Fetch and import metadata for the configured service. A second fetch
    /// for the same service is an error.
    #[instrument(skip(self), fields(service = %self.config.service_name))]
    pub async fn fetch_metadata(&mut self) -> AppResult<()> {
        let adapter = self.begin_fetch_metadata()?;
        let service_name = self.config.service_name.clone();
        let raw = adapter.fetch_metadata(&service_name).await;
        self.complete_fetch_metadata(raw)
    }

    pub(crate) fn begin_fetch_metadata(&self) -> AppResult<Arc<dyn DataServiceAdapter>> {
        let adapter = self.require_data_service()?;
        if self.metadata.has_metadata_for(&self.config.service_name) {
            return Err(AppError::MetadataAlreadyFetched(
                self.config.service_name.clone(),
            ));
        }
        Ok(adapter)
    }

    pub(crate) fn complete_fetch_metadata(
        &mut self,
        raw: anyhow::Result<serde_json::Value>,
    ) -> AppResult<()> {
        let service_name = self.config.service_name.clone();
        let metadata = raw.map_err(|e| {
            warn!(service = %service_name, error = %e, "metadata fetch failed");
            AppError::transport(
                TransportContext::Metadata {
                    service_name: service_name.clone(),
                },
                e,
            )
        })?;
        let store = Arc::make_mut(&mut self.metadata);
        store.mark_fetched(&service_name)?;
        let added = store.import_metadata(&metadata)?;
        info!(service = %service_name, entity_types = added, "metadata fetched");
        Ok(())
    }

    pub(crate) fn needs_metadata(&self) -> bool {
        self.config.has_server_metadata
            && self.data_service.is_some()
            && !self.metadata.has_metadata_for(&self.config.service_name)
    }
}

/// Read-only view of one entity for path-based evaluation.
pub struct EntityView<'a> {
    manager: &'a EntityManager,
    entity: EntityId,
}

impl EntityView<'_> {
    pub fn entity(&self) -> EntityId {
        self.entity
    }
}

impl PropertySource for EntityView<'_> {
    fn value_at(&self, path: &str) -> DataValue {
        self.manager
            .get_property_value(self.entity, path)
            .unwrap_or(DataValue::Null)
    }
}
