// Ent Schema - entity type metadata consumed by the cache
// Declarative definitions (serde) are built into runtime EntityTypes held by a MetadataStore.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::core::data_value::{DataType, DataValue};
use crate::ent_framework::validators::{MaxLengthValidator, RequiredValidator, Validator};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AutoGeneratedKeyType {
    #[default]
    None,
    Identity,
    KeyGenerator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConcurrencyMode {
    #[default]
    None,
    Fixed,
}

fn default_true() -> bool {
    true
}

/// Data property definition - the serialisable form of a `DataProperty`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPropertyDef {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "default_true")]
    pub is_nullable: bool,
    #[serde(default)]
    pub is_part_of_key: bool,
    #[serde(default)]
    pub is_unmapped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub concurrency_mode: ConcurrencyMode,
}

impl DataPropertyDef {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            is_nullable: true,
            is_part_of_key: false,
            is_unmapped: false,
            default_value: None,
            max_length: None,
            concurrency_mode: ConcurrencyMode::None,
        }
    }

    /// Key properties are never nullable
    pub fn key(mut self) -> Self {
        self.is_part_of_key = true;
        self.is_nullable = false;
        self
    }

    pub fn required(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn concurrency(mut self) -> Self {
        self.concurrency_mode = ConcurrencyMode::Fixed;
        self
    }

    pub fn unmapped(mut self) -> Self {
        self.is_unmapped = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// Navigation property definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationPropertyDef {
    pub name: String,
    pub entity_type_name: String,
    pub is_scalar: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_key_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inv_foreign_key_names: Vec<String>,
}

impl NavigationPropertyDef {
    pub fn scalar(name: &str, entity_type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            entity_type_name: entity_type_name.to_string(),
            is_scalar: true,
            association_name: None,
            foreign_key_names: Vec::new(),
            inv_foreign_key_names: Vec::new(),
        }
    }

    pub fn collection(name: &str, entity_type_name: &str) -> Self {
        Self {
            is_scalar: false,
            ..Self::scalar(name, entity_type_name)
        }
    }

    pub fn association(mut self, association_name: &str) -> Self {
        self.association_name = Some(association_name.to_string());
        self
    }

    pub fn foreign_keys(mut self, names: &[&str]) -> Self {
        self.foreign_key_names = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn inv_foreign_keys(mut self, names: &[&str]) -> Self {
        self.inv_foreign_key_names = names.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Entity type definition - what metadata import/export exchanges
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTypeDef {
    pub short_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_resource_name: Option<String>,
    #[serde(default)]
    pub auto_generated_key_type: AutoGeneratedKeyType,
    #[serde(default)]
    pub data_properties: Vec<DataPropertyDef>,
    #[serde(default)]
    pub navigation_properties: Vec<NavigationPropertyDef>,
}

impl EntityTypeDef {
    pub fn new(short_name: &str, namespace: &str) -> Self {
        Self {
            short_name: short_name.to_string(),
            namespace: namespace.to_string(),
            default_resource_name: None,
            auto_generated_key_type: AutoGeneratedKeyType::None,
            data_properties: Vec::new(),
            navigation_properties: Vec::new(),
        }
    }

    pub fn resource(mut self, resource_name: &str) -> Self {
        self.default_resource_name = Some(resource_name.to_string());
        self
    }

    pub fn auto_generated_key(mut self, key_type: AutoGeneratedKeyType) -> Self {
        self.auto_generated_key_type = key_type;
        self
    }

    pub fn data(mut self, property: DataPropertyDef) -> Self {
        self.data_properties.push(property);
        self
    }

    pub fn nav(mut self, property: NavigationPropertyDef) -> Self {
        self.navigation_properties.push(property);
        self
    }
}

#[derive(Debug, Clone)]
pub struct DataProperty {
    pub name: String,
    pub data_type: DataType,
    pub is_nullable: bool,
    pub is_part_of_key: bool,
    pub is_unmapped: bool,
    pub default_value: DataValue,
    pub max_length: Option<usize>,
    pub concurrency_mode: ConcurrencyMode,
    pub validators: Vec<Arc<dyn Validator>>,
    /// Scalar navigation on the same type whose foreign key this is.
    pub related_navigation_property: Option<String>,
    /// (parent type, parent collection navigation) for foreign keys that are
    /// only reachable from the parent side.
    pub inverse_navigation_property: Option<(String, String)>,
    def: DataPropertyDef,
}

impl DataProperty {
    fn from_def(def: DataPropertyDef) -> AppResult<Self> {
        let default_value = match &def.default_value {
            Some(v) => def.data_type.from_json(v)?,
            None if def.is_nullable => DataValue::Null,
            None => def.data_type.default_value(),
        };
        let mut validators: Vec<Arc<dyn Validator>> = Vec::new();
        if !def.is_nullable {
            validators.push(Arc::new(RequiredValidator::default()));
        }
        if let Some(max_length) = def.max_length {
            validators.push(Arc::new(MaxLengthValidator { max_length }));
        }
        Ok(Self {
            name: def.name.clone(),
            data_type: def.data_type,
            is_nullable: def.is_nullable,
            is_part_of_key: def.is_part_of_key,
            is_unmapped: def.is_unmapped,
            default_value,
            max_length: def.max_length,
            concurrency_mode: def.concurrency_mode,
            validators,
            related_navigation_property: None,
            inverse_navigation_property: None,
            def,
        })
    }

    pub fn is_concurrency_property(&self) -> bool {
        self.concurrency_mode == ConcurrencyMode::Fixed
    }

    pub fn is_foreign_key(&self) -> bool {
        self.related_navigation_property.is_some() || self.inverse_navigation_property.is_some()
    }

    pub fn to_def(&self) -> DataPropertyDef {
        self.def.clone()
    }
}

#[derive(Debug, Clone)]
pub struct NavigationProperty {
    pub name: String,
    pub entity_type_name: String,
    pub is_scalar: bool,
    pub association_name: Option<String>,
    pub foreign_key_names: Vec<String>,
    pub inv_foreign_key_names: Vec<String>,
    /// Resolved inverse navigation on the target type.
    pub inverse: Option<String>,
    pub validators: Vec<Arc<dyn Validator>>,
    def: NavigationPropertyDef,
}

impl NavigationProperty {
    fn from_def(def: NavigationPropertyDef) -> Self {
        Self {
            name: def.name.clone(),
            entity_type_name: def.entity_type_name.clone(),
            is_scalar: def.is_scalar,
            association_name: def.association_name.clone(),
            foreign_key_names: def.foreign_key_names.clone(),
            inv_foreign_key_names: def.inv_foreign_key_names.clone(),
            inverse: None,
            validators: Vec::new(),
            def,
        }
    }

    pub fn to_def(&self) -> NavigationPropertyDef {
        self.def.clone()
    }
}

#[derive(Debug, Clone)]
pub struct EntityType {
    pub short_name: String,
    pub namespace: String,
    pub default_resource_name: Option<String>,
    pub auto_generated_key_type: AutoGeneratedKeyType,
    pub data_properties: Vec<DataProperty>,
    pub navigation_properties: Vec<NavigationProperty>,
    pub validators: Vec<Arc<dyn Validator>>,
}

impl EntityType {
    pub fn from_def(def: EntityTypeDef) -> AppResult<Self> {
        let data_properties = def
            .data_properties
            .into_iter()
            .map(DataProperty::from_def)
            .collect::<AppResult<Vec<_>>>()?;
        let entity_type = Self {
            short_name: def.short_name,
            namespace: def.namespace,
            default_resource_name: def.default_resource_name,
            auto_generated_key_type: def.auto_generated_key_type,
            data_properties,
            navigation_properties: def
                .navigation_properties
                .into_iter()
                .map(NavigationProperty::from_def)
                .collect(),
            validators: Vec::new(),
        };
        if entity_type.key_properties().is_empty() {
            return Err(AppError::Configuration(format!(
                "Entity type '{}' declares no key properties",
                entity_type.short_name
            )));
        }
        Ok(entity_type)
    }

    pub fn name(&self) -> &str {
        &self.short_name
    }

    /// `Short:#Namespace`, the form used in save bundles.
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.short_name.clone()
        } else {
            format!("{}:#{}", self.short_name, self.namespace)
        }
    }

    pub fn data_property(&self, name: &str) -> Option<&DataProperty> {
        self.data_properties.iter().find(|p| p.name == name)
    }

    pub fn navigation_property(&self, name: &str) -> Option<&NavigationProperty> {
        self.navigation_properties.iter().find(|p| p.name == name)
    }

    pub fn key_properties(&self) -> Vec<&DataProperty> {
        self.data_properties
            .iter()
            .filter(|p| p.is_part_of_key)
            .collect()
    }

    pub fn concurrency_properties(&self) -> Vec<&DataProperty> {
        self.data_properties
            .iter()
            .filter(|p| p.is_concurrency_property())
            .collect()
    }

    pub fn data_property_names(&self) -> Vec<String> {
        self.data_properties.iter().map(|p| p.name.clone()).collect()
    }

    /// Foreign keys that belong to a parent's collection navigation with no
    /// navigation back from this type.
    pub fn inverse_foreign_key_properties(&self) -> Vec<&DataProperty> {
        self.data_properties
            .iter()
            .filter(|p| p.related_navigation_property.is_none() && p.inverse_navigation_property.is_some())
            .collect()
    }

    pub fn to_def(&self) -> EntityTypeDef {
        EntityTypeDef {
            short_name: self.short_name.clone(),
            namespace: self.namespace.clone(),
            default_resource_name: self.default_resource_name.clone(),
            auto_generated_key_type: self.auto_generated_key_type,
            data_properties: self.data_properties.iter().map(DataProperty::to_def).collect(),
            navigation_properties: self
                .navigation_properties
                .iter()
                .map(NavigationProperty::to_def)
                .collect(),
        }
    }
}

/// Result of resolving a dotted property path against an entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    /// Entity type that owns the final segment.
    pub owner_type: String,
    pub property_name: String,
    /// `None` when the final segment is a navigation property.
    pub data_type: Option<DataType>,
    pub is_scalar: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MetadataStore {
    entity_types: HashMap<String, Arc<EntityType>>,
    resource_map: HashMap<String, String>,
    /// target type -> (owner type, navigation) waiting for that target
    pending_navigations: HashMap<String, Vec<(String, String)>>,
    fetched_services: HashSet<String>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_types.is_empty()
    }

    pub fn add_entity_type(&mut self, def: EntityTypeDef) -> AppResult<()> {
        if self.entity_types.contains_key(&def.short_name) {
            return Err(AppError::Configuration(format!(
                "Entity type '{}' is already registered",
                def.short_name
            )));
        }
        let entity_type = EntityType::from_def(def)?;
        let name = entity_type.short_name.clone();
        if let Some(resource) = &entity_type.default_resource_name {
            self.resource_map.insert(resource.clone(), name.clone());
        }
        let nav_names: Vec<String> = entity_type
            .navigation_properties
            .iter()
            .map(|np| np.name.clone())
            .collect();
        self.entity_types.insert(name.clone(), Arc::new(entity_type));
        debug!(entity_type = %name, "registered entity type");

        for nav in nav_names {
            self.resolve_navigation(&name, &nav);
        }
        if let Some(waiting) = self.pending_navigations.remove(&name) {
            for (owner, nav) in waiting {
                self.resolve_navigation(&owner, &nav);
            }
        }
        Ok(())
    }

    fn resolve_navigation(&mut self, owner: &str, nav_name: &str) {
        let Some(owner_type) = self.entity_types.get(owner).cloned() else {
            return;
        };
        let Some(nav) = owner_type.navigation_property(nav_name).cloned() else {
            return;
        };
        let Some(target_type) = self.entity_types.get(&nav.entity_type_name).cloned() else {
            self.pending_navigations
                .entry(nav.entity_type_name.clone())
                .or_default()
                .push((owner.to_string(), nav_name.to_string()));
            return;
        };

        let inverse = nav.association_name.as_ref().and_then(|assoc| {
            target_type
                .navigation_properties
                .iter()
                .find(|np| {
                    np.association_name.as_deref() == Some(assoc.as_str())
                        && !(target_type.short_name == owner && np.name == nav.name)
                })
                .cloned()
        });

        if let Some(owner_mut) = self.entity_types.get_mut(owner).map(Arc::make_mut) {
            if let Some(np) = owner_mut
                .navigation_properties
                .iter_mut()
                .find(|np| np.name == nav.name)
            {
                if let Some(inv) = &inverse {
                    np.inverse = Some(inv.name.clone());
                    if np.inv_foreign_key_names.is_empty() {
                        np.inv_foreign_key_names = inv.foreign_key_names.clone();
                    }
                }
            }
            for fk in &nav.foreign_key_names {
                if let Some(dp) = owner_mut.data_properties.iter_mut().find(|p| &p.name == fk) {
                    dp.related_navigation_property = Some(nav.name.clone());
                }
            }
        }

        if let Some(target_mut) = self
            .entity_types
            .get_mut(&nav.entity_type_name)
            .map(Arc::make_mut)
        {
            if let Some(inv) = &inverse {
                if let Some(np) = target_mut
                    .navigation_properties
                    .iter_mut()
                    .find(|np| np.name == inv.name)
                {
                    np.inverse = Some(nav.name.clone());
                    if np.inv_foreign_key_names.is_empty() {
                        np.inv_foreign_key_names = nav.foreign_key_names.clone();
                    }
                }
            }
            for fk in &nav.inv_foreign_key_names {
                if let Some(dp) = target_mut.data_properties.iter_mut().find(|p| &p.name == fk) {
                    dp.inverse_navigation_property = Some((owner.to_string(), nav.name.clone()));
                }
            }
        }
    }

    pub fn get_entity_type(&self, name: &str) -> Option<Arc<EntityType>> {
        self.entity_types.get(name).cloned()
    }

    pub fn entity_type(&self, name: &str) -> AppResult<Arc<EntityType>> {
        self.get_entity_type(name)
            .ok_or_else(|| AppError::UnknownEntityType(name.to_string()))
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.entity_types.values()
    }

    pub fn entity_type_for_resource(&self, resource_name: &str) -> Option<Arc<EntityType>> {
        self.resource_map
            .get(resource_name)
            .and_then(|name| self.get_entity_type(name))
    }

    pub fn set_resource_name(&mut self, resource_name: &str, entity_type: &str) -> AppResult<()> {
        self.entity_type(entity_type)?;
        self.resource_map
            .insert(resource_name.to_string(), entity_type.to_string());
        Ok(())
    }

    /// Resolve `Namespace.Type, Assembly` or `Type:#Namespace` type strings.
    pub fn entity_type_from_type_string(&self, type_string: &str) -> Option<Arc<EntityType>> {
        let without_assembly = type_string.split(',').next().unwrap_or(type_string).trim();
        let short = match without_assembly.split_once(":#") {
            Some((short, _)) => short,
            None => without_assembly.rsplit('.').next().unwrap_or(without_assembly),
        };
        self.get_entity_type(short)
    }

    pub fn add_property_validator(
        &mut self,
        entity_type: &str,
        property: &str,
        validator: Arc<dyn Validator>,
    ) -> AppResult<()> {
        let et = self
            .entity_types
            .get_mut(entity_type)
            .map(Arc::make_mut)
            .ok_or_else(|| AppError::UnknownEntityType(entity_type.to_string()))?;
        if let Some(dp) = et.data_properties.iter_mut().find(|p| p.name == property) {
            dp.validators.push(validator);
            return Ok(());
        }
        if let Some(np) = et.navigation_properties.iter_mut().find(|p| p.name == property) {
            np.validators.push(validator);
            return Ok(());
        }
        Err(AppError::unknown_property(entity_type, property))
    }

    pub fn add_entity_validator(
        &mut self,
        entity_type: &str,
        validator: Arc<dyn Validator>,
    ) -> AppResult<()> {
        let et = self
            .entity_types
            .get_mut(entity_type)
            .map(Arc::make_mut)
            .ok_or_else(|| AppError::UnknownEntityType(entity_type.to_string()))?;
        et.validators.push(validator);
        Ok(())
    }

    /// Walk a dotted path (`Customer.CompanyName`) through scalar or
    /// collection navigations.
    pub fn resolve_property_path(&self, entity_type: &str, path: &str) -> AppResult<ResolvedPath> {
        let mut current = self.entity_type(entity_type)?;
        let segments: Vec<&str> = path.split(['.', '/']).collect();
        for (i, segment) in segments.iter().enumerate() {
            let is_last = i + 1 == segments.len();
            if let Some(dp) = current.data_property(segment) {
                if !is_last {
                    return Err(AppError::unknown_property(entity_type, path));
                }
                return Ok(ResolvedPath {
                    owner_type: current.short_name.clone(),
                    property_name: dp.name.clone(),
                    data_type: Some(dp.data_type),
                    is_scalar: true,
                });
            }
            let np = current
                .navigation_property(segment)
                .ok_or_else(|| AppError::unknown_property(entity_type, path))?;
            if is_last {
                return Ok(ResolvedPath {
                    owner_type: current.short_name.clone(),
                    property_name: np.name.clone(),
                    data_type: None,
                    is_scalar: np.is_scalar,
                });
            }
            let next = self.entity_type(&np.entity_type_name)?;
            current = next;
        }
        Err(AppError::unknown_property(entity_type, path))
    }

    pub fn has_metadata_for(&self, service_name: &str) -> bool {
        self.fetched_services.contains(service_name)
    }

    /// Record a completed metadata fetch; fetching the same service twice is an error.
    pub fn mark_fetched(&mut self, service_name: &str) -> AppResult<()> {
        if !self.fetched_services.insert(service_name.to_string()) {
            return Err(AppError::MetadataAlreadyFetched(service_name.to_string()));
        }
        Ok(())
    }

    /// Accepts `{ "entityTypes": [...], "resourceEntityTypeMap": {...} }` or
    /// a bare array of entity type definitions. Types already present are kept.
    pub fn import_metadata(&mut self, metadata: &Value) -> AppResult<usize> {
        let (types, resources) = match metadata {
            Value::Array(_) => (metadata.clone(), Value::Null),
            Value::Object(map) => (
                map.get("entityTypes").cloned().unwrap_or(Value::Array(Vec::new())),
                map.get("resourceEntityTypeMap").cloned().unwrap_or(Value::Null),
            ),
            Value::String(text) => {
                return self.import_metadata(&serde_json::from_str::<Value>(text)?)
            }
            _ => {
                return Err(AppError::Deserialization(
                    "metadata must be an object or an array".to_string(),
                ))
            }
        };
        let defs: Vec<EntityTypeDef> = serde_json::from_value(types)?;
        let mut added = 0;
        for def in defs {
            if self.entity_types.contains_key(&def.short_name) {
                continue;
            }
            self.add_entity_type(def)?;
            added += 1;
        }
        if let Value::Object(map) = resources {
            for (resource, type_name) in map {
                if let Some(type_name) = type_name.as_str() {
                    let short = type_name.split(":#").next().unwrap_or(type_name);
                    if self.entity_types.contains_key(short) {
                        self.resource_map.insert(resource, short.to_string());
                    }
                }
            }
        }
        Ok(added)
    }

    pub fn export_metadata(&self) -> Value {
        let mut names: Vec<&String> = self.entity_types.keys().collect();
        names.sort();
        let types: Vec<EntityTypeDef> = names
            .into_iter()
            .filter_map(|n| self.entity_types.get(n))
            .map(|et| et.to_def())
            .collect();
        let resources: serde_json::Map<String, Value> = self
            .resource_map
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        json!({
            "entityTypes": types,
            "resourceEntityTypeMap": resources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MetadataStore {
        let mut store = MetadataStore::new();
        // Order registered first so its Customer navigation starts out pending
        store
            .add_entity_type(
                EntityTypeDef::new("Order", "Demo")
                    .resource("Orders")
                    .data(DataPropertyDef::new("OrderID", DataType::Int32).key())
                    .data(DataPropertyDef::new("CustomerID", DataType::Int32))
                    .nav(
                        NavigationPropertyDef::scalar("Customer", "Customer")
                            .association("Customer_Orders")
                            .foreign_keys(&["CustomerID"]),
                    ),
            )
            .unwrap();
        store
            .add_entity_type(
                EntityTypeDef::new("Customer", "Demo")
                    .resource("Customers")
                    .auto_generated_key(AutoGeneratedKeyType::Identity)
                    .data(DataPropertyDef::new("CustomerID", DataType::Int32).key())
                    .data(DataPropertyDef::new("Name", DataType::String).max_length(10))
                    .nav(
                        NavigationPropertyDef::collection("Orders", "Order")
                            .association("Customer_Orders"),
                    ),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_inverse_resolution_after_late_registration() {
        let store = store();
        let order = store.entity_type("Order").unwrap();
        let customer = store.entity_type("Customer").unwrap();
        assert_eq!(
            order.navigation_property("Customer").unwrap().inverse.as_deref(),
            Some("Orders")
        );
        assert_eq!(
            customer.navigation_property("Orders").unwrap().inverse.as_deref(),
            Some("Customer")
        );
        assert_eq!(
            customer.navigation_property("Orders").unwrap().inv_foreign_key_names,
            vec!["CustomerID".to_string()]
        );
        assert_eq!(
            order
                .data_property("CustomerID")
                .unwrap()
                .related_navigation_property
                .as_deref(),
            Some("Customer")
        );
    }

    #[test]
    fn test_property_paths() {
        let store = store();
        let resolved = store.resolve_property_path("Order", "Customer.Name").unwrap();
        assert_eq!(resolved.owner_type, "Customer");
        assert_eq!(resolved.data_type, Some(DataType::String));
        assert!(store.resolve_property_path("Order", "Customer.Nope").is_err());
        assert!(store.resolve_property_path("Order", "OrderID.Name").is_err());
    }

    #[test]
    fn test_metadata_round_trip_and_fetch_guard() {
        let mut original = store();
        let exported = original.export_metadata();
        let mut copy = MetadataStore::new();
        assert_eq!(copy.import_metadata(&exported).unwrap(), 2);
        assert!(copy.entity_type_for_resource("Orders").is_some());
        assert_eq!(
            copy.entity_type_from_type_string("Demo.Customer, Model")
                .unwrap()
                .short_name,
            "Customer"
        );

        original.mark_fetched("svc").unwrap();
        assert!(matches!(
            original.mark_fetched("svc"),
            Err(AppError::MetadataAlreadyFetched(_))
        ));
    }

    #[test]
    fn test_type_without_key_is_rejected() {
        let mut store = MetadataStore::new();
        let err = store
            .add_entity_type(
                EntityTypeDef::new("Note", "Demo").data(DataPropertyDef::new("Text", DataType::String)),
            )
            .unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }
}
