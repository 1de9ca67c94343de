// Capability traits - transport, results interpretation and property storage
// Implementations are chosen explicitly when a manager is built.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::data_value::DataValue;
use crate::ent_framework::ent_schema::{EntityType, MetadataStore};

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Raw payload; the results adapter extracts the rows.
    pub results: Value,
    pub inline_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMapping {
    pub entity_type_name: String,
    pub temp_value: Value,
    pub real_value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResult {
    pub entities: Vec<Value>,
    #[serde(default)]
    pub key_mappings: Vec<KeyMapping>,
}

/// Remote data service. Failures are reported as errors and never retried
/// by the cache.
#[async_trait]
pub trait DataServiceAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_metadata(&self, service_name: &str) -> anyhow::Result<Value>;

    async fn execute_query(&self, uri: &str) -> anyhow::Result<QueryResult>;

    async fn save_changes(&self, bundle: &Value) -> anyhow::Result<SaveResult>;
}

/// What the merge pipeline knows about the node being visited.
pub struct NodeContext<'a> {
    pub metadata: &'a MetadataStore,
    pub is_top_level: bool,
    /// Entity type expected by the parent's navigation property.
    pub navigation_target: Option<&'a str>,
    /// Entity type the query targets, used for untyped top-level rows.
    pub query_entity_type: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeMeta {
    pub entity_type: Option<Arc<EntityType>>,
    pub node_id: Option<String>,
    pub node_ref_id: Option<String>,
    pub ignore: bool,
}

/// Interprets server JSON: which rows are entities, of what type, and which
/// nodes are back-references to earlier nodes.
pub trait JsonResultsAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn extract_results(&self, payload: Value) -> Vec<Value> {
        match payload {
            Value::Array(rows) => rows,
            Value::Object(mut map) => match map.remove("results").or_else(|| map.remove("Results")) {
                Some(Value::Array(rows)) => rows,
                Some(other) => vec![other],
                None => vec![Value::Object(map)],
            },
            Value::Null => Vec::new(),
            other => vec![other],
        }
    }

    fn visit_node(&self, node: &Value, context: &NodeContext<'_>) -> NodeMeta;
}

/// `$id` / `$ref` / `$type` conventions of JSON.NET serialised payloads.
#[derive(Debug, Clone, Default)]
pub struct WebApiJsonResultsAdapter;

impl JsonResultsAdapter for WebApiJsonResultsAdapter {
    fn name(&self) -> &str {
        "webApi"
    }

    fn visit_node(&self, node: &Value, context: &NodeContext<'_>) -> NodeMeta {
        let Value::Object(map) = node else {
            return NodeMeta::default();
        };
        let mut meta = NodeMeta {
            node_id: map.get("$id").and_then(value_as_id),
            node_ref_id: map.get("$ref").and_then(value_as_id),
            ..NodeMeta::default()
        };
        if meta.node_ref_id.is_some() {
            return meta;
        }
        meta.entity_type = match map.get("$type").and_then(Value::as_str) {
            Some(type_string) => context.metadata.entity_type_from_type_string(type_string),
            None => context
                .navigation_target
                .and_then(|t| context.metadata.get_entity_type(t))
                .or_else(|| {
                    if !context.is_top_level {
                        return None;
                    }
                    let et = context
                        .query_entity_type
                        .and_then(|t| context.metadata.get_entity_type(t))?;
                    let has_keys = et
                        .key_properties()
                        .iter()
                        .all(|kp| map.contains_key(&kp.name));
                    has_keys.then_some(et)
                }),
        };
        meta
    }
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Where an entity's data-property values live.
pub trait PropertyStore: Send + Sync + fmt::Debug {
    fn get(&self, name: &str) -> Option<&DataValue>;

    fn set(&mut self, name: &str, value: DataValue);

    /// Names whose changes the cache tracks.
    fn trackable_names(&self) -> Vec<String>;
}

/// Factory for property stores; one per binding library.
pub trait ModelLibrary: Send + Sync {
    fn name(&self) -> &str;

    fn create_store(&self, entity_type: &EntityType) -> Box<dyn PropertyStore>;
}

/// Plain map-backed storage.
#[derive(Debug, Clone, Default)]
pub struct BackingStore {
    names: Vec<String>,
    values: HashMap<String, DataValue>,
}

impl PropertyStore for BackingStore {
    fn get(&self, name: &str) -> Option<&DataValue> {
        self.values.get(name)
    }

    fn set(&mut self, name: &str, value: DataValue) {
        if !self.values.contains_key(name) {
            self.names.push(name.to_string());
        }
        self.values.insert(name.to_string(), value);
    }

    fn trackable_names(&self) -> Vec<String> {
        self.names.clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackingStoreLibrary;

impl ModelLibrary for BackingStoreLibrary {
    fn name(&self) -> &str {
        "backingStore"
    }

    fn create_store(&self, entity_type: &EntityType) -> Box<dyn PropertyStore> {
        let mut store = BackingStore::default();
        for dp in &entity_type.data_properties {
            store.set(&dp.name, dp.default_value.clone());
        }
        Box::new(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data_value::DataType;
    use crate::ent_framework::ent_schema::{DataPropertyDef, EntityTypeDef};
    use serde_json::json;

    fn metadata() -> MetadataStore {
        let mut store = MetadataStore::new();
        store
            .add_entity_type(
                EntityTypeDef::new("Customer", "Demo")
                    .data(DataPropertyDef::new("CustomerID", DataType::Int32).key())
                    .data(DataPropertyDef::new("Name", DataType::String)),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_web_api_node_visits() {
        let metadata = metadata();
        let adapter = WebApiJsonResultsAdapter;
        let top = NodeContext {
            metadata: &metadata,
            is_top_level: true,
            navigation_target: None,
            query_entity_type: Some("Customer"),
        };

        let typed = adapter.visit_node(
            &json!({"$id": "1", "$type": "Demo.Customer, Model", "CustomerID": 1}),
            &top,
        );
        assert_eq!(typed.entity_type.unwrap().short_name, "Customer");
        assert_eq!(typed.node_id.as_deref(), Some("1"));

        let reference = adapter.visit_node(&json!({"$ref": "1"}), &top);
        assert_eq!(reference.node_ref_id.as_deref(), Some("1"));
        assert!(reference.entity_type.is_none());

        let untyped = adapter.visit_node(&json!({"CustomerID": 2, "Name": "x"}), &top);
        assert!(untyped.entity_type.is_some());
        let projection = adapter.visit_node(&json!({"Name": "x"}), &top);
        assert!(projection.entity_type.is_none());
    }

    #[test]
    fn test_extract_results_shapes() {
        let adapter = WebApiJsonResultsAdapter;
        assert_eq!(adapter.extract_results(json!([1, 2])).len(), 2);
        assert_eq!(adapter.extract_results(json!({"results": [1]})).len(), 1);
        assert!(adapter.extract_results(Value::Null).is_empty());
    }

    #[test]
    fn test_backing_store_defaults() {
        let metadata = metadata();
        let et = metadata.entity_type("Customer").unwrap();
        let store = BackingStoreLibrary.create_store(&et);
        assert_eq!(store.get("CustomerID"), Some(&DataValue::Int(0)));
        assert_eq!(store.get("Name"), Some(&DataValue::Null));
        assert_eq!(store.trackable_names(), vec!["CustomerID", "Name"]);
    }
}
