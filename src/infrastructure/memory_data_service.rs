// Memory Data Service - in-process transport
// Serves metadata, answers queries from scripted payloads and plays the
// server side of a save: identity keys are assigned, foreign keys that
// pointed at temporary keys are rewritten and the saved rows come back typed.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::data_value::{DataType, DataValue};
use crate::core::entity_key::EntityKey;
use crate::ent_framework::ent_schema::{DataProperty, EntityType, MetadataStore};
use crate::infrastructure::traits::{DataServiceAdapter, KeyMapping, QueryResult, SaveResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceOperation {
    Metadata,
    Query,
    Save,
}

/// One request as the service received it.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceRequest {
    Metadata { service_name: String },
    Query { uri: String },
    Save { bundle: Value },
}

#[derive(Debug, Default)]
struct ServiceState {
    responses: HashMap<String, Value>,
    failures: HashMap<ServiceOperation, VecDeque<String>>,
    requests: Vec<ServiceRequest>,
    next_identity: i64,
}

pub struct MemoryDataService {
    name: String,
    metadata: Option<Value>,
    latency: Option<Duration>,
    state: RwLock<ServiceState>,
}

impl MemoryDataService {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            metadata: None,
            latency: None,
            state: RwLock::new(ServiceState {
                next_identity: 1000,
                ..ServiceState::default()
            }),
        }
    }

    /// Metadata document served by `fetch_metadata` and used to type saved rows.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Delay every request, so callers can observe in-flight operations.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// First identity value handed out on save.
    pub async fn set_identity_seed(&self, seed: i64) {
        self.state.write().await.next_identity = seed;
    }

    /// Payload returned for every query against `resource`.
    pub async fn respond_to(&self, resource: &str, payload: Value) {
        self.state
            .write()
            .await
            .responses
            .insert(resource.to_string(), payload);
    }

    /// The next request of this kind fails with `message`.
    pub async fn fail_next(&self, operation: ServiceOperation, message: &str) {
        self.state
            .write()
            .await
            .failures
            .entry(operation)
            .or_default()
            .push_back(message.to_string());
    }

    pub async fn requests(&self) -> Vec<ServiceRequest> {
        self.state.read().await.requests.clone()
    }

    pub async fn query_uris(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .requests
            .iter()
            .filter_map(|r| match r {
                ServiceRequest::Query { uri } => Some(uri.clone()),
                _ => None,
            })
            .collect()
    }

    async fn receive(&self, operation: ServiceOperation, request: ServiceRequest) -> anyhow::Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.write().await;
        state.requests.push(request);
        if let Some(message) = state.failures.get_mut(&operation).and_then(VecDeque::pop_front) {
            warn!(service = %self.name, ?operation, message = %message, "injected failure");
            bail!(message);
        }
        Ok(())
    }

    fn metadata_store(&self) -> anyhow::Result<MetadataStore> {
        let metadata = self
            .metadata
            .as_ref()
            .ok_or_else(|| anyhow!("service '{}' has no metadata", self.name))?;
        let mut store = MetadataStore::new();
        store.import_metadata(metadata)?;
        Ok(store)
    }

    async fn next_identity(&self, data_type: DataType) -> anyhow::Result<DataValue> {
        if data_type == DataType::Guid {
            return Ok(DataValue::Guid(uuid::Uuid::new_v4()));
        }
        let mut state = self.state.write().await;
        let next = state.next_identity;
        state.next_identity += 1;
        match data_type {
            dt if dt.is_integer() => Ok(DataValue::Int(next)),
            dt if dt.is_numeric() => Ok(DataValue::Float(next as f64)),
            DataType::String => Ok(DataValue::String(format!("ID_{}", next))),
            other => bail!("cannot assign an identity of type {}", other),
        }
    }
}

#[async_trait]
impl DataServiceAdapter for MemoryDataService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_metadata(&self, service_name: &str) -> anyhow::Result<Value> {
        self.receive(
            ServiceOperation::Metadata,
            ServiceRequest::Metadata {
                service_name: service_name.to_string(),
            },
        )
        .await?;
        self.metadata
            .clone()
            .ok_or_else(|| anyhow!("no metadata for service '{}'", service_name))
    }

    async fn execute_query(&self, uri: &str) -> anyhow::Result<QueryResult> {
        self.receive(
            ServiceOperation::Query,
            ServiceRequest::Query {
                uri: uri.to_string(),
            },
        )
        .await?;
        let resource = uri.split('?').next().unwrap_or(uri);
        let payload = self.state.read().await.responses.get(resource).cloned();
        let Some(payload) = payload else {
            debug!(resource = %resource, "no scripted rows");
            return Ok(QueryResult {
                results: Value::Array(Vec::new()),
                inline_count: uri.contains("$inlinecount=allpages").then_some(0),
            });
        };
        let (results, explicit_count) = match payload {
            Value::Object(mut map) if map.contains_key("inlineCount") => {
                let count = map
                    .remove("inlineCount")
                    .and_then(|c| c.as_u64())
                    .and_then(|c| usize::try_from(c).ok());
                let results = map.remove("results").unwrap_or(Value::Array(Vec::new()));
                (results, count)
            }
            other => (other, None),
        };
        let inline_count = if uri.contains("$inlinecount=allpages") {
            explicit_count.or_else(|| results.as_array().map(Vec::len))
        } else {
            None
        };
        Ok(QueryResult {
            results,
            inline_count,
        })
    }

    async fn save_changes(&self, bundle: &Value) -> anyhow::Result<SaveResult> {
        self.receive(
            ServiceOperation::Save,
            ServiceRequest::Save {
                bundle: bundle.clone(),
            },
        )
        .await?;
        let metadata = self.metadata_store()?;
        let rows = bundle
            .get("entities")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("save bundle has no entities"))?;

        let mut typed = Vec::with_capacity(rows.len());
        for row in rows {
            let aspect = row
                .get("entityAspect")
                .ok_or_else(|| anyhow!("saved row has no entityAspect"))?;
            let type_name = aspect
                .get("entityTypeName")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("saved row has no entityTypeName"))?;
            let et = metadata
                .entity_type_from_type_string(type_name)
                .ok_or_else(|| anyhow!("unknown entity type '{}'", type_name))?;
            typed.push((et, row, aspect));
        }

        let mut key_mappings = Vec::new();
        let mut remap: HashMap<(String, String), DataValue> = HashMap::new();
        for (et, row, aspect) in &typed {
            let is_added = aspect.get("entityState").and_then(Value::as_str) == Some("Added");
            let is_identity = aspect
                .pointer("/autoGeneratedKey/autoGeneratedKeyType")
                .and_then(Value::as_str)
                == Some("Identity");
            if !(is_added && is_identity) {
                continue;
            }
            let key_props = et.key_properties();
            let [kp] = key_props.as_slice() else {
                bail!("identity keys need a single key property on '{}'", et.short_name);
            };
            let temp_raw = row.get(&kp.name).cloned().unwrap_or(Value::Null);
            let temp_value = kp.data_type.from_json(&temp_raw)?;
            let real_value = self.next_identity(kp.data_type).await?;
            remap.insert(
                (et.short_name.clone(), EntityKey::create_key_string(&[temp_value])),
                real_value.clone(),
            );
            key_mappings.push(KeyMapping {
                entity_type_name: et.full_name(),
                temp_value: temp_raw,
                real_value: real_value.to_json(),
            });
        }

        let mut entities = Vec::with_capacity(typed.len());
        for (et, row, _) in &typed {
            let mut saved = Map::new();
            saved.insert("$type".to_string(), json!(et.full_name()));
            for dp in &et.data_properties {
                let Some(raw) = row.get(&dp.name) else {
                    continue;
                };
                let value = dp.data_type.from_json(raw)?;
                let value = match key_target(et, dp) {
                    Some(target) => remap
                        .get(&(target, EntityKey::create_key_string(std::slice::from_ref(&value))))
                        .cloned()
                        .unwrap_or(value),
                    None => value,
                };
                saved.insert(dp.name.clone(), value.to_json());
            }
            entities.push(Value::Object(saved));
        }
        info!(
            service = %self.name,
            saved = entities.len(),
            key_mappings = key_mappings.len(),
            "save accepted"
        );
        Ok(SaveResult {
            entities,
            key_mappings,
        })
    }
}

/// Type whose key `dp` holds: its own for key parts, the related type for
/// foreign keys.
fn key_target(et: &EntityType, dp: &DataProperty) -> Option<String> {
    if dp.is_part_of_key {
        return Some(et.short_name.clone());
    }
    if let Some(nav) = &dp.related_navigation_property {
        return et
            .navigation_property(nav)
            .map(|np| np.entity_type_name.clone());
    }
    dp.inverse_navigation_property
        .as_ref()
        .map(|(parent_type, _)| parent_type.clone())
}
