// Projection clauses and projected values
use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::core::data_value::DataValue;
use crate::core::strong_types::EntityId;
use crate::ent_framework::ent_schema::MetadataStore;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectClause {
    paths: Vec<String>,
}

impl SelectClause {
    /// Parse `"CompanyName, Orders, Customer.City"`.
    pub fn create(spec: &str) -> AppResult<Self> {
        let paths: Vec<String> = spec
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| p.replace('/', "."))
            .collect();
        if paths.is_empty() {
            return Err(AppError::QueryParse("empty projection".to_string()));
        }
        if let Some(bad) = paths.iter().find(|p| {
            p.split('.').any(|segment| {
                segment.is_empty()
                    || !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            })
        }) {
            return Err(AppError::QueryParse(format!(
                "'{}' is not a valid projection path",
                bad
            )));
        }
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Name of the projected field for a path: `Customer.City` becomes `Customer_City`.
    pub fn projected_name(path: &str) -> String {
        path.replace('.', "_")
    }

    pub fn validate(&self, entity_type: &str, metadata: &MetadataStore) -> AppResult<()> {
        for path in &self.paths {
            metadata.resolve_property_path(entity_type, path)?;
        }
        Ok(())
    }

    pub fn to_odata_fragment(&self, entity_type: &str, metadata: &MetadataStore) -> AppResult<String> {
        self.validate(entity_type, metadata)?;
        Ok(self
            .paths
            .iter()
            .map(|p| p.replace('.', "/"))
            .collect::<Vec<_>>()
            .join(","))
    }
}

/// One field of a projection row.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectedValue {
    Value(DataValue),
    Entity(Option<EntityId>),
    Entities(Vec<EntityId>),
    Object(BTreeMap<String, ProjectedValue>),
    List(Vec<ProjectedValue>),
}

impl ProjectedValue {
    pub fn as_value(&self) -> Option<&DataValue> {
        match self {
            ProjectedValue::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<EntityId> {
        match self {
            ProjectedValue::Entity(id) => *id,
            _ => None,
        }
    }

    /// JSON rendering; entities are written as their handle string.
    pub fn to_json(&self) -> Value {
        match self {
            ProjectedValue::Value(v) => v.to_json(),
            ProjectedValue::Entity(Some(id)) => Value::String(id.to_string()),
            ProjectedValue::Entity(None) => Value::Null,
            ProjectedValue::Entities(ids) => {
                Value::Array(ids.iter().map(|id| Value::String(id.to_string())).collect())
            }
            ProjectedValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
            ProjectedValue::List(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_normalizes_paths() {
        let clause = SelectClause::create("CompanyName, Customer/City").unwrap();
        assert_eq!(clause.paths(), &["CompanyName".to_string(), "Customer.City".to_string()]);
        assert_eq!(SelectClause::projected_name("Customer.City"), "Customer_City");
        assert!(SelectClause::create(" , ").is_err());
        assert!(SelectClause::create("Name desc").is_err());
    }
}
