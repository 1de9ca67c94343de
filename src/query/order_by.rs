// Ordering clauses
use std::cmp::Ordering;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::LocalQueryComparisonOptions;
use crate::core::data_value::{DataType, DataValue, PropertySource};
use crate::ent_framework::ent_schema::MetadataStore;
use crate::error::{AppError, AppResult};

pub type ComparerFn = Arc<dyn Fn(&dyn PropertySource, &dyn PropertySource) -> Ordering + Send + Sync>;

static PATH_RX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*([./][A-Za-z_][A-Za-z0-9_]*)*$")
        .expect("order-by path pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderByItem {
    /// Dotted property path.
    pub path: String,
    pub is_desc: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrderByClause {
    items: Vec<OrderByItem>,
}

impl OrderByClause {
    /// Parse `"CompanyName desc, City"`. `is_desc` flips every item that has
    /// no explicit direction.
    pub fn create(spec: &str, is_desc: bool) -> AppResult<Self> {
        let mut items = Vec::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let mut words = part.split_whitespace();
            let path = words.next().unwrap_or_default();
            if !PATH_RX.is_match(path) {
                return Err(AppError::QueryParse(format!(
                    "'{}' is not a valid ordering path",
                    path
                )));
            }
            let desc = match words.next().map(str::to_lowercase).as_deref() {
                None => is_desc,
                Some("desc") => true,
                Some("asc") => false,
                Some(other) => {
                    return Err(AppError::QueryParse(format!(
                        "unknown sort direction '{}'",
                        other
                    )))
                }
            };
            if words.next().is_some() {
                return Err(AppError::QueryParse(format!(
                    "could not parse ordering '{}'",
                    part
                )));
            }
            items.push(OrderByItem {
                path: path.replace('/', "."),
                is_desc: desc,
            });
        }
        if items.is_empty() {
            return Err(AppError::QueryParse("empty ordering".to_string()));
        }
        Ok(Self { items })
    }

    pub fn items(&self) -> &[OrderByItem] {
        &self.items
    }

    /// Append `other` as lower-priority keys.
    pub fn then(&self, other: &OrderByClause) -> Self {
        let mut items = self.items.clone();
        items.extend(other.items.iter().cloned());
        Self { items }
    }

    pub fn validate(&self, entity_type: &str, metadata: &MetadataStore) -> AppResult<()> {
        self.data_types(entity_type, metadata).map(|_| ())
    }

    fn data_types(&self, entity_type: &str, metadata: &MetadataStore) -> AppResult<Vec<DataType>> {
        self.items
            .iter()
            .map(|item| {
                metadata
                    .resolve_property_path(entity_type, &item.path)?
                    .data_type
                    .ok_or_else(|| {
                        AppError::QueryParse(format!(
                            "cannot order by navigation property '{}'",
                            item.path
                        ))
                    })
            })
            .collect()
    }

    pub fn to_odata_fragment(&self, entity_type: &str, metadata: &MetadataStore) -> AppResult<String> {
        self.validate(entity_type, metadata)?;
        Ok(self
            .items
            .iter()
            .map(|item| {
                let path = item.path.replace('.', "/");
                if item.is_desc {
                    format!("{} desc", path)
                } else {
                    path
                }
            })
            .collect::<Vec<_>>()
            .join(","))
    }

    /// Compare two rows clause by clause. Nulls sort first in ascending order.
    pub fn to_comparer(
        &self,
        entity_type: &str,
        metadata: &MetadataStore,
        options: &LocalQueryComparisonOptions,
    ) -> AppResult<ComparerFn> {
        let keys: Vec<(OrderByItem, DataType)> = self
            .items
            .iter()
            .cloned()
            .zip(self.data_types(entity_type, metadata)?)
            .collect();
        let case_sensitive = options.is_case_sensitive;
        Ok(Arc::new(move |a: &dyn PropertySource, b: &dyn PropertySource| {
            for (item, dt) in &keys {
                let left = sortable(dt.comparable(a.value_at(&item.path)), case_sensitive);
                let right = sortable(dt.comparable(b.value_at(&item.path)), case_sensitive);
                let ordering = left.compare(&right).unwrap_or(Ordering::Equal);
                let ordering = if item.is_desc {
                    ordering.reverse()
                } else {
                    ordering
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        }))
    }
}

fn sortable(value: DataValue, case_sensitive: bool) -> DataValue {
    match value {
        DataValue::String(s) if !case_sensitive => DataValue::String(s.to_lowercase()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ent_framework::ent_schema::{DataPropertyDef, EntityTypeDef};
    use std::collections::BTreeMap;

    fn metadata() -> MetadataStore {
        let mut store = MetadataStore::new();
        store
            .add_entity_type(
                EntityTypeDef::new("Customer", "Demo")
                    .data(DataPropertyDef::new("CustomerID", DataType::Int32).key())
                    .data(DataPropertyDef::new("CompanyName", DataType::String))
                    .data(DataPropertyDef::new("City", DataType::String)),
            )
            .unwrap();
        store
    }

    fn row(name: Option<&str>, city: &str) -> BTreeMap<String, DataValue> {
        let mut row = BTreeMap::new();
        row.insert("CompanyName".to_string(), DataValue::from(name));
        row.insert("City".to_string(), DataValue::from(city));
        row
    }

    #[test]
    fn test_parse_and_render() {
        let md = metadata();
        let clause = OrderByClause::create("CompanyName desc, City", false).unwrap();
        assert_eq!(clause.items().len(), 2);
        assert_eq!(
            clause.to_odata_fragment("Customer", &md).unwrap(),
            "CompanyName desc,City"
        );
        let flipped = OrderByClause::create("City", true).unwrap();
        assert!(flipped.items()[0].is_desc);
        assert!(OrderByClause::create("City sideways", false).is_err());
        assert!(OrderByClause::create("", false).is_err());
        assert!(OrderByClause::create("Missing", false)
            .unwrap()
            .validate("Customer", &md)
            .is_err());
    }

    #[test]
    fn test_comparer_uses_first_discriminating_key() {
        let md = metadata();
        let options = LocalQueryComparisonOptions::default();
        let clause = OrderByClause::create("City", false)
            .unwrap()
            .then(&OrderByClause::create("CompanyName", true).unwrap());
        let cmp = clause.to_comparer("Customer", &md, &options).unwrap();

        let mut rows = vec![
            row(Some("alpha"), "Paris"),
            row(Some("Beta"), "berlin"),
            row(None, "Paris"),
            row(Some("gamma"), "Paris"),
        ];
        rows.sort_by(|a, b| cmp(a, b));
        let names: Vec<DataValue> = rows.iter().map(|r| r["CompanyName"].clone()).collect();
        assert_eq!(
            names,
            vec![
                DataValue::from("Beta"),
                DataValue::from("gamma"),
                DataValue::from("alpha"),
                DataValue::Null,
            ]
        );
    }
}
