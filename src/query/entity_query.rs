// Entity Query - immutable query builder
// Every builder method returns a new query; the original is untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{FetchStrategy, MergeStrategy};
use crate::core::data_value::{DataValue, PropertySource};
use crate::core::entity_key::EntityKey;
use crate::core::strong_types::EntityId;
use crate::ent_framework::ent_schema::{EntityType, MetadataStore};
use crate::error::{AppError, AppResult};
use crate::query::order_by::OrderByClause;
use crate::query::predicate::Predicate;
use crate::query::select::{ProjectedValue, SelectClause};

/// One row of a query result.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryRow {
    Entity(EntityId),
    Projection(BTreeMap<String, ProjectedValue>),
    Value(DataValue),
}

impl QueryRow {
    pub fn as_entity(&self) -> Option<EntityId> {
        match self {
            QueryRow::Entity(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_projection(&self) -> Option<&BTreeMap<String, ProjectedValue>> {
        match self {
            QueryRow::Projection(fields) => Some(fields),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityQuery {
    resource_name: Option<String>,
    result_entity_type: Option<String>,
    where_clause: Option<Arc<Predicate>>,
    order_by: Option<Arc<OrderByClause>>,
    select: Option<Arc<SelectClause>>,
    expand: Arc<Vec<String>>,
    skip: Option<usize>,
    take: Option<usize>,
    inline_count: bool,
    parameters: Arc<BTreeMap<String, String>>,
    merge_strategy: Option<MergeStrategy>,
    fetch_strategy: Option<FetchStrategy>,
}

impl EntityQuery {
    pub fn from(resource_name: &str) -> Self {
        Self {
            resource_name: Some(resource_name.to_string()),
            ..Self::default()
        }
    }

    pub fn to_type(&self, entity_type: &str) -> Self {
        Self {
            result_entity_type: Some(entity_type.to_string()),
            ..self.clone()
        }
    }

    /// Add a filter; an existing filter is and-ed with the new one.
    pub fn where_(&self, predicate: Predicate) -> Self {
        let combined = match &self.where_clause {
            Some(existing) => existing.and(predicate),
            None => predicate,
        };
        Self {
            where_clause: Some(Arc::new(combined)),
            ..self.clone()
        }
    }

    /// Shorthand for `where_(Predicate::create(expr, op, value)?)`.
    pub fn filter(&self, expr: &str, op: &str, value: impl Into<DataValue>) -> AppResult<Self> {
        Ok(self.where_(Predicate::create(expr, op, value)?))
    }

    pub fn order_by(&self, spec: &str) -> AppResult<Self> {
        self.add_ordering(OrderByClause::create(spec, false)?)
    }

    pub fn order_by_desc(&self, spec: &str) -> AppResult<Self> {
        self.add_ordering(OrderByClause::create(spec, true)?)
    }

    /// Lower-priority ordering after the existing ones.
    pub fn then_by(&self, spec: &str) -> AppResult<Self> {
        self.order_by(spec)
    }

    pub fn then_by_desc(&self, spec: &str) -> AppResult<Self> {
        self.order_by_desc(spec)
    }

    fn add_ordering(&self, clause: OrderByClause) -> AppResult<Self> {
        let combined = match &self.order_by {
            Some(existing) => existing.then(&clause),
            None => clause,
        };
        Ok(Self {
            order_by: Some(Arc::new(combined)),
            ..self.clone()
        })
    }

    pub fn select(&self, spec: &str) -> AppResult<Self> {
        Ok(Self {
            select: Some(Arc::new(SelectClause::create(spec)?)),
            ..self.clone()
        })
    }

    /// Navigation paths to fetch along with the results, e.g. `"Orders, Orders.OrderDetails"`.
    pub fn expand(&self, spec: &str) -> Self {
        let mut expand = (*self.expand).clone();
        expand.extend(
            spec.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| p.replace('/', ".")),
        );
        Self {
            expand: Arc::new(expand),
            ..self.clone()
        }
    }

    pub fn skip(&self, count: usize) -> Self {
        Self {
            skip: Some(count),
            ..self.clone()
        }
    }

    pub fn take(&self, count: usize) -> Self {
        Self {
            take: Some(count),
            ..self.clone()
        }
    }

    pub fn inline_count(&self, enabled: bool) -> Self {
        Self {
            inline_count: enabled,
            ..self.clone()
        }
    }

    /// Extra query-string parameters passed through to the server.
    pub fn with_parameters<I, K, V>(&self, parameters: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut merged = (*self.parameters).clone();
        merged.extend(parameters.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self {
            parameters: Arc::new(merged),
            ..self.clone()
        }
    }

    pub fn using_merge_strategy(&self, strategy: MergeStrategy) -> Self {
        Self {
            merge_strategy: Some(strategy),
            ..self.clone()
        }
    }

    pub fn using_fetch_strategy(&self, strategy: FetchStrategy) -> Self {
        Self {
            fetch_strategy: Some(strategy),
            ..self.clone()
        }
    }

    /// Query for the single entity with `key`.
    pub fn from_entity_key(key: &EntityKey, metadata: &MetadataStore) -> AppResult<Self> {
        let et = metadata.entity_type(key.entity_type())?;
        let predicates = et
            .key_properties()
            .iter()
            .zip(key.values())
            .map(|(kp, value)| Predicate::create(&kp.name, "eq", value.clone()))
            .collect::<AppResult<Vec<_>>>()?;
        Self::for_type(&et, predicates)
    }

    /// Query for the entities `source` reaches through `nav`, built from
    /// foreign keys on whichever side holds them.
    pub fn from_entity_navigation(
        metadata: &MetadataStore,
        entity_type: &str,
        nav: &str,
        source: &dyn PropertySource,
    ) -> AppResult<Self> {
        let et = metadata.entity_type(entity_type)?;
        let np = et
            .navigation_property(nav)
            .ok_or_else(|| AppError::unknown_property(&et.short_name, nav))?;
        let target = metadata.entity_type(&np.entity_type_name)?;

        let pairs: Vec<(String, DataValue)> = if np.is_scalar && !np.foreign_key_names.is_empty() {
            target
                .key_properties()
                .iter()
                .zip(&np.foreign_key_names)
                .map(|(kp, fk)| (kp.name.clone(), source.value_at(fk)))
                .collect()
        } else {
            let target_fks = if !np.inv_foreign_key_names.is_empty() {
                np.inv_foreign_key_names.clone()
            } else {
                np.inverse
                    .as_deref()
                    .and_then(|inv| target.navigation_property(inv))
                    .map(|inv| inv.foreign_key_names.clone())
                    .unwrap_or_default()
            };
            target_fks
                .into_iter()
                .zip(et.key_properties())
                .map(|(fk, kp)| (fk, source.value_at(&kp.name)))
                .collect()
        };
        if pairs.is_empty() {
            return Err(AppError::InvalidOperation(format!(
                "'{}.{}' has no foreign keys to query by",
                et.short_name, nav
            )));
        }
        let predicates = pairs
            .into_iter()
            .map(|(name, value)| Predicate::create(&name, "eq", value))
            .collect::<AppResult<Vec<_>>>()?;
        Self::for_type(&target, predicates)
    }

    fn for_type(et: &EntityType, mut predicates: Vec<Predicate>) -> AppResult<Self> {
        let resource = et.default_resource_name.clone().ok_or_else(|| {
            AppError::InvalidOperation(format!(
                "'{}' has no default resource name to query",
                et.short_name
            ))
        })?;
        let predicate = if predicates.len() == 1 {
            predicates.remove(0)
        } else {
            Predicate::all(predicates)
        };
        Ok(Self::from(&resource)
            .to_type(&et.short_name)
            .where_(predicate))
    }

    pub fn resource_name(&self) -> Option<&str> {
        self.resource_name.as_deref()
    }

    pub fn where_clause(&self) -> Option<&Predicate> {
        self.where_clause.as_deref()
    }

    pub fn order_by_clause(&self) -> Option<&OrderByClause> {
        self.order_by.as_deref()
    }

    pub fn select_clause(&self) -> Option<&SelectClause> {
        self.select.as_deref()
    }

    pub fn expand_paths(&self) -> &[String] {
        &self.expand
    }

    pub fn skip_count(&self) -> Option<usize> {
        self.skip
    }

    pub fn take_count(&self) -> Option<usize> {
        self.take
    }

    pub fn has_inline_count(&self) -> bool {
        self.inline_count
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn merge_strategy(&self) -> Option<MergeStrategy> {
        self.merge_strategy
    }

    pub fn fetch_strategy(&self) -> Option<FetchStrategy> {
        self.fetch_strategy
    }

    /// Entity type the results are materialised as: the explicit
    /// `to_type`, else the type registered for the resource name.
    pub fn resolve_entity_type(&self, metadata: &MetadataStore) -> AppResult<Arc<EntityType>> {
        if let Some(name) = &self.result_entity_type {
            return metadata.entity_type(name);
        }
        let resource = self.resource_name.as_deref().ok_or_else(|| {
            AppError::InvalidOperation("query has neither a resource nor a result type".to_string())
        })?;
        metadata
            .entity_type_for_resource(resource)
            .ok_or_else(|| AppError::UnknownEntityType(resource.to_string()))
    }

    /// Wire form: `Resource?$filter=…&$orderby=…&$skip=…&$top=…&$expand=…&$select=…&$inlinecount=allpages`.
    pub fn to_uri(&self, metadata: &MetadataStore) -> AppResult<String> {
        let et = self.resolve_entity_type(metadata)?;
        let type_name = et.short_name.as_str();
        let resource = self
            .resource_name
            .clone()
            .or_else(|| et.default_resource_name.clone())
            .ok_or_else(|| {
                AppError::InvalidOperation(format!("no resource name to query '{}'", type_name))
            })?;

        let mut params: Vec<(String, String)> = Vec::new();
        if let Some(predicate) = &self.where_clause {
            params.push(("$filter".into(), predicate.to_odata_fragment(type_name, metadata)?));
        }
        if let Some(order_by) = &self.order_by {
            params.push(("$orderby".into(), order_by.to_odata_fragment(type_name, metadata)?));
        }
        if let Some(skip) = self.skip {
            params.push(("$skip".into(), skip.to_string()));
        }
        if let Some(take) = self.take {
            params.push(("$top".into(), take.to_string()));
        }
        if !self.expand.is_empty() {
            for path in self.expand.iter() {
                let resolved = metadata.resolve_property_path(type_name, path)?;
                if resolved.data_type.is_some() {
                    return Err(AppError::QueryParse(format!(
                        "'{}' is not a navigation property and cannot be expanded",
                        path
                    )));
                }
            }
            let paths: Vec<String> = self.expand.iter().map(|p| p.replace('.', "/")).collect();
            params.push(("$expand".into(), paths.join(",")));
        }
        if let Some(select) = &self.select {
            params.push(("$select".into(), select.to_odata_fragment(type_name, metadata)?));
        }
        if self.inline_count {
            params.push(("$inlinecount".into(), "allpages".into()));
        }
        for (name, value) in self.parameters.iter() {
            params.push((encode_component(name), value.clone()));
        }

        if params.is_empty() {
            return Ok(resource);
        }
        let query = params
            .iter()
            .map(|(name, value)| format!("{}={}", name, encode_component(value)))
            .collect::<Vec<_>>()
            .join("&");
        Ok(format!("{}?{}", resource, query))
    }
}

/// Percent-encode everything except the unreserved URI component characters.
fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => out.push(byte as char),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data_value::DataType;
    use crate::ent_framework::ent_schema::{DataPropertyDef, EntityTypeDef, NavigationPropertyDef};

    fn metadata() -> MetadataStore {
        let mut store = MetadataStore::new();
        store
            .add_entity_type(
                EntityTypeDef::new("Customer", "Demo")
                    .resource("Customers")
                    .data(DataPropertyDef::new("CustomerID", DataType::Int32).key())
                    .data(DataPropertyDef::new("CompanyName", DataType::String))
                    .nav(NavigationPropertyDef::collection("Orders", "Order").association("Customer_Orders")),
            )
            .unwrap();
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
    }

    #[test]
    fn test_builders_are_immutable() {
        let base = EntityQuery::from("Customers");
        let paged = base.skip(10).take(5);
        assert_eq!(base.skip_count(), None);
        assert_eq!(paged.skip_count(), Some(10));
        assert_eq!(paged.take_count(), Some(5));
    }

    #[test]
    fn test_to_uri() {
        let md = metadata();
        let query = EntityQuery::from("Customers")
            .filter("CompanyName", "startsWith", "Fo")
            .unwrap()
            .order_by("CompanyName")
            .unwrap()
            .then_by_desc("CustomerID")
            .unwrap()
            .take(5)
            .inline_count(true);
        assert_eq!(
            query.to_uri(&md).unwrap(),
            "Customers?$filter=startswith(CompanyName%2C'Fo')%20eq%20true\
             &$orderby=CompanyName%2CCustomerID%20desc&$top=5&$inlinecount=allpages"
        );
        assert_eq!(EntityQuery::from("Customers").to_uri(&md).unwrap(), "Customers");

        let expanded = EntityQuery::from("Orders").expand("Customer");
        assert_eq!(expanded.to_uri(&md).unwrap(), "Orders?$expand=Customer");
        let bad = EntityQuery::from("Orders").expand("OrderID");
        assert!(bad.to_uri(&md).is_err());
        assert!(matches!(
            EntityQuery::from("Nowhere").to_uri(&md),
            Err(AppError::UnknownEntityType(_))
        ));
    }

    #[test]
    fn test_from_entity_key() {
        let md = metadata();
        let key = EntityKey::single("Order", 42);
        let query = EntityQuery::from_entity_key(&key, &md).unwrap();
        assert_eq!(query.to_uri(&md).unwrap(), "Orders?$filter=OrderID%20eq%2042");
    }

    #[test]
    fn test_from_entity_navigation() {
        let md = metadata();
        let mut order = BTreeMap::new();
        order.insert("OrderID".to_string(), DataValue::Int(1));
        order.insert("CustomerID".to_string(), DataValue::Int(7));
        let to_parent = EntityQuery::from_entity_navigation(&md, "Order", "Customer", &order).unwrap();
        assert_eq!(
            to_parent.to_uri(&md).unwrap(),
            "Customers?$filter=CustomerID%20eq%207"
        );

        let mut customer = BTreeMap::new();
        customer.insert("CustomerID".to_string(), DataValue::Int(7));
        let to_children =
            EntityQuery::from_entity_navigation(&md, "Customer", "Orders", &customer).unwrap();
        assert_eq!(
            to_children.to_uri(&md).unwrap(),
            "Orders?$filter=CustomerID%20eq%207"
        );
    }
}
