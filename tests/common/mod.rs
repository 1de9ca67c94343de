#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use entity_cache::core::{DataType, DataValue, EntityId, EntityState};
use entity_cache::ent_framework::{
    AutoGeneratedKeyType, DataPropertyDef, EntityTypeDef, MetadataStore, NavigationPropertyDef,
};
use entity_cache::infrastructure::{EntityManager, MemoryDataService};
use entity_cache::ManagerConfig;

pub const SERVICE: &str = "northwind";

/// Customer -> Orders -> OrderDetails, Employee -> Orders (unidirectional),
/// Shipper -> Orders (the parent's type name sorts after the child's),
/// Region -> Territories (non-nullable foreign key).
pub fn metadata() -> MetadataStore {
    let mut store = MetadataStore::new();
    store
        .add_entity_type(
            EntityTypeDef::new("Customer", "Northwind")
                .resource("Customers")
                .auto_generated_key(AutoGeneratedKeyType::Identity)
                .data(DataPropertyDef::new("CustomerID", DataType::Int32).key())
                .data(DataPropertyDef::new("CompanyName", DataType::String))
                .data(DataPropertyDef::new("City", DataType::String))
                .data(DataPropertyDef::new("RowVersion", DataType::Int32).concurrency())
                .nav(NavigationPropertyDef::collection("Orders", "Order").association("Customer_Orders")),
        )
        .unwrap();
    store
        .add_entity_type(
            EntityTypeDef::new("Order", "Northwind")
                .resource("Orders")
                .auto_generated_key(AutoGeneratedKeyType::Identity)
                .data(DataPropertyDef::new("OrderID", DataType::Int32).key())
                .data(DataPropertyDef::new("CustomerID", DataType::Int32))
                .data(DataPropertyDef::new("EmployeeID", DataType::Int32))
                .data(DataPropertyDef::new("Freight", DataType::Decimal))
                .data(DataPropertyDef::new("ShipCity", DataType::String))
                .data(DataPropertyDef::new("ShipVia", DataType::Int32))
                .nav(
                    NavigationPropertyDef::scalar("Shipper", "Shipper")
                        .association("Shipper_Orders")
                        .foreign_keys(&["ShipVia"]),
                )
                .nav(
                    NavigationPropertyDef::scalar("Customer", "Customer")
                        .association("Customer_Orders")
                        .foreign_keys(&["CustomerID"]),
                )
                .nav(
                    NavigationPropertyDef::collection("OrderDetails", "OrderDetail")
                        .association("Order_Details"),
                ),
        )
        .unwrap();
    store
        .add_entity_type(
            EntityTypeDef::new("OrderDetail", "Northwind")
                .resource("OrderDetails")
                .data(DataPropertyDef::new("OrderID", DataType::Int32).key())
                .data(DataPropertyDef::new("ProductID", DataType::Int32).key())
                .data(DataPropertyDef::new("Quantity", DataType::Int16))
                .nav(
                    NavigationPropertyDef::scalar("Order", "Order")
                        .association("Order_Details")
                        .foreign_keys(&["OrderID"]),
                ),
        )
        .unwrap();
    store
        .add_entity_type(
            EntityTypeDef::new("Employee", "Northwind")
                .resource("Employees")
                .auto_generated_key(AutoGeneratedKeyType::Identity)
                .data(DataPropertyDef::new("EmployeeID", DataType::Int32).key())
                .data(DataPropertyDef::new("LastName", DataType::String).required().max_length(20))
                .nav(NavigationPropertyDef::collection("Orders", "Order").inv_foreign_keys(&["EmployeeID"])),
        )
        .unwrap();
    store
        .add_entity_type(
            EntityTypeDef::new("Shipper", "Northwind")
                .resource("Shippers")
                .data(DataPropertyDef::new("ShipperID", DataType::Int32).key())
                .data(DataPropertyDef::new("CompanyName", DataType::String))
                .nav(NavigationPropertyDef::collection("Orders", "Order").association("Shipper_Orders")),
        )
        .unwrap();
    store
        .add_entity_type(
            EntityTypeDef::new("Region", "Northwind")
                .resource("Regions")
                .data(DataPropertyDef::new("RegionID", DataType::Int32).key())
                .data(DataPropertyDef::new("RegionDescription", DataType::String))
                .nav(
                    NavigationPropertyDef::collection("Territories", "Territory")
                        .association("Region_Territories"),
                ),
        )
        .unwrap();
    store
        .add_entity_type(
            EntityTypeDef::new("Territory", "Northwind")
                .resource("Territories")
                .data(DataPropertyDef::new("TerritoryID", DataType::String).key())
                .data(DataPropertyDef::new("RegionID", DataType::Int32).required())
                .data(DataPropertyDef::new("TerritoryDescription", DataType::String))
                .nav(
                    NavigationPropertyDef::scalar("Region", "Region")
                        .association("Region_Territories")
                        .foreign_keys(&["RegionID"]),
                ),
        )
        .unwrap();
    store
}

pub fn manager() -> EntityManager {
    EntityManager::new(metadata()).unwrap()
}

/// Manager wired to an in-memory service that already knows the metadata.
pub fn manager_with_service() -> (EntityManager, Arc<MemoryDataService>) {
    manager_with(MemoryDataService::new(SERVICE))
}

pub fn manager_with(service: MemoryDataService) -> (EntityManager, Arc<MemoryDataService>) {
    let service = Arc::new(service.with_metadata(metadata().export_metadata()));
    let config = ManagerConfig {
        has_server_metadata: false,
        ..ManagerConfig::default()
    }
    .with_service_name(SERVICE);
    let manager = EntityManager::builder()
        .config(config)
        .metadata(metadata())
        .data_service(service.clone())
        .build()
        .unwrap();
    (manager, service)
}

pub fn values<const N: usize>(pairs: [(&str, DataValue); N]) -> BTreeMap<String, DataValue> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

pub fn customer(em: &mut EntityManager, id: i64, name: &str, state: EntityState) -> EntityId {
    em.create_entity(
        "Customer",
        values([
            ("CustomerID", DataValue::Int(id)),
            ("CompanyName", name.into()),
            ("RowVersion", DataValue::Int(1)),
        ]),
        state,
    )
    .unwrap()
}

pub fn order(em: &mut EntityManager, id: i64, customer_id: Option<i64>, state: EntityState) -> EntityId {
    em.create_entity(
        "Order",
        values([
            ("OrderID", DataValue::Int(id)),
            ("CustomerID", customer_id.into()),
        ]),
        state,
    )
    .unwrap()
}
