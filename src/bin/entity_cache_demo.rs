use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use entity_cache::ent_framework::{
    AutoGeneratedKeyType, DataPropertyDef, EntityTypeDef, MetadataStore, NavigationPropertyDef,
};
use entity_cache::infrastructure::ImportOptions;
use entity_cache::{
    AppResult, DataType, DataValue, EntityManager, EntityQuery, EntityState, ManagerConfig,
    MemoryDataService, SharedEntityManager,
};

const SERVICE: &str = "northwind";

fn northwind() -> AppResult<MetadataStore> {
    let mut store = MetadataStore::new();
    store.add_entity_type(
        EntityTypeDef::new("Customer", "Northwind")
            .resource("Customers")
            .auto_generated_key(AutoGeneratedKeyType::Identity)
            .data(DataPropertyDef::new("CustomerID", DataType::Int32).key())
            .data(DataPropertyDef::new("CompanyName", DataType::String).required().max_length(40))
            .data(DataPropertyDef::new("City", DataType::String))
            .data(DataPropertyDef::new("RowVersion", DataType::Int32).concurrency())
            .nav(NavigationPropertyDef::collection("Orders", "Order").association("Customer_Orders")),
    )?;
    store.add_entity_type(
        EntityTypeDef::new("Order", "Northwind")
            .resource("Orders")
            .auto_generated_key(AutoGeneratedKeyType::Identity)
            .data(DataPropertyDef::new("OrderID", DataType::Int32).key())
            .data(DataPropertyDef::new("CustomerID", DataType::Int32))
            .data(DataPropertyDef::new("Freight", DataType::Decimal))
            .nav(
                NavigationPropertyDef::scalar("Customer", "Customer")
                    .association("Customer_Orders")
                    .foreign_keys(&["CustomerID"]),
            ),
    )?;
    Ok(store)
}

async fn seed(service: &MemoryDataService) {
    service
        .respond_to(
            "Customers",
            json!([
                {"CustomerID": 1, "CompanyName": "Alfreds Futterkiste", "City": "Berlin", "RowVersion": 1},
                {"CustomerID": 2, "CompanyName": "Ana Trujillo", "City": "México D.F.", "RowVersion": 1},
                {"CustomerID": 3, "CompanyName": "Folies gourmandes", "City": "Lille", "RowVersion": 1}
            ]),
        )
        .await;
    service
        .respond_to(
            "Orders",
            json!([
                {"OrderID": 10643, "CustomerID": 1, "Freight": 29.46},
                {"OrderID": 10692, "CustomerID": 1, "Freight": 61.02}
            ]),
        )
        .await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let service = Arc::new(
        MemoryDataService::new(SERVICE)
            .with_metadata(northwind()?.export_metadata())
            .with_latency(Duration::from_millis(5)),
    );
    seed(&service).await;

    let config = ManagerConfig::from_env()?.with_service_name(SERVICE);
    let mut em = EntityManager::builder()
        .config(config)
        .data_service(service.clone())
        .build()?;

    // Metadata is fetched on the first query.
    let query = EntityQuery::from("Customers")
        .filter("City", "ne", DataValue::Null)?
        .order_by("CompanyName")?
        .inline_count(true);
    let outcome = em.execute_query(&query).await?;
    info!(
        uri = ?outcome.uri,
        rows = outcome.results.len(),
        inline_count = ?outcome.inline_count,
        "customers loaded"
    );

    let alfreds = outcome
        .entities()
        .first()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("no customers returned"))?;
    let orders = em.load_navigation_property(alfreds, "Orders").await?;
    info!(orders = orders.entities().len(), "orders for Alfreds loaded");

    // Local queries never leave the cache.
    let local = EntityQuery::from("Customers")
        .filter("CompanyName", "startswith", "a")?
        .using_fetch_strategy(entity_cache::FetchStrategy::FromLocalCache);
    info!(matches = em.execute_query_locally(&local)?.entities().len(), "local query");

    // Edit, then reject.
    em.set_value(alfreds, "City", "Hamburg")?;
    info!(state = %em.entity_state(alfreds)?, has_changes = em.has_changes(), "edited");
    em.reject_changes()?;
    info!(city = %em.get_value(alfreds, "City")?, "changes rejected");

    // New customer with an order; keys are temporary until saved.
    let customer = em.create_entity(
        "Customer",
        [
            ("CompanyName", DataValue::from("Blauer See Delikatessen")),
            ("City", DataValue::from("Mannheim")),
        ],
        EntityState::Added,
    )?;
    let order = em.new_entity("Order")?;
    em.set_value(order, "Freight", 12.5)?;
    em.set_navigation(order, "Customer", Some(customer))?;
    info!(customer_key = %em.get_key(customer)?, order_key = %em.get_key(order)?, "created");

    let backup = em.export_entities(None, true)?;

    let shared = SharedEntityManager::new(em);
    let reader = shared.clone();
    let all_orders = EntityQuery::from("Orders");
    let (saved, reread) = futures::join!(
        shared.save_changes(None),
        reader.execute_query(&all_orders)
    );
    let saved = saved?;
    info!(
        saved = saved.entities.len(),
        key_mappings = saved.key_mappings.len(),
        "changes saved"
    );
    if let Err(e) = reread {
        warn!(error = %e, "concurrent query failed");
    }

    let em = shared.lock().await;
    info!(
        customer_key = %em.get_key(customer)?,
        order_customer = %em.get_value(order, "CustomerID")?,
        has_changes = em.has_changes(),
        "keys fixed up"
    );

    // The pre-save snapshot replays into a fresh manager.
    let mut copy = em.create_empty_copy()?;
    let imported = copy.import_entities(&backup, ImportOptions::default())?;
    info!(
        entities = imported.entities.len(),
        temp_keys = imported.temp_key_map.len(),
        pending = copy.get_changes(None).len(),
        "snapshot imported"
    );
    Ok(())
}
