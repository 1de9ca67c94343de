mod common;

use std::sync::{Arc, Mutex};

use common::{customer, manager, manager_with_service, metadata, order, SERVICE};
use entity_cache::core::{DataValue, EntityKey, EntityState};
use entity_cache::error::TransportContext;
use entity_cache::infrastructure::{EntityManager, MemoryDataService, ServiceOperation};
use entity_cache::query::{EntityQuery, Predicate, ProjectedValue};
use entity_cache::{AppError, MergeStrategy};
use serde_json::json;

#[test]
fn test_local_starts_with_query() {
    let mut em = manager();
    let foo = customer(&mut em, 1, "Foo", EntityState::Unchanged);
    customer(&mut em, 2, "Bar", EntityState::Unchanged);

    let query = EntityQuery::from("Customers")
        .where_(Predicate::create("CompanyName", "startsWith", "Fo").unwrap());
    let outcome = em.execute_query_locally(&query).unwrap();

    assert_eq!(outcome.entities(), vec![foo]);
    assert!(outcome.from_cache);
    assert_eq!(outcome.uri, None);
}

#[test]
fn test_local_string_comparison_ignores_case_and_trailing_spaces() {
    let mut em = manager();
    let padded = customer(&mut em, 1, "Alfreds  ", EntityState::Unchanged);

    let query = EntityQuery::from("Customers").filter("CompanyName", "eq", "ALFREDS").unwrap();
    assert_eq!(em.execute_query_locally(&query).unwrap().entities(), vec![padded]);

    let mut config = em.config().clone();
    config.local_query_comparison.is_case_sensitive = true;
    em.set_config(config);
    assert!(em.execute_query_locally(&query).unwrap().entities().is_empty());
}

#[test]
fn test_local_order_skip_take_and_inline_count() {
    let mut em = manager();
    for (n, name) in ["Delta", "Alpha", "Echo", "Charlie", "Bravo"].iter().enumerate() {
        customer(&mut em, n as i64 + 1, name, EntityState::Unchanged);
    }

    let query = EntityQuery::from("Customers")
        .order_by_desc("CompanyName")
        .unwrap()
        .skip(1)
        .take(2)
        .inline_count(true);
    let outcome = em.execute_query_locally(&query).unwrap();

    let names: Vec<DataValue> = outcome
        .entities()
        .into_iter()
        .map(|id| em.get_value(id, "CompanyName").unwrap())
        .collect();
    assert_eq!(names, vec![DataValue::from("Delta"), DataValue::from("Charlie")]);
    assert_eq!(outcome.inline_count, Some(5));
}

#[test]
fn test_local_query_skips_deleted_entities() {
    let mut em = manager();
    let kept = customer(&mut em, 1, "Kept", EntityState::Unchanged);
    let gone = customer(&mut em, 2, "Gone", EntityState::Unchanged);
    em.set_deleted(gone).unwrap();

    let outcome = em.execute_query_locally(&EntityQuery::from("Customers")).unwrap();
    assert_eq!(outcome.entities(), vec![kept]);
}

#[test]
fn test_local_query_across_navigation_and_projection() {
    let mut em = manager();
    customer(&mut em, 1, "Berlin Co", EntityState::Unchanged);
    let o = order(&mut em, 10, Some(1), EntityState::Unchanged);
    order(&mut em, 11, None, EntityState::Unchanged);

    let query = EntityQuery::from("Orders")
        .filter("Customer.CompanyName", "contains", "berlin")
        .unwrap()
        .select("OrderID, Customer")
        .unwrap();
    let outcome = em.execute_query_locally(&query).unwrap();

    assert_eq!(outcome.results.len(), 1);
    let row = outcome.results[0].as_projection().unwrap();
    assert_eq!(row.get("OrderID"), Some(&ProjectedValue::Value(DataValue::Int(10))));
    let c = em.get_navigation(o, "Customer").unwrap();
    assert_eq!(row.get("Customer"), Some(&ProjectedValue::Entity(c)));
}

#[test]
fn test_unknown_property_paths_are_errors() {
    let em = manager();
    let query = EntityQuery::from("Customers").filter("Nope", "eq", 1i64).unwrap();
    assert!(matches!(
        em.execute_query_locally(&query),
        Err(AppError::UnknownProperty { .. })
    ));
}

#[test]
fn test_wire_uri_generation() {
    let md = metadata();
    let query = EntityQuery::from("Orders")
        .filter("Freight", "gt", 10i64)
        .unwrap()
        .filter("Customer.CompanyName", "startswith", "A")
        .unwrap()
        .order_by("OrderID")
        .unwrap()
        .expand("Customer, OrderDetails")
        .skip(20)
        .take(10);

    assert_eq!(
        query.to_uri(&md).unwrap(),
        "Orders?$filter=(Freight%20gt%2010m)%20and%20(startswith(Customer%2FCompanyName%2C'A')%20eq%20true)\
         &$orderby=OrderID&$skip=20&$top=10&$expand=Customer%2COrderDetails"
    );

    let by_key = EntityQuery::from_entity_key(&EntityKey::single("Order", 10i64), &md).unwrap();
    assert_eq!(by_key.to_uri(&md).unwrap(), "Orders?$filter=OrderID%20eq%2010");

    let bad_expand = EntityQuery::from("Orders").expand("ShipCity");
    assert!(bad_expand.to_uri(&md).is_err());
}

#[tokio::test]
async fn test_remote_query_merges_rows_as_unchanged() {
    let (mut em, service) = manager_with_service();
    service
        .respond_to(
            "Customers",
            json!([
                {"CustomerID": 1, "CompanyName": "Alfreds", "RowVersion": 1},
                {"CustomerID": 2, "CompanyName": "Ana Trujillo", "RowVersion": 1}
            ]),
        )
        .await;

    let query = EntityQuery::from("Customers").filter("CompanyName", "startswith", "A").unwrap();
    let outcome = em.execute_query(&query).await.unwrap();

    assert_eq!(outcome.entities().len(), 2);
    assert!(!outcome.from_cache);
    for id in outcome.entities() {
        assert_eq!(em.entity_state(id).unwrap(), EntityState::Unchanged);
    }
    assert!(!em.has_changes());
    assert_eq!(
        service.query_uris().await,
        vec!["Customers?$filter=startswith(CompanyName%2C'A')%20eq%20true".to_string()]
    );
}

#[tokio::test]
async fn test_merging_the_same_rows_twice_is_silent() {
    let (mut em, service) = manager_with_service();
    service
        .respond_to(
            "Orders",
            json!([{
                "$type": "Northwind.Order, Model",
                "OrderID": 1,
                "CustomerID": 5,
                "Customer": {"$type": "Northwind.Customer, Model", "CustomerID": 5, "CompanyName": "X"}
            }]),
        )
        .await;
    let query = EntityQuery::from("Orders");
    let first = em.execute_query(&query).await.unwrap();
    let o = first.entities()[0];
    let c = em.get_navigation(o, "Customer").unwrap().unwrap();

    let events = Arc::new(Mutex::new(0usize));
    let sink = events.clone();
    em.aspect_mut(o).unwrap().property_changed.subscribe(move |_| *sink.lock().unwrap() += 1);
    let sink = events.clone();
    em.aspect_mut(c).unwrap().property_changed.subscribe(move |_| *sink.lock().unwrap() += 1);
    let sink = events.clone();
    em.array_changed.subscribe(move |_| *sink.lock().unwrap() += 1);

    let second = em.execute_query(&query).await.unwrap();

    assert_eq!(second.entities(), vec![o]);
    assert_eq!(em.get_entities(None, None).len(), 2);
    assert_eq!(*events.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_merge_strategy_decides_local_edits() {
    let (mut em, service) = manager_with_service();
    let c = customer(&mut em, 1, "Local", EntityState::Unchanged);
    em.set_value(c, "CompanyName", "Edited").unwrap();
    service
        .respond_to("Customers", json!([{"CustomerID": 1, "CompanyName": "Server"}]))
        .await;

    em.execute_query(&EntityQuery::from("Customers")).await.unwrap();
    assert_eq!(em.get_value(c, "CompanyName").unwrap(), DataValue::from("Edited"));
    assert_eq!(em.entity_state(c).unwrap(), EntityState::Modified);

    let overwrite = EntityQuery::from("Customers").using_merge_strategy(MergeStrategy::OverwriteChanges);
    em.execute_query(&overwrite).await.unwrap();
    assert_eq!(em.get_value(c, "CompanyName").unwrap(), DataValue::from("Server"));
    assert_eq!(em.entity_state(c).unwrap(), EntityState::Unchanged);
    assert!(em.aspect(c).unwrap().original_values().is_empty());
    assert!(!em.has_changes());
}

#[tokio::test]
async fn test_payload_back_references_resolve() {
    let (mut em, service) = manager_with_service();
    service
        .respond_to(
            "Orders",
            json!([
                {
                    "$id": "1",
                    "$type": "Northwind.Order, Model",
                    "OrderID": 1,
                    "Customer": {"$ref": "2"}
                },
                {
                    "$id": "2",
                    "$type": "Northwind.Customer, Model",
                    "CustomerID": 5,
                    "CompanyName": "Forward",
                    "Orders": [{"$ref": "1"}]
                },
                {"$ref": "1"}
            ]),
        )
        .await;

    let outcome = em.execute_query(&EntityQuery::from("Orders")).await.unwrap();

    assert_eq!(outcome.results.len(), 3);
    let o = outcome.results[0].as_entity().unwrap();
    let c = outcome.results[1].as_entity().unwrap();
    assert_eq!(outcome.results[2].as_entity(), Some(o));
    assert_eq!(em.get_navigation(o, "Customer").unwrap(), Some(c));
    assert_eq!(em.get_collection(c, "Orders").unwrap(), vec![o]);
    assert_eq!(em.get_value(o, "CustomerID").unwrap(), DataValue::Int(5));
    assert_eq!(em.entity_state(o).unwrap(), EntityState::Unchanged);
}

#[tokio::test]
async fn test_server_projection_and_inline_count() {
    let (mut em, service) = manager_with_service();
    service
        .respond_to(
            "Customers",
            json!({"results": [{"CompanyName": "A"}, {"CompanyName": "B"}], "inlineCount": 12}),
        )
        .await;

    let query = EntityQuery::from("Customers")
        .select("CompanyName")
        .unwrap()
        .take(2)
        .inline_count(true);
    let outcome = em.execute_query(&query).await.unwrap();

    assert_eq!(outcome.inline_count, Some(12));
    assert_eq!(outcome.results.len(), 2);
    let row = outcome.results[1].as_projection().unwrap();
    assert_eq!(row.get("CompanyName"), Some(&ProjectedValue::Value(DataValue::from("B"))));
    assert!(em.get_entities(None, None).is_empty());
}

#[tokio::test]
async fn test_transport_failure_carries_the_query() {
    let (mut em, service) = manager_with_service();
    service.fail_next(ServiceOperation::Query, "503 unavailable").await;

    let err = em.execute_query(&EntityQuery::from("Customers")).await.unwrap_err();
    match err {
        AppError::Transport { context, message, .. } => {
            assert_eq!(context, TransportContext::Query { uri: "Customers".to_string() });
            assert!(message.contains("503"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_fetch_entity_by_key_checks_cache_first() {
    let (mut em, service) = manager_with_service();
    let cached = order(&mut em, 10, None, EntityState::Unchanged);
    service.respond_to("Orders", json!([{"OrderID": 11}])).await;

    let hit = em.fetch_entity_by_key(&EntityKey::single("Order", 10i64), true).await.unwrap();
    assert_eq!(hit.entity, Some(cached));
    assert!(hit.from_cache);
    assert!(service.query_uris().await.is_empty());

    let miss = em.fetch_entity_by_key(&EntityKey::single("Order", 11i64), true).await.unwrap();
    assert!(!miss.from_cache);
    let fetched = miss.entity.unwrap();
    assert_eq!(em.get_value(fetched, "OrderID").unwrap(), DataValue::Int(11));
    assert_eq!(
        service.query_uris().await,
        vec!["Orders?$filter=OrderID%20eq%2011".to_string()]
    );
}

#[tokio::test]
async fn test_load_navigation_property_links_and_marks_loaded() {
    let (mut em, service) = manager_with_service();
    let c = customer(&mut em, 1, "Parent", EntityState::Unchanged);
    service
        .respond_to(
            "Orders",
            json!([{"OrderID": 10, "CustomerID": 1}, {"OrderID": 11, "CustomerID": 1}]),
        )
        .await;
    assert!(!em.aspect(c).unwrap().was_loaded("Orders"));

    let outcome = em.load_navigation_property(c, "Orders").await.unwrap();

    let mut orders = em.get_collection(c, "Orders").unwrap();
    orders.sort();
    let mut loaded = outcome.entities();
    loaded.sort();
    assert_eq!(orders, loaded);
    assert!(em.aspect(c).unwrap().was_loaded("Orders"));
    assert_eq!(
        service.query_uris().await,
        vec!["Orders?$filter=CustomerID%20eq%201".to_string()]
    );
}

#[tokio::test]
async fn test_metadata_is_fetched_once_per_service() {
    let service = Arc::new(MemoryDataService::new(SERVICE).with_metadata(metadata().export_metadata()));
    service.respond_to("Customers", json!([{"CustomerID": 1}])).await;
    let mut em = EntityManager::builder()
        .service_name(SERVICE)
        .data_service(service.clone())
        .build()
        .unwrap();
    assert!(em.metadata().get_entity_type("Customer").is_none());

    let outcome = em.execute_query(&EntityQuery::from("Customers")).await.unwrap();
    assert_eq!(outcome.entities().len(), 1);
    assert!(em.metadata().get_entity_type("Order").is_some());

    assert!(matches!(
        em.fetch_metadata().await,
        Err(AppError::MetadataAlreadyFetched(_))
    ));
}
