mod common;

use std::time::Duration;

use common::{customer, manager_with, manager_with_service, order, values};
use entity_cache::core::{DataValue, EntityKey, EntityState};
use entity_cache::error::TransportContext;
use entity_cache::infrastructure::{MemoryDataService, ServiceOperation, ServiceRequest};
use entity_cache::{AppError, SharedEntityManager};
use serde_json::Value;

fn saved_bundles(requests: Vec<ServiceRequest>) -> Vec<Value> {
    requests
        .into_iter()
        .filter_map(|r| match r {
            ServiceRequest::Save { bundle } => Some(bundle),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_identity_keys_are_replaced_and_foreign_keys_follow() {
    let (mut em, _service) = manager_with_service();
    let c = customer(&mut em, 0, "New Co", EntityState::Added);
    let o = order(&mut em, 0, None, EntityState::Detached);
    em.push_related(c, "Orders", &[o]).unwrap();
    assert_eq!(em.get_value(c, "CustomerID").unwrap(), DataValue::Int(-1));
    assert_eq!(em.get_value(o, "CustomerID").unwrap(), DataValue::Int(-1));

    let outcome = em.save_changes(None).await.unwrap();

    assert_eq!(outcome.entities, vec![c, o]);
    assert_eq!(outcome.key_mappings.len(), 2);
    assert_eq!(em.get_value(c, "CustomerID").unwrap(), DataValue::Int(1000));
    assert_eq!(em.get_value(o, "OrderID").unwrap(), DataValue::Int(1001));
    assert_eq!(em.get_value(o, "CustomerID").unwrap(), DataValue::Int(1000));
    assert_eq!(em.get_navigation(o, "Customer").unwrap(), Some(c));
    assert_eq!(em.get_entity_by_key(&EntityKey::single("Customer", 1000i64)), Some(c));
    assert!(em.get_entity_by_key(&EntityKey::single("Customer", -1i64)).is_none());
    for id in [c, o] {
        assert_eq!(em.entity_state(id).unwrap(), EntityState::Unchanged);
        assert!(!em.aspect(id).unwrap().has_temp_key());
    }
    assert!(!em.has_changes());
}

#[tokio::test]
async fn test_modified_entities_bump_their_concurrency_value() {
    let (mut em, service) = manager_with_service();
    let c = customer(&mut em, 1, "Before", EntityState::Unchanged);
    em.set_value(c, "CompanyName", "After").unwrap();

    em.save_changes(None).await.unwrap();

    let bundles = saved_bundles(service.requests().await);
    assert_eq!(bundles.len(), 1);
    let row = &bundles[0]["entities"][0];
    assert_eq!(row["RowVersion"], 2);
    assert_eq!(row["entityAspect"]["entityState"], "Modified");
    assert_eq!(row["entityAspect"]["originalValuesMap"]["CompanyName"], "Before");
    assert_eq!(row["entityAspect"]["entityTypeName"], "Customer:#Northwind");

    assert_eq!(em.get_value(c, "RowVersion").unwrap(), DataValue::Int(2));
    assert_eq!(em.entity_state(c).unwrap(), EntityState::Unchanged);
    assert!(em.aspect(c).unwrap().original_values().is_empty());
}

#[tokio::test]
async fn test_failed_save_leaves_entities_as_they_were() {
    let (mut em, service) = manager_with_service();
    let c = customer(&mut em, 1, "Before", EntityState::Unchanged);
    em.set_value(c, "CompanyName", "After").unwrap();
    let o = order(&mut em, 0, Some(1), EntityState::Added);
    let temp = em.get_key(o).unwrap();
    service.fail_next(ServiceOperation::Save, "409 conflict").await;

    let err = em.save_changes(None).await.unwrap_err();

    assert!(matches!(
        err,
        AppError::Transport {
            context: TransportContext::Save { .. },
            ..
        }
    ));
    assert_eq!(em.entity_state(c).unwrap(), EntityState::Modified);
    assert_eq!(em.get_value(c, "RowVersion").unwrap(), DataValue::Int(1));
    assert_eq!(em.get_value(c, "CompanyName").unwrap(), DataValue::from("After"));
    assert!(!em.aspect(c).unwrap().original_values().contains_key("RowVersion"));
    assert_eq!(em.entity_state(o).unwrap(), EntityState::Added);
    assert_eq!(em.get_key(o).unwrap(), temp);
    assert!(em.aspect(o).unwrap().has_temp_key());
    for id in [c, o] {
        assert!(!em.aspect(id).unwrap().is_being_saved());
    }
    assert!(em.has_changes());

    // the same changes go through once the server recovers
    em.save_changes(None).await.unwrap();
    assert!(!em.has_changes());
    assert_eq!(em.get_value(c, "RowVersion").unwrap(), DataValue::Int(2));
}

#[tokio::test]
async fn test_validation_errors_stop_the_save_before_transport() {
    let (mut em, service) = manager_with_service();
    let employee = em
        .create_entity(
            "Employee",
            values([("LastName", DataValue::from(""))]),
            EntityState::Added,
        )
        .unwrap();

    let err = em.save_changes(None).await.unwrap_err();

    match err {
        AppError::Validation { entities, .. } => assert_eq!(entities, vec![employee]),
        other => panic!("unexpected error: {}", other),
    }
    assert!(em.aspect(employee).unwrap().has_validation_errors());
    assert!(service.requests().await.is_empty());
    assert_eq!(em.entity_state(employee).unwrap(), EntityState::Added);
}

#[tokio::test]
async fn test_deleted_entities_are_detached_after_save() {
    let (mut em, _service) = manager_with_service();
    let c = customer(&mut em, 1, "Gone", EntityState::Unchanged);
    em.set_deleted(c).unwrap();

    let outcome = em.save_changes(None).await.unwrap();

    assert_eq!(outcome.entities, vec![c]);
    assert_eq!(em.entity_state(c).unwrap(), EntityState::Detached);
    assert!(em.get_entity_by_key(&EntityKey::single("Customer", 1i64)).is_none());
    assert!(!em.has_changes());
}

#[tokio::test]
async fn test_saving_nothing_sends_nothing() {
    let (mut em, service) = manager_with_service();
    let c = customer(&mut em, 1, "Clean", EntityState::Unchanged);

    let outcome = em.save_changes(Some(&[c])).await.unwrap();
    assert!(outcome.entities.is_empty());
    let outcome = em.save_changes(None).await.unwrap();
    assert!(outcome.entities.is_empty());
    assert!(service.requests().await.is_empty());
}

#[tokio::test]
async fn test_only_the_requested_entities_are_saved() {
    let (mut em, service) = manager_with_service();
    let a = customer(&mut em, 1, "A", EntityState::Unchanged);
    let b = customer(&mut em, 2, "B", EntityState::Unchanged);
    em.set_value(a, "City", "Lyon").unwrap();
    em.set_value(b, "City", "Nice").unwrap();

    em.save_changes(Some(&[a])).await.unwrap();

    assert_eq!(em.entity_state(a).unwrap(), EntityState::Unchanged);
    assert_eq!(em.entity_state(b).unwrap(), EntityState::Modified);
    let bundles = saved_bundles(service.requests().await);
    assert_eq!(bundles[0]["entities"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_overlapping_saves_are_rejected_while_in_flight() {
    let (mut em, _service) =
        manager_with(MemoryDataService::new(common::SERVICE).with_latency(Duration::from_millis(100)));
    let a = customer(&mut em, 1, "A", EntityState::Unchanged);
    let b = customer(&mut em, 2, "B", EntityState::Unchanged);
    em.set_value(a, "City", "Oslo").unwrap();
    let shared = SharedEntityManager::new(em);

    let first = {
        let shared = shared.clone();
        tokio::spawn(async move { shared.save_changes(None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    {
        let mut em = shared.lock().await;
        assert!(em.aspect(a).unwrap().is_being_saved());
        em.set_value(b, "City", "Bergen").unwrap();
    }
    let second = shared.save_changes(Some(vec![a])).await;
    assert!(matches!(second, Err(AppError::ConcurrentSave(ref ids)) if ids == &vec![a]));

    let saved = first.await.unwrap().unwrap();
    assert_eq!(saved.entities, vec![a]);
    let em = shared.lock().await;
    assert!(!em.aspect(a).unwrap().is_being_saved());
    assert_eq!(em.entity_state(a).unwrap(), EntityState::Unchanged);
    assert_eq!(em.entity_state(b).unwrap(), EntityState::Modified);
}
