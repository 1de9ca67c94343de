mod common;

use common::{customer, manager, order, values};
use entity_cache::core::{DataValue, EntityKey, EntityState};
use entity_cache::infrastructure::ImportOptions;
use entity_cache::MergeStrategy;

#[test]
fn test_round_trip_keeps_states_values_and_links() {
    let mut source = manager();
    let c = customer(&mut source, 1, "Alfreds", EntityState::Unchanged);
    source.set_value(c, "City", "Berlin").unwrap();
    order(&mut source, 10, Some(1), EntityState::Unchanged);
    let gone = customer(&mut source, 2, "Gone", EntityState::Unchanged);
    source.set_deleted(gone).unwrap();

    let document = source.export_entities(None, true).unwrap();
    let mut target = source.create_empty_copy().unwrap();
    let result = target.import_entities(&document, ImportOptions::default()).unwrap();

    assert_eq!(result.entities.len(), 3);
    assert!(result.temp_key_map.is_empty());
    let c2 = target.get_entity_by_key(&EntityKey::single("Customer", 1i64)).unwrap();
    let o2 = target.get_entity_by_key(&EntityKey::single("Order", 10i64)).unwrap();
    let gone2 = target.get_entity_by_key(&EntityKey::single("Customer", 2i64)).unwrap();

    assert_eq!(target.entity_state(c2).unwrap(), EntityState::Modified);
    assert_eq!(target.get_value(c2, "City").unwrap(), DataValue::from("Berlin"));
    assert_eq!(
        target.aspect(c2).unwrap().original_values().get("City"),
        Some(&DataValue::Null)
    );
    assert_eq!(target.entity_state(o2).unwrap(), EntityState::Unchanged);
    assert_eq!(target.get_navigation(o2, "Customer").unwrap(), Some(c2));
    assert_eq!(target.entity_state(gone2).unwrap(), EntityState::Deleted);
    assert!(target.has_changes());

    // rejecting in the copy restores what the source started from
    target.reject_entity_changes(c2).unwrap();
    assert_eq!(target.get_value(c2, "City").unwrap(), DataValue::Null);
}

#[test]
fn test_deleted_child_stays_unlinked_when_its_parent_is_imported_after_it() {
    let mut source = manager();
    let o = source
        .create_entity(
            "Order",
            values([("OrderID", DataValue::Int(10)), ("ShipVia", DataValue::Int(1))]),
            EntityState::Unchanged,
        )
        .unwrap();
    source.set_deleted(o).unwrap();
    let shipper = source
        .create_entity(
            "Shipper",
            values([("ShipperID", DataValue::Int(1)), ("CompanyName", "Speedy".into())]),
            EntityState::Unchanged,
        )
        .unwrap();
    assert!(source.get_collection(shipper, "Orders").unwrap().is_empty());

    let document = source.export_entities(None, false).unwrap();
    let mut target = source.create_empty_copy().unwrap();
    target.import_entities(&document, ImportOptions::default()).unwrap();

    let o2 = target.get_entity_by_key(&EntityKey::single("Order", 10i64)).unwrap();
    let shipper2 = target.get_entity_by_key(&EntityKey::single("Shipper", 1i64)).unwrap();
    assert_eq!(target.entity_state(o2).unwrap(), EntityState::Deleted);
    assert!(target.get_collection(shipper2, "Orders").unwrap().is_empty());
    assert_eq!(target.get_navigation(o2, "Shipper").unwrap(), None);
    assert_eq!(target.get_value(o2, "ShipVia").unwrap(), DataValue::Int(1));

    target.reject_entity_changes(o2).unwrap();
    assert_eq!(target.get_navigation(o2, "Shipper").unwrap(), Some(shipper2));
}

#[test]
fn test_export_of_selected_entities_only() {
    let mut source = manager();
    let a = customer(&mut source, 1, "A", EntityState::Unchanged);
    customer(&mut source, 2, "B", EntityState::Unchanged);

    let document = source.export_entities(Some(&[a]), false).unwrap();
    assert!(document.get("metadataStore").map_or(true, |m| m.is_null()));
    let rows = document["entityGroupMap"]["Customer"]["entities"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["CustomerID"], 1);
    assert_eq!(rows[0]["entityAspect"]["entityState"], "Unchanged");
}

#[test]
fn test_temporary_keys_are_replaced_on_import() {
    let mut source = manager();
    let c = customer(&mut source, 0, "New", EntityState::Added);
    let o = order(&mut source, 0, None, EntityState::Detached);
    source.push_related(c, "Orders", &[o]).unwrap();
    assert_eq!(source.get_value(o, "CustomerID").unwrap(), DataValue::Int(-1));
    let document = source.export_entities(None, false).unwrap();

    let mut target = manager();
    let local = order(&mut target, 0, None, EntityState::Added);
    assert_eq!(target.get_value(local, "OrderID").unwrap(), DataValue::Int(-1));

    let result = target.import_entities(&document, ImportOptions::default()).unwrap();

    assert_eq!(result.temp_key_map.len(), 2);
    let c2 = result
        .entities
        .iter()
        .copied()
        .find(|id| target.entity_type_of(*id).unwrap().short_name == "Customer")
        .unwrap();
    let o2 = result
        .entities
        .iter()
        .copied()
        .find(|id| target.entity_type_of(*id).unwrap().short_name == "Order")
        .unwrap();
    let new_customer_key = target.get_value(c2, "CustomerID").unwrap();
    assert_ne!(new_customer_key, DataValue::Int(-1));
    assert_ne!(target.get_value(o2, "OrderID").unwrap(), DataValue::Int(-1));
    assert_eq!(target.get_value(o2, "CustomerID").unwrap(), new_customer_key);
    assert_eq!(target.get_navigation(o2, "Customer").unwrap(), Some(c2));
    assert!(target.aspect(c2).unwrap().has_temp_key());
    assert!(target.key_generator().is_temp_key(&target.get_key(o2).unwrap()));
    assert_eq!(target.entity_state(local).unwrap(), EntityState::Added);
    assert_eq!(target.get_entities(Some(&["Order"]), None).len(), 2);
}

#[test]
fn test_import_preserves_local_changes_unless_told_otherwise() {
    let mut source = manager();
    customer(&mut source, 1, "Exported", EntityState::Unchanged);
    let document = source.export_entities(None, false).unwrap();

    let mut target = manager();
    let local = customer(&mut target, 1, "Local", EntityState::Unchanged);
    target.set_value(local, "City", "Rome").unwrap();

    target.import_entities(&document, ImportOptions::default()).unwrap();
    assert_eq!(target.get_value(local, "CompanyName").unwrap(), DataValue::from("Local"));
    assert_eq!(target.entity_state(local).unwrap(), EntityState::Modified);

    let overwrite = ImportOptions {
        merge_strategy: Some(MergeStrategy::OverwriteChanges),
    };
    target.import_entities(&document, overwrite).unwrap();
    assert_eq!(target.get_value(local, "CompanyName").unwrap(), DataValue::from("Exported"));
    assert_eq!(target.entity_state(local).unwrap(), EntityState::Unchanged);
    assert!(!target.has_changes());
}

#[tokio::test]
async fn test_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.json");
    let mut source = manager();
    customer(&mut source, 3, "On Disk", EntityState::Added);

    source.export_to_file(&path, None, true).await.unwrap();
    let mut target = source.create_empty_copy().unwrap();
    let result = target.import_from_file(&path, ImportOptions::default()).await.unwrap();

    assert_eq!(result.entities.len(), 1);
    let id = result.entities[0];
    assert_eq!(target.entity_state(id).unwrap(), EntityState::Added);
    assert_eq!(target.get_value(id, "CompanyName").unwrap(), DataValue::from("On Disk"));

    let missing = target
        .import_from_file(dir.path().join("missing.json"), ImportOptions::default())
        .await;
    assert!(missing.is_err());
}
