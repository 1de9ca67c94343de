mod common;

use std::sync::{Arc, Mutex};

use common::{customer, manager, order, values};
use entity_cache::core::{DataValue, EntityState};

#[test]
fn test_setting_order_customer_attaches_and_links() {
    let mut em = manager();
    let c = customer(&mut em, 1, "Alfreds", EntityState::Unchanged);
    let o = order(&mut em, 10, None, EntityState::Detached);

    em.set_navigation(o, "Customer", Some(c)).unwrap();

    assert_eq!(em.entity_state(o).unwrap(), EntityState::Added);
    assert_eq!(em.get_value(o, "CustomerID").unwrap(), DataValue::Int(1));
    assert_eq!(em.get_collection(c, "Orders").unwrap(), vec![o]);
    assert_eq!(em.entity_state(c).unwrap(), EntityState::Unchanged);
}

#[test]
fn test_reparenting_severs_the_old_association() {
    let mut em = manager();
    let first = customer(&mut em, 1, "First", EntityState::Unchanged);
    let second = customer(&mut em, 2, "Second", EntityState::Unchanged);
    let o = order(&mut em, 10, Some(1), EntityState::Unchanged);
    assert_eq!(em.get_collection(first, "Orders").unwrap(), vec![o]);

    em.set_navigation(o, "Customer", Some(second)).unwrap();

    assert!(em.get_collection(first, "Orders").unwrap().is_empty());
    assert_eq!(em.get_collection(second, "Orders").unwrap(), vec![o]);
    assert_eq!(em.get_value(o, "CustomerID").unwrap(), DataValue::Int(2));
    assert_eq!(em.entity_state(o).unwrap(), EntityState::Modified);
    assert_eq!(
        em.aspect(o).unwrap().original_values().get("CustomerID"),
        Some(&DataValue::Int(1))
    );
}

#[test]
fn test_foreign_key_write_moves_the_navigation() {
    let mut em = manager();
    let first = customer(&mut em, 1, "First", EntityState::Unchanged);
    let second = customer(&mut em, 2, "Second", EntityState::Unchanged);
    let o = order(&mut em, 10, Some(1), EntityState::Unchanged);

    em.set_value(o, "CustomerID", 2i64).unwrap();
    assert_eq!(em.get_navigation(o, "Customer").unwrap(), Some(second));
    assert!(em.get_collection(first, "Orders").unwrap().is_empty());
    assert_eq!(em.get_collection(second, "Orders").unwrap(), vec![o]);

    em.set_value(o, "CustomerID", DataValue::Null).unwrap();
    assert_eq!(em.get_navigation(o, "Customer").unwrap(), None);
    assert!(em.get_collection(second, "Orders").unwrap().is_empty());
}

#[test]
fn test_collection_push_sets_inverse_and_foreign_key() {
    let mut em = manager();
    let c = customer(&mut em, 5, "Parent", EntityState::Unchanged);
    let o = order(&mut em, 0, None, EntityState::Detached);

    em.push_related(c, "Orders", &[o]).unwrap();

    assert_eq!(em.entity_state(o).unwrap(), EntityState::Added);
    assert_eq!(em.get_navigation(o, "Customer").unwrap(), Some(c));
    assert_eq!(em.get_value(o, "CustomerID").unwrap(), DataValue::Int(5));

    // pushing the same member again is ignored
    em.push_related(c, "Orders", &[o]).unwrap();
    assert_eq!(em.get_collection(c, "Orders").unwrap().len(), 1);

    assert!(em.remove_related(c, "Orders", o).unwrap());
    assert_eq!(em.get_navigation(o, "Customer").unwrap(), None);
    assert_eq!(em.get_value(o, "CustomerID").unwrap(), DataValue::Null);
}

#[test]
fn test_array_changed_reports_adds_and_removes() {
    let mut em = manager();
    let c = customer(&mut em, 1, "Parent", EntityState::Unchanged);
    let a = order(&mut em, 11, None, EntityState::Unchanged);
    let b = order(&mut em, 12, None, EntityState::Unchanged);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    em.array_changed.subscribe(move |args| {
        sink.lock()
            .unwrap()
            .push((args.added.clone(), args.removed.clone()));
    });

    em.push_related(c, "Orders", &[a, b]).unwrap();
    assert_eq!(em.shift_related(c, "Orders").unwrap(), Some(a));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.first(), Some(&(vec![a, b], vec![])));
    assert_eq!(seen.last(), Some(&(vec![], vec![a])));
}

#[test]
fn test_splice_replaces_members() {
    let mut em = manager();
    let c = customer(&mut em, 1, "Parent", EntityState::Unchanged);
    let a = order(&mut em, 11, Some(1), EntityState::Unchanged);
    let b = order(&mut em, 12, Some(1), EntityState::Unchanged);
    let d = order(&mut em, 13, None, EntityState::Unchanged);

    let removed = em.splice_related(c, "Orders", 0, 1, &[d]).unwrap();
    assert_eq!(removed, vec![a]);
    assert_eq!(em.get_collection(c, "Orders").unwrap(), vec![d, b]);
    assert_eq!(em.get_navigation(a, "Customer").unwrap(), None);
    assert_eq!(em.get_navigation(d, "Customer").unwrap(), Some(c));
}

#[test]
fn test_children_attached_before_parent_are_linked_later() {
    let mut em = manager();
    let o1 = order(&mut em, 10, Some(3), EntityState::Unchanged);
    let o2 = order(&mut em, 11, Some(3), EntityState::Unchanged);
    assert_eq!(em.get_navigation(o1, "Customer").unwrap(), None);

    let c = customer(&mut em, 3, "Late", EntityState::Unchanged);

    assert_eq!(em.get_navigation(o1, "Customer").unwrap(), Some(c));
    assert_eq!(em.get_navigation(o2, "Customer").unwrap(), Some(c));
    let mut orders = em.get_collection(c, "Orders").unwrap();
    orders.sort();
    assert_eq!(orders, vec![o1, o2]);
    assert_eq!(em.entity_state(o1).unwrap(), EntityState::Unchanged);
}

#[test]
fn test_parent_key_change_follows_into_children() {
    let mut em = manager();
    let c = customer(&mut em, 0, "Temp", EntityState::Added);
    let o = order(&mut em, 0, None, EntityState::Detached);
    em.push_related(c, "Orders", &[o]).unwrap();
    let temp = em.get_value(c, "CustomerID").unwrap();
    assert_eq!(em.get_value(o, "CustomerID").unwrap(), temp);

    em.set_value(c, "CustomerID", 42i64).unwrap();
    assert_eq!(em.get_value(o, "CustomerID").unwrap(), DataValue::Int(42));
    assert_eq!(em.get_navigation(o, "Customer").unwrap(), Some(c));
}

#[test]
fn test_graph_attach_takes_related_entities_along() {
    let mut em = manager();
    let c = customer(&mut em, 1, "Root", EntityState::Detached);
    let o = order(&mut em, 20, None, EntityState::Detached);
    em.set_navigation(o, "Customer", Some(c)).unwrap();
    assert_eq!(em.entity_state(o).unwrap(), EntityState::Detached);

    em.attach_entity(c, EntityState::Unchanged).unwrap();

    assert_eq!(em.entity_state(o).unwrap(), EntityState::Unchanged);
    assert_eq!(em.get_collection(c, "Orders").unwrap(), vec![o]);
}

#[test]
fn test_unidirectional_collection_uses_inverse_foreign_keys() {
    let mut em = manager();
    let employee = em
        .create_entity(
            "Employee",
            values([("EmployeeID", DataValue::Int(9)), ("LastName", "Davolio".into())]),
            EntityState::Unchanged,
        )
        .unwrap();
    let existing = em
        .create_entity(
            "Order",
            values([("OrderID", DataValue::Int(1)), ("EmployeeID", DataValue::Int(9))]),
            EntityState::Unchanged,
        )
        .unwrap();
    assert_eq!(em.get_collection(employee, "Orders").unwrap(), vec![existing]);

    let added = order(&mut em, 2, None, EntityState::Unchanged);
    em.push_related(employee, "Orders", &[added]).unwrap();
    assert_eq!(em.get_value(added, "EmployeeID").unwrap(), DataValue::Int(9));
    assert_eq!(em.entity_state(added).unwrap(), EntityState::Modified);
}

#[test]
fn test_deleting_parent_nulls_nullable_children() {
    let mut em = manager();
    let c = customer(&mut em, 1, "Gone", EntityState::Unchanged);
    let o = order(&mut em, 10, Some(1), EntityState::Unchanged);

    em.set_deleted(c).unwrap();

    assert_eq!(em.get_navigation(o, "Customer").unwrap(), None);
    assert_eq!(em.get_value(o, "CustomerID").unwrap(), DataValue::Null);
    assert_eq!(em.entity_state(o).unwrap(), EntityState::Modified);
    assert!(em.get_collection(c, "Orders").unwrap().is_empty());
}

#[test]
fn test_deleting_parent_detaches_dependents_with_required_keys() {
    let mut em = manager();
    let region = em
        .create_entity(
            "Region",
            values([("RegionID", DataValue::Int(1)), ("RegionDescription", "East".into())]),
            EntityState::Unchanged,
        )
        .unwrap();
    let territory = em
        .create_entity(
            "Territory",
            values([("TerritoryID", "01581".into()), ("RegionID", DataValue::Int(1))]),
            EntityState::Unchanged,
        )
        .unwrap();
    assert_eq!(em.get_navigation(territory, "Region").unwrap(), Some(region));

    em.set_deleted(region).unwrap();

    assert_eq!(em.entity_state(territory).unwrap(), EntityState::Detached);
    assert_eq!(em.get_value(territory, "RegionID").unwrap(), DataValue::Int(1));
}

#[test]
fn test_detach_severs_links_without_touching_foreign_keys() {
    let mut em = manager();
    let c = customer(&mut em, 1, "Parent", EntityState::Unchanged);
    let o = order(&mut em, 10, Some(1), EntityState::Unchanged);

    em.detach_entity(c).unwrap();

    assert_eq!(em.get_navigation(o, "Customer").unwrap(), None);
    assert_eq!(em.get_value(o, "CustomerID").unwrap(), DataValue::Int(1));
    assert_eq!(em.entity_state(o).unwrap(), EntityState::Unchanged);
    assert!(em.get_collection(c, "Orders").unwrap().is_empty());
}

#[test]
fn test_parent_key_and_property_paths() {
    let mut em = manager();
    customer(&mut em, 4, "Blauer See", EntityState::Unchanged);
    let o = order(&mut em, 10, Some(4), EntityState::Unchanged);

    let parent = em.get_parent_key(o, "Customer").unwrap().unwrap();
    assert_eq!(parent.values(), &[DataValue::Int(4)]);
    assert_eq!(
        em.get_property_value(o, "Customer.CompanyName").unwrap(),
        DataValue::from("Blauer See")
    );
}

#[test]
fn test_deleted_child_is_not_linked_when_its_parent_arrives() {
    let mut em = manager();
    let o = order(&mut em, 10, Some(5), EntityState::Unchanged);
    em.set_deleted(o).unwrap();

    let c = customer(&mut em, 5, "Late", EntityState::Unchanged);

    assert_eq!(em.entity_state(o).unwrap(), EntityState::Deleted);
    assert!(em.get_collection(c, "Orders").unwrap().is_empty());
    assert_eq!(em.get_navigation(o, "Customer").unwrap(), None);

    em.reject_entity_changes(o).unwrap();
    assert_eq!(em.get_navigation(o, "Customer").unwrap(), Some(c));
    assert_eq!(em.get_collection(c, "Orders").unwrap(), vec![o]);
}

#[test]
fn test_children_wait_while_their_parent_is_deleted() {
    let mut em = manager();
    let c = customer(&mut em, 1, "Gone", EntityState::Unchanged);
    em.set_deleted(c).unwrap();

    let o = order(&mut em, 10, Some(1), EntityState::Unchanged);
    assert_eq!(em.get_navigation(o, "Customer").unwrap(), None);
    assert!(em.get_collection(c, "Orders").unwrap().is_empty());

    em.reject_entity_changes(c).unwrap();
    assert_eq!(em.get_navigation(o, "Customer").unwrap(), Some(c));
    assert_eq!(em.get_collection(c, "Orders").unwrap(), vec![o]);
}
