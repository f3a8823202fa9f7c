mod common;

use std::sync::{Arc, Mutex};

use layerdb::query::shortcuts;
use layerdb::{ContextRegistry, Direction, Error, Predicate, SortKey, Value};

fn scored_registry() -> ContextRegistry {
    let registry = common::memory_registry();
    let ctx = registry.current();
    common::create_item(&ctx, "A", 1);
    common::create_item(&ctx, "B", 3);
    common::create_item(&ctx, "C", 2);
    common::save_and_wait(&ctx);
    registry
}

fn names(rows: &[layerdb::ManagedEntity]) -> Vec<String> {
    rows.iter()
        .map(|e| e.get_text("name").unwrap().unwrap_or_default())
        .collect()
}

#[test]
fn filter_order_aggregate_and_count() {
    let registry = scored_registry();
    let ctx = registry.current();

    let rows = ctx
        .query("Item")
        .unwrap()
        .filter(Predicate::gt("score", 1))
        .order("score")
        .all(&ctx)
        .unwrap();
    assert_eq!(names(&rows), vec!["C", "B"]);

    let q = ctx.query("Item").unwrap();
    assert_eq!(q.max(&ctx, "score").unwrap(), Value::Integer(3));
    assert_eq!(q.min(&ctx, "score").unwrap(), Value::Integer(1));
    assert_eq!(q.sum(&ctx, "score").unwrap(), Value::Integer(6));
    assert_eq!(q.count(&ctx).unwrap(), 3);
}

#[test]
fn equality_filter_keeps_identity_order() {
    let registry = common::memory_registry();
    let ctx = registry.current();
    for (name, group) in [("a", "x"), ("b", "y"), ("c", "x"), ("d", "x")] {
        let mut item = ctx.create_named("Item").unwrap();
        item.set("name", name).unwrap();
        item.set("group", group).unwrap();
    }
    common::save_and_wait(&ctx);

    let rows = ctx
        .query("Item")
        .unwrap()
        .filter(("group", "x"))
        .all(&ctx)
        .unwrap();
    assert_eq!(names(&rows), vec!["a", "c", "d"]);
    let ids: Vec<_> = rows.iter().map(|r| r.id()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
}

#[test]
fn pages_are_slices_of_the_full_order() {
    let registry = common::memory_registry();
    let ctx = registry.current();
    for n in 0..20 {
        common::create_item(&ctx, &format!("n{n:02}"), (n * 7) % 5);
    }
    common::save_and_wait(&ctx);

    let order = vec![SortKey::desc("score"), SortKey::asc("name")];
    let full = names(
        &ctx.query("Item")
            .unwrap()
            .order(order.clone())
            .all(&ctx)
            .unwrap(),
    );
    assert_eq!(full.len(), 20);

    for offset in [0, 3, 7, 19, 25] {
        for limit in [1, 4, 10] {
            let page = names(
                &ctx.query("Item")
                    .unwrap()
                    .order(order.clone())
                    .offset(offset)
                    .limit(limit)
                    .all(&ctx)
                    .unwrap(),
            );
            let expected: Vec<_> = full.iter().skip(offset).take(limit).cloned().collect();
            assert_eq!(page, expected, "offset {offset} limit {limit}");
        }
    }
}

#[test]
fn filters_accumulate_and_other_setters_replace() {
    let registry = scored_registry();
    let ctx = registry.current();

    let rows = ctx
        .query("Item")
        .unwrap()
        .filter(Predicate::ge("score", 2))
        .filter(Predicate::ne("name", "B"))
        .limit(1)
        .limit(5)
        .order("name desc")
        .order("name")
        .all(&ctx)
        .unwrap();
    assert_eq!(names(&rows), vec!["C"]);
}

#[test]
fn like_or_and_not_predicates() {
    let registry = common::memory_registry();
    let ctx = registry.current();
    for name in ["Blue Train", "blue in green", "So What", "Giant Steps"] {
        common::create_item(&ctx, name, 0);
    }
    common::save_and_wait(&ctx);

    let like = ctx
        .query("Item")
        .unwrap()
        .where_like("name", "Blue*")
        .all(&ctx)
        .unwrap();
    assert_eq!(names(&like), vec!["Blue Train"]);

    let ilike = shortcuts::where_like_ordered(&ctx, "Item", "name", "blue*", "name").unwrap();
    assert_eq!(names(&ilike), vec!["Blue Train", "blue in green"]);

    let either = ctx
        .query("Item")
        .unwrap()
        .filter(Predicate::eq("name", "So What").or(Predicate::like("name", "G?ant*")))
        .order(vec![("name", Direction::Ascending)])
        .all(&ctx)
        .unwrap();
    assert_eq!(names(&either), vec!["Giant Steps", "So What"]);

    let neither = ctx
        .query("Item")
        .unwrap()
        .filter(!Predicate::ilike("name", "*blue*"))
        .count(&ctx)
        .unwrap();
    assert_eq!(neither, 2);
}

#[test]
fn unknown_attribute_fails_before_store_access() {
    let registry = scored_registry();
    let ctx = registry.current();

    let err = ctx
        .query("Item")
        .unwrap()
        .filter(Predicate::eq("colour", "red"))
        .all(&ctx)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAttribute { .. }));
    assert_eq!(err.code(), 200);

    let err = ctx.query("Item").unwrap().order("colour").validate().unwrap_err();
    assert_eq!(err.code(), 200);

    let err = ctx.query("Item").unwrap().sum(&ctx, "name").unwrap_err();
    assert_eq!(err.code(), 200);

    let err = ctx.query("Nope").unwrap_err();
    assert!(matches!(err, Error::UnknownEntity(_)));
}

#[test]
fn type_mismatch_in_predicate() {
    let registry = scored_registry();
    let ctx = registry.current();
    let err = ctx
        .query("Item")
        .unwrap()
        .where_eq("score", "three")
        .count(&ctx)
        .unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { .. }));
}

#[test]
fn on_error_routes_to_handler_and_returns_empty() {
    let registry = scored_registry();
    let ctx = registry.current();
    let seen: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let q = ctx
        .query("Item")
        .unwrap()
        .filter(Predicate::eq("colour", "red"))
        .on_error(move |err| sink.lock().unwrap().push(err.code()));

    assert!(q.all(&ctx).unwrap().is_empty());
    assert!(q.first(&ctx).unwrap().is_none());
    assert_eq!(q.count(&ctx).unwrap(), 0);
    assert_eq!(q.max(&ctx, "score").unwrap(), Value::Null);
    assert!(q.observe(&ctx).is_err());

    assert_eq!(*seen.lock().unwrap(), vec![200, 200, 200, 200, 200]);
}

#[test]
fn first_and_each() {
    let registry = scored_registry();
    let ctx = registry.current();

    let top = ctx
        .query("Item")
        .unwrap()
        .order("score desc")
        .first(&ctx)
        .unwrap()
        .unwrap();
    assert_eq!(top.get_text("name").unwrap().as_deref(), Some("B"));

    let mut visited = Vec::new();
    let n = ctx
        .query("Item")
        .unwrap()
        .order("name desc")
        .each(&ctx, |e| visited.push(e.get_text("name").unwrap().unwrap()))
        .unwrap();
    assert_eq!(n, 3);
    assert_eq!(visited, vec!["C", "B", "A"]);
}

#[test]
fn queries_read_through_pending_changes() {
    let registry = scored_registry();
    let ctx = registry.current();

    common::create_item(&ctx, "D", 10);
    let mut a = shortcuts::one_where(&ctx, "Item", "name", "A").unwrap().unwrap();
    a.set("score", 0).unwrap();

    assert_eq!(shortcuts::count_of(&ctx, "Item").unwrap(), 4);
    let q = ctx.query("Item").unwrap();
    assert_eq!(q.max(&ctx, "score").unwrap(), Value::Integer(10));
    assert_eq!(q.min(&ctx, "score").unwrap(), Value::Integer(0));

    // Nothing saved yet, so the store is unchanged.
    assert_eq!(registry.store().fetch_entity("Item").unwrap().len(), 3);
}

#[test]
fn empty_aggregates() {
    let registry = common::memory_registry();
    let ctx = registry.current();
    let q = ctx.query("Item").unwrap();
    assert_eq!(q.min(&ctx, "score").unwrap(), Value::Null);
    assert_eq!(q.max(&ctx, "score").unwrap(), Value::Null);
    assert_eq!(q.sum(&ctx, "score").unwrap(), Value::Integer(0));
    assert_eq!(q.count(&ctx).unwrap(), 0);
    assert!(q.first(&ctx).unwrap().is_none());
}

#[test]
fn shortcut_helpers() {
    let registry = scored_registry();
    let ctx = registry.current();

    assert_eq!(names(&shortcuts::all_of(&ctx, "Item").unwrap()), vec!["A", "B", "C"]);
    assert_eq!(
        names(&shortcuts::all_ordered_by(&ctx, "Item", "score desc").unwrap()),
        vec!["B", "C", "A"]
    );
    assert_eq!(
        names(&shortcuts::where_eq(&ctx, "Item", "score", 2).unwrap()),
        vec!["C"]
    );
    assert_eq!(
        names(&shortcuts::where_eq_ordered(&ctx, "Item", "score", 3, "name").unwrap()),
        vec!["B"]
    );
    assert!(shortcuts::one_where(&ctx, "Item", "name", "Z").unwrap().is_none());

    assert_eq!(shortcuts::delete_all_of(&ctx, "Item").unwrap(), 3);
    assert_eq!(shortcuts::count_of(&ctx, "Item").unwrap(), 0);
}
