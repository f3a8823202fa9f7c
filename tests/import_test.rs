mod common;

use std::io::Write;

use layerdb::{FieldHooks, ImportBuilder, ImportSource, Record, Value};

fn record(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[test]
fn imports_records_and_saves_once() {
    let registry = common::memory_registry();
    let ctx = registry.current();
    let mut events = registry.notifier().subscribe();

    let records = vec![
        record(&[("title", "Kind of Blue".into()), ("year", 1959.into())]),
        record(&[("title", "A Love Supreme".into()), ("year", 1965.into())]),
        record(&[("title", "Ignored".into()), ("unknown", "field".into())]),
    ];
    let report = ImportBuilder::new(ctx.entity("Album").unwrap())
        .source(ImportSource::Records(records))
        .unwrap()
        .run(&ctx)
        .unwrap();

    assert_eq!(report.imported, 3);
    assert_eq!(report.failed, 0);
    assert!(common::wait_for(&mut events, &report.ticket).is_success());
    assert_eq!(registry.store().fetch_entity("Album").unwrap().len(), 3);
}

#[test]
fn filter_skips_and_bad_records_fail_without_aborting() {
    let registry = common::memory_registry();
    let ctx = registry.current();

    let records = vec![
        record(&[("title", "Keep".into()), ("year", 2001.into())]),
        record(&[("title", "Too Old".into()), ("year", 1899.into())]),
        record(&[("year", 2003.into())]),
        record(&[("title", "Wrong Type".into()), ("year", "soon".into())]),
        record(&[("title", "Also Keep".into()), ("year", 2010.into())]),
    ];
    let report = ImportBuilder::new(ctx.entity("Album").unwrap())
        .source(ImportSource::Records(records))
        .unwrap()
        .field("title", FieldHooks::new())
        .unwrap()
        .field(
            "year",
            FieldHooks::new().filter(|v| v.as_integer().map_or(true, |y| y >= 1900)),
        )
        .unwrap()
        .run(&ctx)
        .unwrap();

    assert_eq!(report.imported, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 2);

    common::save_and_wait(&ctx);
    let titles: Vec<_> = ctx
        .query("Album")
        .unwrap()
        .order("title")
        .all(&ctx)
        .unwrap()
        .iter()
        .map(|a| a.get_text("title").unwrap().unwrap())
        .collect();
    assert_eq!(titles, vec!["Also Keep", "Keep"]);
}

#[test]
fn unique_by_updates_existing_entities() {
    let registry = common::memory_registry();
    let ctx = registry.current();
    common::create_item(&ctx, "existing", 1);
    common::save_and_wait(&ctx);

    let records = vec![
        record(&[("name", "existing".into()), ("score", 50.into())]),
        record(&[("name", "fresh".into()), ("score", 5.into())]),
        record(&[("name", "fresh".into()), ("score", 6.into())]),
    ];
    let report = ImportBuilder::new(ctx.entity("Item").unwrap())
        .source(ImportSource::Records(records))
        .unwrap()
        .unique_by("name")
        .unwrap()
        .run(&ctx)
        .unwrap();

    assert_eq!(report.imported, 1);
    assert_eq!(report.updated, 2);
    assert_eq!(ctx.query("Item").unwrap().count(&ctx).unwrap(), 2);
    assert_eq!(
        ctx.query("Item").unwrap().sum(&ctx, "score").unwrap(),
        Value::Integer(56)
    );
}

#[test]
fn map_hook_parses_text_timestamps_from_json() {
    let registry = common::memory_registry();
    let ctx = registry.current();

    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(
        file,
        r#"[
            {{"name": "Giant Steps", "date": "1960-01-27"}},
            {{"name": "Mingus Ah Um", "date": "1959-10-12"}}
        ]"#
    )
    .unwrap();

    let report = ImportBuilder::new(ctx.entity("Album").unwrap())
        .source(ImportSource::JsonFile(file.path().to_path_buf()))
        .unwrap()
        .field("title", FieldHooks::new().from_key("name"))
        .unwrap()
        .field(
            "released",
            FieldHooks::new()
                .from_key("date")
                .text_source()
                .map(|v, _| {
                    // YYYYMMDD as a number keeps the fixtures in date order.
                    let digits: String = v
                        .as_text()
                        .unwrap_or_default()
                        .chars()
                        .filter(char::is_ascii_digit)
                        .collect();
                    digits.parse::<i64>().map(Value::Timestamp).unwrap_or(Value::Null)
                }),
        )
        .unwrap()
        .run(&ctx)
        .unwrap();
    assert_eq!(report.imported, 2);

    let first = ctx
        .query("Album")
        .unwrap()
        .order("released")
        .first(&ctx)
        .unwrap()
        .unwrap();
    assert_eq!(first.get_text("title").unwrap().as_deref(), Some("Mingus Ah Um"));
}

#[test]
fn configuration_errors_are_eager() {
    let registry = common::memory_registry();
    let ctx = registry.current();
    let album = ctx.entity("Album").unwrap();

    let dir = tempfile::tempdir().unwrap();
    let xml = dir.path().join("albums.xml");
    std::fs::write(&xml, "<albums/>").unwrap();

    let err = ImportBuilder::new(album.clone())
        .source(ImportSource::JsonFile(xml))
        .unwrap_err();
    assert_eq!(err.code(), 100);

    let err = ImportBuilder::new(album.clone())
        .source(ImportSource::JsonFile(dir.path().join("missing.json")))
        .unwrap_err();
    assert_eq!(err.code(), 101);

    let err = ImportBuilder::new(album.clone())
        .field("label", FieldHooks::new())
        .unwrap_err();
    assert_eq!(err.code(), 200);

    let err = ImportBuilder::new(album)
        .field("released", FieldHooks::new().text_source())
        .unwrap_err();
    assert_eq!(err.code(), 201);
}
