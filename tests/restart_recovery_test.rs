mod common;

use std::collections::HashSet;

use layerdb::{AttributeType, ContextRegistry, EntityDescriptor, Error, Model, StoreHandle, Value};

#[test]
fn restart_recovers_entities_and_relationships() {
    let (_dir, config) = common::temp_config("restart");

    let artist_id = {
        let registry = ContextRegistry::open(&config, common::music_model()).unwrap();
        let ctx = registry.current();

        let mut artist = ctx.create_named("Artist").unwrap();
        artist.set("name", "Thelonious Monk").unwrap();
        artist.set("country", "US").unwrap();
        for title in ["Brilliant Corners", "Monk's Dream"] {
            let mut album = ctx.create_named("Album").unwrap();
            album.set("title", title).unwrap();
            album.set_related("artist", &[&artist]).unwrap();
            artist.add_related("albums", &album).unwrap();
        }
        for n in 0..10 {
            common::create_item(&ctx, &format!("n{n}"), n);
        }
        assert!(common::save_and_wait(&ctx).is_success());
        registry.shutdown();
        artist.id()
    };

    let registry = ContextRegistry::open(&config, common::music_model()).unwrap();
    let ctx = registry.current();

    let artist = ctx.object_with_id(artist_id).unwrap();
    assert_eq!(artist.get("country").unwrap(), Value::from("US"));
    let mut titles: Vec<_> = artist
        .related_entities("albums")
        .unwrap()
        .iter()
        .map(|a| a.get_text("title").unwrap().unwrap())
        .collect();
    titles.sort();
    assert_eq!(titles, vec!["Brilliant Corners", "Monk's Dream"]);

    assert_eq!(ctx.query("Item").unwrap().count(&ctx).unwrap(), 10);
    assert_eq!(
        ctx.query("Item").unwrap().sum(&ctx, "score").unwrap(),
        Value::Integer(45)
    );
}

#[test]
fn new_ids_after_restart_do_not_collide() {
    let (_dir, config) = common::temp_config("ids");

    let mut seen = HashSet::new();
    for round in 0..3 {
        let registry = ContextRegistry::open(&config, common::music_model()).unwrap();
        let ctx = registry.current();
        for n in 0..5 {
            common::create_item(&ctx, &format!("r{round}-{n}"), n);
        }
        common::save_and_wait(&ctx);
        registry.shutdown();
    }

    let store = StoreHandle::open(common::store_path(&config), common::music_model()).unwrap();
    let items = store.fetch_entity("Item").unwrap();
    assert_eq!(items.len(), 15);
    for record in &items {
        assert!(seen.insert(record.id), "duplicate id {}", record.id);
    }
}

#[test]
fn unsaved_changes_do_not_survive_restart() {
    let (_dir, config) = common::temp_config("unsaved");

    {
        let registry = ContextRegistry::open(&config, common::music_model()).unwrap();
        let ctx = registry.current();
        common::create_item(&ctx, "saved", 1);
        common::save_and_wait(&ctx);
        common::create_item(&ctx, "pending", 2);
        registry.shutdown();
    }

    let store = StoreHandle::open(common::store_path(&config), common::music_model()).unwrap();
    let items = store.fetch_entity("Item").unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].value("name"), &Value::from("saved"));
}

#[test]
fn store_refuses_a_different_model() {
    let (_dir, config) = common::temp_config("pinned");
    let path = common::store_path(&config);
    drop(StoreHandle::open(&path, common::music_model()).unwrap());

    let books = Model::new("books").with_entity(
        EntityDescriptor::new("Book").required("title", AttributeType::Text),
    );
    let err = StoreHandle::open(&path, books).unwrap_err();
    assert!(matches!(err, Error::Schema(_)));
    assert_eq!(err.code(), 303);
}

#[test]
fn config_is_frozen_once_a_registry_opens() {
    let (_dir, config) = common::temp_config("frozen");
    let registry = ContextRegistry::open(&config, common::music_model()).unwrap();

    assert!(config.is_frozen());
    let err = config.set_database_name("other").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(registry.config().database_name, "frozen");
}

#[test]
fn configured_model_name_must_match_the_model() {
    let (_dir, config) = common::temp_config("mismatch");
    config.set_model_name("catalog").unwrap();

    let err = ContextRegistry::open(&config, common::music_model()).unwrap_err();
    assert!(matches!(err, Error::Config(ref message) if message.contains("catalog")));
    assert_eq!(err.code(), 306);
    assert!(!common::store_path(&config).exists());
}
