#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use layerdb::{
    AttributeType, ConfigCell, Context, ContextRegistry, EntityDescriptor, Model, SaveEvent,
    SaveTicket, StoreConfig,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Artists own their albums; items are a flat scoring fixture.
pub fn music_model() -> Model {
    Model::new("music")
        .with_entity(
            EntityDescriptor::new("Artist")
                .required("name", AttributeType::Text)
                .attribute("country", AttributeType::Text)
                .owning_to_many("albums", "Album"),
        )
        .with_entity(
            EntityDescriptor::new("Album")
                .required("title", AttributeType::Text)
                .attribute("year", AttributeType::Integer)
                .attribute("released", AttributeType::Timestamp)
                .to_one("artist", "Artist"),
        )
        .with_entity(
            EntityDescriptor::new("Item")
                .attribute("name", AttributeType::Text)
                .attribute("score", AttributeType::Integer)
                .attribute("group", AttributeType::Text),
        )
}

pub fn memory_registry() -> ContextRegistry {
    layerdb::observability::init_test_tracing();
    ContextRegistry::open_in_memory(music_model()).expect("open in-memory registry")
}

pub fn temp_config(name: &str) -> (tempfile::TempDir, ConfigCell) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let cell = ConfigCell::new(StoreConfig::in_dir(dir.path()));
    cell.set_database_name(name).expect("set database name");
    cell.set_model_name("music").expect("set model name");
    (dir, cell)
}

pub fn store_path(cell: &ConfigCell) -> PathBuf {
    cell.get().sqlite_store_path()
}

pub fn create_item(ctx: &Context, name: &str, score: i64) {
    let mut item = ctx.create_named("Item").expect("create item");
    item.set("name", name).expect("set name");
    item.set("score", score).expect("set score");
}

/// Saves `ctx` and blocks until the save's event arrives.
pub fn save_and_wait(ctx: &Context) -> SaveEvent {
    let mut events = ctx.notifier().subscribe();
    let ticket = ctx.save().expect("save");
    wait_for(&mut events, &ticket)
}

pub fn wait_for(events: &mut layerdb::SaveSubscription, ticket: &SaveTicket) -> SaveEvent {
    events.wait_for(ticket, WAIT).expect("save event")
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

pub fn eventually_blocking<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
