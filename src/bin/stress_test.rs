//! LayerDB Stress Test Binary
//!
//! Many threads, each with its own context, creating and saving entities at
//! the same time. Run with: `cargo run --bin stress_test -- [OPTIONS]`
//!
//! This is separate from the regular test suite because:
//! 1. It can take a long time to run
//! 2. It's configurable via command-line arguments
//! 3. It reports throughput
//!
//! # Examples
//!
//! ```bash
//! # Default test: 8 threads, 1000 entities each, saving every 50
//! cargo run --release --bin stress_test
//!
//! # Save after every single create
//! cargo run --release --bin stress_test -- --threads 32 --entities 200 --batch 1
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use layerdb::observability::init_tracing;
use layerdb::{
    AttributeType, ConfigCell, ContextRegistry, EntityDescriptor, Model, SaveTicket, StoreConfig,
};

/// Stress test configuration
struct Config {
    /// Number of threads, each with its own context
    threads: usize,
    /// Entities created per thread
    entities: usize,
    /// Creates between saves
    batch: usize,
    /// Data directory (or temp if None)
    data_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 8,
            entities: 1000,
            batch: 50,
            data_dir: None,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--threads" | "-t" => {
                i += 1;
                config.threads = args[i].parse().expect("Invalid --threads value");
            }
            "--entities" | "-e" => {
                i += 1;
                config.entities = args[i].parse().expect("Invalid --entities value");
            }
            "--batch" | "-b" => {
                i += 1;
                config.batch = args[i].parse::<usize>().expect("Invalid --batch value").max(1);
            }
            "--data-dir" | "-d" => {
                i += 1;
                config.data_dir = Some(args[i].clone());
            }
            "--help" | "-h" => {
                println!(
                    r#"LayerDB Stress Test

Usage: stress_test [OPTIONS]

Options:
  -t, --threads <N>      Concurrent threads (default: 8)
  -e, --entities <N>     Entities per thread (default: 1000)
  -b, --batch <N>        Creates between saves (default: 50)
  -d, --data-dir <PATH>  Store directory (default: temp dir)
  -h, --help             Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn model() -> Model {
    Model::new("stress").with_entity(
        EntityDescriptor::new("Item")
            .required("name", AttributeType::Text)
            .attribute("worker", AttributeType::Integer),
    )
}

fn main() {
    init_tracing("stress_test");
    let config = parse_args();

    println!("LayerDB Stress Test");
    println!("===================");
    println!("Threads:     {}", config.threads);
    println!("Entities:    {} per thread", config.entities);
    println!("Batch:       {}", config.batch);
    println!();

    let data_dir = config.data_dir.clone().unwrap_or_else(|| {
        std::env::temp_dir()
            .join(format!("layerdb-stress-{}", std::process::id()))
            .to_string_lossy()
            .to_string()
    });
    let cell = ConfigCell::new(StoreConfig::in_dir(&data_dir));
    cell.set_database_name("stress").expect("config frozen");
    cell.set_model_name("stress").expect("config frozen");
    let registry = ContextRegistry::open(&cell, model()).expect("open registry");
    println!("Store:       {}", cell.get().sqlite_store_path().display());
    println!();

    let mut events = registry.notifier().subscribe();
    let failures = Arc::new(AtomicU64::new(0));

    println!("Starting stress test...");
    let start = Instant::now();

    let mut handles = Vec::new();
    for worker in 0..config.threads {
        let registry = registry.clone();
        let failures = failures.clone();
        let entities = config.entities;
        let batch = config.batch;

        handles.push(thread::spawn(move || {
            let ctx = registry.current();
            let mut tickets: Vec<SaveTicket> = Vec::new();
            for i in 0..entities {
                let mut item = ctx.create_named("Item").expect("create");
                item.set("name", format!("item-{}-{}", worker, i)).expect("set name");
                item.set("worker", worker as i64).expect("set worker");

                if (i + 1) % batch == 0 || i + 1 == entities {
                    match ctx.save() {
                        Ok(ticket) => tickets.push(ticket),
                        Err(_) => {
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
            tickets
        }));
    }

    let mut tickets = Vec::new();
    for handle in handles {
        tickets.extend(handle.join().expect("worker panicked"));
    }

    // Every ticket's event must arrive.
    let mut pending: HashSet<SaveTicket> = tickets.iter().copied().collect();
    while !pending.is_empty() {
        match events.next_blocking() {
            Some(Ok(event)) => {
                if !event.is_success() {
                    failures.fetch_add(1, Ordering::Relaxed);
                }
                pending.remove(&SaveTicket {
                    context_id: event.context_id,
                    generation: event.generation,
                });
            }
            Some(Err(err)) => panic!("save events lost: {}", err),
            None => panic!("notifier closed with {} saves outstanding", pending.len()),
        }
    }
    let elapsed = start.elapsed();

    let expected = config.threads * config.entities;
    let failed = failures.load(Ordering::Relaxed);

    println!();
    println!("Results");
    println!("-------");
    println!("Saves:           {}", tickets.len());
    println!("Failed saves:    {}", failed);
    println!("Duration:        {:?}", elapsed);
    println!(
        "Throughput:      {:.2} entities/sec",
        expected as f64 / elapsed.as_secs_f64()
    );
    println!();

    println!("Verifying invariants...");
    let ctx = registry.current();
    let count = ctx.query("Item").and_then(|q| q.count(&ctx)).expect("count");
    println!("  Items visible:     {}", count);
    assert_eq!(count, expected, "item count mismatch");

    for worker in 0..config.threads {
        let per_worker = ctx
            .query("Item")
            .and_then(|q| q.where_eq("worker", worker as i64).count(&ctx))
            .expect("count per worker");
        assert_eq!(per_worker, config.entities, "worker {} lost items", worker);
    }
    println!("  Per-thread counts: complete ✓");

    registry.shutdown();
    let reopened = ContextRegistry::open(&cell, model()).expect("reopen");
    let ctx = reopened.current();
    let ids: HashSet<_> = ctx
        .query("Item")
        .and_then(|q| q.all(&ctx))
        .expect("fetch all")
        .into_iter()
        .map(|item| item.id())
        .collect();
    assert_eq!(ids.len(), expected, "duplicate or missing ids after restart");
    println!("  Durable after restart: {} unique ids ✓", ids.len());

    assert_eq!(failed, 0, "some saves failed");
    println!();
    println!("Stress test PASSED ✓");
}
