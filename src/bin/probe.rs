use std::env;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use rowgate::config::RateSettings;
use rowgate::{fields, Fault, MemoryStore, RowGateConfig, RowStore};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SHEET: &str = "Probe";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer())
        .init();

    println!("\n🚦 RATE BUDGET PROBE 🚦");
    println!("==================================================");

    let writers: u32 = env::var("PROBE_WRITERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(24);
    let ceiling: u32 = env::var("PROBE_CEILING")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10);

    let config = RowGateConfig {
        rate: RateSettings {
            window_ms: 1_000,
            ceiling,
        },
        ..RowGateConfig::from_env()?
    };

    // A flaky store: a handful of transient and quota failures mixed in.
    let memory = Arc::new(MemoryStore::new().with_sheet(SHEET, Vec::new()));
    let mut rng = rand::thread_rng();
    for _ in 0..writers {
        match rng.gen_range(0..10) {
            0 => memory.push_fault(Fault::status(503)),
            1 => memory.push_fault(Fault::quota(429)),
            _ => {}
        }
    }

    let store = RowStore::new(config, memory.clone())?;
    store.register_schema(SHEET, &["id", "writer", "seq"]);

    println!(
        "▶ Releasing {} concurrent writers against {} calls/second...\n",
        writers, ceiling
    );
    let start = Instant::now();

    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                let id = format!("w{}", i % (writers / 2).max(1));
                store
                    .upsert_row(
                        SHEET,
                        "id",
                        &id,
                        &fields([("writer", i.to_string()), ("seq", i.to_string())]),
                    )
                    .await
            })
        })
        .collect();

    let mut ok = 0u32;
    let mut failed = 0u32;
    for handle in handles {
        match handle.await? {
            Ok(_) => ok += 1,
            Err(e) => {
                failed += 1;
                println!("  ⚠️  {} ({})", e, e.kind());
            }
        }
        let stats = store.stats();
        println!(
            "  🚗 admitted {:>3} | deferred {:>3} | window {}/{}",
            stats.executor.admitted,
            stats.executor.deferred,
            stats.executor.window_calls,
            stats.executor.ceiling
        );
    }

    let duration = start.elapsed();
    println!("\n✅ Burst drained in {:.2?}", duration);
    println!(
        "   Upserts: {} ok, {} failed | Store saw {} calls",
        ok,
        failed,
        memory.calls().len()
    );

    let stats = store.stats();
    println!("\n📊 Final Status:");
    println!("  • Admitted calls:   {}", stats.executor.admitted);
    println!("  • Deferred calls:   {}", stats.executor.deferred);
    println!(
        "  • Cache:            {} hits / {} misses",
        stats.cache.hits, stats.cache.misses
    );
    println!("  • Rows in sheet:    {}", memory.rows(SHEET).len().saturating_sub(1));

    Ok(())
}
