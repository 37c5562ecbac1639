use std::env;
use std::sync::Arc;

use rowgate::{fields, HttpTransport, MemoryStore, RowGateConfig, RowStore, Transport, Upserted};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SHEET: &str = "Inventory";
const HEADER: [&str; 4] = ["sku", "name", "qty", "status"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    println!("\n╔════════════════════════════════════════════════════╗");
    println!("║  ROWGATE - Rate-limited client for row stores      ║");
    println!("╚════════════════════════════════════════════════════╝\n");

    println!("📚 Architecture (5 Layers):");
    println!("  1️⃣  Transport:       One physical call to the store");
    println!("  2️⃣  RetryController: Backoff with jitter, quota-aware");
    println!("  3️⃣  Executor:        Fixed-window call budget, FIFO admission");
    println!("  4️⃣  TtlCache:        Read-through cache, prefix invalidation");
    println!("  5️⃣  RowStore:        Records by key, positions resolved per call");

    let config = RowGateConfig::from_env()?;
    let transport: Arc<dyn Transport> = if env::var("ROWGATE_SPREADSHEET_ID").is_ok() {
        println!("\n▶ Using remote store at {}", config.store.base_url);
        Arc::new(HttpTransport::new(&config.store)?)
    } else {
        println!("\n▶ ROWGATE_SPREADSHEET_ID not set, using the in-memory store");
        Arc::new(MemoryStore::new().with_sheet(SHEET, Vec::new()))
    };

    let store = RowStore::new(config, transport)?;
    println!("✓ RowStore initialized\n");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("▶ Ensuring header {:?}...", HEADER);
    let change = store.ensure_schema(SHEET, &HEADER).await?;
    println!("  ✓ {:?}", change);
    let change = store.ensure_schema(SHEET, &HEADER).await?;
    println!("  ✓ Second call: {:?}\n", change);

    println!("▶ Performing UPSERT operations...");
    for (sku, name, qty) in [("A-100", "bolt", "40"), ("A-200", "nut", "120"), ("A-300", "washer", "0")] {
        let outcome = store
            .upsert_row(SHEET, "sku", sku, &fields([("name", name), ("qty", qty), ("status", "active")]))
            .await?;
        println!("  ✓ UPSERT {} -> {:?}", sku, outcome);
    }
    match store
        .upsert_row(SHEET, "sku", "A-200", &fields([("qty", "95")]))
        .await?
    {
        Upserted::Updated { position } => println!("  ✓ UPSERT A-200 updated in place at row {}", position),
        Upserted::Inserted { .. } => println!("  ✗ UPSERT A-200 unexpectedly appended"),
    }
    println!();

    println!("▶ Performing FIND operations...");
    if let Some(row) = store.find_row(SHEET, "sku", "A-200").await? {
        println!("  ✓ FIND A-200 at row {}: qty={}", row.position, row.get("qty").unwrap_or(""));
    }
    match store.find_row(SHEET, "sku", "Z-999").await? {
        Some(row) => println!("  ✓ FIND Z-999 at row {}", row.position),
        None => println!("  ✓ FIND Z-999 = <not found>"),
    }
    println!();

    println!("▶ Performing UPDATE by predicate...");
    let updated = store
        .update_rows(SHEET, |row| row.get("qty") == Some("0"), &fields([("status", "reorder")]))
        .await?;
    println!("  ✓ Marked rows {:?} for reorder\n", updated);

    println!("▶ Performing DELETE by predicate...");
    let deleted = store
        .delete_rows(SHEET, |row| row.get("status") == Some("reorder"))
        .await?;
    println!("  ✓ Deleted rows {:?} (highest first)\n", deleted);

    println!("▶ Reading all rows...");
    let rows = store.read_rows(SHEET).await?;
    println!("  ✓ Found {} rows:", rows.len());
    for row in &rows {
        println!("    - row {}: {:?}", row.position, row.fields);
    }
    println!();

    println!("▶ Client Statistics:");
    let stats = store.stats();
    println!("  • Calls admitted: {}", stats.executor.admitted);
    println!("  • Calls deferred by rate budget: {}", stats.executor.deferred);
    println!(
        "  • Current window: {}/{} calls",
        stats.executor.window_calls, stats.executor.ceiling
    );
    println!(
        "  • Cache: {} entries, {} hits, {} misses, {} invalidated",
        stats.cache.entries, stats.cache.hits, stats.cache.misses, stats.cache.invalidations
    );

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("\n✅ All operations completed successfully!");
    println!();

    Ok(())
}
