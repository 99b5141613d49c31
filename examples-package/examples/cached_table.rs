//! Table Caching Example
//!
//! Demonstrates caching a table eagerly and lazily, transparent cached
//! reads, and explicit uncaching.

use anyhow::Result;
use arrow::array::{Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use relcache_core::{DataType, Field, ScalarValue, Schema};
use relcache_exec::MemoryEngine;
use relcache_manager::{CacheConfig, CacheSession};
use relcache_plan::{BinaryOp, LogicalExpr, LogicalPlan};
use relcache_store::{InMemoryBlockStore, StoreConfig};
use std::sync::Arc;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== Table Caching Example ===\n");

    let schema = Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("city", DataType::Utf8, true),
    ]);

    // Two partitions of sample rows.
    let cities = ["tokyo", "nairobi", "lima"];
    let make_batch = |range: std::ops::Range<i64>| -> Result<RecordBatch> {
        let ids: Vec<i64> = range.collect();
        let names: Vec<Option<&str>> = ids
            .iter()
            .map(|i| Some(cities[(*i as usize) % cities.len()]))
            .collect();
        Ok(RecordBatch::try_new(
            Arc::new(schema.to_arrow()),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(names)),
            ],
        )?)
    };

    let engine = Arc::new(MemoryEngine::new());
    engine.register_table(
        "visits",
        schema.clone(),
        vec![vec![make_batch(0..5_000)?], vec![make_batch(5_000..10_000)?]],
    );

    let spill = tempfile::TempDir::new()?;
    let store = Arc::new(InMemoryBlockStore::new(
        StoreConfig::default().with_spill_dir(spill.path()),
    )?);
    let session = CacheSession::new(
        engine,
        store,
        CacheConfig::default().with_rows_per_block(1_000),
    );
    session.register_temp_table("visits", LogicalPlan::table_scan("visits", schema.clone()));

    // Eagerly cache: materialization happens before cache_table returns.
    let entry = session.cache_table("visits")?;
    let stats = entry.relation().stats().expect("eager entry has stats");
    println!(
        "Cached 'visits': {} rows in {} compressed bytes",
        stats.row_count, stats.size_in_bytes
    );

    // Reads now run against the columnar blocks transparently.
    let query = LogicalPlan::filter(
        LogicalPlan::table_scan("visits", schema.clone()),
        LogicalExpr::binary(
            LogicalExpr::col("id", 0),
            BinaryOp::GtEq,
            LogicalExpr::lit(ScalarValue::Int64(Some(9_000))),
        ),
    );
    let batches = session.execute(&query)?;
    let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    println!("Query over cached data returned {} rows", rows);
    println!(
        "Registry lookups: {} hits, {} misses",
        session.manager().stats().hits(),
        session.manager().stats().misses()
    );

    // Uncaching is explicit; reading afterwards recomputes from source.
    session.uncache_table("visits")?;
    println!("is_cached after uncache: {}", session.is_cached("visits"));
    let rows: usize = session.execute(&query)?.iter().map(|b| b.num_rows()).sum();
    println!("Query after uncache returned {} rows (recomputed)", rows);

    session.clear_cache()?;
    println!(
        "Live size accumulators after clear: {}",
        session.manager().accumulator_registry().live_count()
    );

    Ok(())
}
