//! Columnar Encoding Example
//!
//! Shows how row batches are sliced into blocks, which compression scheme
//! the encoder picks per column, and block-level pruning statistics.

use anyhow::Result;
use arrow::array::{Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use relcache_columnar::{BlockBuilder, EncoderOptions, RelationId};
use relcache_core::{DataType, Field, Schema};
use std::sync::Arc;

fn main() -> Result<()> {
    println!("=== Columnar Encoding Example ===\n");

    let schema = Schema::new(vec![
        Field::new("seq", DataType::Int64, false),
        Field::new("status", DataType::Utf8, false),
    ]);

    // A monotonically increasing id and a low-cardinality status column.
    let ids: Vec<i64> = (0..4_000).collect();
    let statuses: Vec<&str> = ids
        .iter()
        .map(|i| ["ok", "retry", "failed"][(*i as usize) % 3])
        .collect();
    let batch = RecordBatch::try_new(
        Arc::new(schema.to_arrow()),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(statuses)),
        ],
    )?;

    let mut builder = BlockBuilder::new(
        RelationId(0),
        0,
        schema.clone(),
        1_000,
        EncoderOptions::default(),
    );
    let mut blocks = builder.push(batch)?;
    blocks.extend(builder.finish()?);

    for block in &blocks {
        println!(
            "block {}: {} rows, {} bytes",
            block.id,
            block.row_count,
            block.size_in_bytes()
        );
        for (field, column) in schema.fields().iter().zip(&block.columns) {
            println!(
                "  {:8} -> {:10} (min={:?}, max={:?}, nulls={})",
                field.name(),
                column.scheme.to_string(),
                column.stats.min,
                column.stats.max,
                column.stats.null_count
            );
        }
    }

    // Decoding reconstructs the original rows exactly.
    let decoded = blocks[0].to_record_batch(&schema, None)?;
    println!("\nDecoded first block: {} rows", decoded.num_rows());

    Ok(())
}
