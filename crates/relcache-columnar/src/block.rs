//! Columnar blocks and the builder that seals row batches into them.

use crate::encoder::{encode_column, decode_column, CompressedColumn, EncoderOptions};
use crate::stats::ColumnStats;
use arrow::array::ArrayRef;
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use relcache_core::{CacheError, Result, Schema};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity of a cached relation, unique within one cache manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationId(pub u64);

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rel-{}", self.0)
    }
}

/// Identity of one block: unique per (relation, partition, batch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub relation: RelationId,
    pub partition: usize,
    pub batch: usize,
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.p{}.b{}", self.relation, self.partition, self.batch)
    }
}

/// A bounded batch of rows, one compressed column per schema field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnarBlock {
    pub id: BlockId,
    pub row_count: usize,
    pub columns: Vec<CompressedColumn>,
}

impl ColumnarBlock {
    /// Every column must cover the same number of rows.
    pub fn try_new(id: BlockId, columns: Vec<CompressedColumn>) -> Result<Self> {
        let row_count = columns.first().map(|c| c.row_count()).unwrap_or(0);
        for column in &columns {
            if column.row_count() != row_count {
                return Err(CacheError::Storage(format!(
                    "block {}: column covers {} rows, expected {}",
                    id,
                    column.row_count(),
                    row_count
                )));
            }
        }
        Ok(Self {
            id,
            row_count,
            columns,
        })
    }

    pub fn size_in_bytes(&self) -> usize {
        self.columns.iter().map(|c| c.size_in_bytes()).sum()
    }

    pub fn column_stats(&self, index: usize) -> Option<&ColumnStats> {
        self.columns.get(index).map(|c| &c.stats)
    }

    /// Decode the requested columns (all of them when `projection` is
    /// `None`) into a record batch. `schema` is the full relation schema.
    pub fn to_record_batch(
        &self,
        schema: &Schema,
        projection: Option<&[usize]>,
    ) -> Result<RecordBatch> {
        let indices: Vec<usize> = match projection {
            Some(indices) => indices.to_vec(),
            None => (0..self.columns.len()).collect(),
        };
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(indices.len());
        for &i in &indices {
            let column = self.columns.get(i).ok_or_else(|| {
                CacheError::ColumnNotFound(format!("block {} has no column {}", self.id, i))
            })?;
            arrays.push(decode_column(column)?);
        }
        let out_schema = Arc::new(schema.project(&indices)?.to_arrow());
        RecordBatch::try_new(out_schema, arrays).map_err(CacheError::from)
    }
}

/// Slices incoming row batches into fixed-size chunks and encodes each
/// chunk into a [`ColumnarBlock`]. One builder per (relation, partition);
/// partitions never share a builder.
pub struct BlockBuilder {
    relation: RelationId,
    partition: usize,
    schema: Schema,
    rows_per_block: usize,
    opts: EncoderOptions,
    pending: Vec<RecordBatch>,
    pending_rows: usize,
    next_batch: usize,
}

impl BlockBuilder {
    pub fn new(
        relation: RelationId,
        partition: usize,
        schema: Schema,
        rows_per_block: usize,
        opts: EncoderOptions,
    ) -> Self {
        Self {
            relation,
            partition,
            schema,
            rows_per_block: rows_per_block.max(1),
            opts,
            pending: Vec::new(),
            pending_rows: 0,
            next_batch: 0,
        }
    }

    /// Buffer a batch, sealing as many full blocks as it completes.
    pub fn push(&mut self, batch: RecordBatch) -> Result<Vec<ColumnarBlock>> {
        self.pending_rows += batch.num_rows();
        self.pending.push(batch);
        let mut sealed = Vec::new();
        while self.pending_rows >= self.rows_per_block {
            sealed.push(self.seal(self.rows_per_block)?);
        }
        Ok(sealed)
    }

    /// Seal whatever rows remain. Returns `None` when nothing is pending.
    pub fn finish(mut self) -> Result<Option<ColumnarBlock>> {
        if self.pending_rows == 0 {
            return Ok(None);
        }
        let rows = self.pending_rows;
        Ok(Some(self.seal(rows)?))
    }

    fn seal(&mut self, rows: usize) -> Result<ColumnarBlock> {
        let arrow_schema = Arc::new(self.schema.to_arrow());
        let combined = concat_batches(&arrow_schema, self.pending.iter())?;
        let chunk = combined.slice(0, rows);
        let rest = combined.num_rows() - rows;
        self.pending = if rest > 0 {
            vec![combined.slice(rows, rest)]
        } else {
            Vec::new()
        };
        self.pending_rows = rest;

        let mut columns = Vec::with_capacity(self.schema.len());
        for (i, field) in self.schema.fields().iter().enumerate() {
            columns.push(encode_column(field.data_type(), chunk.column(i), &self.opts)?);
        }
        let id = BlockId {
            relation: self.relation,
            partition: self.partition,
            batch: self.next_batch,
        };
        self.next_batch += 1;
        ColumnarBlock::try_new(id, columns)
    }
}
