//! Columnar materialization for cached query results.
//!
//! Row batches are sliced into bounded chunks and encoded column by
//! column under a cost-selected compression scheme, with nulls tracked in
//! a separate bitmap and min/max/null-count statistics recorded per
//! column for block-level pruning.

pub mod bitmap;
pub mod block;
pub mod encoder;
pub mod scheme;
pub mod stats;
mod varint;

pub use bitmap::NullBitmap;
pub use block::{BlockBuilder, BlockId, ColumnarBlock, RelationId};
pub use encoder::{decode_column, encode_column, CompressedColumn, EncoderOptions};
pub use scheme::CompressionScheme;
pub use stats::ColumnStats;
