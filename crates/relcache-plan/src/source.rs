use arrow::record_batch::RecordBatch;
use relcache_core::{Result, Schema};
use std::any::Any;
use std::fmt::Debug;

/// A readable relation that can stand in for a sub-plan after rewriting.
///
/// The cache substitutes a columnar scan behind this trait wherever a
/// submitted plan matches a tracked entry. Scans must be re-runnable:
/// `scan` may be called any number of times, concurrently.
pub trait RelationSource: Debug + Send + Sync {
    fn schema(&self) -> &Schema;

    fn scan(&self) -> Result<Vec<RecordBatch>>;

    /// Lets optimization passes recover the concrete source type.
    fn as_any(&self) -> &dyn Any;
}
