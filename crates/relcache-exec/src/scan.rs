//! Reading cached relations: column pruning and block-level skipping.

use crate::relation::CachedRelation;
use arrow::record_batch::RecordBatch;
use relcache_columnar::{BlockId, ColumnStats, ColumnarBlock};
use relcache_core::{CacheError, Result, ScalarValue, Schema};
use relcache_plan::RelationSource;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

/// A comparison pushed down to the scan, evaluated against block
/// statistics only. `column` indexes the relation schema, not the scan's
/// output projection.
#[derive(Debug, Clone, PartialEq)]
pub struct PruningPredicate {
    pub column: usize,
    pub op: CompareOp,
    pub value: ScalarValue,
}

impl PruningPredicate {
    /// False only when no row in a block with these statistics can satisfy
    /// the predicate; anything uncertain answers true.
    pub fn block_can_match(&self, stats: &ColumnStats) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        let (min, max) = match (&stats.min, &stats.max) {
            (Some(min), Some(max)) => (min, max),
            // No non-null values in the block: a comparison never holds.
            _ => return false,
        };
        let value = &self.value;
        match self.op {
            CompareOp::Eq => match (value.partial_cmp(min), value.partial_cmp(max)) {
                (Some(Less), _) => false,
                (_, Some(Greater)) => false,
                _ => true,
            },
            CompareOp::NotEq => {
                !(min.partial_cmp(value) == Some(Equal) && max.partial_cmp(value) == Some(Equal))
            }
            CompareOp::Lt => min.partial_cmp(value).map_or(true, |o| o == Less),
            CompareOp::LtEq => min.partial_cmp(value).map_or(true, |o| o != Greater),
            CompareOp::Gt => max.partial_cmp(value).map_or(true, |o| o == Greater),
            CompareOp::GtEq => max.partial_cmp(value).map_or(true, |o| o != Less),
        }
    }
}

/// Counters for one scan, shared across its readers.
#[derive(Debug, Default)]
pub struct ScanMetrics {
    blocks_read: AtomicU64,
    blocks_skipped: AtomicU64,
}

impl ScanMetrics {
    pub fn blocks_read(&self) -> u64 {
        self.blocks_read.load(Ordering::Relaxed)
    }

    pub fn blocks_skipped(&self) -> u64 {
        self.blocks_skipped.load(Ordering::Relaxed)
    }
}

/// A read-only, re-runnable reader over a cached relation's blocks.
///
/// Blocks whose statistics prove a pushed predicate unsatisfiable are
/// skipped without decoding; surviving blocks decode only the projected
/// columns. Row-level filtering stays with the enclosing plan.
#[derive(Debug)]
pub struct ColumnarScan {
    relation: Arc<CachedRelation>,
    projection: Option<Vec<usize>>,
    predicates: Vec<PruningPredicate>,
    output_schema: Schema,
    metrics: Arc<ScanMetrics>,
}

impl ColumnarScan {
    pub fn new(relation: Arc<CachedRelation>) -> Self {
        let output_schema = relation.schema().clone();
        Self {
            relation,
            projection: None,
            predicates: Vec::new(),
            output_schema,
            metrics: Arc::new(ScanMetrics::default()),
        }
    }

    /// Decode only the given relation columns, in the given order.
    pub fn with_projection(mut self, projection: Vec<usize>) -> Result<Self> {
        self.output_schema = self.relation.schema().project(&projection)?;
        self.projection = Some(projection);
        Ok(self)
    }

    pub fn with_predicates(mut self, predicates: Vec<PruningPredicate>) -> Self {
        self.predicates = predicates;
        self
    }

    pub fn relation(&self) -> &Arc<CachedRelation> {
        &self.relation
    }

    pub fn projection(&self) -> Option<&[usize]> {
        self.projection.as_deref()
    }

    pub fn predicates(&self) -> &[PruningPredicate] {
        &self.predicates
    }

    pub fn metrics(&self) -> Arc<ScanMetrics> {
        self.metrics.clone()
    }

    /// Lazy iterator of one record batch per surviving block. Triggers
    /// materialization of a lazy relation on first use.
    pub fn iter(&self) -> Result<BlockIter> {
        let blocks = self.relation.ensure_materialized()?;
        Ok(BlockIter {
            relation: self.relation.clone(),
            blocks: blocks.into_iter(),
            projection: self.projection.clone(),
            predicates: self.predicates.clone(),
            schema: self.relation.schema().clone(),
            metrics: self.metrics.clone(),
        })
    }
}

impl RelationSource for ColumnarScan {
    fn schema(&self) -> &Schema {
        &self.output_schema
    }

    fn scan(&self) -> Result<Vec<RecordBatch>> {
        self.iter()?.collect()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct BlockIter {
    relation: Arc<CachedRelation>,
    blocks: std::vec::IntoIter<BlockId>,
    projection: Option<Vec<usize>>,
    predicates: Vec<PruningPredicate>,
    schema: Schema,
    metrics: Arc<ScanMetrics>,
}

impl BlockIter {
    fn should_skip(&self, block: &ColumnarBlock) -> bool {
        self.predicates.iter().any(|p| {
            block
                .column_stats(p.column)
                .map(|stats| !p.block_can_match(stats))
                .unwrap_or(false)
        })
    }
}

impl Iterator for BlockIter {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.blocks.next()?;
            let block = match self.relation.store().get(&id) {
                Ok(Some(block)) => block,
                Ok(None) => {
                    return Some(Err(CacheError::BlockUnavailable(format!(
                        "block {} is no longer stored",
                        id
                    ))))
                }
                Err(e) => return Some(Err(e)),
            };
            if self.should_skip(&block) {
                debug!("pruned block {} via statistics", id);
                self.metrics.blocks_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.metrics.blocks_read.fetch_add(1, Ordering::Relaxed);
            return Some(block.to_record_batch(&self.schema, self.projection.as_deref()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::AccumulatorRegistry;
    use crate::engine::{ExecutionEngine, MemoryEngine};
    use crate::relation::{MaterializationMode, RelationConfig};
    use arrow::array::{Array, Int64Array, StringArray};
    use relcache_columnar::RelationId;
    use relcache_core::{DataType, Field};
    use relcache_plan::LogicalPlan;
    use relcache_store::{InMemoryBlockStore, StorageLevel, StoreConfig};
    use tempfile::TempDir;

    fn test_schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ])
    }

    fn batch(range: std::ops::Range<i64>) -> RecordBatch {
        let ids: Vec<i64> = range.collect();
        let names: Vec<Option<String>> = ids.iter().map(|i| Some(format!("n{}", i))).collect();
        RecordBatch::try_new(
            Arc::new(test_schema().to_arrow()),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from_iter(names)),
            ],
        )
        .unwrap()
    }

    struct Fixture {
        relation: Arc<CachedRelation>,
        engine: Arc<MemoryEngine>,
        _spill: TempDir,
    }

    /// 100 rows in one partition, 25 rows per block: four blocks with
    /// disjoint id ranges.
    fn fixture() -> Fixture {
        let engine = Arc::new(MemoryEngine::new());
        engine.register_single_partition("t", test_schema(), vec![batch(0..100)]);
        let spill = TempDir::new().unwrap();
        let store = Arc::new(
            InMemoryBlockStore::new(StoreConfig::default().with_spill_dir(spill.path())).unwrap(),
        );
        let registry = Arc::new(AccumulatorRegistry::new());
        let relation = Arc::new(CachedRelation::new(
            RelationId(1),
            LogicalPlan::table_scan("t", test_schema()),
            StorageLevel::MEMORY_ONLY,
            MaterializationMode::Lazy,
            RelationConfig {
                rows_per_block: 25,
                ..Default::default()
            },
            engine.clone(),
            store,
            registry,
        ));
        Fixture {
            relation,
            engine,
            _spill: spill,
        }
    }

    fn total_rows(batches: &[RecordBatch]) -> usize {
        batches.iter().map(|b| b.num_rows()).sum()
    }

    fn collect_rows(batches: &[RecordBatch]) -> Vec<(i64, Option<String>)> {
        let mut rows = Vec::new();
        for batch in batches {
            let ids = batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap();
            let names = batch
                .column(1)
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap();
            for i in 0..batch.num_rows() {
                let name = if names.is_null(i) {
                    None
                } else {
                    Some(names.value(i).to_string())
                };
                rows.push((ids.value(i), name));
            }
        }
        rows
    }

    #[test]
    fn test_scan_round_trips_all_rows() {
        let fixture = fixture();
        let scan = ColumnarScan::new(fixture.relation.clone());
        let batches = scan.scan().unwrap();
        assert_eq!(total_rows(&batches), 100);

        let expected = fixture
            .engine
            .execute(&LogicalPlan::table_scan("t", test_schema()))
            .unwrap();
        // Block boundaries differ from source batch boundaries; the rows
        // themselves must not.
        assert_eq!(collect_rows(&batches), collect_rows(&expected));
    }

    #[test]
    fn test_lazy_relation_materializes_on_first_read() {
        let fixture = fixture();
        assert!(!fixture.relation.is_materialized());
        let scan = ColumnarScan::new(fixture.relation.clone());
        scan.scan().unwrap();
        assert!(fixture.relation.is_materialized());
    }

    #[test]
    fn test_scan_is_rerunnable() {
        let fixture = fixture();
        let scan = ColumnarScan::new(fixture.relation.clone());
        let first = scan.scan().unwrap();
        let second = scan.scan().unwrap();
        assert_eq!(total_rows(&first), total_rows(&second));
    }

    #[test]
    fn test_column_pruning() {
        let fixture = fixture();
        let scan = ColumnarScan::new(fixture.relation.clone())
            .with_projection(vec![1])
            .unwrap();
        assert_eq!(scan.schema().len(), 1);
        assert_eq!(scan.schema().field(0).unwrap().name(), "name");
        let batches = scan.scan().unwrap();
        assert_eq!(batches[0].num_columns(), 1);
        assert_eq!(total_rows(&batches), 100);
    }

    #[test]
    fn test_block_pruning_skips_unreachable_blocks() {
        let fixture = fixture();
        let scan = ColumnarScan::new(fixture.relation.clone()).with_predicates(vec![
            PruningPredicate {
                column: 0,
                op: CompareOp::Gt,
                value: ScalarValue::Int64(Some(74)),
            },
        ]);
        let batches = scan.scan().unwrap();
        let metrics = scan.metrics();
        assert_eq!(metrics.blocks_skipped(), 3);
        assert_eq!(metrics.blocks_read(), 1);
        // Pruning is block granular: the surviving block comes back whole.
        assert_eq!(total_rows(&batches), 25);
    }

    #[test]
    fn test_satisfiable_predicate_never_skips() {
        let fixture = fixture();
        let scan = ColumnarScan::new(fixture.relation.clone()).with_predicates(vec![
            PruningPredicate {
                column: 0,
                op: CompareOp::GtEq,
                value: ScalarValue::Int64(Some(0)),
            },
        ]);
        let batches = scan.scan().unwrap();
        assert_eq!(scan.metrics().blocks_skipped(), 0);
        assert_eq!(total_rows(&batches), 100);
    }

    #[test]
    fn test_scan_after_release_is_clean_miss() {
        let fixture = fixture();
        let scan = ColumnarScan::new(fixture.relation.clone());
        scan.scan().unwrap();
        fixture.relation.release(true).unwrap();
        match scan.scan() {
            Err(CacheError::BlockUnavailable(_)) => {}
            other => panic!("expected a clean miss, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_block_can_match_boundaries() {
        let stats = ColumnStats {
            min: Some(ScalarValue::Int64(Some(10))),
            max: Some(ScalarValue::Int64(Some(20))),
            null_count: 0,
        };
        let pred = |op, v: i64| PruningPredicate {
            column: 0,
            op,
            value: ScalarValue::Int64(Some(v)),
        };

        assert!(pred(CompareOp::Eq, 10).block_can_match(&stats));
        assert!(pred(CompareOp::Eq, 15).block_can_match(&stats));
        assert!(!pred(CompareOp::Eq, 9).block_can_match(&stats));
        assert!(!pred(CompareOp::Eq, 21).block_can_match(&stats));

        assert!(!pred(CompareOp::Lt, 10).block_can_match(&stats));
        assert!(pred(CompareOp::Lt, 11).block_can_match(&stats));
        assert!(pred(CompareOp::LtEq, 10).block_can_match(&stats));
        assert!(!pred(CompareOp::LtEq, 9).block_can_match(&stats));

        assert!(!pred(CompareOp::Gt, 20).block_can_match(&stats));
        assert!(pred(CompareOp::Gt, 19).block_can_match(&stats));
        assert!(pred(CompareOp::GtEq, 20).block_can_match(&stats));
        assert!(!pred(CompareOp::GtEq, 21).block_can_match(&stats));

        assert!(pred(CompareOp::NotEq, 15).block_can_match(&stats));
        let constant = ColumnStats {
            min: Some(ScalarValue::Int64(Some(7))),
            max: Some(ScalarValue::Int64(Some(7))),
            null_count: 0,
        };
        assert!(!pred(CompareOp::NotEq, 7).block_can_match(&constant));
        assert!(pred(CompareOp::Eq, 7).block_can_match(&constant));
    }

    #[test]
    fn test_all_null_stats_never_match_comparisons() {
        let stats = ColumnStats {
            min: None,
            max: None,
            null_count: 25,
        };
        let pred = PruningPredicate {
            column: 0,
            op: CompareOp::Eq,
            value: ScalarValue::Int64(Some(1)),
        };
        assert!(!pred.block_can_match(&stats));
    }

    #[test]
    fn test_incomparable_types_stay_conservative() {
        let stats = ColumnStats {
            min: Some(ScalarValue::Int64(Some(0))),
            max: Some(ScalarValue::Int64(Some(9))),
            null_count: 0,
        };
        let pred = PruningPredicate {
            column: 0,
            op: CompareOp::Gt,
            value: ScalarValue::Utf8(Some("zzz".to_string())),
        };
        assert!(pred.block_can_match(&stats));
    }
}
