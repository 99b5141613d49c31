//! The cache registry: tracked plans, their cached relations, and plan
//! rewriting.

use crate::config::CacheConfig;
use crate::pushdown;
use crate::stats::CacheStats;
use relcache_columnar::RelationId;
use relcache_core::{CacheError, Result};
use parking_lot::RwLock;
use relcache_exec::{
    AccumulatorRegistry, CachedRelation, ColumnarScan, ExecutionEngine, MaterializationMode,
};
use relcache_plan::{canonicalize, LogicalPlan};
use relcache_store::{BlockStore, StorageLevel};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One tracked query: the canonical plan it answers, the cached relation
/// holding its data, and the temp table that owns it, if any.
#[derive(Debug)]
pub struct CacheEntry {
    plan: Arc<LogicalPlan>,
    relation: Arc<CachedRelation>,
    table_name: Option<String>,
}

impl CacheEntry {
    /// Canonical form of the cached plan; the registry key.
    pub fn plan(&self) -> &Arc<LogicalPlan> {
        &self.plan
    }

    pub fn relation(&self) -> &Arc<CachedRelation> {
        &self.relation
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table_name.as_deref()
    }
}

/// Registry mapping tracked query plans to cached relations.
///
/// An owned, injected instance: construct one per query-execution context
/// and share it via `Arc`. Registry mutations serialize behind the write
/// lock; lookups take the read lock. Entries are matched by structural
/// equality of canonical plans, so the registry is a scanned sequence
/// rather than a hash map.
pub struct CacheManager {
    engine: Arc<dyn ExecutionEngine>,
    store: Arc<dyn BlockStore>,
    config: CacheConfig,
    registry: Arc<AccumulatorRegistry>,
    entries: RwLock<Vec<Arc<CacheEntry>>>,
    next_relation: AtomicU64,
    stats: Arc<CacheStats>,
}

impl CacheManager {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        store: Arc<dyn BlockStore>,
        config: CacheConfig,
    ) -> Self {
        Self {
            engine,
            store,
            config,
            registry: Arc::new(AccumulatorRegistry::new()),
            entries: RwLock::new(Vec::new()),
            next_relation: AtomicU64::new(0),
            stats: Arc::new(CacheStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Registry of live size accumulators; empty once every entry is gone.
    pub fn accumulator_registry(&self) -> &Arc<AccumulatorRegistry> {
        &self.registry
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Track `plan` under the given level and mode.
    ///
    /// Idempotent: an equivalent tracked plan returns the existing entry
    /// untouched, whatever its materialization state. Eager caching
    /// materializes before returning and deregisters the entry if the
    /// child plan fails, leaving the registry unchanged.
    pub fn cache_query(
        &self,
        plan: &Arc<LogicalPlan>,
        table_name: Option<String>,
        level: StorageLevel,
        mode: MaterializationMode,
    ) -> Result<Arc<CacheEntry>> {
        // Reads of already-cached sub-plans go through their scans.
        let child = self.rewrite_plan(plan);
        let canonical = canonicalize(plan);

        let entry = {
            let mut entries = self.entries.write();
            if let Some(existing) = entries.iter().find(|e| e.plan == canonical) {
                debug!("plan already tracked, returning existing entry");
                return Ok(existing.clone());
            }
            let relation = Arc::new(CachedRelation::new(
                RelationId(self.next_relation.fetch_add(1, Ordering::Relaxed)),
                child,
                level,
                mode,
                self.config.relation_config(),
                self.engine.clone(),
                self.store.clone(),
                self.registry.clone(),
            ));
            let entry = Arc::new(CacheEntry {
                plan: canonical,
                relation,
                table_name,
            });
            entries.push(entry.clone());
            self.stats.set_entry_count(entries.len() as u64);
            entry
        };

        if mode == MaterializationMode::Eager {
            if let Err(e) = entry.relation.ensure_materialized() {
                self.remove_entry(&entry);
                let _ = entry.relation.release(false);
                return Err(e);
            }
        }
        info!(
            "cached query{} at {} ({:?})",
            entry
                .table_name
                .as_deref()
                .map(|n| format!(" for table '{}'", n))
                .unwrap_or_default(),
            level,
            mode
        );
        Ok(entry)
    }

    /// Stop tracking `plan` and release its relation.
    ///
    /// A miss is an error at this layer; callers that tolerate one use
    /// [`try_uncache_query`](Self::try_uncache_query).
    pub fn uncache_query(&self, plan: &Arc<LogicalPlan>, blocking: bool) -> Result<()> {
        let canonical = canonicalize(plan);
        let entry = {
            let mut entries = self.entries.write();
            let position = entries
                .iter()
                .position(|e| e.plan == canonical)
                .ok_or_else(|| CacheError::NotCached("no cache entry matches the plan".to_string()))?;
            let entry = entries.remove(position);
            self.stats.set_entry_count(entries.len() as u64);
            entry
        };
        entry.relation.release(blocking)?;
        info!("uncached query (blocking={})", blocking);
        Ok(())
    }

    /// Like [`uncache_query`](Self::uncache_query), but a miss is a silent
    /// no-op. Returns whether an entry was removed.
    pub fn try_uncache_query(&self, plan: &Arc<LogicalPlan>, blocking: bool) -> Result<bool> {
        match self.uncache_query(plan, blocking) {
            Ok(()) => Ok(true),
            Err(CacheError::NotCached(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The entry matching `plan`'s canonical form, if tracked. Never
    /// mutates registry state.
    pub fn lookup_cached_data(&self, plan: &Arc<LogicalPlan>) -> Option<Arc<CacheEntry>> {
        let canonical = canonicalize(plan);
        let found = self.find_canonical(&canonical);
        if found.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        found
    }

    /// Release every tracked entry (blocking) and empty the registry.
    /// Afterwards no size accumulators remain registered.
    pub fn clear_cache(&self) -> Result<()> {
        let drained: Vec<Arc<CacheEntry>> = {
            let mut entries = self.entries.write();
            let drained = std::mem::take(&mut *entries);
            self.stats.set_entry_count(0);
            drained
        };
        info!("clearing cache ({} entries)", drained.len());
        let mut first_error = None;
        for entry in drained {
            if let Err(e) = entry.relation.release(true) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Substitute columnar scans for every tracked sub-plan of `plan`,
    /// then push enclosing projections and filters into the new scans.
    ///
    /// Matching is exact-sub-plan only: a node is replaced when its
    /// canonical form equals a tracked entry's, largest subtree first.
    pub fn rewrite_plan(&self, plan: &Arc<LogicalPlan>) -> Arc<LogicalPlan> {
        let rewritten = self.rewrite_node(plan);
        pushdown::apply(&rewritten)
    }

    fn rewrite_node(&self, plan: &Arc<LogicalPlan>) -> Arc<LogicalPlan> {
        if !matches!(plan.as_ref(), LogicalPlan::SourceScan { .. }) {
            let canonical = canonicalize(plan);
            if let Some(entry) = self.find_canonical(&canonical) {
                debug!("substituting columnar scan for a tracked sub-plan");
                let scan = ColumnarScan::new(entry.relation.clone());
                return LogicalPlan::source_scan(Arc::new(scan));
            }
        }
        match plan.as_ref() {
            LogicalPlan::Projection {
                input,
                exprs,
                schema,
            } => Arc::new(LogicalPlan::Projection {
                input: self.rewrite_node(input),
                exprs: exprs.clone(),
                schema: schema.clone(),
            }),
            LogicalPlan::Filter { input, predicate } => Arc::new(LogicalPlan::Filter {
                input: self.rewrite_node(input),
                predicate: predicate.clone(),
            }),
            LogicalPlan::Aggregate {
                input,
                group_exprs,
                aggr_exprs,
                schema,
            } => Arc::new(LogicalPlan::Aggregate {
                input: self.rewrite_node(input),
                group_exprs: group_exprs.clone(),
                aggr_exprs: aggr_exprs.clone(),
                schema: schema.clone(),
            }),
            LogicalPlan::Sort {
                input,
                exprs,
                ascending,
            } => Arc::new(LogicalPlan::Sort {
                input: self.rewrite_node(input),
                exprs: exprs.clone(),
                ascending: ascending.clone(),
            }),
            LogicalPlan::Limit { input, skip, fetch } => Arc::new(LogicalPlan::Limit {
                input: self.rewrite_node(input),
                skip: *skip,
                fetch: *fetch,
            }),
            LogicalPlan::SubqueryAlias { input, alias } => Arc::new(LogicalPlan::SubqueryAlias {
                input: self.rewrite_node(input),
                alias: alias.clone(),
            }),
            LogicalPlan::TableScan { .. }
            | LogicalPlan::EmptyRelation { .. }
            | LogicalPlan::SourceScan { .. } => plan.clone(),
        }
    }

    fn find_canonical(&self, canonical: &Arc<LogicalPlan>) -> Option<Arc<CacheEntry>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.plan == *canonical)
            .cloned()
    }

    fn remove_entry(&self, entry: &Arc<CacheEntry>) {
        let mut entries = self.entries.write();
        entries.retain(|e| !Arc::ptr_eq(e, entry));
        self.stats.set_entry_count(entries.len() as u64);
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("entries", &self.len())
            .field("live_accumulators", &self.registry.live_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array};
    use arrow::record_batch::RecordBatch;
    use relcache_core::{DataType, Field, ScalarValue, Schema};
    use relcache_exec::MemoryEngine;
    use relcache_plan::{BinaryOp, LogicalExpr};
    use relcache_store::{InMemoryBlockStore, StoreConfig};
    use std::thread;
    use tempfile::TempDir;

    fn data_schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ])
    }

    fn batch(range: std::ops::Range<i64>) -> RecordBatch {
        let ids: Vec<i64> = range.collect();
        let names: Vec<Option<String>> =
            ids.iter().map(|i| Some(format!("n{}", i))).collect();
        RecordBatch::try_new(
            Arc::new(data_schema().to_arrow()),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(arrow::array::StringArray::from_iter(names)),
            ],
        )
        .unwrap()
    }

    struct Fixture {
        manager: Arc<CacheManager>,
        engine: Arc<MemoryEngine>,
        _spill: TempDir,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(MemoryEngine::new());
        engine.register_table(
            "data",
            data_schema(),
            vec![vec![batch(0..50)], vec![batch(50..100)]],
        );
        let spill = TempDir::new().unwrap();
        let store = Arc::new(
            InMemoryBlockStore::new(StoreConfig::default().with_spill_dir(spill.path())).unwrap(),
        );
        let manager = Arc::new(CacheManager::new(
            engine.clone(),
            store,
            CacheConfig::default().with_rows_per_block(20),
        ));
        Fixture {
            manager,
            engine,
            _spill: spill,
        }
    }

    fn scan_data() -> Arc<LogicalPlan> {
        LogicalPlan::table_scan("data", data_schema())
    }

    fn filter_gt(plan: Arc<LogicalPlan>, value: i64) -> Arc<LogicalPlan> {
        LogicalPlan::filter(
            plan,
            LogicalExpr::binary(
                LogicalExpr::col("id", 0),
                BinaryOp::Gt,
                LogicalExpr::lit(ScalarValue::Int64(Some(value))),
            ),
        )
    }

    #[test]
    fn test_cache_query_is_idempotent() {
        let fixture = fixture();
        let level = StorageLevel::MEMORY_ONLY;
        let first = fixture
            .manager
            .cache_query(&scan_data(), None, level, MaterializationMode::Lazy)
            .unwrap();
        let aliased = LogicalPlan::alias(scan_data(), "view");
        let second = fixture
            .manager
            .cache_query(&aliased, None, level, MaterializationMode::Eager)
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fixture.manager.len(), 1);
        // The existing lazy entry is returned untouched.
        assert!(!second.relation().is_materialized());
    }

    #[test]
    fn test_eager_materializes_before_returning() {
        let fixture = fixture();
        let entry = fixture
            .manager
            .cache_query(
                &scan_data(),
                None,
                StorageLevel::MEMORY_ONLY,
                MaterializationMode::Eager,
            )
            .unwrap();
        assert!(entry.relation().is_materialized());
        assert_eq!(entry.relation().stats().unwrap().row_count, 100);
    }

    #[test]
    fn test_eager_failure_leaves_registry_unchanged() {
        let fixture = fixture();
        let missing = LogicalPlan::table_scan("missing", data_schema());
        let result = fixture.manager.cache_query(
            &missing,
            None,
            StorageLevel::MEMORY_ONLY,
            MaterializationMode::Eager,
        );
        assert!(matches!(result, Err(CacheError::Materialization(_))));
        assert!(fixture.manager.is_empty());
        assert_eq!(fixture.manager.accumulator_registry().live_count(), 0);
    }

    #[test]
    fn test_uncache_strict_vs_lenient() {
        let fixture = fixture();
        let plan = scan_data();
        assert!(matches!(
            fixture.manager.uncache_query(&plan, true),
            Err(CacheError::NotCached(_))
        ));
        assert!(!fixture.manager.try_uncache_query(&plan, true).unwrap());

        fixture
            .manager
            .cache_query(&plan, None, StorageLevel::MEMORY_ONLY, MaterializationMode::Lazy)
            .unwrap();
        assert!(fixture.manager.try_uncache_query(&plan, true).unwrap());
        assert!(fixture.manager.is_empty());
    }

    #[test]
    fn test_uncache_leaves_no_materialized_blocks() {
        let fixture = fixture();
        let plan = scan_data();
        let entry = fixture
            .manager
            .cache_query(
                &plan,
                None,
                StorageLevel::MEMORY_AND_DISK,
                MaterializationMode::Eager,
            )
            .unwrap();
        let blocks = entry.relation().block_ids().unwrap();
        let store = entry.relation().store().clone();
        assert!(blocks.iter().all(|id| store.is_materialized(id)));

        fixture.manager.uncache_query(&plan, true).unwrap();
        assert!(fixture.manager.lookup_cached_data(&plan).is_none());
        assert!(blocks.iter().all(|id| !store.is_materialized(id)));
    }

    #[test]
    fn test_clear_cache_releases_every_accumulator() {
        let fixture = fixture();
        for value in [10, 20, 30] {
            fixture
                .manager
                .cache_query(
                    &filter_gt(scan_data(), value),
                    None,
                    StorageLevel::MEMORY_ONLY,
                    MaterializationMode::Eager,
                )
                .unwrap();
        }
        assert_eq!(fixture.manager.len(), 3);
        assert_eq!(fixture.manager.accumulator_registry().live_count(), 3);

        fixture.manager.clear_cache().unwrap();
        assert!(fixture.manager.is_empty());
        assert_eq!(fixture.manager.accumulator_registry().live_count(), 0);
    }

    #[test]
    fn test_lookup_records_stats() {
        let fixture = fixture();
        let plan = scan_data();
        assert!(fixture.manager.lookup_cached_data(&plan).is_none());
        fixture
            .manager
            .cache_query(&plan, None, StorageLevel::MEMORY_ONLY, MaterializationMode::Lazy)
            .unwrap();
        assert!(fixture.manager.lookup_cached_data(&plan).is_some());

        let stats = fixture.manager.stats();
        assert_eq!(stats.misses(), 1);
        assert_eq!(stats.hits(), 1);
        assert_eq!(stats.entry_count(), 1);
    }

    #[test]
    fn test_rewrite_substitutes_matching_subplan() {
        let fixture = fixture();
        fixture
            .manager
            .cache_query(
                &scan_data(),
                None,
                StorageLevel::MEMORY_ONLY,
                MaterializationMode::Eager,
            )
            .unwrap();

        let rewritten = fixture.manager.rewrite_plan(&scan_data());
        assert!(matches!(
            rewritten.as_ref(),
            LogicalPlan::SourceScan { .. }
        ));

        // An enclosing filter is kept, and its comparison reaches the scan
        // as a pruning predicate.
        let rewritten = fixture.manager.rewrite_plan(&filter_gt(scan_data(), 80));
        match rewritten.as_ref() {
            LogicalPlan::Filter { input, .. } => match input.as_ref() {
                LogicalPlan::SourceScan { source, .. } => {
                    let scan = source
                        .as_any()
                        .downcast_ref::<relcache_exec::ColumnarScan>()
                        .unwrap();
                    assert_eq!(scan.predicates().len(), 1);
                }
                other => panic!("expected source scan, got {:?}", other),
            },
            other => panic!("expected filter, got {:?}", other),
        }
    }

    #[test]
    fn test_rewrite_pushes_projection_into_scan() {
        let fixture = fixture();
        fixture
            .manager
            .cache_query(
                &scan_data(),
                None,
                StorageLevel::MEMORY_ONLY,
                MaterializationMode::Eager,
            )
            .unwrap();

        let projected_schema = Schema::new(vec![Field::new("name", DataType::Utf8, true)]);
        let plan = LogicalPlan::projection(
            scan_data(),
            vec![LogicalExpr::col("name", 1)],
            projected_schema,
        );
        let rewritten = fixture.manager.rewrite_plan(&plan);
        match rewritten.as_ref() {
            LogicalPlan::Projection { input, exprs, .. } => {
                match input.as_ref() {
                    LogicalPlan::SourceScan { source, .. } => {
                        let scan = source
                            .as_any()
                            .downcast_ref::<relcache_exec::ColumnarScan>()
                            .unwrap();
                        assert_eq!(scan.projection(), Some(&[1usize][..]));
                    }
                    other => panic!("expected source scan, got {:?}", other),
                }
                // Column index remapped into the projected schema.
                assert!(matches!(
                    exprs[0],
                    LogicalExpr::Column { index: 0, .. }
                ));
            }
            other => panic!("expected projection, got {:?}", other),
        }

        // The rewritten plan still runs and produces the projected rows.
        let batches = fixture.engine.execute(&rewritten).unwrap();
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 100);
        assert_eq!(batches[0].num_columns(), 1);
    }

    #[test]
    fn test_rewrite_requires_exact_subplan_match() {
        let fixture = fixture();
        // Cache the filtered plan, then submit the bare scan: no match.
        fixture
            .manager
            .cache_query(
                &filter_gt(scan_data(), 10),
                None,
                StorageLevel::MEMORY_ONLY,
                MaterializationMode::Lazy,
            )
            .unwrap();
        let rewritten = fixture.manager.rewrite_plan(&scan_data());
        assert!(matches!(rewritten.as_ref(), LogicalPlan::TableScan { .. }));

        // A different filter constant is a different plan.
        let rewritten = fixture.manager.rewrite_plan(&filter_gt(scan_data(), 11));
        assert!(matches!(rewritten.as_ref(), LogicalPlan::Filter { .. }));
        let inner = match rewritten.as_ref() {
            LogicalPlan::Filter { input, .. } => input.clone(),
            _ => unreachable!(),
        };
        assert!(matches!(inner.as_ref(), LogicalPlan::TableScan { .. }));
    }

    #[test]
    fn test_concurrent_cache_of_same_plan_creates_one_entry() {
        let fixture = fixture();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = fixture.manager.clone();
                thread::spawn(move || {
                    manager
                        .cache_query(
                            &scan_data(),
                            None,
                            StorageLevel::MEMORY_ONLY,
                            MaterializationMode::Eager,
                        )
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(fixture.manager.len(), 1);
        assert_eq!(fixture.manager.accumulator_registry().live_count(), 1);
    }

    #[test]
    fn test_cached_reads_match_direct_execution() {
        let fixture = fixture();
        let query = filter_gt(scan_data(), 42);
        let baseline = fixture.engine.execute(&query).unwrap();

        fixture
            .manager
            .cache_query(
                &scan_data(),
                None,
                StorageLevel::MEMORY_AND_DISK_SER,
                MaterializationMode::Eager,
            )
            .unwrap();
        let rewritten = fixture.manager.rewrite_plan(&query);
        let cached = fixture.engine.execute(&rewritten).unwrap();

        let flatten = |batches: &[RecordBatch]| -> Vec<i64> {
            batches
                .iter()
                .flat_map(|b| {
                    let col = b.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
                    (0..col.len()).map(|i| col.value(i)).collect::<Vec<_>>()
                })
                .collect()
        };
        assert_eq!(flatten(&baseline), flatten(&cached));
    }
}
