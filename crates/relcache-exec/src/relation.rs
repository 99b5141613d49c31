//! Cached relations and their materialization lifecycle.
//!
//! A relation moves `Unmaterialized -> Materializing -> Materialized` and
//! finally `Released`. Materialization runs the child plan once, fanning
//! out across partitions; every other caller waits on the in-flight run
//! and observes its outcome. Release evicts the relation's blocks and
//! drops its size accumulator registration.

use crate::accumulator::{AccumulatorRegistry, SizeAccumulator};
use crate::engine::ExecutionEngine;
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use relcache_columnar::{BlockBuilder, BlockId, ColumnarBlock, EncoderOptions, RelationId};
use relcache_core::{CacheError, Result, Schema};
use relcache_plan::LogicalPlan;
use relcache_store::{BlockStore, StorageLevel};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Whether caching materializes at registration time or on first read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializationMode {
    Eager,
    Lazy,
}

/// Aggregate statistics, finalized at the `Materialized` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationStats {
    pub size_in_bytes: u64,
    pub row_count: u64,
}

enum MaterializationState {
    Unmaterialized,
    Materializing,
    Materialized {
        blocks: Vec<BlockId>,
        stats: RelationStats,
    },
    Released,
}

/// Tuning shared by every relation a cache manager creates.
#[derive(Debug, Clone)]
pub struct RelationConfig {
    pub rows_per_block: usize,
    pub encoder: EncoderOptions,
    /// Bound on the wait for confirmed eviction during a blocking release.
    pub eviction_wait: Duration,
    pub eviction_retry: Duration,
}

impl Default for RelationConfig {
    fn default() -> Self {
        Self {
            rows_per_block: 10_000,
            encoder: EncoderOptions::default(),
            eviction_wait: Duration::from_secs(5),
            eviction_retry: Duration::from_millis(10),
        }
    }
}

pub struct CachedRelation {
    id: RelationId,
    schema: Schema,
    child: Arc<LogicalPlan>,
    level: StorageLevel,
    mode: MaterializationMode,
    config: RelationConfig,
    engine: Arc<dyn ExecutionEngine>,
    store: Arc<dyn BlockStore>,
    registry: Arc<AccumulatorRegistry>,
    accumulator: SizeAccumulator,
    state: Mutex<MaterializationState>,
    state_changed: Condvar,
}

impl CachedRelation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: RelationId,
        child: Arc<LogicalPlan>,
        level: StorageLevel,
        mode: MaterializationMode,
        config: RelationConfig,
        engine: Arc<dyn ExecutionEngine>,
        store: Arc<dyn BlockStore>,
        registry: Arc<AccumulatorRegistry>,
    ) -> Self {
        let schema = child.schema().clone();
        let accumulator = registry.register();
        Self {
            id,
            schema,
            child,
            level,
            mode,
            config,
            engine,
            store,
            registry,
            accumulator,
            state: Mutex::new(MaterializationState::Unmaterialized),
            state_changed: Condvar::new(),
        }
    }

    pub fn id(&self) -> RelationId {
        self.id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn child_plan(&self) -> &Arc<LogicalPlan> {
        &self.child
    }

    pub fn storage_level(&self) -> StorageLevel {
        self.level
    }

    pub fn mode(&self) -> MaterializationMode {
        self.mode
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Bytes stored so far, live even while materialization is running.
    pub fn cached_bytes(&self) -> u64 {
        self.accumulator.value()
    }

    pub fn is_materialized(&self) -> bool {
        matches!(&*self.state.lock(), MaterializationState::Materialized { .. })
    }

    pub fn is_released(&self) -> bool {
        matches!(&*self.state.lock(), MaterializationState::Released)
    }

    /// `None` until materialization completes.
    pub fn stats(&self) -> Option<RelationStats> {
        match &*self.state.lock() {
            MaterializationState::Materialized { stats, .. } => Some(*stats),
            _ => None,
        }
    }

    pub fn block_ids(&self) -> Option<Vec<BlockId>> {
        match &*self.state.lock() {
            MaterializationState::Materialized { blocks, .. } => Some(blocks.clone()),
            _ => None,
        }
    }

    /// Return the relation's block ids, materializing first if needed.
    ///
    /// At most one caller runs the child plan; concurrent callers block
    /// until the in-flight materialization settles and then observe its
    /// result.
    pub fn ensure_materialized(&self) -> Result<Vec<BlockId>> {
        {
            let mut state = self.state.lock();
            loop {
                match &*state {
                    MaterializationState::Materialized { blocks, .. } => {
                        return Ok(blocks.clone())
                    }
                    MaterializationState::Released => {
                        return Err(CacheError::BlockUnavailable(format!(
                            "relation {} was released",
                            self.id
                        )))
                    }
                    MaterializationState::Materializing => {
                        self.state_changed.wait(&mut state);
                    }
                    MaterializationState::Unmaterialized => break,
                }
            }
            *state = MaterializationState::Materializing;
        }

        info!("materializing relation {} at {}", self.id, self.level);
        let started = Instant::now();
        let outcome = self.materialize_all();

        let mut state = self.state.lock();
        match outcome {
            Ok((blocks, stats)) => {
                if matches!(&*state, MaterializationState::Released) {
                    drop(state);
                    for id in &blocks {
                        let _ = self.store.evict(id, false);
                    }
                    return Err(CacheError::BlockUnavailable(format!(
                        "relation {} was released during materialization",
                        self.id
                    )));
                }
                info!(
                    "materialized relation {}: {} rows, {} bytes in {} blocks ({:?})",
                    self.id,
                    stats.row_count,
                    stats.size_in_bytes,
                    blocks.len(),
                    started.elapsed()
                );
                *state = MaterializationState::Materialized {
                    blocks: blocks.clone(),
                    stats,
                };
                self.state_changed.notify_all();
                Ok(blocks)
            }
            Err(e) => {
                if !matches!(&*state, MaterializationState::Released) {
                    *state = MaterializationState::Unmaterialized;
                }
                self.state_changed.notify_all();
                Err(e)
            }
        }
    }

    fn materialize_all(&self) -> Result<(Vec<BlockId>, RelationStats)> {
        let partitions = self.engine.output_partitions(&self.child);
        // Partitions are disjoint; each task encodes and stores its own
        // blocks with no shared mutable state beyond the size counter.
        let per_partition: Vec<Vec<(BlockId, u64, u64)>> = (0..partitions)
            .into_par_iter()
            .map(|partition| self.materialize_partition(partition))
            .collect::<Result<Vec<_>>>()?;

        let mut blocks = Vec::new();
        let mut stats = RelationStats {
            size_in_bytes: 0,
            row_count: 0,
        };
        for partition_blocks in per_partition {
            for (id, bytes, rows) in partition_blocks {
                blocks.push(id);
                stats.size_in_bytes += bytes;
                stats.row_count += rows;
            }
        }
        Ok((blocks, stats))
    }

    fn materialize_partition(&self, partition: usize) -> Result<Vec<(BlockId, u64, u64)>> {
        let batches = self
            .engine
            .execute_partition(&self.child, partition)
            .map_err(|e| CacheError::Materialization(e.to_string()))?;
        let mut builder = BlockBuilder::new(
            self.id,
            partition,
            self.schema.clone(),
            self.config.rows_per_block,
            self.config.encoder.clone(),
        );
        let mut out = Vec::new();
        for batch in batches {
            for block in builder.push(batch)? {
                out.push(self.store_block(block)?);
            }
        }
        if let Some(block) = builder.finish()? {
            out.push(self.store_block(block)?);
        }
        debug!(
            "relation {} partition {}: stored {} blocks",
            self.id,
            partition,
            out.len()
        );
        Ok(out)
    }

    fn store_block(&self, block: ColumnarBlock) -> Result<(BlockId, u64, u64)> {
        let id = block.id;
        let bytes = block.size_in_bytes() as u64;
        let rows = block.row_count as u64;
        self.store.put(Arc::new(block), self.level)?;
        self.accumulator.add(bytes);
        Ok((id, bytes, rows))
    }

    /// Transition to `Released`: evict every block and unregister the size
    /// accumulator. With `blocking`, wait until the store confirms removal
    /// of every block, failing with `EvictionTimeout` past the bound.
    pub fn release(&self, blocking: bool) -> Result<()> {
        let blocks = {
            let mut state = self.state.lock();
            let blocks = match &*state {
                MaterializationState::Materialized { blocks, .. } => blocks.clone(),
                _ => Vec::new(),
            };
            *state = MaterializationState::Released;
            self.state_changed.notify_all();
            blocks
        };
        self.registry.unregister(&self.accumulator);

        for id in &blocks {
            self.store.evict(id, blocking)?;
        }
        if blocking && !blocks.is_empty() {
            let deadline = Instant::now() + self.config.eviction_wait;
            loop {
                let remaining = blocks
                    .iter()
                    .filter(|id| self.store.is_materialized(id))
                    .count();
                if remaining == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(CacheError::EvictionTimeout {
                        waited_ms: self.config.eviction_wait.as_millis() as u64,
                        remaining,
                    });
                }
                std::thread::sleep(self.config.eviction_retry);
            }
        }
        info!("released relation {} ({} blocks)", self.id, blocks.len());
        Ok(())
    }
}

impl fmt::Debug for CachedRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            MaterializationState::Unmaterialized => "unmaterialized",
            MaterializationState::Materializing => "materializing",
            MaterializationState::Materialized { .. } => "materialized",
            MaterializationState::Released => "released",
        };
        f.debug_struct("CachedRelation")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("mode", &self.mode)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use relcache_core::{DataType, Field};
    use relcache_store::{InMemoryBlockStore, StoreConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::TempDir;

    fn test_schema() -> Schema {
        Schema::new(vec![Field::new("id", DataType::Int64, false)])
    }

    fn batch(range: std::ops::Range<i64>) -> RecordBatch {
        RecordBatch::try_new(
            Arc::new(test_schema().to_arrow()),
            vec![Arc::new(Int64Array::from(range.collect::<Vec<_>>()))],
        )
        .unwrap()
    }

    #[derive(Debug)]
    struct CountingEngine {
        inner: MemoryEngine,
        executions: AtomicUsize,
    }

    impl CountingEngine {
        fn executions(&self) -> usize {
            self.executions.load(Ordering::SeqCst)
        }
    }

    impl ExecutionEngine for CountingEngine {
        fn output_partitions(&self, plan: &LogicalPlan) -> usize {
            self.inner.output_partitions(plan)
        }

        fn execute_partition(
            &self,
            plan: &LogicalPlan,
            partition: usize,
        ) -> Result<Vec<RecordBatch>> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.inner.execute_partition(plan, partition)
        }
    }

    struct Fixture {
        relation: Arc<CachedRelation>,
        engine: Arc<CountingEngine>,
        store: Arc<InMemoryBlockStore>,
        registry: Arc<AccumulatorRegistry>,
        _spill: TempDir,
    }

    fn fixture(register_table: bool) -> Fixture {
        let inner = MemoryEngine::new();
        if register_table {
            // Two partitions of 60 rows, 25 rows per block: 3 blocks each.
            inner.register_table(
                "t",
                test_schema(),
                vec![vec![batch(0..60)], vec![batch(60..120)]],
            );
        }
        let engine = Arc::new(CountingEngine {
            inner,
            executions: AtomicUsize::new(0),
        });
        let spill = TempDir::new().unwrap();
        let store = Arc::new(
            InMemoryBlockStore::new(StoreConfig::default().with_spill_dir(spill.path())).unwrap(),
        );
        let registry = Arc::new(AccumulatorRegistry::new());
        let relation = Arc::new(CachedRelation::new(
            RelationId(9),
            LogicalPlan::table_scan("t", test_schema()),
            StorageLevel::MEMORY_AND_DISK,
            MaterializationMode::Lazy,
            RelationConfig {
                rows_per_block: 25,
                ..Default::default()
            },
            engine.clone(),
            store.clone(),
            registry.clone(),
        ));
        Fixture {
            relation,
            engine,
            store,
            registry,
            _spill: spill,
        }
    }

    #[test]
    fn test_materialization_finalizes_stats() {
        let fixture = fixture(true);
        assert!(!fixture.relation.is_materialized());
        assert_eq!(fixture.relation.stats(), None);

        let blocks = fixture.relation.ensure_materialized().unwrap();
        assert_eq!(blocks.len(), 6);
        let stats = fixture.relation.stats().unwrap();
        assert_eq!(stats.row_count, 120);
        assert!(stats.size_in_bytes > 0);
        assert_eq!(fixture.relation.cached_bytes(), stats.size_in_bytes);
        for id in &blocks {
            assert!(fixture.store.is_materialized(id));
        }
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let fixture = fixture(true);
        let first = fixture.relation.ensure_materialized().unwrap();
        let second = fixture.relation.ensure_materialized().unwrap();
        assert_eq!(first, second);
        // One execution per partition, not per caller.
        assert_eq!(fixture.engine.executions(), 2);
    }

    #[test]
    fn test_concurrent_callers_share_one_materialization() {
        let fixture = fixture(true);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let relation = fixture.relation.clone();
                thread::spawn(move || relation.ensure_materialized().unwrap().len())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 6);
        }
        assert_eq!(fixture.engine.executions(), 2);
    }

    #[test]
    fn test_release_evicts_blocks_and_accumulator() {
        let fixture = fixture(true);
        let blocks = fixture.relation.ensure_materialized().unwrap();
        assert_eq!(fixture.registry.live_count(), 1);

        fixture.relation.release(true).unwrap();
        assert!(fixture.relation.is_released());
        assert_eq!(fixture.registry.live_count(), 0);
        for id in &blocks {
            assert!(!fixture.store.is_materialized(id));
        }
        assert!(fixture.relation.ensure_materialized().is_err());
    }

    #[test]
    fn test_release_before_materialization_is_clean() {
        let fixture = fixture(true);
        fixture.relation.release(true).unwrap();
        assert_eq!(fixture.registry.live_count(), 0);
        assert!(fixture.relation.ensure_materialized().is_err());
    }

    #[test]
    fn test_blocking_release_times_out_on_stuck_eviction() {
        #[derive(Debug, Default)]
        struct StuckStore {
            blocks: parking_lot::Mutex<std::collections::HashMap<BlockId, Arc<ColumnarBlock>>>,
        }

        impl relcache_store::BlockStore for StuckStore {
            fn put(
                &self,
                block: Arc<ColumnarBlock>,
                _level: StorageLevel,
            ) -> Result<()> {
                self.blocks.lock().insert(block.id, block);
                Ok(())
            }

            fn get(&self, id: &BlockId) -> Result<Option<Arc<ColumnarBlock>>> {
                Ok(self.blocks.lock().get(id).cloned())
            }

            // Accepts the request but never removes anything.
            fn evict(&self, _id: &BlockId, _blocking: bool) -> Result<()> {
                Ok(())
            }

            fn is_materialized(&self, id: &BlockId) -> bool {
                self.blocks.lock().contains_key(id)
            }
        }

        let inner = MemoryEngine::new();
        inner.register_table("t", test_schema(), vec![vec![batch(0..10)]]);
        let relation = Arc::new(CachedRelation::new(
            RelationId(1),
            LogicalPlan::table_scan("t", test_schema()),
            StorageLevel::MEMORY_ONLY,
            MaterializationMode::Lazy,
            RelationConfig {
                eviction_wait: Duration::from_millis(50),
                eviction_retry: Duration::from_millis(5),
                ..Default::default()
            },
            Arc::new(inner),
            Arc::new(StuckStore::default()),
            Arc::new(AccumulatorRegistry::new()),
        ));
        relation.ensure_materialized().unwrap();

        match relation.release(true) {
            Err(CacheError::EvictionTimeout { remaining, .. }) => assert!(remaining > 0),
            other => panic!("expected eviction timeout, got {:?}", other),
        }
        // Best-effort cleanup already happened; the relation stays released.
        assert!(relation.is_released());
    }

    #[test]
    fn test_failed_materialization_resets_state() {
        let fixture = fixture(false);
        match fixture.relation.ensure_materialized() {
            Err(CacheError::Materialization(_)) => {}
            other => panic!("expected materialization error, got {:?}", other),
        }
        assert!(!fixture.relation.is_materialized());
        assert!(!fixture.relation.is_released());

        // The relation recovers once the input exists.
        fixture
            .engine
            .inner
            .register_table("t", test_schema(), vec![vec![batch(0..10)]]);
        let blocks = fixture.relation.ensure_materialized().unwrap();
        assert_eq!(blocks.len(), 1);
    }
}
