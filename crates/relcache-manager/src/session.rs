//! Caller-facing facade: named temp tables over the cache manager.
//!
//! `CacheSession` owns the manager, a temp-table catalog, and the engine
//! reference, and exposes the surface the SQL/API layer maps onto:
//! `cache_table`/`uncache_table`/`is_cached`/`clear_cache` plus the
//! programmatic `cache`/`persist`/`unpersist`. Every submitted plan is
//! rewritten through the manager before execution, so reads of cached
//! data are transparent.

use crate::catalog::TempCatalog;
use crate::config::CacheConfig;
use crate::manager::{CacheEntry, CacheManager};
use arrow::record_batch::RecordBatch;
use relcache_core::{CacheError, Result};
use relcache_exec::{ExecutionEngine, MaterializationMode};
use relcache_plan::LogicalPlan;
use relcache_store::{BlockStore, StorageLevel};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

pub struct CacheSession {
    engine: Arc<dyn ExecutionEngine>,
    manager: Arc<CacheManager>,
    catalog: TempCatalog,
}

impl CacheSession {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        store: Arc<dyn BlockStore>,
        config: CacheConfig,
    ) -> Self {
        let manager = Arc::new(CacheManager::new(engine.clone(), store, config));
        Self {
            engine,
            manager,
            catalog: TempCatalog::new(),
        }
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub fn catalog(&self) -> &TempCatalog {
        &self.catalog
    }

    /// Bind `name` to a plan. Plans may reference other temp tables by
    /// name; references are expanded when the plan is used.
    pub fn register_temp_table(&self, name: impl Into<String>, plan: Arc<LogicalPlan>) {
        self.catalog.register(name, plan);
    }

    /// Drop a temp table, releasing its cache entry and the entries of
    /// every registered plan that references it. The dependents stay
    /// registered; only their cached data is released.
    pub fn drop_temp_table(&self, name: &str) -> Result<()> {
        let plan = self
            .catalog
            .plan(name)
            .ok_or_else(|| CacheError::TableNotFound(name.to_string()))?;
        let resolved = self.resolve(&plan);
        let dependents: Vec<Arc<LogicalPlan>> = self
            .catalog
            .dependents_of(name)
            .iter()
            .map(|(_, dependent)| self.resolve(dependent))
            .collect();
        self.catalog.drop_table(name);

        self.manager.try_uncache_query(&resolved, true)?;
        for dependent in dependents {
            self.manager.try_uncache_query(&dependent, true)?;
        }
        info!("dropped temp table '{}'", name);
        Ok(())
    }

    /// `CACHE TABLE name`: eager, default storage level.
    pub fn cache_table(&self, name: &str) -> Result<Arc<CacheEntry>> {
        self.cache_table_with(
            name,
            self.manager.config().default_storage_level,
            MaterializationMode::Eager,
        )
    }

    /// `CACHE LAZY TABLE name`.
    pub fn cache_table_lazy(&self, name: &str) -> Result<Arc<CacheEntry>> {
        self.cache_table_with(
            name,
            self.manager.config().default_storage_level,
            MaterializationMode::Lazy,
        )
    }

    pub fn cache_table_with(
        &self,
        name: &str,
        level: StorageLevel,
        mode: MaterializationMode,
    ) -> Result<Arc<CacheEntry>> {
        let plan = self
            .catalog
            .plan(name)
            .ok_or_else(|| CacheError::TableNotFound(name.to_string()))?;
        let resolved = self.resolve(&plan);
        self.manager
            .cache_query(&resolved, Some(name.to_string()), level, mode)
    }

    /// `UNCACHE TABLE name`: uncaching a table that is not cached is an
    /// explicit error, never a silent success.
    pub fn uncache_table(&self, name: &str) -> Result<()> {
        let plan = self.catalog.plan(name).ok_or_else(|| {
            CacheError::NotCached(format!("table '{}' is not cached", name))
        })?;
        self.manager.uncache_query(&self.resolve(&plan), true)
    }

    pub fn is_cached(&self, name: &str) -> bool {
        match self.catalog.plan(name) {
            Some(plan) => self
                .manager
                .lookup_cached_data(&self.resolve(&plan))
                .is_some(),
            None => false,
        }
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.manager.clear_cache()
    }

    /// Programmatic `cache()`: lazy, default level, unnamed.
    pub fn cache(&self, plan: &Arc<LogicalPlan>) -> Result<Arc<CacheEntry>> {
        self.persist(plan, self.manager.config().default_storage_level)
    }

    /// Programmatic `persist(level)`: lazy under the chosen level.
    pub fn persist(&self, plan: &Arc<LogicalPlan>, level: StorageLevel) -> Result<Arc<CacheEntry>> {
        self.manager
            .cache_query(&self.resolve(plan), None, level, MaterializationMode::Lazy)
    }

    /// Programmatic `unpersist(blocking)`: tolerant of a cache miss.
    pub fn unpersist(&self, plan: &Arc<LogicalPlan>, blocking: bool) -> Result<bool> {
        self.manager
            .try_uncache_query(&self.resolve(plan), blocking)
    }

    /// Rewrite through the cache and run the plan.
    pub fn execute(&self, plan: &Arc<LogicalPlan>) -> Result<Vec<RecordBatch>> {
        let resolved = self.resolve(plan);
        let rewritten = self.manager.rewrite_plan(&resolved);
        self.engine.execute(&rewritten)
    }

    /// Expand temp-table references into the plans they name.
    fn resolve(&self, plan: &Arc<LogicalPlan>) -> Arc<LogicalPlan> {
        let mut expanding = HashSet::new();
        self.resolve_inner(plan, &mut expanding)
    }

    fn resolve_inner(
        &self,
        plan: &Arc<LogicalPlan>,
        expanding: &mut HashSet<String>,
    ) -> Arc<LogicalPlan> {
        match plan.as_ref() {
            LogicalPlan::TableScan { table_name, .. } => {
                if expanding.contains(table_name) {
                    return plan.clone();
                }
                match self.catalog.plan(table_name) {
                    Some(target) if !scans_itself(&target, table_name) => {
                        expanding.insert(table_name.clone());
                        let resolved = self.resolve_inner(&target, expanding);
                        expanding.remove(table_name);
                        resolved
                    }
                    _ => plan.clone(),
                }
            }
            LogicalPlan::Projection {
                input,
                exprs,
                schema,
            } => Arc::new(LogicalPlan::Projection {
                input: self.resolve_inner(input, expanding),
                exprs: exprs.clone(),
                schema: schema.clone(),
            }),
            LogicalPlan::Filter { input, predicate } => Arc::new(LogicalPlan::Filter {
                input: self.resolve_inner(input, expanding),
                predicate: predicate.clone(),
            }),
            LogicalPlan::Aggregate {
                input,
                group_exprs,
                aggr_exprs,
                schema,
            } => Arc::new(LogicalPlan::Aggregate {
                input: self.resolve_inner(input, expanding),
                group_exprs: group_exprs.clone(),
                aggr_exprs: aggr_exprs.clone(),
                schema: schema.clone(),
            }),
            LogicalPlan::Sort {
                input,
                exprs,
                ascending,
            } => Arc::new(LogicalPlan::Sort {
                input: self.resolve_inner(input, expanding),
                exprs: exprs.clone(),
                ascending: ascending.clone(),
            }),
            LogicalPlan::Limit { input, skip, fetch } => Arc::new(LogicalPlan::Limit {
                input: self.resolve_inner(input, expanding),
                skip: *skip,
                fetch: *fetch,
            }),
            LogicalPlan::SubqueryAlias { input, alias } => Arc::new(LogicalPlan::SubqueryAlias {
                input: self.resolve_inner(input, expanding),
                alias: alias.clone(),
            }),
            LogicalPlan::EmptyRelation { .. } | LogicalPlan::SourceScan { .. } => plan.clone(),
        }
    }
}

/// A binding that merely scans an engine table of its own name is
/// terminal, not a reference to itself.
fn scans_itself(plan: &Arc<LogicalPlan>, name: &str) -> bool {
    matches!(plan.as_ref(), LogicalPlan::TableScan { table_name, .. } if table_name == name)
}

impl std::fmt::Debug for CacheSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSession")
            .field("manager", &self.manager)
            .field("temp_tables", &self.catalog.len())
            .finish()
    }
}
