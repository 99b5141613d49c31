//! Temp-table catalog: name-to-plan bindings for the session facade.

use parking_lot::RwLock;
use relcache_plan::LogicalPlan;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps temp-table names to the logical plans that define them.
#[derive(Debug, Default)]
pub struct TempCatalog {
    tables: RwLock<HashMap<String, Arc<LogicalPlan>>>,
}

impl TempCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a named plan.
    pub fn register(&self, name: impl Into<String>, plan: Arc<LogicalPlan>) {
        self.tables.write().insert(name.into(), plan);
    }

    pub fn plan(&self, name: &str) -> Option<Arc<LogicalPlan>> {
        self.tables.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    /// Remove a binding, returning its plan.
    pub fn drop_table(&self, name: &str) -> Option<Arc<LogicalPlan>> {
        self.tables.write().remove(name)
    }

    /// Registered tables whose plans scan `name` somewhere in their tree.
    pub fn dependents_of(&self, name: &str) -> Vec<(String, Arc<LogicalPlan>)> {
        self.tables
            .read()
            .iter()
            .filter(|(table, plan)| table.as_str() != name && plan.references_table(name))
            .map(|(table, plan)| (table.clone(), plan.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}
