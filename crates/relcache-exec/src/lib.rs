//! Materialization and scanning of cached relations.
//!
//! This crate owns the execution-facing half of the cache: the
//! [`ExecutionEngine`] seam (plus a reference in-memory engine), the
//! [`CachedRelation`] state machine that turns child-plan output into
//! stored columnar blocks, the [`ColumnarScan`] reader with block-level
//! pruning and column pruning, and the size-accumulator registry used for
//! leak-free resource accounting.

pub mod accumulator;
pub mod engine;
pub mod eval;
pub mod relation;
pub mod scan;

pub use accumulator::{AccumulatorRegistry, SizeAccumulator};
pub use engine::{ExecutionEngine, MemoryEngine};
pub use relation::{CachedRelation, MaterializationMode, RelationConfig, RelationStats};
pub use scan::{BlockIter, ColumnarScan, CompareOp, PruningPredicate, ScanMetrics};
