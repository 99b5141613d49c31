//! Execution engine seam and the reference in-memory engine.
//!
//! The cache only needs two things from an engine: how many partitions a
//! plan produces, and the row batches of one partition. `MemoryEngine`
//! implements enough of the plan language over registered, pre-partitioned
//! tables to exercise materialization and cached reads end to end.

use crate::eval::{evaluate_aggregate, evaluate_expr, scalars_to_batch};
use arrow::array::ArrayRef;
use arrow::compute::{concat_batches, lexsort_to_indices, take, SortColumn, SortOptions};
use arrow::record_batch::RecordBatch;
use parking_lot::RwLock;
use relcache_core::{CacheError, Result, Schema};
use relcache_plan::LogicalPlan;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Runs plans and yields row batches per partition.
///
/// Partitions are disjoint: callers may execute them concurrently with no
/// coordination beyond the partition index.
pub trait ExecutionEngine: Send + Sync + fmt::Debug {
    fn output_partitions(&self, plan: &LogicalPlan) -> usize;

    fn execute_partition(&self, plan: &LogicalPlan, partition: usize) -> Result<Vec<RecordBatch>>;

    /// Convenience: every partition, concatenated in partition order.
    fn execute(&self, plan: &LogicalPlan) -> Result<Vec<RecordBatch>> {
        let mut batches = Vec::new();
        for partition in 0..self.output_partitions(plan) {
            batches.extend(self.execute_partition(plan, partition)?);
        }
        Ok(batches)
    }
}

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: Schema,
    partitions: Vec<Vec<RecordBatch>>,
}

/// Reference engine over named in-memory tables.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    tables: RwLock<HashMap<String, MemoryTable>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table with explicit partitioning.
    pub fn register_table(
        &self,
        name: impl Into<String>,
        schema: Schema,
        partitions: Vec<Vec<RecordBatch>>,
    ) {
        self.tables
            .write()
            .insert(name.into(), MemoryTable { schema, partitions });
    }

    /// Register a table holding all batches in one partition.
    pub fn register_single_partition(
        &self,
        name: impl Into<String>,
        schema: Schema,
        batches: Vec<RecordBatch>,
    ) {
        self.register_table(name, schema, vec![batches]);
    }

    pub fn deregister_table(&self, name: &str) {
        self.tables.write().remove(name);
    }

    pub fn table_schema(&self, name: &str) -> Option<Schema> {
        self.tables.read().get(name).map(|t| t.schema.clone())
    }

    fn scan_partition(&self, name: &str, partition: usize) -> Result<Vec<RecordBatch>> {
        let tables = self.tables.read();
        let table = tables
            .get(name)
            .ok_or_else(|| CacheError::TableNotFound(name.to_string()))?;
        table
            .partitions
            .get(partition)
            .cloned()
            .ok_or_else(|| {
                CacheError::Execution(format!(
                    "table {} has no partition {}",
                    name, partition
                ))
            })
    }
}

impl ExecutionEngine for MemoryEngine {
    fn output_partitions(&self, plan: &LogicalPlan) -> usize {
        match plan {
            LogicalPlan::TableScan { table_name, .. } => self
                .tables
                .read()
                .get(table_name)
                .map(|t| t.partitions.len().max(1))
                .unwrap_or(1),
            LogicalPlan::Projection { input, .. }
            | LogicalPlan::Filter { input, .. }
            | LogicalPlan::SubqueryAlias { input, .. } => self.output_partitions(input),
            // Global operators collapse to a single output partition.
            LogicalPlan::Aggregate { .. } | LogicalPlan::Sort { .. } | LogicalPlan::Limit { .. } => 1,
            LogicalPlan::EmptyRelation { .. } | LogicalPlan::SourceScan { .. } => 1,
        }
    }

    fn execute_partition(&self, plan: &LogicalPlan, partition: usize) -> Result<Vec<RecordBatch>> {
        match plan {
            LogicalPlan::TableScan { table_name, .. } => {
                self.scan_partition(table_name, partition)
            }
            LogicalPlan::Projection {
                input,
                exprs,
                schema,
            } => {
                let out_schema = Arc::new(schema.to_arrow());
                let mut out = Vec::new();
                for batch in self.execute_partition(input, partition)? {
                    let arrays = exprs
                        .iter()
                        .map(|e| evaluate_expr(e, &batch))
                        .collect::<Result<Vec<ArrayRef>>>()?;
                    out.push(RecordBatch::try_new(out_schema.clone(), arrays)?);
                }
                Ok(out)
            }
            LogicalPlan::Filter { input, predicate } => {
                let mut out = Vec::new();
                for batch in self.execute_partition(input, partition)? {
                    let mask = evaluate_expr(predicate, &batch)?;
                    let mask = mask
                        .as_any()
                        .downcast_ref::<arrow::array::BooleanArray>()
                        .ok_or_else(|| {
                            CacheError::Execution(
                                "filter predicate must evaluate to booleans".to_string(),
                            )
                        })?
                        .clone();
                    let filtered =
                        arrow::compute::kernels::filter::filter_record_batch(&batch, &mask)?;
                    if filtered.num_rows() > 0 {
                        out.push(filtered);
                    }
                }
                Ok(out)
            }
            LogicalPlan::Aggregate {
                input,
                group_exprs,
                aggr_exprs,
                schema,
            } => {
                require_single_partition(partition)?;
                if !group_exprs.is_empty() {
                    return Err(CacheError::Execution(
                        "grouped aggregation is not supported by the reference engine".to_string(),
                    ));
                }
                let input_schema = Arc::new(input.schema().to_arrow());
                let mut batches = self.execute(input)?;
                if batches.is_empty() {
                    batches.push(RecordBatch::new_empty(input_schema.clone()));
                }
                let combined = concat_batches(&input_schema, batches.iter())?;
                let values = aggr_exprs
                    .iter()
                    .map(|aggr| {
                        let column = evaluate_expr(&aggr.expr, &combined)?;
                        evaluate_aggregate(aggr.func, &column)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(vec![scalars_to_batch(schema, &values)?])
            }
            LogicalPlan::Sort {
                input,
                exprs,
                ascending,
            } => {
                require_single_partition(partition)?;
                let input_schema = Arc::new(input.schema().to_arrow());
                let batches = self.execute(input)?;
                if batches.is_empty() {
                    return Ok(vec![]);
                }
                let combined = concat_batches(&input_schema, batches.iter())?;
                let sort_columns = exprs
                    .iter()
                    .zip(ascending.iter())
                    .map(|(expr, asc)| {
                        Ok(SortColumn {
                            values: evaluate_expr(expr, &combined)?,
                            options: Some(SortOptions {
                                descending: !asc,
                                nulls_first: true,
                            }),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let indices = lexsort_to_indices(&sort_columns, None)?;
                let columns = combined
                    .columns()
                    .iter()
                    .map(|c| take(c.as_ref(), &indices, None).map_err(CacheError::from))
                    .collect::<Result<Vec<_>>>()?;
                Ok(vec![RecordBatch::try_new(input_schema, columns)?])
            }
            LogicalPlan::Limit { input, skip, fetch } => {
                require_single_partition(partition)?;
                let batches = self.execute(input)?;
                let mut out = Vec::new();
                let mut to_skip = *skip;
                let mut remaining = fetch.unwrap_or(usize::MAX);
                for batch in batches {
                    if remaining == 0 {
                        break;
                    }
                    let rows = batch.num_rows();
                    if to_skip >= rows {
                        to_skip -= rows;
                        continue;
                    }
                    let offset = to_skip;
                    to_skip = 0;
                    let len = (rows - offset).min(remaining);
                    remaining -= len;
                    out.push(batch.slice(offset, len));
                }
                Ok(out)
            }
            LogicalPlan::EmptyRelation { .. } => Ok(vec![]),
            LogicalPlan::SubqueryAlias { input, .. } => self.execute_partition(input, partition),
            LogicalPlan::SourceScan { source, .. } => {
                require_single_partition(partition)?;
                source.scan()
            }
        }
    }
}

fn require_single_partition(partition: usize) -> Result<()> {
    if partition != 0 {
        return Err(CacheError::Execution(format!(
            "single-partition operator asked for partition {}",
            partition
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use relcache_core::{DataType, Field, ScalarValue};
    use relcache_plan::{AggregateExpr, AggregateFunction, BinaryOp, LogicalExpr};

    fn test_schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ])
    }

    fn batch(ids: Vec<i64>) -> RecordBatch {
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

    fn engine() -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine.register_table(
            "t",
            test_schema(),
            vec![vec![batch(vec![1, 2, 3])], vec![batch(vec![4, 5, 6])]],
        );
        engine
    }

    fn total_rows(batches: &[RecordBatch]) -> usize {
        batches.iter().map(|b| b.num_rows()).sum()
    }

    #[test]
    fn test_partitioned_scan() {
        let engine = engine();
        let plan = LogicalPlan::table_scan("t", test_schema());
        assert_eq!(engine.output_partitions(&plan), 2);
        assert_eq!(total_rows(&engine.execute(&plan).unwrap()), 6);
        assert_eq!(
            total_rows(&engine.execute_partition(&plan, 1).unwrap()),
            3
        );
    }

    #[test]
    fn test_missing_table() {
        let engine = engine();
        let plan = LogicalPlan::table_scan("missing", test_schema());
        assert!(engine.execute(&plan).is_err());
    }

    #[test]
    fn test_filter_preserves_partitioning() {
        let engine = engine();
        let plan = LogicalPlan::filter(
            LogicalPlan::table_scan("t", test_schema()),
            LogicalExpr::binary(
                LogicalExpr::col("id", 0),
                BinaryOp::Gt,
                LogicalExpr::lit(ScalarValue::Int64(Some(4))),
            ),
        );
        assert_eq!(engine.output_partitions(&plan), 2);
        assert_eq!(total_rows(&engine.execute(&plan).unwrap()), 2);
    }

    #[test]
    fn test_projection() {
        let engine = engine();
        let out_schema = Schema::new(vec![Field::new("id", DataType::Int64, false)]);
        let plan = LogicalPlan::projection(
            LogicalPlan::table_scan("t", test_schema()),
            vec![LogicalExpr::col("id", 0)],
            out_schema,
        );
        let batches = engine.execute(&plan).unwrap();
        assert_eq!(total_rows(&batches), 6);
        assert_eq!(batches[0].num_columns(), 1);
    }

    #[test]
    fn test_global_aggregate() {
        let engine = engine();
        let out_schema = Schema::new(vec![
            Field::new("count", DataType::Int64, true),
            Field::new("sum", DataType::Int64, true),
        ]);
        let plan = LogicalPlan::aggregate(
            LogicalPlan::table_scan("t", test_schema()),
            vec![],
            vec![
                AggregateExpr {
                    func: AggregateFunction::Count,
                    expr: LogicalExpr::col("id", 0),
                },
                AggregateExpr {
                    func: AggregateFunction::Sum,
                    expr: LogicalExpr::col("id", 0),
                },
            ],
            out_schema,
        );
        assert_eq!(engine.output_partitions(&plan), 1);
        let batches = engine.execute(&plan).unwrap();
        assert_eq!(batches.len(), 1);
        let counts = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        let sums = batches[0]
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(counts.value(0), 6);
        assert_eq!(sums.value(0), 21);
    }

    #[test]
    fn test_sort_and_limit() {
        let engine = engine();
        let sorted = Arc::new(LogicalPlan::Sort {
            input: LogicalPlan::table_scan("t", test_schema()),
            exprs: vec![LogicalExpr::col("id", 0)],
            ascending: vec![false],
        });
        let plan = LogicalPlan::limit(sorted, 1, Some(2));
        let batches = engine.execute(&plan).unwrap();
        assert_eq!(total_rows(&batches), 2);
        let ids = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(ids.value(0), 5);
        assert_eq!(ids.value(1), 4);
    }
}
