//! Projection and filter pushdown into freshly substituted columnar
//! scans.
//!
//! Pushdown narrows what a scan fetches and decodes; it never changes
//! plan semantics. Enclosing `Filter` and `Projection` nodes stay in
//! place: pruning is block granular and row-level filtering remains the
//! plan's job. Pruning predicates always index the relation schema, so
//! they stay valid regardless of the scan's output projection.

use relcache_exec::{ColumnarScan, CompareOp, PruningPredicate};
use relcache_plan::{BinaryOp, LogicalExpr, LogicalPlan};
use std::collections::HashMap;
use std::sync::Arc;

/// Apply pushdown to every scan-adjacent `Filter`/`Projection` pattern.
pub fn apply(plan: &Arc<LogicalPlan>) -> Arc<LogicalPlan> {
    match plan.as_ref() {
        LogicalPlan::Filter { input, predicate } => {
            let input = apply(input);
            if let Some(scan) = open_scan(&input) {
                let pruning = extract_pruning(predicate);
                if !pruning.is_empty() {
                    let mut predicates = scan.predicates().to_vec();
                    predicates.extend(pruning);
                    let pushed =
                        ColumnarScan::new(scan.relation().clone()).with_predicates(predicates);
                    return Arc::new(LogicalPlan::Filter {
                        input: LogicalPlan::source_scan(Arc::new(pushed)),
                        predicate: predicate.clone(),
                    });
                }
            }
            Arc::new(LogicalPlan::Filter {
                input,
                predicate: predicate.clone(),
            })
        }
        LogicalPlan::Projection {
            input,
            exprs,
            schema,
        } => {
            let input = apply(input);
            if let Some(scan) = open_scan(&input) {
                if let Some((pushed, map)) = project_scan(scan, exprs, None) {
                    let exprs = exprs.iter().map(|e| remap_expr(e, &map)).collect();
                    return Arc::new(LogicalPlan::Projection {
                        input: LogicalPlan::source_scan(Arc::new(pushed)),
                        exprs,
                        schema: schema.clone(),
                    });
                }
            }
            if let LogicalPlan::Filter {
                input: filter_input,
                predicate,
            } = input.as_ref()
            {
                if let Some(scan) = open_scan(filter_input) {
                    if let Some((pushed, map)) = project_scan(scan, exprs, Some(predicate)) {
                        let filter = Arc::new(LogicalPlan::Filter {
                            input: LogicalPlan::source_scan(Arc::new(pushed)),
                            predicate: remap_expr(predicate, &map),
                        });
                        let exprs = exprs.iter().map(|e| remap_expr(e, &map)).collect();
                        return Arc::new(LogicalPlan::Projection {
                            input: filter,
                            exprs,
                            schema: schema.clone(),
                        });
                    }
                }
            }
            Arc::new(LogicalPlan::Projection {
                input,
                exprs: exprs.clone(),
                schema: schema.clone(),
            })
        }
        LogicalPlan::Aggregate {
            input,
            group_exprs,
            aggr_exprs,
            schema,
        } => Arc::new(LogicalPlan::Aggregate {
            input: apply(input),
            group_exprs: group_exprs.clone(),
            aggr_exprs: aggr_exprs.clone(),
            schema: schema.clone(),
        }),
        LogicalPlan::Sort {
            input,
            exprs,
            ascending,
        } => Arc::new(LogicalPlan::Sort {
            input: apply(input),
            exprs: exprs.clone(),
            ascending: ascending.clone(),
        }),
        LogicalPlan::Limit { input, skip, fetch } => Arc::new(LogicalPlan::Limit {
            input: apply(input),
            skip: *skip,
            fetch: *fetch,
        }),
        LogicalPlan::SubqueryAlias { input, alias } => Arc::new(LogicalPlan::SubqueryAlias {
            input: apply(input),
            alias: alias.clone(),
        }),
        LogicalPlan::TableScan { .. }
        | LogicalPlan::EmptyRelation { .. }
        | LogicalPlan::SourceScan { .. } => plan.clone(),
    }
}

/// The concrete columnar scan behind a `SourceScan`, if it is still
/// unprojected (projection pushdown must see original column indices).
fn open_scan(plan: &Arc<LogicalPlan>) -> Option<&ColumnarScan> {
    if let LogicalPlan::SourceScan { source, .. } = plan.as_ref() {
        source
            .as_any()
            .downcast_ref::<ColumnarScan>()
            .filter(|scan| scan.projection().is_none())
    } else {
        None
    }
}

/// Build a projected copy of `scan` covering exactly the columns the
/// projection (and optional filter predicate) reference, plus the mapping
/// from relation column index to projected position.
fn project_scan(
    scan: &ColumnarScan,
    exprs: &[LogicalExpr],
    predicate: Option<&LogicalExpr>,
) -> Option<(ColumnarScan, HashMap<usize, usize>)> {
    let mut needed = Vec::new();
    for expr in exprs {
        expr.column_indices(&mut needed);
    }
    if let Some(predicate) = predicate {
        predicate.column_indices(&mut needed);
    }
    needed.sort_unstable();
    needed.dedup();
    if needed.is_empty() || needed.len() == scan.relation().schema().len() {
        return None;
    }
    let map: HashMap<usize, usize> = needed
        .iter()
        .enumerate()
        .map(|(position, &index)| (index, position))
        .collect();
    let mut predicates = scan.predicates().to_vec();
    if let Some(predicate) = predicate {
        predicates.extend(extract_pruning(predicate));
    }
    let pushed = ColumnarScan::new(scan.relation().clone())
        .with_predicates(predicates)
        .with_projection(needed)
        .ok()?;
    Some((pushed, map))
}

fn remap_expr(expr: &LogicalExpr, map: &HashMap<usize, usize>) -> LogicalExpr {
    match expr {
        LogicalExpr::Column { name, index } => LogicalExpr::Column {
            name: name.clone(),
            index: *map.get(index).unwrap_or(index),
        },
        LogicalExpr::Literal(_) => expr.clone(),
        LogicalExpr::BinaryExpr { left, op, right } => LogicalExpr::BinaryExpr {
            left: Box::new(remap_expr(left, map)),
            op: *op,
            right: Box::new(remap_expr(right, map)),
        },
        LogicalExpr::UnaryExpr { op, expr } => LogicalExpr::UnaryExpr {
            op: *op,
            expr: Box::new(remap_expr(expr, map)),
        },
        LogicalExpr::Alias { expr, alias } => LogicalExpr::Alias {
            expr: Box::new(remap_expr(expr, map)),
            alias: alias.clone(),
        },
    }
}

/// Pruning predicates implied by `expr`: the column-versus-literal
/// comparisons of its conjuncts. Disjunctions and anything else are
/// ignored, which is always sound for block skipping.
pub fn extract_pruning(expr: &LogicalExpr) -> Vec<PruningPredicate> {
    let mut out = Vec::new();
    collect_pruning(expr, &mut out);
    out
}

fn collect_pruning(expr: &LogicalExpr, out: &mut Vec<PruningPredicate>) {
    match expr {
        LogicalExpr::Alias { expr, .. } => collect_pruning(expr, out),
        LogicalExpr::BinaryExpr { left, op, right } if *op == BinaryOp::And => {
            collect_pruning(left, out);
            collect_pruning(right, out);
        }
        LogicalExpr::BinaryExpr { left, op, right } => {
            let cmp = match compare_op(*op) {
                Some(cmp) => cmp,
                None => return,
            };
            match (unalias(left), unalias(right)) {
                (LogicalExpr::Column { index, .. }, LogicalExpr::Literal(value))
                    if !value.is_null() =>
                {
                    out.push(PruningPredicate {
                        column: *index,
                        op: cmp,
                        value: value.clone(),
                    });
                }
                (LogicalExpr::Literal(value), LogicalExpr::Column { index, .. })
                    if !value.is_null() =>
                {
                    out.push(PruningPredicate {
                        column: *index,
                        op: flip(cmp),
                        value: value.clone(),
                    });
                }
                _ => {}
            }
        }
        _ => {}
    }
}

fn unalias(expr: &LogicalExpr) -> &LogicalExpr {
    match expr {
        LogicalExpr::Alias { expr, .. } => unalias(expr),
        other => other,
    }
}

fn compare_op(op: BinaryOp) -> Option<CompareOp> {
    match op {
        BinaryOp::Eq => Some(CompareOp::Eq),
        BinaryOp::NotEq => Some(CompareOp::NotEq),
        BinaryOp::Lt => Some(CompareOp::Lt),
        BinaryOp::LtEq => Some(CompareOp::LtEq),
        BinaryOp::Gt => Some(CompareOp::Gt),
        BinaryOp::GtEq => Some(CompareOp::GtEq),
        _ => None,
    }
}

fn flip(op: CompareOp) -> CompareOp {
    match op {
        CompareOp::Lt => CompareOp::Gt,
        CompareOp::LtEq => CompareOp::GtEq,
        CompareOp::Gt => CompareOp::Lt,
        CompareOp::GtEq => CompareOp::LtEq,
        CompareOp::Eq | CompareOp::NotEq => op,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relcache_core::ScalarValue;

    fn col(index: usize) -> LogicalExpr {
        LogicalExpr::col(format!("c{}", index), index)
    }

    fn lit(v: i64) -> LogicalExpr {
        LogicalExpr::lit(ScalarValue::Int64(Some(v)))
    }

    #[test]
    fn test_extract_simple_comparison() {
        let preds = extract_pruning(&LogicalExpr::binary(col(0), BinaryOp::Gt, lit(5)));
        assert_eq!(
            preds,
            vec![PruningPredicate {
                column: 0,
                op: CompareOp::Gt,
                value: ScalarValue::Int64(Some(5)),
            }]
        );
    }

    #[test]
    fn test_extract_flips_reversed_operands() {
        let preds = extract_pruning(&LogicalExpr::binary(lit(5), BinaryOp::Lt, col(2)));
        assert_eq!(preds[0].column, 2);
        assert_eq!(preds[0].op, CompareOp::Gt);
    }

    #[test]
    fn test_extract_walks_conjunctions_only() {
        let conjunction = LogicalExpr::binary(
            LogicalExpr::binary(col(0), BinaryOp::GtEq, lit(1)),
            BinaryOp::And,
            LogicalExpr::binary(col(1), BinaryOp::Lt, lit(9)),
        );
        assert_eq!(extract_pruning(&conjunction).len(), 2);

        let disjunction = LogicalExpr::binary(
            LogicalExpr::binary(col(0), BinaryOp::Eq, lit(1)),
            BinaryOp::Or,
            LogicalExpr::binary(col(1), BinaryOp::Eq, lit(2)),
        );
        assert!(extract_pruning(&disjunction).is_empty());
    }

    #[test]
    fn test_column_to_column_is_ignored() {
        let preds = extract_pruning(&LogicalExpr::binary(col(0), BinaryOp::Eq, col(1)));
        assert!(preds.is_empty());
    }

    #[test]
    fn test_null_literals_are_ignored() {
        let preds = extract_pruning(&LogicalExpr::binary(
            col(0),
            BinaryOp::Eq,
            LogicalExpr::lit(ScalarValue::Int64(None)),
        ));
        assert!(preds.is_empty());
    }

    #[test]
    fn test_remap_expr() {
        let map: HashMap<usize, usize> = [(2, 0), (5, 1)].into_iter().collect();
        let expr = LogicalExpr::binary(col(5), BinaryOp::Add, col(2));
        match remap_expr(&expr, &map) {
            LogicalExpr::BinaryExpr { left, right, .. } => {
                assert!(matches!(*left, LogicalExpr::Column { index: 1, .. }));
                assert!(matches!(*right, LogicalExpr::Column { index: 0, .. }));
            }
            other => panic!("unexpected expr {:?}", other),
        }
    }
}
