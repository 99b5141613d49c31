//! Plan canonicalization.
//!
//! Two plans are considered equivalent by the cache when their canonical
//! forms are structurally equal. Canonicalization strips alias wrappers
//! (both `SubqueryAlias` nodes and `Alias` expressions) and orders the
//! operands of commutative binary operators deterministically, so that
//! `a = 1 AND b = 2` and `b = 2 AND a = 1` key to the same entry.

use crate::logical_plan::{LogicalExpr, LogicalPlan};
use std::sync::Arc;

/// Rewrites `plan` into its canonical form. Pure; the input is untouched.
pub fn canonicalize(plan: &Arc<LogicalPlan>) -> Arc<LogicalPlan> {
    match plan.as_ref() {
        LogicalPlan::SubqueryAlias { input, .. } => canonicalize(input),
        LogicalPlan::Projection {
            input,
            exprs,
            schema,
        } => Arc::new(LogicalPlan::Projection {
            input: canonicalize(input),
            exprs: exprs.iter().map(canonicalize_expr).collect(),
            schema: schema.clone(),
        }),
        LogicalPlan::Filter { input, predicate } => Arc::new(LogicalPlan::Filter {
            input: canonicalize(input),
            predicate: canonicalize_expr(predicate),
        }),
        LogicalPlan::Aggregate {
            input,
            group_exprs,
            aggr_exprs,
            schema,
        } => Arc::new(LogicalPlan::Aggregate {
            input: canonicalize(input),
            group_exprs: group_exprs.iter().map(canonicalize_expr).collect(),
            aggr_exprs: aggr_exprs
                .iter()
                .map(|a| crate::logical_plan::AggregateExpr {
                    func: a.func,
                    expr: canonicalize_expr(&a.expr),
                })
                .collect(),
            schema: schema.clone(),
        }),
        LogicalPlan::Sort {
            input,
            exprs,
            ascending,
        } => Arc::new(LogicalPlan::Sort {
            input: canonicalize(input),
            exprs: exprs.iter().map(canonicalize_expr).collect(),
            ascending: ascending.clone(),
        }),
        LogicalPlan::Limit { input, skip, fetch } => Arc::new(LogicalPlan::Limit {
            input: canonicalize(input),
            skip: *skip,
            fetch: *fetch,
        }),
        LogicalPlan::TableScan { .. }
        | LogicalPlan::EmptyRelation { .. }
        | LogicalPlan::SourceScan { .. } => plan.clone(),
    }
}

/// True when the two plans are equivalent under canonicalization.
pub fn plans_match(a: &Arc<LogicalPlan>, b: &Arc<LogicalPlan>) -> bool {
    canonicalize(a) == canonicalize(b)
}

fn canonicalize_expr(expr: &LogicalExpr) -> LogicalExpr {
    match expr {
        LogicalExpr::Alias { expr, .. } => canonicalize_expr(expr),
        LogicalExpr::BinaryExpr { left, op, right } => {
            let mut left = canonicalize_expr(left);
            let mut right = canonicalize_expr(right);
            if op.is_commutative() && expr_sort_key(&right) < expr_sort_key(&left) {
                std::mem::swap(&mut left, &mut right);
            }
            LogicalExpr::BinaryExpr {
                left: Box::new(left),
                op: *op,
                right: Box::new(right),
            }
        }
        LogicalExpr::UnaryExpr { op, expr } => LogicalExpr::UnaryExpr {
            op: *op,
            expr: Box::new(canonicalize_expr(expr)),
        },
        LogicalExpr::Column { .. } | LogicalExpr::Literal(_) => expr.clone(),
    }
}

// The Debug rendering is a stable total order over expression trees, which
// is all operand normalization needs.
fn expr_sort_key(expr: &LogicalExpr) -> String {
    format!("{:?}", expr)
}
