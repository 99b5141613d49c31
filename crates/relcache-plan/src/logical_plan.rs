use crate::source::RelationSource;
use relcache_core::{ScalarValue, Schema};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum LogicalPlan {
    TableScan {
        table_name: String,
        schema: Schema,
    },
    Projection {
        input: Arc<LogicalPlan>,
        exprs: Vec<LogicalExpr>,
        schema: Schema,
    },
    Filter {
        input: Arc<LogicalPlan>,
        predicate: LogicalExpr,
    },
    Aggregate {
        input: Arc<LogicalPlan>,
        group_exprs: Vec<LogicalExpr>,
        aggr_exprs: Vec<AggregateExpr>,
        schema: Schema,
    },
    Sort {
        input: Arc<LogicalPlan>,
        exprs: Vec<LogicalExpr>,
        ascending: Vec<bool>,
    },
    Limit {
        input: Arc<LogicalPlan>,
        skip: usize,
        fetch: Option<usize>,
    },
    EmptyRelation {
        schema: Schema,
    },
    /// A named wrapper around a sub-plan; stripped during canonicalization.
    SubqueryAlias {
        input: Arc<LogicalPlan>,
        alias: String,
    },
    /// A resolved data source installed by plan rewriting. Never produced
    /// by planning; compares by source identity.
    SourceScan {
        source: Arc<dyn RelationSource>,
        schema: Schema,
    },
}

impl LogicalPlan {
    pub fn schema(&self) -> &Schema {
        match self {
            LogicalPlan::TableScan { schema, .. } => schema,
            LogicalPlan::Projection { schema, .. } => schema,
            LogicalPlan::Filter { input, .. } => input.schema(),
            LogicalPlan::Aggregate { schema, .. } => schema,
            LogicalPlan::Sort { input, .. } => input.schema(),
            LogicalPlan::Limit { input, .. } => input.schema(),
            LogicalPlan::EmptyRelation { schema } => schema,
            LogicalPlan::SubqueryAlias { input, .. } => input.schema(),
            LogicalPlan::SourceScan { schema, .. } => schema,
        }
    }

    pub fn inputs(&self) -> Vec<&Arc<LogicalPlan>> {
        match self {
            LogicalPlan::Projection { input, .. }
            | LogicalPlan::Filter { input, .. }
            | LogicalPlan::Aggregate { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. }
            | LogicalPlan::SubqueryAlias { input, .. } => vec![input],
            LogicalPlan::TableScan { .. }
            | LogicalPlan::EmptyRelation { .. }
            | LogicalPlan::SourceScan { .. } => vec![],
        }
    }

    /// True if any leaf of the tree scans `table_name`.
    pub fn references_table(&self, table_name: &str) -> bool {
        match self {
            LogicalPlan::TableScan { table_name: t, .. } => t == table_name,
            other => other
                .inputs()
                .iter()
                .any(|input| input.references_table(table_name)),
        }
    }

    // Construction helpers, used by tests and demos in place of a planner.

    pub fn table_scan(table_name: impl Into<String>, schema: Schema) -> Arc<LogicalPlan> {
        Arc::new(LogicalPlan::TableScan {
            table_name: table_name.into(),
            schema,
        })
    }

    pub fn filter(input: Arc<LogicalPlan>, predicate: LogicalExpr) -> Arc<LogicalPlan> {
        Arc::new(LogicalPlan::Filter { input, predicate })
    }

    pub fn projection(
        input: Arc<LogicalPlan>,
        exprs: Vec<LogicalExpr>,
        schema: Schema,
    ) -> Arc<LogicalPlan> {
        Arc::new(LogicalPlan::Projection {
            input,
            exprs,
            schema,
        })
    }

    pub fn aggregate(
        input: Arc<LogicalPlan>,
        group_exprs: Vec<LogicalExpr>,
        aggr_exprs: Vec<AggregateExpr>,
        schema: Schema,
    ) -> Arc<LogicalPlan> {
        Arc::new(LogicalPlan::Aggregate {
            input,
            group_exprs,
            aggr_exprs,
            schema,
        })
    }

    pub fn limit(input: Arc<LogicalPlan>, skip: usize, fetch: Option<usize>) -> Arc<LogicalPlan> {
        Arc::new(LogicalPlan::Limit { input, skip, fetch })
    }

    pub fn alias(input: Arc<LogicalPlan>, alias: impl Into<String>) -> Arc<LogicalPlan> {
        Arc::new(LogicalPlan::SubqueryAlias {
            input,
            alias: alias.into(),
        })
    }

    pub fn source_scan(source: Arc<dyn RelationSource>) -> Arc<LogicalPlan> {
        let schema = source.schema().clone();
        Arc::new(LogicalPlan::SourceScan { source, schema })
    }
}

impl PartialEq for LogicalPlan {
    fn eq(&self, other: &Self) -> bool {
        use LogicalPlan::*;
        match (self, other) {
            (
                TableScan {
                    table_name: a,
                    schema: sa,
                },
                TableScan {
                    table_name: b,
                    schema: sb,
                },
            ) => a == b && sa == sb,
            (
                Projection {
                    input: ia,
                    exprs: ea,
                    schema: sa,
                },
                Projection {
                    input: ib,
                    exprs: eb,
                    schema: sb,
                },
            ) => ia == ib && ea == eb && sa == sb,
            (
                Filter {
                    input: ia,
                    predicate: pa,
                },
                Filter {
                    input: ib,
                    predicate: pb,
                },
            ) => ia == ib && pa == pb,
            (
                Aggregate {
                    input: ia,
                    group_exprs: ga,
                    aggr_exprs: aa,
                    schema: sa,
                },
                Aggregate {
                    input: ib,
                    group_exprs: gb,
                    aggr_exprs: ab,
                    schema: sb,
                },
            ) => ia == ib && ga == gb && aa == ab && sa == sb,
            (
                Sort {
                    input: ia,
                    exprs: ea,
                    ascending: aa,
                },
                Sort {
                    input: ib,
                    exprs: eb,
                    ascending: ab,
                },
            ) => ia == ib && ea == eb && aa == ab,
            (
                Limit {
                    input: ia,
                    skip: ka,
                    fetch: fa,
                },
                Limit {
                    input: ib,
                    skip: kb,
                    fetch: fb,
                },
            ) => ia == ib && ka == kb && fa == fb,
            (EmptyRelation { schema: a }, EmptyRelation { schema: b }) => a == b,
            (
                SubqueryAlias {
                    input: ia,
                    alias: aa,
                },
                SubqueryAlias {
                    input: ib,
                    alias: ab,
                },
            ) => ia == ib && aa == ab,
            (SourceScan { source: a, .. }, SourceScan { source: b, .. }) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for LogicalPlan {}

#[derive(Debug, Clone, PartialEq)]
pub enum LogicalExpr {
    Column { name: String, index: usize },
    Literal(ScalarValue),
    BinaryExpr {
        left: Box<LogicalExpr>,
        op: BinaryOp,
        right: Box<LogicalExpr>,
    },
    UnaryExpr {
        op: UnaryOp,
        expr: Box<LogicalExpr>,
    },
    Alias {
        expr: Box<LogicalExpr>,
        alias: String,
    },
}

impl LogicalExpr {
    pub fn col(name: impl Into<String>, index: usize) -> LogicalExpr {
        LogicalExpr::Column {
            name: name.into(),
            index,
        }
    }

    pub fn lit(value: ScalarValue) -> LogicalExpr {
        LogicalExpr::Literal(value)
    }

    pub fn binary(left: LogicalExpr, op: BinaryOp, right: LogicalExpr) -> LogicalExpr {
        LogicalExpr::BinaryExpr {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Column indices referenced anywhere in this expression.
    pub fn column_indices(&self, out: &mut Vec<usize>) {
        match self {
            LogicalExpr::Column { index, .. } => out.push(*index),
            LogicalExpr::Literal(_) => {}
            LogicalExpr::BinaryExpr { left, right, .. } => {
                left.column_indices(out);
                right.column_indices(out);
            }
            LogicalExpr::UnaryExpr { expr, .. } => expr.column_indices(out),
            LogicalExpr::Alias { expr, .. } => expr.column_indices(out),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    /// Operand order does not change the result.
    pub fn is_commutative(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Multiply
                | BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::And
                | BinaryOp::Or
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Minus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub func: AggregateFunction,
    pub expr: LogicalExpr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}
