//! Expression evaluation over Arrow record batches for the reference
//! engine.

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
};
use arrow::record_batch::RecordBatch;
use relcache_core::{CacheError, Result, ScalarValue};
use relcache_plan::{AggregateFunction, BinaryOp, LogicalExpr, UnaryOp};
use std::sync::Arc;

pub fn evaluate_expr(expr: &LogicalExpr, batch: &RecordBatch) -> Result<ArrayRef> {
    match expr {
        LogicalExpr::Column { index, name } => {
            if *index >= batch.num_columns() {
                return Err(CacheError::ColumnNotFound(format!(
                    "{} (index {})",
                    name, index
                )));
            }
            Ok(batch.column(*index).clone())
        }
        LogicalExpr::Literal(value) => literal_array(value, batch.num_rows()),
        LogicalExpr::BinaryExpr { left, op, right } => {
            let left = evaluate_expr(left, batch)?;
            let right = evaluate_expr(right, batch)?;
            evaluate_binary(&left, *op, &right)
        }
        LogicalExpr::UnaryExpr { op, expr } => {
            let array = evaluate_expr(expr, batch)?;
            evaluate_unary(&array, *op)
        }
        LogicalExpr::Alias { expr, .. } => evaluate_expr(expr, batch),
    }
}

fn literal_array(value: &ScalarValue, rows: usize) -> Result<ArrayRef> {
    Ok(match value {
        ScalarValue::Boolean(v) => Arc::new(BooleanArray::from(vec![*v; rows])) as ArrayRef,
        ScalarValue::Int32(v) => Arc::new(Int32Array::from(vec![*v; rows])) as ArrayRef,
        ScalarValue::Int64(v) => Arc::new(Int64Array::from(vec![*v; rows])) as ArrayRef,
        ScalarValue::Float64(v) => Arc::new(Float64Array::from(vec![*v; rows])) as ArrayRef,
        ScalarValue::Utf8(v) => {
            Arc::new(StringArray::from_iter(vec![v.clone(); rows])) as ArrayRef
        }
        ScalarValue::Null => {
            return Err(CacheError::Execution(
                "untyped null literal cannot be evaluated".to_string(),
            ))
        }
    })
}

fn evaluate_unary(array: &ArrayRef, op: UnaryOp) -> Result<ArrayRef> {
    match op {
        UnaryOp::Not => {
            let arr = as_bool(array)?;
            let result: BooleanArray = arr.iter().map(|v| v.map(|b| !b)).collect();
            Ok(Arc::new(result) as ArrayRef)
        }
        UnaryOp::Minus => {
            if let Some(arr) = array.as_any().downcast_ref::<Int64Array>() {
                let result: Int64Array = arr.iter().map(|v| v.map(|x| -x)).collect();
                Ok(Arc::new(result) as ArrayRef)
            } else if let Some(arr) = array.as_any().downcast_ref::<Int32Array>() {
                let result: Int32Array = arr.iter().map(|v| v.map(|x| -x)).collect();
                Ok(Arc::new(result) as ArrayRef)
            } else if let Some(arr) = array.as_any().downcast_ref::<Float64Array>() {
                let result: Float64Array = arr.iter().map(|v| v.map(|x| -x)).collect();
                Ok(Arc::new(result) as ArrayRef)
            } else {
                Err(CacheError::Execution(
                    "unsupported type for negation".to_string(),
                ))
            }
        }
    }
}

fn evaluate_binary(left: &ArrayRef, op: BinaryOp, right: &ArrayRef) -> Result<ArrayRef> {
    use BinaryOp::*;
    match op {
        Add | Subtract | Multiply | Divide | Modulo => arithmetic(left, op, right),
        Eq | NotEq | Lt | LtEq | Gt | GtEq => Ok(Arc::new(compare(left, op, right)?) as ArrayRef),
        And => {
            let (l, r) = (as_bool(left)?, as_bool(right)?);
            let result: BooleanArray = l
                .iter()
                .zip(r.iter())
                .map(|(a, b)| match (a, b) {
                    (Some(a), Some(b)) => Some(a && b),
                    _ => None,
                })
                .collect();
            Ok(Arc::new(result) as ArrayRef)
        }
        Or => {
            let (l, r) = (as_bool(left)?, as_bool(right)?);
            let result: BooleanArray = l
                .iter()
                .zip(r.iter())
                .map(|(a, b)| match (a, b) {
                    (Some(a), Some(b)) => Some(a || b),
                    _ => None,
                })
                .collect();
            Ok(Arc::new(result) as ArrayRef)
        }
    }
}

fn arithmetic(left: &ArrayRef, op: BinaryOp, right: &ArrayRef) -> Result<ArrayRef> {
    if let (Some(l), Some(r)) = (
        left.as_any().downcast_ref::<Int64Array>(),
        right.as_any().downcast_ref::<Int64Array>(),
    ) {
        let result: Int64Array = l
            .iter()
            .zip(r.iter())
            .map(|(a, b)| int_arith(a, op, b))
            .collect();
        return Ok(Arc::new(result) as ArrayRef);
    }
    if let (Some(l), Some(r)) = (
        left.as_any().downcast_ref::<Int32Array>(),
        right.as_any().downcast_ref::<Int32Array>(),
    ) {
        let result: Int32Array = l
            .iter()
            .zip(r.iter())
            .map(|(a, b)| int32_arith(a, op, b))
            .collect();
        return Ok(Arc::new(result) as ArrayRef);
    }
    if let (Some(l), Some(r)) = (
        left.as_any().downcast_ref::<Float64Array>(),
        right.as_any().downcast_ref::<Float64Array>(),
    ) {
        let result: Float64Array = l
            .iter()
            .zip(r.iter())
            .map(|(a, b)| float_arith(a, op, b))
            .collect();
        return Ok(Arc::new(result) as ArrayRef);
    }
    Err(CacheError::Execution(format!(
        "unsupported operand types for {:?}",
        op
    )))
}

fn int_arith(a: Option<i64>, op: BinaryOp, b: Option<i64>) -> Option<i64> {
    let (a, b) = (a?, b?);
    match op {
        BinaryOp::Add => Some(a.wrapping_add(b)),
        BinaryOp::Subtract => Some(a.wrapping_sub(b)),
        BinaryOp::Multiply => Some(a.wrapping_mul(b)),
        BinaryOp::Divide if b != 0 => Some(a / b),
        BinaryOp::Modulo if b != 0 => Some(a % b),
        _ => None,
    }
}

fn int32_arith(a: Option<i32>, op: BinaryOp, b: Option<i32>) -> Option<i32> {
    let (a, b) = (a?, b?);
    match op {
        BinaryOp::Add => Some(a.wrapping_add(b)),
        BinaryOp::Subtract => Some(a.wrapping_sub(b)),
        BinaryOp::Multiply => Some(a.wrapping_mul(b)),
        BinaryOp::Divide if b != 0 => Some(a / b),
        BinaryOp::Modulo if b != 0 => Some(a % b),
        _ => None,
    }
}

fn float_arith(a: Option<f64>, op: BinaryOp, b: Option<f64>) -> Option<f64> {
    let (a, b) = (a?, b?);
    match op {
        BinaryOp::Add => Some(a + b),
        BinaryOp::Subtract => Some(a - b),
        BinaryOp::Multiply => Some(a * b),
        BinaryOp::Divide => Some(a / b),
        BinaryOp::Modulo => Some(a % b),
        _ => None,
    }
}

fn compare(left: &ArrayRef, op: BinaryOp, right: &ArrayRef) -> Result<BooleanArray> {
    if let (Some(l), Some(r)) = (
        left.as_any().downcast_ref::<Int64Array>(),
        right.as_any().downcast_ref::<Int64Array>(),
    ) {
        return Ok(cmp_iter(l.iter(), r.iter(), op));
    }
    if let (Some(l), Some(r)) = (
        left.as_any().downcast_ref::<Int32Array>(),
        right.as_any().downcast_ref::<Int32Array>(),
    ) {
        return Ok(cmp_iter(l.iter(), r.iter(), op));
    }
    if let (Some(l), Some(r)) = (
        left.as_any().downcast_ref::<Float64Array>(),
        right.as_any().downcast_ref::<Float64Array>(),
    ) {
        return Ok(cmp_iter(l.iter(), r.iter(), op));
    }
    if let (Some(l), Some(r)) = (
        left.as_any().downcast_ref::<StringArray>(),
        right.as_any().downcast_ref::<StringArray>(),
    ) {
        return Ok(cmp_iter(l.iter(), r.iter(), op));
    }
    if let (Some(l), Some(r)) = (
        left.as_any().downcast_ref::<BooleanArray>(),
        right.as_any().downcast_ref::<BooleanArray>(),
    ) {
        return Ok(cmp_iter(l.iter(), r.iter(), op));
    }
    Err(CacheError::Execution(format!(
        "unsupported operand types for {:?}",
        op
    )))
}

fn cmp_iter<T, L, R>(left: L, right: R, op: BinaryOp) -> BooleanArray
where
    T: PartialOrd,
    L: Iterator<Item = Option<T>>,
    R: Iterator<Item = Option<T>>,
{
    left.zip(right)
        .map(|(a, b)| match (a, b) {
            (Some(a), Some(b)) => Some(match op {
                BinaryOp::Eq => a == b,
                BinaryOp::NotEq => a != b,
                BinaryOp::Lt => a < b,
                BinaryOp::LtEq => a <= b,
                BinaryOp::Gt => a > b,
                BinaryOp::GtEq => a >= b,
                _ => false,
            }),
            _ => None,
        })
        .collect()
}

fn as_bool(array: &ArrayRef) -> Result<&BooleanArray> {
    array
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| CacheError::Execution("expected a boolean array".to_string()))
}

/// Evaluate one ungrouped aggregate over a fully evaluated input column.
pub fn evaluate_aggregate(func: AggregateFunction, array: &ArrayRef) -> Result<ScalarValue> {
    match func {
        AggregateFunction::Count => {
            let non_null = array.len() - array.null_count();
            Ok(ScalarValue::Int64(Some(non_null as i64)))
        }
        AggregateFunction::Sum => sum(array),
        AggregateFunction::Avg => {
            let count = (array.len() - array.null_count()) as f64;
            if count == 0.0 {
                return Ok(ScalarValue::Float64(None));
            }
            let total = match sum(array)? {
                ScalarValue::Int64(Some(v)) => v as f64,
                ScalarValue::Float64(Some(v)) => v,
                _ => return Ok(ScalarValue::Float64(None)),
            };
            Ok(ScalarValue::Float64(Some(total / count)))
        }
        AggregateFunction::Min => extremum(array, false),
        AggregateFunction::Max => extremum(array, true),
    }
}

fn sum(array: &ArrayRef) -> Result<ScalarValue> {
    if let Some(arr) = array.as_any().downcast_ref::<Int64Array>() {
        Ok(ScalarValue::Int64(fold_sum(arr.iter())))
    } else if let Some(arr) = array.as_any().downcast_ref::<Int32Array>() {
        Ok(ScalarValue::Int64(fold_sum(
            arr.iter().map(|v| v.map(i64::from)),
        )))
    } else if let Some(arr) = array.as_any().downcast_ref::<Float64Array>() {
        let mut total = None;
        for v in arr.iter().flatten() {
            total = Some(total.unwrap_or(0.0) + v);
        }
        Ok(ScalarValue::Float64(total))
    } else {
        Err(CacheError::Execution("unsupported type for SUM".to_string()))
    }
}

fn fold_sum(values: impl Iterator<Item = Option<i64>>) -> Option<i64> {
    let mut total: Option<i64> = None;
    for v in values.flatten() {
        total = Some(total.unwrap_or(0).wrapping_add(v));
    }
    total
}

fn extremum(array: &ArrayRef, want_max: bool) -> Result<ScalarValue> {
    fn pick<T: PartialOrd>(values: impl Iterator<Item = Option<T>>, want_max: bool) -> Option<T> {
        let mut best: Option<T> = None;
        for v in values.flatten() {
            best = match best {
                None => Some(v),
                Some(b) => {
                    if (want_max && v > b) || (!want_max && v < b) {
                        Some(v)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        best
    }

    if let Some(arr) = array.as_any().downcast_ref::<Int64Array>() {
        Ok(ScalarValue::Int64(pick(arr.iter(), want_max)))
    } else if let Some(arr) = array.as_any().downcast_ref::<Int32Array>() {
        Ok(ScalarValue::Int32(pick(arr.iter(), want_max)))
    } else if let Some(arr) = array.as_any().downcast_ref::<Float64Array>() {
        Ok(ScalarValue::Float64(pick(arr.iter(), want_max)))
    } else if let Some(arr) = array.as_any().downcast_ref::<StringArray>() {
        Ok(ScalarValue::Utf8(
            pick(arr.iter(), want_max).map(|s| s.to_string()),
        ))
    } else {
        Err(CacheError::Execution(
            "unsupported type for MIN/MAX".to_string(),
        ))
    }
}

/// Render one row of aggregate results as a record batch.
pub fn scalars_to_batch(
    schema: &relcache_core::Schema,
    values: &[ScalarValue],
) -> Result<RecordBatch> {
    let arrays = values
        .iter()
        .map(|v| literal_array_or_null(v))
        .collect::<Result<Vec<_>>>()?;
    RecordBatch::try_new(Arc::new(schema.to_arrow()), arrays).map_err(CacheError::from)
}

fn literal_array_or_null(value: &ScalarValue) -> Result<ArrayRef> {
    match value {
        ScalarValue::Null => Ok(Arc::new(Int64Array::from(vec![None::<i64>])) as ArrayRef),
        other => literal_array(other, 1),
    }
}
