use arrow::datatypes::DataType as ArrowDataType;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Column types the columnar cache can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float64,
    Utf8,
}

impl DataType {
    pub fn to_arrow(&self) -> ArrowDataType {
        match self {
            DataType::Boolean => ArrowDataType::Boolean,
            DataType::Int32 => ArrowDataType::Int32,
            DataType::Int64 => ArrowDataType::Int64,
            DataType::Float64 => ArrowDataType::Float64,
            DataType::Utf8 => ArrowDataType::Utf8,
        }
    }

    pub fn from_arrow(dt: &ArrowDataType) -> Option<Self> {
        match dt {
            ArrowDataType::Boolean => Some(DataType::Boolean),
            ArrowDataType::Int32 => Some(DataType::Int32),
            ArrowDataType::Int64 => Some(DataType::Int64),
            ArrowDataType::Float64 => Some(DataType::Float64),
            ArrowDataType::Utf8 | ArrowDataType::LargeUtf8 => Some(DataType::Utf8),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "Boolean",
            DataType::Int32 => "Int32",
            DataType::Int64 => "Int64",
            DataType::Float64 => "Float64",
            DataType::Utf8 => "Utf8",
        };
        write!(f, "{}", name)
    }
}

/// A single typed value, nullable per variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Boolean(Option<bool>),
    Int32(Option<i32>),
    Int64(Option<i64>),
    Float64(Option<f64>),
    Utf8(Option<String>),
    Null,
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(
            self,
            ScalarValue::Null
                | ScalarValue::Boolean(None)
                | ScalarValue::Int32(None)
                | ScalarValue::Int64(None)
                | ScalarValue::Float64(None)
                | ScalarValue::Utf8(None)
        )
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            ScalarValue::Boolean(_) => Some(DataType::Boolean),
            ScalarValue::Int32(_) => Some(DataType::Int32),
            ScalarValue::Int64(_) => Some(DataType::Int64),
            ScalarValue::Float64(_) => Some(DataType::Float64),
            ScalarValue::Utf8(_) => Some(DataType::Utf8),
            ScalarValue::Null => None,
        }
    }
}

impl PartialOrd for ScalarValue {
    /// Same-type comparison only; nulls and mixed types are incomparable.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        use ScalarValue::*;
        match (self, other) {
            (Boolean(Some(a)), Boolean(Some(b))) => a.partial_cmp(b),
            (Int32(Some(a)), Int32(Some(b))) => a.partial_cmp(b),
            (Int64(Some(a)), Int64(Some(b))) => a.partial_cmp(b),
            (Float64(Some(a)), Float64(Some(b))) => a.partial_cmp(b),
            (Utf8(Some(a)), Utf8(Some(b))) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Boolean(Some(v)) => write!(f, "{}", v),
            ScalarValue::Int32(Some(v)) => write!(f, "{}", v),
            ScalarValue::Int64(Some(v)) => write!(f, "{}", v),
            ScalarValue::Float64(Some(v)) => write!(f, "{}", v),
            ScalarValue::Utf8(Some(v)) => write!(f, "'{}'", v),
            _ => write!(f, "NULL"),
        }
    }
}
