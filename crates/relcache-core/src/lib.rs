//! Core types shared across the relcache workspace.
//!
//! Defines the column type system, scalar values, schemas with Arrow
//! conversions, and the error taxonomy used by every other crate.

pub mod error;
pub mod schema;
pub mod types;

pub use error::{CacheError, Result};
pub use schema::{Field, Schema};
pub use types::{DataType, ScalarValue};
