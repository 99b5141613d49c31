//! Logical query plans and plan-equivalence matching.
//!
//! The cache keys its registry on canonical plan forms: structural
//! equality over a tagged plan representation after stripping aliases and
//! normalizing commutative operands. `RelationSource` is the seam through
//! which rewritten plans read cached data.

pub mod canonical;
pub mod logical_plan;
pub mod source;

pub use canonical::{canonicalize, plans_match};
pub use logical_plan::{
    AggregateExpr, AggregateFunction, BinaryOp, LogicalExpr, LogicalPlan, UnaryOp,
};
pub use source::RelationSource;
