//! Block storage layer for cached columnar data.
//!
//! The cache interacts with storage only through the [`BlockStore`]
//! trait. The bundled [`InMemoryBlockStore`] keeps blocks in a bounded
//! memory tier, evicting least-recently-used blocks under pressure and
//! spilling them to disk when their storage level allows it.

pub mod level;
pub mod store;

pub use level::StorageLevel;
pub use store::{BlockStore, InMemoryBlockStore, StoreConfig};
