//! Domain layer types and invariants.

pub mod error;
pub mod hierarchy;
pub mod types;

pub use hierarchy::{HierarchyError, HierarchyStore};
pub use types::{ActivityScope, FileStats, MAX_DEPTH, Node, NodeId};
