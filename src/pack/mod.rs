//! Pack files: index + data pairs that consolidate many loose objects, plus
//! the super-index that lists them all.

pub mod engine;
pub mod format;

pub use engine::{PackEngine, PackLocation};
pub use format::{PackIndex, PackIndexEntry, SuperIndex, SuperIndexPack};
