//! Content-addressed object store for immutable filesystem trees: a loose
//! object store, mutable-tree commit engine, pack subsystem, reference
//! namespace, and checkout engine, optionally chained to a parent
//! repository for reads.

pub mod cancel;
pub mod checkout;
pub mod checksum;
pub mod commit;
pub mod config;
pub mod encoding;
pub mod error;
pub mod mtree;
pub mod objects;
pub mod pack;
pub mod refs;
pub mod remote_cache;
pub mod repo;

pub use checksum::Checksum;
pub use error::{Error, Result};
pub use repo::Repo;
