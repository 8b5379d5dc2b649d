//! The loose object store: on-disk layout, canonical serialization, and the
//! staging/commit machinery.

pub mod format;
pub mod layout;
pub mod store;

pub use format::{Commit, DirMeta, DirTree, DirTreeFile, DirTreeSubdir, FileHeader, FileKind,
    ObjectType, Xattrs};
pub use layout::StorageMode;
pub use store::{LooseFile, ObjectStore, StagedObject, Transaction, TransactionStats};
