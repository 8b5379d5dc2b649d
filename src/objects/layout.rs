//! On-disk path derivation for loose objects.
//!
//! Every object lives at `objects/<shard>/<remainder>.<ext>`, where `shard`
//! is the first two hex characters of the checksum and `remainder` is the
//! other 62 -- the same two-level fan-out content-addressed stores commonly
//! use to keep any one directory from holding too many entries, here driven
//! by the object's own checksum.

use std::path::{Path, PathBuf};

use crate::checksum::Checksum;
use crate::objects::format::{FileKind, ObjectType};

/// Whether a repository stores file content as real filesystem entries
/// (`Bare`) or as header+content pairs safe to own by any uid (`Archive`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageMode {
    Bare,
    Archive,
}

/// Directory, relative to the repository root, holding all loose objects.
pub const OBJECTS_DIR: &str = "objects";

/// Directory, relative to the repository root, used for staging temp files
/// before they are linked into their final loose-object location.
pub const TMP_DIR: &str = "tmp";

/// The path of the shard directory (`objects/<shard>`) a checksum falls
/// into, relative to the repository root.
pub fn shard_dir(objects_root: &Path, checksum: &Checksum) -> PathBuf {
    objects_root.join(checksum.shard())
}

/// The path of a metadata object (`DIR_META`, `DIR_TREE`, or `COMMIT`),
/// which is stored identically in both bare and archive mode.
pub fn metadata_object_path(
    objects_root: &Path,
    checksum: &Checksum,
    object_type: ObjectType,
) -> PathBuf {
    debug_assert!(!matches!(object_type, ObjectType::File));
    shard_dir(objects_root, checksum).join(format!(
        "{}.{}",
        checksum.remainder(),
        object_type.loose_ext()
    ))
}

/// The path(s) at which a `FILE` object is stored, which differ by storage
/// mode and, in archive mode, by whether the file kind carries content.
pub enum FileObjectPath {
    /// Bare mode: the file itself (regular file, symlink, or device node)
    /// lives directly at this path with real POSIX ownership and mode.
    Bare(PathBuf),
    /// Archive mode: the header variant lives at `header`, and if the file
    /// kind carries content (`FileKind::has_content`), the raw bytes live
    /// separately at `content`.
    Archive { header: PathBuf, content: PathBuf },
}

/// Compute where a `FILE` object belongs under `objects_root` for the given
/// storage mode and file kind.
pub fn file_object_path(
    objects_root: &Path,
    checksum: &Checksum,
    mode: StorageMode,
    kind: FileKind,
) -> FileObjectPath {
    let dir = shard_dir(objects_root, checksum);
    let stem = checksum.remainder();
    match mode {
        StorageMode::Bare => FileObjectPath::Bare(dir.join(stem)),
        StorageMode::Archive => FileObjectPath::Archive {
            header: dir.join(format!("{}.{}", stem, ObjectType::File.loose_ext())),
            content: dir.join(format!("{}.filecontent", stem)),
        },
    }
}

/// Whether `kind` stores a separate `.filecontent` sibling in archive mode.
pub fn has_filecontent_sibling(mode: StorageMode, kind: FileKind) -> bool {
    matches!(mode, StorageMode::Archive) && kind.has_content()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csum() -> Checksum {
        Checksum::of_bytes(b"layout test")
    }

    #[test]
    fn test_metadata_object_path_uses_shard_and_extension() {
        let root = Path::new("objects");
        let c = csum();
        let path = metadata_object_path(root, &c, ObjectType::Commit);
        assert_eq!(
            path,
            root.join(c.shard()).join(format!("{}.commit", c.remainder()))
        );
    }

    #[test]
    fn test_bare_file_object_has_single_path() {
        let root = Path::new("objects");
        let c = csum();
        match file_object_path(root, &c, StorageMode::Bare, FileKind::Regular) {
            FileObjectPath::Bare(p) => {
                assert_eq!(p, root.join(c.shard()).join(c.remainder()));
            }
            FileObjectPath::Archive { .. } => panic!("expected bare path"),
        }
    }

    #[test]
    fn test_archive_regular_file_has_header_and_content_paths() {
        let root = Path::new("objects");
        let c = csum();
        match file_object_path(root, &c, StorageMode::Archive, FileKind::Regular) {
            FileObjectPath::Archive { header, content } => {
                assert_eq!(
                    header,
                    root.join(c.shard()).join(format!("{}.file", c.remainder()))
                );
                assert_eq!(
                    content,
                    root.join(c.shard())
                        .join(format!("{}.filecontent", c.remainder()))
                );
            }
            FileObjectPath::Bare(_) => panic!("expected archive path"),
        }
        assert!(has_filecontent_sibling(StorageMode::Archive, FileKind::Regular));
    }

    #[test]
    fn test_archive_symlink_has_no_content_sibling() {
        assert!(!has_filecontent_sibling(
            StorageMode::Archive,
            FileKind::Symlink
        ));
    }
}
