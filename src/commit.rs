//! The commit engine: walking a real directory (or a tar archive) into a
//! [`MutableTree`], sealing that tree into immutable `DIR_TREE`/`DIR_META`
//! objects, and staging the final `COMMIT` object.
//!
//! Recurse the real filesystem into the mutable tree, consulting the devino
//! cache to avoid rehashing files the repository has already seen, then
//! flatten the mutable tree bottom-up into sealed objects -- the same shape
//! OSTree's own `ostree_repo_stage_mtree` takes.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use crate::cancel::CancellationToken;
use crate::checksum::Checksum;
use crate::error::{Error, IoContext, Result};
use crate::mtree::MutableTree;
use crate::objects::{Commit, DirMeta, DirTree, DirTreeFile, DirTreeSubdir, FileHeader, FileKind,
    ObjectStore, Transaction, Xattrs};

/// What a [`CommitFilter`] decides to do with a given path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilterResult {
    Allow,
    Skip,
}

/// Per-entry veto hook consulted while walking a real directory into a
/// commit, mirroring `OstreeRepoCommitModifier`'s filter callback. The
/// default behavior (no modifier) allows everything.
pub trait CommitFilter {
    /// Decide whether `relative_path` (slash-separated, repo-root-relative)
    /// should be included in the commit.
    fn filter(&self, relative_path: &str, is_dir: bool) -> FilterResult;
}

/// A filter that allows every entry, used when the caller supplies none.
pub struct AllowAll;

impl CommitFilter for AllowAll {
    fn filter(&self, _relative_path: &str, _is_dir: bool) -> FilterResult {
        FilterResult::Allow
    }
}

/// Maps `(device, inode)` to a previously-seen `FILE` checksum, letting a
/// re-commit of an already-checked-out tree skip rehashing file content it
/// already knows about.
#[derive(Default)]
pub struct DevinoCache {
    map: HashMap<(u64, u64), Checksum>,
}

impl DevinoCache {
    pub fn new() -> Self {
        DevinoCache::default()
    }

    /// Populate from a store's own loose objects, then recursively from
    /// every ancestor in the parent-repository chain, so that a checkout
    /// whose objects physically live in a parent repo still benefits.
    pub fn build(stores: &[&ObjectStore]) -> Result<Self> {
        let mut cache = DevinoCache::new();
        for store in stores {
            for (devino, checksum) in store.scan_loose_devino()? {
                cache.map.entry(devino).or_insert(checksum);
            }
        }
        Ok(cache)
    }

    fn lookup(&self, dev: u64, ino: u64) -> Option<Checksum> {
        self.map.get(&(dev, ino)).copied()
    }
}

pub(crate) fn xattrs_of(path: &Path) -> Result<Xattrs> {
    let mut entries = Vec::new();
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Xattrs::empty()),
        Err(e) => return Err(Error::io(path, e)),
    };
    for name in names {
        if let Some(value) = xattr::get(path, &name).with_path(path)? {
            let name = name.to_string_lossy().into_owned();
            entries.push((name, value));
        }
    }
    Ok(Xattrs::new(entries))
}

pub(crate) fn file_kind_of(file_type: fs::FileType) -> FileKind {
    if file_type.is_symlink() {
        FileKind::Symlink
    } else if file_type.is_char_device() {
        FileKind::CharDevice
    } else if file_type.is_block_device() {
        FileKind::BlockDevice
    } else if file_type.is_fifo() {
        FileKind::Fifo
    } else if file_type.is_socket() {
        FileKind::Socket
    } else {
        FileKind::Regular
    }
}

/// Stage a single real filesystem entry (not a directory) as a `FILE`
/// object, consulting and then updating the devino cache.
fn stage_real_file(
    tx: &mut Transaction<'_>,
    path: &Path,
    devino: &DevinoCache,
) -> Result<Checksum> {
    let meta = fs::symlink_metadata(path).with_path(path)?;
    if let Some(cached) = devino.lookup(meta.dev(), meta.ino()) {
        return Ok(cached);
    }
    let kind = file_kind_of(meta.file_type());
    let xattrs = xattrs_of(path)?;
    let mut header = FileHeader {
        kind,
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev(),
        symlink_target: Vec::new(),
        content_length: 0,
        xattrs,
    };
    let staged = match kind {
        FileKind::Regular => {
            let file = fs::File::open(path).with_path(path)?;
            tx.stage_file(header, file)?
        }
        FileKind::Symlink => {
            let target = fs::read_link(path).with_path(path)?;
            header.symlink_target = target.as_os_str().as_bytes().to_vec();
            tx.stage_file(header, std::io::empty())?
        }
        FileKind::CharDevice | FileKind::BlockDevice | FileKind::Fifo | FileKind::Socket => {
            tx.stage_file(header, std::io::empty())?
        }
    };
    Ok(staged.checksum)
}

fn dir_meta_of(path: &Path) -> Result<DirMeta> {
    let meta = fs::symlink_metadata(path).with_path(path)?;
    let xattrs = xattrs_of(path)?;
    Ok(DirMeta {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        xattrs,
    })
}

/// Recursively stage a real directory tree into `mtree`, honoring `filter`
/// and using `devino` to skip rehashing known files.
///
/// `relative_path` is the slash-joined path from the commit root, used only
/// to evaluate `filter` and to produce readable error context.
pub fn stage_directory_to_mtree<F: CommitFilter>(
    tx: &mut Transaction<'_>,
    dir: &Path,
    mtree: &mut MutableTree,
    filter: &F,
    devino: &DevinoCache,
    cancel: &CancellationToken,
    relative_path: &str,
) -> Result<()> {
    let meta = dir_meta_of(dir)?;
    let staged_meta = tx.stage_dir_meta(&meta)?;
    mtree.set_metadata_checksum(staged_meta.checksum);

    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_path(dir)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_path(dir)?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        cancel.check()?;
        let name_os = entry.file_name();
        let name = name_os.to_string_lossy().into_owned();
        let child_relative = if relative_path.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", relative_path, name)
        };
        let file_type = entry.file_type().with_path(entry.path())?;
        let is_dir = file_type.is_dir();
        if filter.filter(&child_relative, is_dir) == FilterResult::Skip {
            continue;
        }
        let child_path = entry.path();
        if is_dir {
            let child_mtree = mtree.ensure_dir(&name)?;
            stage_directory_to_mtree(
                tx,
                &child_path,
                child_mtree,
                filter,
                devino,
                cancel,
                &child_relative,
            )?;
        } else {
            let checksum = stage_real_file(tx, &child_path, devino)?;
            mtree.replace_file(&name, checksum)?;
        }
    }
    Ok(())
}

/// Flatten a [`MutableTree`] bottom-up into sealed `DIR_TREE`/`DIR_META`
/// objects, returning `(contents_checksum, metadata_checksum)` for the
/// root. Already-sealed subtrees (`contents_checksum` cached, unmodified
/// since) are not re-serialized.
pub fn seal_mtree(tx: &mut Transaction<'_>, mtree: &mut MutableTree) -> Result<(Checksum, Checksum)> {
    let metadata_checksum = mtree.metadata_checksum().ok_or_else(|| Error::InvalidFormat {
        context: "mutable tree".into(),
        detail: "directory has no metadata checksum set".into(),
    })?;

    if let Some(cached) = mtree.contents_checksum() {
        return Ok((cached, metadata_checksum));
    }

    let files: Vec<DirTreeFile> = mtree
        .files()
        .map(|(name, checksum)| DirTreeFile {
            name: name.to_string(),
            checksum,
        })
        .collect();

    let subdir_names: Vec<String> = mtree.subdirs().map(|(name, _)| name.to_string()).collect();
    let mut subdirs = Vec::with_capacity(subdir_names.len());
    for name in subdir_names {
        let child = mtree
            .subdir_mut(&name)
            .expect("name was just enumerated from subdirs()");
        let (contents_checksum, metadata_checksum) = seal_mtree(tx, child)?;
        subdirs.push(DirTreeSubdir {
            name,
            contents_checksum,
            metadata_checksum,
        });
    }

    let tree = DirTree::new(files, subdirs);
    let staged = tx.stage_dir_tree(&tree)?;
    mtree.set_contents_checksum(staged.checksum);
    Ok((staged.checksum, metadata_checksum))
}

/// Build and stage a `COMMIT` object pointing at `root`, with the given
/// metadata. `timestamp` is a caller-supplied UTC unix time (this crate
/// never calls a clock itself, so tests and callers stay deterministic).
#[allow(clippy::too_many_arguments)]
pub fn stage_commit(
    tx: &mut Transaction<'_>,
    root_contents_checksum: Checksum,
    root_metadata_checksum: Checksum,
    parent: Option<Checksum>,
    subject: &str,
    body: Option<&str>,
    metadata: Vec<(String, Vec<u8>)>,
    related_objects: Vec<Checksum>,
    timestamp: u64,
) -> Result<Checksum> {
    let commit = Commit {
        metadata,
        parent,
        related_objects,
        subject: subject.to_string(),
        body: body.map(|s| s.to_string()),
        timestamp,
        root_contents_checksum,
        root_metadata_checksum,
    };
    Ok(tx.stage_commit(&commit)?.checksum)
}

/// Stage the contents of a tar archive into `mtree`, resolving hardlinked
/// tar entries (`GNU.sparse`/hardlink type `'1'`) against whatever sibling
/// entry they reference, the way `stage_libarchive_entry_to_mtree` resolves
/// `archive_entry_hardlink` in `ostree-repo.c`.
pub fn stage_archive_to_mtree<R: Read>(
    tx: &mut Transaction<'_>,
    archive: &mut tar::Archive<R>,
    mtree: &mut MutableTree,
) -> Result<()> {
    // A tar stream has no inherent root directory entry, so the root's own
    // attributes, and those of any intermediate directory implied only by a
    // deeper entry's path (never visited as its own `Directory` entry),
    // default to a plain staged `0755` directory unless overridden by an
    // explicit entry later in the stream.
    let default_meta_checksum = tx.stage_dir_meta(&DirMeta::default_mode())?.checksum;
    if mtree.metadata_checksum().is_none() {
        mtree.set_metadata_checksum(default_meta_checksum);
    }

    let mut hardlink_targets: HashMap<String, Checksum> = HashMap::new();

    for entry in archive.entries().map_err(|e| Error::io("<archive>", e))? {
        let mut entry = entry.map_err(|e| Error::io("<archive>", e))?;
        let path = entry.path().map_err(|e| Error::io("<archive>", e))?;
        let path_str = path.to_string_lossy().trim_end_matches('/').to_string();
        if path_str.is_empty() || path_str == "." {
            continue;
        }
        let components: Vec<&str> = path_str.split('/').collect();
        let (dir_components, name) = components.split_at(components.len() - 1);
        let name = name[0];
        for c in dir_components {
            validate_tar_component(c)?;
        }
        let parent_dir = ensure_parent_dirs_with_default_meta(
            mtree,
            dir_components.iter().copied(),
            default_meta_checksum,
        )?;

        let header = entry.header();
        let mode = header.mode().unwrap_or(0o644);
        let uid = header.uid().unwrap_or(0) as u32;
        let gid = header.gid().unwrap_or(0) as u32;

        match header.entry_type() {
            tar::EntryType::Directory => {
                let child = parent_dir.ensure_dir(name)?;
                let meta = DirMeta {
                    mode: mode | 0o40000,
                    uid,
                    gid,
                    xattrs: Xattrs::empty(),
                };
                child.set_metadata_checksum(tx.stage_dir_meta(&meta)?.checksum);
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| Error::io(path_str.clone(), e))?
                    .unwrap_or_default();
                let fh = FileHeader {
                    kind: FileKind::Symlink,
                    mode: mode | 0o120000,
                    uid,
                    gid,
                    rdev: 0,
                    symlink_target: target.as_os_str().as_bytes().to_vec(),
                    content_length: 0,
                    xattrs: Xattrs::empty(),
                };
                let checksum = tx.stage_file(fh, std::io::empty())?.checksum;
                parent_dir.replace_file(name, checksum)?;
                hardlink_targets.insert(path_str.clone(), checksum);
            }
            tar::EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(|e| Error::io(path_str.clone(), e))?
                    .map(|p| p.to_string_lossy().trim_end_matches('/').to_string())
                    .unwrap_or_default();
                let checksum = hardlink_targets.get(&target).copied().ok_or_else(|| {
                    Error::InvalidFormat {
                        context: "archive".into(),
                        detail: format!(
                            "hardlink {:?} references unseen target {:?}",
                            path_str, target
                        ),
                    }
                })?;
                parent_dir.replace_file(name, checksum)?;
                hardlink_targets.insert(path_str.clone(), checksum);
            }
            _ => {
                let fh = FileHeader {
                    kind: FileKind::Regular,
                    mode: mode | 0o100000,
                    uid,
                    gid,
                    rdev: 0,
                    symlink_target: Vec::new(),
                    content_length: entry.header().size().unwrap_or(0),
                    xattrs: Xattrs::empty(),
                };
                let checksum = tx.stage_file(fh, &mut entry)?.checksum;
                parent_dir.replace_file(name, checksum)?;
                hardlink_targets.insert(path_str.clone(), checksum);
            }
        }
    }
    Ok(())
}

/// Ensure every component of `path` exists as a chain of subdirectories
/// under `mtree`, creating any that are missing, and return the final one.
/// Any directory created along the way that does not already carry a
/// metadata checksum (i.e. it is being seen here for the first time, only
/// implied by this entry's path) is given `default_meta_checksum`. A later
/// explicit `Directory` entry for that same path still overrides it.
fn ensure_parent_dirs_with_default_meta<'a, I>(
    mtree: &mut MutableTree,
    components: I,
    default_meta_checksum: Checksum,
) -> Result<&mut MutableTree>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut cur = mtree;
    for name in components {
        cur = cur.ensure_dir(name)?;
        if cur.metadata_checksum().is_none() {
            cur.set_metadata_checksum(default_meta_checksum);
        }
    }
    Ok(cur)
}

fn validate_tar_component(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::InvalidFormat {
            context: "archive".into(),
            detail: format!("{:?} is not a valid path component", name),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::StorageMode;

    #[test]
    fn test_stage_directory_to_mtree_round_trip() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/b.txt"), b"world").unwrap();

        let repo_dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(repo_dir.path(), StorageMode::Archive).unwrap();
        let mut tx = store.begin_transaction().unwrap();
        let devino = DevinoCache::new();
        let cancel = CancellationToken::new();
        let mut mtree = MutableTree::new();
        stage_directory_to_mtree(&mut tx, src.path(), &mut mtree, &AllowAll, &devino, &cancel, "")
            .unwrap();
        let (contents, metadata) = seal_mtree(&mut tx, &mut mtree).unwrap();
        tx.commit().unwrap();

        let tree = store.load_dir_tree(&contents).unwrap();
        assert_eq!(tree.files.len(), 1);
        assert_eq!(tree.subdirs.len(), 1);
        assert!(store.has_loose_metadata(&metadata, crate::objects::ObjectType::DirMeta).unwrap());
    }

    struct SkipNamed(&'static str);
    impl CommitFilter for SkipNamed {
        fn filter(&self, relative_path: &str, _is_dir: bool) -> FilterResult {
            if relative_path == self.0 {
                FilterResult::Skip
            } else {
                FilterResult::Allow
            }
        }
    }

    #[test]
    fn test_filter_skips_named_entry() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("keep.txt"), b"keep").unwrap();
        fs::write(src.path().join("skip.txt"), b"skip").unwrap();

        let repo_dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(repo_dir.path(), StorageMode::Archive).unwrap();
        let mut tx = store.begin_transaction().unwrap();
        let devino = DevinoCache::new();
        let cancel = CancellationToken::new();
        let mut mtree = MutableTree::new();
        stage_directory_to_mtree(
            &mut tx,
            src.path(),
            &mut mtree,
            &SkipNamed("skip.txt"),
            &devino,
            &cancel,
            "",
        )
        .unwrap();
        let (contents, _) = seal_mtree(&mut tx, &mut mtree).unwrap();
        tx.commit().unwrap();
        let tree = store.load_dir_tree(&contents).unwrap();
        assert_eq!(tree.files.len(), 1);
        assert_eq!(tree.files[0].name, "keep.txt");
    }

    #[test]
    fn test_commit_round_trip_through_store() {
        let repo_dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(repo_dir.path(), StorageMode::Archive).unwrap();
        let mut tx = store.begin_transaction().unwrap();
        let meta = DirMeta::default_mode();
        let meta_checksum = tx.stage_dir_meta(&meta).unwrap().checksum;
        let tree = DirTree::default();
        let tree_checksum = tx.stage_dir_tree(&tree).unwrap().checksum;
        let commit_checksum = stage_commit(
            &mut tx,
            tree_checksum,
            meta_checksum,
            None,
            "initial",
            None,
            Vec::new(),
            Vec::new(),
            1_700_000_000,
        )
        .unwrap();
        tx.commit().unwrap();

        let loaded = store.load_commit(&commit_checksum).unwrap();
        assert_eq!(loaded.subject, "initial");
        assert_eq!(loaded.parent, None);
    }
}
