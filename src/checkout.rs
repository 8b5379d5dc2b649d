//! The checkout engine: materializing a committed tree onto the real
//! filesystem, preferring a hardlink to the loose object over a full copy
//! whenever the storage mode and checkout mode make that safe.
//!
//! The hardlink-first algorithm and its `EMLINK`/`EXDEV`/`EEXIST` fallbacks
//! follow the same shape OSTree's own checkout path uses. Object resolution
//! sits behind a small trait so the engine stays agnostic to exactly how
//! objects are resolved (loose, packed, or from a parent repository).

use std::fs;
use std::io::Write;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use log::{debug, trace};

use crate::cancel::CancellationToken;
use crate::checksum::Checksum;
use crate::error::{Error, IoContext, Result};
use crate::objects::{DirMeta, DirTree, FileHeader, FileKind};

/// Everything the checkout engine needs to resolve objects, independent of
/// whether they live loose, in a pack, or in a parent repository -- `Repo`
/// is the production implementation, but tests can supply a minimal one.
pub trait ObjectSource: Sync {
    fn load_dir_meta(&self, checksum: &Checksum) -> Result<DirMeta>;
    fn load_dir_tree(&self, checksum: &Checksum) -> Result<DirTree>;
    fn load_file(&self, checksum: &Checksum) -> Result<(FileHeader, Vec<u8>)>;

    /// Path to a loose regular-file object suitable for hardlinking given
    /// `mode`, or `None` if no such object exists or hardlinking would be
    /// unsafe for this storage-mode/checkout-mode combination. The
    /// implementation owns that safety decision since only it knows its own
    /// storage mode: hardlinking into the object store is safe only when
    /// the checkout cannot be modified out from under it.
    fn hardlink_candidate(&self, checksum: &Checksum, mode: CheckoutMode) -> Result<Option<PathBuf>>;
}

/// Whether the caller is checking out as the privileged repository owner
/// (who may hardlink into the object store itself) or as an ordinary user
/// of the checkout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckoutMode {
    None,
    User,
}

/// What to do when the destination path already exists.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OverwriteMode {
    None,
    UnionFiles,
}

/// Checkout options, bundled for `checkout_tree`.
#[derive(Clone, Copy, Debug)]
pub struct CheckoutOptions {
    pub mode: CheckoutMode,
    pub overwrite: OverwriteMode,
    /// Maximum number of directory entries processed concurrently; `1`
    /// makes the walk fully serial.
    pub max_concurrency: usize,
}

impl Default for CheckoutOptions {
    fn default() -> Self {
        CheckoutOptions {
            mode: CheckoutMode::None,
            overwrite: OverwriteMode::None,
            max_concurrency: 1,
        }
    }
}

/// A small non-blocking counting semaphore used to bound how many sibling
/// directory entries are processed on separate scoped threads at once.
///
/// A blocking semaphore (or a fixed-size worker pool fed through a channel)
/// risks deadlock here: `checkout_tree` recurses, so a thread already
/// holding a permit while waiting on a child's scoped thread could starve if
/// every remaining permit is checked out with no thread free to release
/// one. `try_acquire` sidesteps this --
/// a caller that cannot get a permit immediately just runs the work on its
/// own call stack instead of waiting, so the walk always makes forward
/// progress regardless of the concurrency bound. Parallelism here is purely
/// an optimization; result and error semantics match a fully serial walk.
struct Semaphore {
    available: AtomicUsize,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Semaphore {
            available: AtomicUsize::new(permits),
        }
    }

    fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Permit { sem: self }),
                Err(actual) => current = actual,
            }
        }
    }
}

struct Permit<'a> {
    sem: &'a Semaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.sem.available.fetch_add(1, Ordering::Release);
    }
}

/// Materialize the tree rooted at `(contents_checksum, metadata_checksum)`
/// under `destination`, which must not yet exist unless `options.overwrite`
/// permits it.
pub fn checkout_tree(
    source: &dyn ObjectSource,
    contents_checksum: &Checksum,
    metadata_checksum: &Checksum,
    destination: &Path,
    options: &CheckoutOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let sem = Semaphore::new(options.max_concurrency.max(1).saturating_sub(1));
    let first_error: Mutex<Option<Error>> = Mutex::new(None);
    std::thread::scope(|scope| {
        checkout_dir(
            source,
            contents_checksum,
            metadata_checksum,
            destination,
            options,
            cancel,
            scope,
            &sem,
            &first_error,
        );
    });
    match first_error.into_inner().expect("mutex never poisoned") {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[allow(clippy::too_many_arguments)]
fn checkout_dir<'scope>(
    source: &'scope dyn ObjectSource,
    contents_checksum: &Checksum,
    metadata_checksum: &Checksum,
    destination: &Path,
    options: &'scope CheckoutOptions,
    cancel: &'scope CancellationToken,
    scope: &'scope std::thread::Scope<'scope, '_>,
    sem: &'scope Semaphore,
    first_error: &'scope Mutex<Option<Error>>,
) {
    if has_error(first_error) {
        return;
    }
    if let Err(e) = cancel.check() {
        record_error(first_error, e);
        return;
    }

    let tree = match checkout_dir_inner(source, contents_checksum, metadata_checksum, destination, options) {
        Ok(tree) => tree,
        Err(e) => {
            record_error(first_error, e);
            return;
        }
    };

    let mut handles = Vec::new();
    for subdir in tree.subdirs.clone() {
        if has_error(first_error) {
            break;
        }
        let child_destination = destination.join(&subdir.name);
        let run = move || {
            checkout_dir(
                source,
                &subdir.contents_checksum,
                &subdir.metadata_checksum,
                &child_destination,
                options,
                cancel,
                scope,
                sem,
                first_error,
            );
        };
        match sem.try_acquire() {
            Some(permit) => {
                handles.push(scope.spawn(move || {
                    let _permit = permit;
                    run();
                }));
            }
            None => run(),
        }
    }
    for handle in handles {
        if handle.join().is_err() {
            record_error(
                first_error,
                Error::Unsupported {
                    feature: "checkout worker thread panicked",
                },
            );
        }
    }

    for file in &tree.files {
        if has_error(first_error) {
            break;
        }
        let path = destination.join(&file.name);
        if let Err(e) = checkout_one_file(source, &file.checksum, &path, options) {
            record_error(first_error, e);
            break;
        }
    }
}

fn has_error(first_error: &Mutex<Option<Error>>) -> bool {
    first_error.lock().expect("mutex never poisoned").is_some()
}

fn record_error(first_error: &Mutex<Option<Error>>, e: Error) {
    let mut guard = first_error.lock().expect("mutex never poisoned");
    if guard.is_none() {
        *guard = Some(e);
    }
}

fn checkout_dir_inner(
    source: &dyn ObjectSource,
    contents_checksum: &Checksum,
    metadata_checksum: &Checksum,
    destination: &Path,
    options: &CheckoutOptions,
) -> Result<DirTree> {
    let meta = source.load_dir_meta(metadata_checksum)?;
    match fs::create_dir(destination) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if options.overwrite != OverwriteMode::UnionFiles {
                return Err(Error::io(destination, e));
            }
        }
        Err(e) => return Err(Error::io(destination, e)),
    }
    apply_dir_meta(destination, &meta)?;
    source.load_dir_tree(contents_checksum)
}

fn apply_dir_meta(path: &Path, meta: &DirMeta) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(meta.mode & 0o7777)).with_path(path)?;
    chown_best_effort(path, meta.uid, meta.gid);
    apply_xattrs_best_effort(path, meta.xattrs.iter());
    Ok(())
}

fn chown_best_effort(path: &Path, uid: u32, gid: u32) {
    // Unprivileged checkouts routinely cannot chown, so a failure here is
    // logged, not propagated.
    let c_path = match std::ffi::CString::new(path.as_os_str().as_bytes()) {
        Ok(c) => c,
        Err(_) => return,
    };
    let result = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
    if result != 0 {
        trace!(
            "checkout: chown {} failed (likely unprivileged): {}",
            path.display(),
            std::io::Error::last_os_error()
        );
    }
}

fn apply_xattrs_best_effort<'a>(path: &Path, xattrs: impl Iterator<Item = &'a (String, Vec<u8>)>) {
    for (name, value) in xattrs {
        if let Err(e) = xattr::set(path, name, value) {
            trace!("checkout: xattr {:?} on {} failed: {}", name, path.display(), e);
        }
    }
}

/// Checkout a single `FILE` object at `destination`, hardlinking from a
/// loose object when the storage/checkout mode combination allows it and
/// falling back to a full copy on `EMLINK`/`EXDEV` or when no hardlink
/// candidate exists.
fn checkout_one_file(
    source: &dyn ObjectSource,
    checksum: &Checksum,
    destination: &Path,
    options: &CheckoutOptions,
) -> Result<()> {
    if try_hardlink(source, checksum, destination, options)? {
        return Ok(());
    }
    copy_out_file(source, checksum, destination, options)
}

fn try_hardlink(
    source: &dyn ObjectSource,
    checksum: &Checksum,
    destination: &Path,
    options: &CheckoutOptions,
) -> Result<bool> {
    let candidate = match source.hardlink_candidate(checksum, options.mode)? {
        Some(path) => path,
        None => return Ok(false),
    };
    loop {
        match fs::hard_link(&candidate, destination) {
            Ok(()) => return Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if options.overwrite == OverwriteMode::UnionFiles {
                    fs::remove_file(destination).with_path(destination)?;
                    continue;
                }
                return Err(Error::io(destination, e));
            }
            Err(e) => match e.raw_os_error() {
                Some(libc::EMLINK) | Some(libc::EXDEV) => {
                    debug!(
                        "checkout: hardlink {} -> {} failed ({}), falling back to copy",
                        candidate.display(),
                        destination.display(),
                        e
                    );
                    return Ok(false);
                }
                _ => return Err(Error::io(destination, e)),
            },
        }
    }
}

fn copy_out_file(
    source: &dyn ObjectSource,
    checksum: &Checksum,
    destination: &Path,
    options: &CheckoutOptions,
) -> Result<()> {
    let (header, content) = source.load_file(checksum)?;
    match header.kind {
        FileKind::Symlink => {
            let target = std::ffi::OsString::from_vec(header.symlink_target.clone());
            write_symlink(&target, destination, options)?;
        }
        FileKind::Regular => {
            write_regular_file(destination, &content, options)?;
            fs::set_permissions(destination, fs::Permissions::from_mode(header.mode & 0o7777))
                .with_path(destination)?;
        }
        FileKind::CharDevice | FileKind::BlockDevice | FileKind::Fifo | FileKind::Socket => {
            if options.mode == CheckoutMode::User {
                trace!(
                    "checkout: skipping device/fifo/socket node {} (a user cannot create one)",
                    destination.display()
                );
                return Ok(());
            }
            return Err(Error::Unsupported {
                feature: "checking out device, fifo, or socket nodes without root privileges",
            });
        }
    }
    match options.mode {
        CheckoutMode::None => {
            chown_best_effort(destination, header.uid, header.gid);
            apply_xattrs_best_effort(destination, header.xattrs.iter());
        }
        CheckoutMode::User => {
            chown_best_effort(destination, effective_uid(), effective_gid());
        }
    }
    Ok(())
}

fn effective_uid() -> u32 {
    unsafe { libc::geteuid() }
}

fn effective_gid() -> u32 {
    unsafe { libc::getegid() }
}

fn write_symlink(target: &std::ffi::OsStr, destination: &Path, options: &CheckoutOptions) -> Result<()> {
    match symlink(target, destination) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if options.overwrite == OverwriteMode::UnionFiles {
                fs::remove_file(destination).with_path(destination)?;
                symlink(target, destination).with_path(destination)
            } else {
                Err(Error::io(destination, e))
            }
        }
        Err(e) => Err(Error::io(destination, e)),
    }
}

fn write_regular_file(destination: &Path, content: &[u8], options: &CheckoutOptions) -> Result<()> {
    let mut open_options = fs::OpenOptions::new();
    open_options.write(true).create_new(true);
    let mut file = match open_options.open(destination) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if options.overwrite != OverwriteMode::UnionFiles {
                return Err(Error::io(destination, e));
            }
            fs::remove_file(destination).with_path(destination)?;
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(destination)
                .with_path(destination)?
        }
        Err(e) => return Err(Error::io(destination, e)),
    };
    file.write_all(content).with_path(destination)?;
    Ok(())
}

/// The number of worker threads a caller should size `max_concurrency` to
/// by default, based on the available parallelism.
pub fn default_concurrency() -> usize {
    static CACHED: OnceLock<usize> = OnceLock::new();
    *CACHED.get_or_init(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{DirTreeFile, DirTreeSubdir, Xattrs};
    use std::collections::HashMap;
    use std::os::unix::fs::MetadataExt;
    use std::sync::Mutex as StdMutex;

    struct FakeSource {
        dir_metas: HashMap<Checksum, DirMeta>,
        dir_trees: HashMap<Checksum, DirTree>,
        files: HashMap<Checksum, (FileHeader, Vec<u8>)>,
        hardlinks: StdMutex<HashMap<Checksum, PathBuf>>,
    }

    impl ObjectSource for FakeSource {
        fn load_dir_meta(&self, checksum: &Checksum) -> Result<DirMeta> {
            self.dir_metas
                .get(checksum)
                .cloned()
                .ok_or_else(|| Error::not_found("dir_meta", checksum.to_hex()))
        }
        fn load_dir_tree(&self, checksum: &Checksum) -> Result<DirTree> {
            self.dir_trees
                .get(checksum)
                .cloned()
                .ok_or_else(|| Error::not_found("dir_tree", checksum.to_hex()))
        }
        fn load_file(&self, checksum: &Checksum) -> Result<(FileHeader, Vec<u8>)> {
            self.files
                .get(checksum)
                .cloned()
                .ok_or_else(|| Error::not_found("file", checksum.to_hex()))
        }
        fn hardlink_candidate(&self, checksum: &Checksum, _mode: CheckoutMode) -> Result<Option<PathBuf>> {
            Ok(self.hardlinks.lock().unwrap().get(checksum).cloned())
        }
    }

    fn leaf_file(content: &[u8]) -> (Checksum, FileHeader, Vec<u8>) {
        let header = FileHeader {
            kind: FileKind::Regular,
            mode: 0o644,
            uid: 0,
            gid: 0,
            rdev: 0,
            symlink_target: Vec::new(),
            content_length: content.len() as u64,
            xattrs: Xattrs::empty(),
        };
        let checksum = header.checksum_with_content(content);
        (checksum, header, content.to_vec())
    }

    #[test]
    fn test_checkout_tree_writes_files_and_subdirs() {
        let (leaf_checksum, leaf_header, leaf_content) = leaf_file(b"hello world");
        let meta = DirMeta::default_mode();
        let meta_checksum = meta.checksum();

        let sub_tree = DirTree::new(
            vec![DirTreeFile {
                name: "inner.txt".to_string(),
                checksum: leaf_checksum,
            }],
            Vec::new(),
        );
        let sub_tree_checksum = sub_tree.checksum();

        let root_tree = DirTree::new(
            Vec::new(),
            vec![DirTreeSubdir {
                name: "sub".to_string(),
                contents_checksum: sub_tree_checksum,
                metadata_checksum: meta_checksum,
            }],
        );
        let root_tree_checksum = root_tree.checksum();

        let mut dir_metas = HashMap::new();
        dir_metas.insert(meta_checksum, meta);
        let mut dir_trees = HashMap::new();
        dir_trees.insert(root_tree_checksum, root_tree);
        dir_trees.insert(sub_tree_checksum, sub_tree);
        let mut files = HashMap::new();
        files.insert(leaf_checksum, (leaf_header, leaf_content));

        let source = FakeSource {
            dir_metas,
            dir_trees,
            files,
            hardlinks: StdMutex::new(HashMap::new()),
        };

        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("checkout");
        let options = CheckoutOptions::default();
        let cancel = CancellationToken::new();
        checkout_tree(&source, &root_tree_checksum, &meta_checksum, &target, &options, &cancel).unwrap();

        let written = fs::read(target.join("sub/inner.txt")).unwrap();
        assert_eq!(written, b"hello world");
    }

    #[test]
    fn test_checkout_uses_hardlink_when_candidate_present() {
        let (leaf_checksum, leaf_header, leaf_content) = leaf_file(b"linked");
        let meta = DirMeta::default_mode();
        let meta_checksum = meta.checksum();
        let root_tree = DirTree::new(
            vec![DirTreeFile {
                name: "a.txt".to_string(),
                checksum: leaf_checksum,
            }],
            Vec::new(),
        );
        let root_tree_checksum = root_tree.checksum();

        let mut dir_metas = HashMap::new();
        dir_metas.insert(meta_checksum, meta);
        let mut dir_trees = HashMap::new();
        dir_trees.insert(root_tree_checksum, root_tree);
        let mut files = HashMap::new();
        files.insert(leaf_checksum, (leaf_header, leaf_content.clone()));

        let object_dir = tempfile::tempdir().unwrap();
        let object_path = object_dir.path().join("object");
        fs::write(&object_path, &leaf_content).unwrap();
        let mut hardlinks = HashMap::new();
        hardlinks.insert(leaf_checksum, object_path.clone());

        let source = FakeSource {
            dir_metas,
            dir_trees,
            files,
            hardlinks: StdMutex::new(hardlinks),
        };

        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("checkout");
        checkout_tree(
            &source,
            &root_tree_checksum,
            &meta_checksum,
            &target,
            &CheckoutOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        let checked_out = target.join("a.txt");
        let out_meta = fs::symlink_metadata(&checked_out).unwrap();
        let src_meta = fs::symlink_metadata(&object_path).unwrap();
        assert_eq!(out_meta.ino(), src_meta.ino());
    }

    #[test]
    fn test_checkout_rejects_existing_destination_without_union() {
        let (leaf_checksum, leaf_header, leaf_content) = leaf_file(b"data");
        let meta = DirMeta::default_mode();
        let meta_checksum = meta.checksum();
        let root_tree = DirTree::new(
            vec![DirTreeFile {
                name: "a.txt".to_string(),
                checksum: leaf_checksum,
            }],
            Vec::new(),
        );
        let root_tree_checksum = root_tree.checksum();
        let mut dir_metas = HashMap::new();
        dir_metas.insert(meta_checksum, meta);
        let mut dir_trees = HashMap::new();
        dir_trees.insert(root_tree_checksum, root_tree);
        let mut files = HashMap::new();
        files.insert(leaf_checksum, (leaf_header, leaf_content));
        let source = FakeSource {
            dir_metas,
            dir_trees,
            files,
            hardlinks: StdMutex::new(HashMap::new()),
        };

        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("checkout");
        fs::create_dir(&target).unwrap();
        let result = checkout_tree(
            &source,
            &root_tree_checksum,
            &meta_checksum,
            &target,
            &CheckoutOptions::default(),
            &CancellationToken::new(),
        );
        assert!(result.is_err());
    }
}
