//! Loose object storage: staging new objects into a transaction's scratch
//! directory, then installing them atomically into `objects/<shard>/...`.
//!
//! Staging always writes to a temp file and moves it into place rather than
//! writing in place, the usual pattern for making a multi-step write look
//! atomic to concurrent readers. The install step itself -- hard link,
//! tolerate `EEXIST`, fall back to rename on `EXDEV` -- follows the same
//! shape as OSTree's own `ostree_repo_commit_staged_file`.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::checksum::Checksum;
use crate::error::{Error, IoContext, Result};
use crate::objects::format::{Commit, DirMeta, DirTree, FileHeader, FileKind, ObjectType, Xattrs};
use crate::objects::layout::{self, FileObjectPath, StorageMode};

/// What kind of object was found loose on disk for `FILE` entries; unlike
/// metadata objects, a `FILE` object's representation depends on both the
/// repository's storage mode and the entry's own kind.
pub enum LooseFile {
    /// Bare mode: the path of the real filesystem entry (regular file,
    /// symlink, device node, fifo, or socket). The caller reads its content
    /// and POSIX attributes directly off the filesystem.
    Bare(PathBuf),
    /// Archive mode: the decoded header, plus the path of the `.filecontent`
    /// sibling if `header.kind.has_content()`.
    Archive {
        header: FileHeader,
        content_path: Option<PathBuf>,
    },
}

/// Result of staging a single object: its checksum and whether it was a
/// fresh write or a no-op because the object already existed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StagedObject {
    pub checksum: Checksum,
    pub was_new: bool,
}

/// Running totals for a transaction, surfaced to callers for logging
/// (mirrors `ostree_repo_transaction_get_stats`).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TransactionStats {
    pub objects_written: u64,
    pub objects_deduplicated: u64,
    pub content_bytes_written: u64,
}

/// The loose object store rooted at `<repo>/objects`, with a `<repo>/tmp`
/// staging area.
pub struct ObjectStore {
    objects_dir: PathBuf,
    tmp_dir: PathBuf,
    mode: StorageMode,
}

impl ObjectStore {
    /// Open the loose object store under `repo_root`, creating `objects/`
    /// and `tmp/` if they do not yet exist.
    pub fn open(repo_root: &Path, mode: StorageMode) -> Result<Self> {
        let objects_dir = repo_root.join(layout::OBJECTS_DIR);
        let tmp_dir = repo_root.join(layout::TMP_DIR);
        fs::create_dir_all(&objects_dir).with_path(&objects_dir)?;
        fs::create_dir_all(&tmp_dir).with_path(&tmp_dir)?;
        Ok(ObjectStore {
            objects_dir,
            tmp_dir,
            mode,
        })
    }

    /// The storage mode this store was opened with.
    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Root `objects/` directory.
    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    /// Whether a metadata object (`DIR_META`, `DIR_TREE`, or `COMMIT`) is
    /// present loose.
    pub fn has_loose_metadata(&self, checksum: &Checksum, object_type: ObjectType) -> Result<bool> {
        let path = layout::metadata_object_path(&self.objects_dir, checksum, object_type);
        path_exists(&path)
    }

    /// Whether a `FILE` object is present loose, regardless of storage mode
    /// or file kind.
    pub fn has_loose_file(&self, checksum: &Checksum) -> Result<bool> {
        match self.mode {
            StorageMode::Bare => {
                // The bare path has no fixed kind-specific extension, so we
                // probe the stem directly with symlink_metadata to avoid
                // following (and thus mis-stat'ing) a symlink entry.
                let dir = layout::shard_dir(&self.objects_dir, checksum);
                let path = dir.join(checksum.remainder());
                match fs::symlink_metadata(&path) {
                    Ok(_) => Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(Error::io(path, e)),
                }
            }
            StorageMode::Archive => {
                let header_path =
                    layout::metadata_object_path(&self.objects_dir, checksum, ObjectType::File);
                path_exists(&header_path)
            }
        }
    }

    /// Load a metadata object's raw canonical bytes.
    pub fn load_loose_metadata_bytes(
        &self,
        checksum: &Checksum,
        object_type: ObjectType,
    ) -> Result<Vec<u8>> {
        let path = layout::metadata_object_path(&self.objects_dir, checksum, object_type);
        fs::read(&path).with_path(&path)
    }

    pub fn load_dir_meta(&self, checksum: &Checksum) -> Result<DirMeta> {
        let bytes = self.load_loose_metadata_bytes(checksum, ObjectType::DirMeta)?;
        DirMeta::decode(&bytes)
    }

    pub fn load_dir_tree(&self, checksum: &Checksum) -> Result<DirTree> {
        let bytes = self.load_loose_metadata_bytes(checksum, ObjectType::DirTree)?;
        DirTree::decode(&bytes)
    }

    pub fn load_commit(&self, checksum: &Checksum) -> Result<Commit> {
        let bytes = self.load_loose_metadata_bytes(checksum, ObjectType::Commit)?;
        Commit::decode(&bytes)
    }

    /// Resolve a `FILE` object, in whatever shape this store's mode keeps it.
    pub fn load_loose_file(&self, checksum: &Checksum) -> Result<LooseFile> {
        match self.mode {
            StorageMode::Bare => {
                let dir = layout::shard_dir(&self.objects_dir, checksum);
                Ok(LooseFile::Bare(dir.join(checksum.remainder())))
            }
            StorageMode::Archive => {
                let header_path =
                    layout::metadata_object_path(&self.objects_dir, checksum, ObjectType::File);
                let bytes = fs::read(&header_path).with_path(&header_path)?;
                let (header, _empty_tail) = FileHeader::parse(&bytes)?;
                let content_path = if layout::has_filecontent_sibling(self.mode, header.kind) {
                    let dir = layout::shard_dir(&self.objects_dir, checksum);
                    Some(dir.join(format!("{}.filecontent", checksum.remainder())))
                } else {
                    None
                };
                Ok(LooseFile::Archive {
                    header,
                    content_path,
                })
            }
        }
    }

    /// Resolve a `FILE` object to a `(header, content)` pair regardless of
    /// storage mode: in archive mode this just decodes the stored header
    /// and reads its `.filecontent` sibling, but in bare mode there is no
    /// stored header at all, so one is reconstructed from the real file's
    /// own POSIX metadata and xattrs -- the inverse of how
    /// `commit::stage_real_file` built it in the first place.
    pub fn load_file_full(&self, checksum: &Checksum) -> Result<(FileHeader, Vec<u8>)> {
        match self.load_loose_file(checksum)? {
            LooseFile::Bare(path) => {
                let meta = fs::symlink_metadata(&path).with_path(&path)?;
                let kind = crate::commit::file_kind_of(meta.file_type());
                let xattrs = crate::commit::xattrs_of(&path)?;
                let (symlink_target, content) = match kind {
                    FileKind::Regular => (Vec::new(), fs::read(&path).with_path(&path)?),
                    FileKind::Symlink => {
                        use std::os::unix::ffi::OsStrExt;
                        let target = fs::read_link(&path).with_path(&path)?;
                        (target.as_os_str().as_bytes().to_vec(), Vec::new())
                    }
                    FileKind::CharDevice | FileKind::BlockDevice | FileKind::Fifo | FileKind::Socket => {
                        (Vec::new(), Vec::new())
                    }
                };
                let header = FileHeader {
                    kind,
                    mode: meta.mode(),
                    uid: meta.uid(),
                    gid: meta.gid(),
                    rdev: meta.rdev(),
                    symlink_target,
                    content_length: content.len() as u64,
                    xattrs,
                };
                Ok((header, content))
            }
            LooseFile::Archive { header, content_path } => {
                let content = match content_path {
                    Some(path) => fs::read(&path).with_path(&path)?,
                    None => Vec::new(),
                };
                Ok((header, content))
            }
        }
    }

    /// Locate a loose regular-file path suitable as a hardlink source for
    /// `checksum`, or `None` if the object is absent loose or is not a
    /// plain regular file. Symlinks are deliberately excluded even when
    /// present loose: hardlinking them would pin an unbounded number of
    /// links to whatever they point at.
    pub fn hardlink_candidate(&self, checksum: &Checksum) -> Result<Option<PathBuf>> {
        match self.mode {
            StorageMode::Bare => {
                let dir = layout::shard_dir(&self.objects_dir, checksum);
                let path = dir.join(checksum.remainder());
                match fs::symlink_metadata(&path) {
                    Ok(meta) if meta.file_type().is_file() => Ok(Some(path)),
                    Ok(_) => Ok(None),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(Error::io(path, e)),
                }
            }
            StorageMode::Archive => match self.load_loose_file(checksum) {
                Ok(LooseFile::Archive {
                    header,
                    content_path: Some(content_path),
                }) if header.kind == FileKind::Regular => Ok(Some(content_path)),
                Ok(_) => Ok(None),
                Err(Error::Io { .. }) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    /// Walk every loose `FILE` object and record the `(device, inode)` of
    /// each onto its checksum. Used to build the devino cache that lets a
    /// checkout-turned-commit skip rehashing files it already knows about.
    ///
    /// Only meaningful in bare mode: archive-mode loose objects do not carry
    /// real POSIX ownership, so their device/inode numbers are irrelevant
    /// for this optimization.
    pub fn scan_loose_devino(&self) -> Result<Vec<((u64, u64), Checksum)>> {
        let mut out = Vec::new();
        if self.mode != StorageMode::Bare {
            return Ok(out);
        }
        let read_dir = match fs::read_dir(&self.objects_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Error::io(&self.objects_dir, e)),
        };
        for shard_entry in read_dir {
            let shard_entry = shard_entry.with_path(&self.objects_dir)?;
            let shard_path = shard_entry.path();
            if !shard_path.is_dir() {
                continue;
            }
            let shard_name = match shard_path.file_name().and_then(|n| n.to_str()) {
                Some(n) if n.len() == 2 && n.bytes().all(|b| b.is_ascii_hexdigit()) => n,
                _ => continue,
            };
            for obj_entry in fs::read_dir(&shard_path).with_path(&shard_path)? {
                let obj_entry = obj_entry.with_path(&shard_path)?;
                let path = obj_entry.path();
                let stem = match path.file_name().and_then(|n| n.to_str()) {
                    Some(n) if n.len() == 62 && n.bytes().all(|b| b.is_ascii_hexdigit()) => n,
                    _ => continue,
                };
                let hex = format!("{}{}", shard_name, stem);
                let checksum = match Checksum::from_hex(&hex) {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                let meta = fs::symlink_metadata(&path).with_path(&path)?;
                out.push(((meta.dev(), meta.ino()), checksum));
            }
        }
        Ok(out)
    }

    /// Enumerate every loose object under `objects/`, regardless of type,
    /// by walking all 256 shard directories. A shard entry
    /// with a recognized metadata extension is classified directly; any
    /// other entry is treated as a `FILE` object (bare-mode files carry no
    /// extension, and archive-mode file headers use `.file`).
    pub fn list_loose(&self) -> Result<Vec<(Checksum, ObjectType)>> {
        let mut out = Vec::new();
        let read_dir = match fs::read_dir(&self.objects_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Error::io(&self.objects_dir, e)),
        };
        for shard_entry in read_dir {
            let shard_entry = shard_entry.with_path(&self.objects_dir)?;
            let shard_path = shard_entry.path();
            if !shard_path.is_dir() {
                continue;
            }
            let shard_name = match shard_path.file_name().and_then(|n| n.to_str()) {
                Some(n) if n.len() == 2 && n.bytes().all(|b| b.is_ascii_hexdigit()) => n,
                _ => continue,
            };
            for obj_entry in fs::read_dir(&shard_path).with_path(&shard_path)? {
                let obj_entry = obj_entry.with_path(&shard_path)?;
                let path = obj_entry.path();
                let file_name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(n) => n,
                    None => continue,
                };
                let (stem, object_type) = match file_name.split_once('.') {
                    Some((stem, "dirmeta")) => (stem, ObjectType::DirMeta),
                    Some((stem, "dirtree")) => (stem, ObjectType::DirTree),
                    Some((stem, "commit")) => (stem, ObjectType::Commit),
                    Some((stem, "file")) => (stem, ObjectType::File),
                    Some((_, "filecontent")) | Some((_, "tmp")) => continue,
                    None => (file_name, ObjectType::File),
                    _ => continue,
                };
                if stem.len() != 62 || !stem.bytes().all(|b| b.is_ascii_hexdigit()) {
                    continue;
                }
                let hex = format!("{}{}", shard_name, stem);
                if let Ok(checksum) = Checksum::from_hex(&hex) {
                    out.push((checksum, object_type));
                }
            }
        }
        Ok(out)
    }

    /// Begin a transaction, creating a fresh scratch directory under `tmp/`.
    /// The scratch directory is deliberately not auto-deleted on drop: a
    /// crash mid-transaction leaves it behind as an orphaned temp file,
    /// which is the accepted behavior documented in `SPEC_FULL.md` §9.
    pub fn begin_transaction(&self) -> Result<Transaction<'_>> {
        let scratch_dir = tempfile::Builder::new()
            .prefix("transaction-")
            .rand_bytes(12)
            .tempdir_in(&self.tmp_dir)
            .with_path(&self.tmp_dir)?
            .into_path();
        Ok(Transaction {
            store: self,
            scratch_dir,
            next_tmp_id: AtomicU64::new(0),
            stats: TransactionStats::default(),
        })
    }
}

/// A single staging transaction. Objects are content-addressed, so each
/// `stage_*` call installs its object into `objects/` as soon as it is
/// written -- there is no deferred, all-or-nothing install. `commit` and
/// `abort` differ only in how they dispose of the transaction's own scratch
/// directory and in the stats they report.
pub struct Transaction<'a> {
    store: &'a ObjectStore,
    scratch_dir: PathBuf,
    next_tmp_id: AtomicU64,
    stats: TransactionStats,
}

impl<'a> Transaction<'a> {
    fn new_tmp_path(&self) -> PathBuf {
        let id = self.next_tmp_id.fetch_add(1, Ordering::Relaxed);
        self.scratch_dir.join(format!("obj-{:08x}", id))
    }

    /// Stats accumulated so far in this transaction.
    pub fn stats(&self) -> TransactionStats {
        self.stats
    }

    /// Stage a `DIR_META` object.
    pub fn stage_dir_meta(&mut self, meta: &DirMeta) -> Result<StagedObject> {
        let checksum = meta.checksum();
        self.stage_metadata_bytes(checksum, ObjectType::DirMeta, &meta.encode())
    }

    /// Stage a `DIR_TREE` object.
    pub fn stage_dir_tree(&mut self, tree: &DirTree) -> Result<StagedObject> {
        let checksum = tree.checksum();
        self.stage_metadata_bytes(checksum, ObjectType::DirTree, &tree.encode())
    }

    /// Stage a `COMMIT` object.
    pub fn stage_commit(&mut self, commit: &Commit) -> Result<StagedObject> {
        let checksum = commit.checksum();
        self.stage_metadata_bytes(checksum, ObjectType::Commit, &commit.encode())
    }

    fn stage_metadata_bytes(
        &mut self,
        checksum: Checksum,
        object_type: ObjectType,
        bytes: &[u8],
    ) -> Result<StagedObject> {
        if self.store.has_loose_metadata(&checksum, object_type)? {
            self.stats.objects_deduplicated += 1;
            return Ok(StagedObject {
                checksum,
                was_new: false,
            });
        }
        let tmp_path = self.new_tmp_path();
        write_new_file(&tmp_path, bytes)?;
        let dest = layout::metadata_object_path(self.store.objects_dir(), &checksum, object_type);
        install(&tmp_path, &dest)?;
        self.stats.objects_written += 1;
        Ok(StagedObject {
            checksum,
            was_new: true,
        })
    }

    /// Stage a `FILE` object: a header (mode/uid/gid/rdev/symlink
    /// target/xattrs) plus, for regular files, a content stream read from
    /// `content`. The checksum is computed over the header bytes followed
    /// by the content bytes, identically in both storage modes.
    pub fn stage_file<R: Read>(&mut self, header: FileHeader, content: R) -> Result<StagedObject> {
        self.stage_file_impl(header, content, None)
    }

    /// Stage a `FILE` object the same way [`Self::stage_file`] does, but
    /// verify the content actually hashes to `claimed_checksum` before
    /// installing anything. If it does not, returns
    /// `Error::CorruptedObject{expected, actual}`, leaves no temp residue,
    /// and the object is never written under `objects/`.
    pub fn stage_file_trusted<R: Read>(
        &mut self,
        claimed_checksum: Checksum,
        header: FileHeader,
        content: R,
    ) -> Result<StagedObject> {
        self.stage_file_impl(header, content, Some(claimed_checksum))
    }

    fn stage_file_impl<R: Read>(
        &mut self,
        mut header: FileHeader,
        mut content: R,
        claimed_checksum: Option<Checksum>,
    ) -> Result<StagedObject> {
        // First pass: stream content to a temp file, discovering its true
        // length (the caller is not required to know it up front).
        let content_tmp_path = if header.kind.has_content() {
            Some(self.new_tmp_path())
        } else {
            None
        };
        let mut content_len: u64 = 0;
        if let Some(tmp_path) = &content_tmp_path {
            let mut out = File::create(tmp_path).with_path(tmp_path)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = content.read(&mut buf).with_path(tmp_path)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).with_path(tmp_path)?;
                content_len += n as u64;
            }
            out.sync_all().with_path(tmp_path)?;
        }
        header.content_length = content_len;

        // Second pass: hash the final header (with the true content length
        // baked in) followed by the content bytes.
        let mut hasher = Sha256::new();
        hasher.update(&header.encode());
        if let Some(tmp_path) = &content_tmp_path {
            let mut f = File::open(tmp_path).with_path(tmp_path)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = f.read(&mut buf).with_path(tmp_path)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        let checksum = Checksum::from_bytes(hasher.finalize().into());

        if let Some(expected) = claimed_checksum {
            if checksum != expected {
                if let Some(tmp_path) = &content_tmp_path {
                    let _ = fs::remove_file(tmp_path);
                }
                return Err(Error::CorruptedObject {
                    expected,
                    actual: checksum,
                });
            }
        }

        if self.store.has_loose_file(&checksum)? {
            self.stats.objects_deduplicated += 1;
            if let Some(tmp_path) = &content_tmp_path {
                let _ = fs::remove_file(tmp_path);
            }
            return Ok(StagedObject {
                checksum,
                was_new: false,
            });
        }

        match self.store.mode {
            StorageMode::Bare => {
                self.install_bare_file(&header, content_tmp_path.as_deref(), &checksum)?;
            }
            StorageMode::Archive => {
                self.install_archive_file(&header, content_tmp_path.as_deref(), &checksum)?;
            }
        }
        self.stats.objects_written += 1;
        self.stats.content_bytes_written += content_len;
        Ok(StagedObject {
            checksum,
            was_new: true,
        })
    }

    fn install_bare_file(
        &self,
        header: &FileHeader,
        content_tmp: Option<&Path>,
        checksum: &Checksum,
    ) -> Result<()> {
        let dest = match layout::file_object_path(
            self.store.objects_dir(),
            checksum,
            StorageMode::Bare,
            header.kind,
        ) {
            FileObjectPath::Bare(p) => p,
            FileObjectPath::Archive { .. } => unreachable!("bare mode always yields Bare"),
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        match header.kind {
            FileKind::Regular => {
                let tmp = content_tmp.expect("regular file must have content");
                apply_regular_file_attrs(tmp, header)?;
                install(tmp, &dest)?;
            }
            FileKind::Symlink => {
                let target = String::from_utf8_lossy(&header.symlink_target).into_owned();
                create_symlink_at(&target, &dest)?;
            }
            FileKind::CharDevice | FileKind::BlockDevice | FileKind::Fifo | FileKind::Socket => {
                create_special_file(&dest, header)?;
            }
        }
        apply_xattrs(&dest, &header.xattrs, header.kind == FileKind::Symlink)?;
        Ok(())
    }

    fn install_archive_file(
        &self,
        header: &FileHeader,
        content_tmp: Option<&Path>,
        checksum: &Checksum,
    ) -> Result<()> {
        let (header_dest, content_dest) = match layout::file_object_path(
            self.store.objects_dir(),
            checksum,
            StorageMode::Archive,
            header.kind,
        ) {
            FileObjectPath::Archive { header, content } => (header, content),
            FileObjectPath::Bare(_) => unreachable!("archive mode always yields Archive"),
        };
        if let Some(parent) = header_dest.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        // Archive headers always strip setuid/setgid bits so that checking
        // out content later never hands out elevated file modes regardless
        // of who owns the repository ("Don't make setuid files in the
        // repository", ostree-repo.c).
        let mut stripped = header.clone();
        stripped.mode &= !(libc::S_ISUID | libc::S_ISGID) as u32;
        let header_tmp = self.new_tmp_path();
        write_new_file(&header_tmp, &stripped.encode())?;
        install(&header_tmp, &header_dest)?;

        if let Some(tmp) = content_tmp {
            install(tmp, &content_dest)?;
        }
        Ok(())
    }

    /// Finish the transaction successfully, removing the now-empty scratch
    /// directory.
    pub fn commit(self) -> Result<TransactionStats> {
        let stats = self.stats;
        let _ = fs::remove_dir_all(&self.scratch_dir);
        Ok(stats)
    }

    /// Abandon the transaction, removing every temp file it created. Any
    /// objects already installed into `objects/` remain -- they are
    /// content-addressed and valid regardless of which transaction wrote
    /// them first.
    pub fn abort(self) -> Result<()> {
        fs::remove_dir_all(&self.scratch_dir).or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Ok(())
            } else {
                Err(Error::io(&self.scratch_dir, e))
            }
        })
    }
}

fn path_exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(path, e)),
    }
}

fn write_new_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }
    let mut f = File::create(path).with_path(path)?;
    f.write_all(bytes).with_path(path)?;
    f.sync_all().with_path(path)?;
    Ok(())
}

/// Move `tmp` into `dest`, creating `dest`'s parent directory if needed and
/// tolerating a concurrent writer that beat us to the same content-addressed
/// path. Uses `link` + unlink rather than `rename` so two transactions
/// racing to install the same object both succeed instead of one clobbering
/// the other mid-write (`ostree_repo_commit_staged_file`, `ostree-repo.c`).
fn install(tmp: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }
    match fs::hard_link(tmp, dest) {
        Ok(()) => {
            fs::remove_file(tmp).with_path(tmp)?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // Another transaction (or an earlier stage in this one) already
            // installed this exact content-addressed object; ours is
            // redundant.
            let _ = fs::remove_file(tmp);
            Ok(())
        }
        Err(e) => {
            // Cross-device tmp/objects (unusual, but not this crate's to
            // forbid) falls back to a plain rename.
            if e.raw_os_error() == Some(libc::EXDEV) {
                fs::rename(tmp, dest).with_path(dest)?;
                Ok(())
            } else {
                Err(Error::io(dest, e))
            }
        }
    }
}

pub(crate) fn apply_regular_file_attrs(path: &Path, header: &FileHeader) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perm = fs::Permissions::from_mode(header.mode);
    fs::set_permissions(path, perm).with_path(path)?;
    chown(path, header.uid, header.gid)?;
    Ok(())
}

pub(crate) fn create_symlink_at(target: &str, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, dest).with_path(dest)
}

pub(crate) fn create_special_file(dest: &Path, header: &FileHeader) -> Result<()> {
    let path_c = std::ffi::CString::new(dest.as_os_str().to_string_lossy().as_bytes())
        .map_err(|_| Error::InvalidFormat {
            context: "file object path".into(),
            detail: "path contains a NUL byte".into(),
        })?;
    let file_type_bits: libc::mode_t = match header.kind {
        FileKind::CharDevice => libc::S_IFCHR,
        FileKind::BlockDevice => libc::S_IFBLK,
        FileKind::Fifo => libc::S_IFIFO,
        FileKind::Socket => libc::S_IFSOCK,
        FileKind::Regular | FileKind::Symlink => unreachable!(),
    };
    let mode = (header.mode & 0o7777) as libc::mode_t | file_type_bits;
    let rc = unsafe { libc::mknod(path_c.as_ptr(), mode, header.rdev as libc::dev_t) };
    if rc != 0 {
        return Err(Error::io(dest, std::io::Error::last_os_error()));
    }
    chown(dest, header.uid, header.gid)?;
    Ok(())
}

pub(crate) fn chown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let path_c = std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes())
        .map_err(|_| Error::InvalidFormat {
            context: "file object path".into(),
            detail: "path contains a NUL byte".into(),
        })?;
    let rc = unsafe { libc::lchown(path_c.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // Running unprivileged (no CAP_CHOWN) is common in tests and CI;
        // treat EPERM as best-effort rather than fatal.
        if err.raw_os_error() != Some(libc::EPERM) {
            return Err(Error::io(path, err));
        }
    }
    Ok(())
}

pub(crate) fn apply_xattrs(path: &Path, xattrs: &Xattrs, is_symlink: bool) -> Result<()> {
    if is_symlink {
        // Most platforms cannot set xattrs on a symlink itself; silently
        // skip rather than fail the whole checkout over it.
        return Ok(());
    }
    for (name, value) in xattrs.iter() {
        xattr::set(path, name, value).with_path(path)?;
    }
    Ok(())
}
