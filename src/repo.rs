//! The top-level repository type tying every subsystem together: object
//! store, pack engine, reference namespace, configuration, and (optionally)
//! a parent repository chained for reads.
//!
//! One facade type owns the lower-level pieces and exposes the operations
//! callers actually need, rather than asking every caller to wire up the
//! object store, pack engine, and ref store themselves.

use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use log::{info, warn};

use crate::cancel::CancellationToken;
use crate::checkout::{self, CheckoutMode, CheckoutOptions, ObjectSource};
use crate::checksum::Checksum;
use crate::commit::{self, CommitFilter, DevinoCache};
use crate::config::{Config, RemoteConfig};
use crate::error::{Error, Result};
use crate::mtree::MutableTree;
use crate::objects::{
    Commit, DirMeta, DirTree, FileHeader, ObjectStore, ObjectType, StorageMode,
};
use crate::pack::{PackEngine, PackIndex, SuperIndex};
use crate::refs::RefStore;
use crate::remote_cache::{RemotePackCache, ResyncResult};

/// Which population of objects [`Repo::list_objects`] should enumerate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListScope {
    LooseOnly,
    PackedOnly,
    All,
}

/// A content-addressed object repository: the composition of an
/// [`ObjectStore`], a [`PackEngine`], a [`RefStore`], this repository's own
/// [`Config`], and an optional parent repository chained for reads.
pub struct Repo {
    root: PathBuf,
    config: Config,
    objects: ObjectStore,
    packs: PackEngine,
    refs: RefStore,
    parent: Option<Box<Repo>>,
}

impl Repo {
    /// Create a brand new repository at `root`, which must not already
    /// contain a `config` file.
    pub fn create(root: &Path, mode: StorageMode) -> Result<Repo> {
        if Config::load_if_exists(root)?.is_some() {
            return Err(Error::InvalidConfig {
                detail: format!("{} already contains a repository", root.display()),
            });
        }
        let config = match mode {
            StorageMode::Bare => Config::default_bare(),
            StorageMode::Archive => Config::default_archive(),
        };
        Repo::initialize(root, config)
    }

    /// Create a new repository at `root` chained to the repository at
    /// `parent_root` for reads.
    pub fn create_with_parent(root: &Path, mode: StorageMode, parent_root: &Path) -> Result<Repo> {
        if Config::load_if_exists(root)?.is_some() {
            return Err(Error::InvalidConfig {
                detail: format!("{} already contains a repository", root.display()),
            });
        }
        let mut config = match mode {
            StorageMode::Bare => Config::default_bare(),
            StorageMode::Archive => Config::default_archive(),
        };
        config.parent = Some(parent_root.to_path_buf());
        Repo::initialize(root, config)
    }

    fn initialize(root: &Path, config: Config) -> Result<Repo> {
        std::fs::create_dir_all(root).map_err(|e| Error::io(root, e))?;
        config.write(root)?;
        info!("repo: created at {} (mode {:?})", root.display(), config.mode);
        Repo::open(root)
    }

    /// Open an existing repository at `root`, recursively opening its
    /// parent chain if `config.parent` is set.
    pub fn open(root: &Path) -> Result<Repo> {
        let config = Config::load(root)?;
        let objects = ObjectStore::open(root, config.mode)?;
        let packs = PackEngine::open(root)?;
        let refs = RefStore::open(root, config.mode == StorageMode::Archive)?;
        let parent = match &config.parent {
            Some(parent_root) => Some(Box::new(Repo::open(parent_root)?)),
            None => None,
        };
        Ok(Repo {
            root: root.to_path_buf(),
            config,
            objects,
            packs,
            refs,
            parent,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> StorageMode {
        self.config.mode
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn parent(&self) -> Option<&Repo> {
        self.parent.as_deref()
    }

    /// Persist `config` (replacing this repository's in-memory copy) to
    /// disk.
    pub fn write_config(&mut self, config: Config) -> Result<()> {
        config.write(&self.root)?;
        self.config = config;
        Ok(())
    }

    /// Copy this repository's configuration verbatim into a freshly
    /// created, not-yet-opened repository directory.
    pub fn copy_config(&self, dest_root: &Path) -> Result<()> {
        self.config.copy_to(dest_root)
    }

    pub fn add_remote(&mut self, name: &str, remote: RemoteConfig) -> Result<()> {
        let mut config = self.config.clone();
        config.remotes.insert(name.to_string(), remote);
        self.write_config(config)
    }

    /// Begin a staging transaction, together with a devino cache built from
    /// this repository's own loose objects and every ancestor's.
    pub fn prepare_transaction(&self) -> Result<(crate::objects::Transaction<'_>, DevinoCache)> {
        let mut stores = vec![&self.objects];
        let mut cursor = self.parent.as_deref();
        while let Some(repo) = cursor {
            stores.push(&repo.objects);
            cursor = repo.parent.as_deref();
        }
        let devino = DevinoCache::build(&stores)?;
        let tx = self.objects.begin_transaction()?;
        Ok((tx, devino))
    }

    fn has_object_local(&self, checksum: &Checksum, object_type: ObjectType) -> Result<bool> {
        if object_type.prefers_packed_lookup() {
            if self.packs.find_object_in_packs(checksum, object_type)?.is_some() {
                return Ok(true);
            }
            self.objects.has_loose_metadata(checksum, object_type)
        } else {
            if self.objects.has_loose_file(checksum)? {
                return Ok(true);
            }
            Ok(self.packs.find_object_in_packs(checksum, object_type)?.is_some())
        }
    }

    /// Whether `checksum` (of kind `object_type`) is present locally or
    /// anywhere in the parent chain. Never considers remote-cache packs --
    /// those must be explicitly resynced and pulled first.
    pub fn has_object(&self, checksum: &Checksum, object_type: ObjectType) -> Result<bool> {
        if self.has_object_local(checksum, object_type)? {
            return Ok(true);
        }
        match &self.parent {
            Some(parent) => parent.has_object(checksum, object_type),
            None => Ok(false),
        }
    }

    fn load_metadata_bytes_local(
        &self,
        checksum: &Checksum,
        object_type: ObjectType,
    ) -> Result<Option<Vec<u8>>> {
        let prefer_packed = object_type.prefers_packed_lookup();
        let try_packed = |repo: &Repo| -> Result<Option<Vec<u8>>> {
            match repo.packs.find_object_in_packs(checksum, object_type)? {
                Some(location) => Ok(Some(repo.packs.read_pack_entry(&location, true)?)),
                None => Ok(None),
            }
        };
        let try_loose = |repo: &Repo| -> Result<Option<Vec<u8>>> {
            if repo.objects.has_loose_metadata(checksum, object_type)? {
                Ok(Some(repo.objects.load_loose_metadata_bytes(checksum, object_type)?))
            } else {
                Ok(None)
            }
        };
        if prefer_packed {
            if let Some(bytes) = try_packed(self)? {
                return Ok(Some(bytes));
            }
            try_loose(self)
        } else {
            if let Some(bytes) = try_loose(self)? {
                return Ok(Some(bytes));
            }
            try_packed(self)
        }
    }

    fn load_metadata_bytes(&self, checksum: &Checksum, object_type: ObjectType) -> Result<Vec<u8>> {
        if let Some(bytes) = self.load_metadata_bytes_local(checksum, object_type)? {
            return Ok(bytes);
        }
        if let Some(parent) = &self.parent {
            return parent.load_metadata_bytes(checksum, object_type);
        }
        Err(Error::not_found(object_type.loose_ext(), checksum.to_hex()))
    }

    pub fn load_dir_meta(&self, checksum: &Checksum) -> Result<DirMeta> {
        DirMeta::decode(&self.load_metadata_bytes(checksum, ObjectType::DirMeta)?)
    }

    pub fn load_dir_tree(&self, checksum: &Checksum) -> Result<DirTree> {
        DirTree::decode(&self.load_metadata_bytes(checksum, ObjectType::DirTree)?)
    }

    pub fn load_commit(&self, checksum: &Checksum) -> Result<Commit> {
        Commit::decode(&self.load_metadata_bytes(checksum, ObjectType::Commit)?)
    }

    fn load_file_local(&self, checksum: &Checksum) -> Result<Option<(FileHeader, Vec<u8>)>> {
        if self.objects.has_loose_file(checksum)? {
            return Ok(Some(self.objects.load_file_full(checksum)?));
        }
        if let Some(location) = self.packs.find_object_in_packs(checksum, ObjectType::File)? {
            let bytes = self.packs.read_pack_entry(&location, true)?;
            let (header, content) = FileHeader::parse(&bytes)?;
            return Ok(Some((header, content.to_vec())));
        }
        Ok(None)
    }

    /// Load a `FILE` object's header and content bytes, preferring loose
    /// storage over packs and falling through the parent chain.
    pub fn load_file(&self, checksum: &Checksum) -> Result<(FileHeader, Vec<u8>)> {
        if let Some(result) = self.load_file_local(checksum)? {
            return Ok(result);
        }
        if let Some(parent) = &self.parent {
            return parent.load_file(checksum);
        }
        Err(Error::not_found("file", checksum.to_hex()))
    }

    /// Enumerate every object this repository (not its parent) knows about.
    pub fn list_objects(&self, scope: ListScope) -> Result<Vec<(Checksum, ObjectType)>> {
        let mut out = Vec::new();
        if matches!(scope, ListScope::LooseOnly | ListScope::All) {
            out.extend(self.objects.list_loose()?);
        }
        if matches!(scope, ListScope::PackedOnly | ListScope::All) {
            out.extend(self.packs.list_packed()?);
        }
        Ok(out)
    }

    /// Resolve a revision string the same way [`RefStore::resolve_rev`]
    /// does, but with `^`-walks and fallback falling through to the parent
    /// repository chain when nothing local matches. When nothing resolves
    /// anywhere in the chain: `Ok(None)` if `allow_missing`, otherwise
    /// `Err(Error::NotFound)`.
    pub fn resolve_rev(&self, name: &str, allow_missing: bool) -> Result<Option<Checksum>> {
        let resolved = self.resolve_rev_chain(name)?;
        if resolved.is_none() && !allow_missing {
            return Err(Error::not_found("rev", name));
        }
        Ok(resolved)
    }

    fn resolve_rev_chain(&self, name: &str) -> Result<Option<Checksum>> {
        let resolved = self.refs.resolve_rev(name, |checksum| self.commit_parent(checksum))?;
        if resolved.is_some() {
            return Ok(resolved);
        }
        match &self.parent {
            Some(parent) => parent.resolve_rev_chain(name),
            None => Ok(None),
        }
    }

    fn commit_parent(&self, checksum: &Checksum) -> Result<Option<Checksum>> {
        match self.load_commit(checksum) {
            Ok(commit) => Ok(commit.parent),
            Err(Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn list_refs(&self) -> Result<Vec<(String, Checksum)>> {
        self.refs.list_refs()
    }

    pub fn list_remote_refs(&self, remote: &str) -> Result<Vec<(String, Checksum)>> {
        self.refs.list_remote_refs(remote)
    }

    pub fn write_ref(&self, remote: Option<&str>, name: &str, checksum: &Checksum) -> Result<()> {
        self.refs.write_ref(remote, name, checksum)
    }

    pub fn delete_ref(&self, remote: Option<&str>, name: &str) -> Result<()> {
        self.refs.delete_ref(remote, name)
    }

    /// Stage a real directory into a commit, returning the new commit's
    /// checksum. A thin convenience wrapper around the lower-level
    /// `commit` module that owns the transaction's full lifecycle.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_directory<F: CommitFilter>(
        &self,
        dir: &Path,
        filter: &F,
        parent_commit: Option<Checksum>,
        subject: &str,
        body: Option<&str>,
        metadata: Vec<(String, Vec<u8>)>,
        related_objects: Vec<Checksum>,
        timestamp: u64,
        cancel: &CancellationToken,
    ) -> Result<Checksum> {
        let (mut tx, devino) = self.prepare_transaction()?;
        let mut mtree = MutableTree::new();
        commit::stage_directory_to_mtree(&mut tx, dir, &mut mtree, filter, &devino, cancel, "")?;
        let (root_contents, root_metadata) = commit::seal_mtree(&mut tx, &mut mtree)?;
        let commit_checksum = commit::stage_commit(
            &mut tx,
            root_contents,
            root_metadata,
            parent_commit,
            subject,
            body,
            metadata,
            related_objects,
            timestamp,
        )?;
        let stats = tx.commit()?;
        let when = Utc
            .timestamp_opt(timestamp as i64, 0)
            .single()
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| timestamp.to_string());
        info!(
            "repo: committed {} at {} ({} objects written, {} deduplicated)",
            commit_checksum.to_hex(),
            when,
            stats.objects_written,
            stats.objects_deduplicated
        );
        Ok(commit_checksum)
    }

    /// Stage the contents of a tar archive into a commit.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_archive<R: std::io::Read>(
        &self,
        archive: &mut tar::Archive<R>,
        parent_commit: Option<Checksum>,
        subject: &str,
        body: Option<&str>,
        metadata: Vec<(String, Vec<u8>)>,
        related_objects: Vec<Checksum>,
        timestamp: u64,
    ) -> Result<Checksum> {
        let (mut tx, _devino) = self.prepare_transaction()?;
        let mut mtree = MutableTree::new();
        commit::stage_archive_to_mtree(&mut tx, archive, &mut mtree)?;
        let (root_contents, root_metadata) = commit::seal_mtree(&mut tx, &mut mtree)?;
        let commit_checksum = commit::stage_commit(
            &mut tx,
            root_contents,
            root_metadata,
            parent_commit,
            subject,
            body,
            metadata,
            related_objects,
            timestamp,
        )?;
        tx.commit()?;
        Ok(commit_checksum)
    }

    /// The root `(contents_checksum, metadata_checksum)` pair of a commit,
    /// ready to pass to [`Self::checkout_tree`] -- the "virtual directory"
    /// a commit exposes without ever materializing it.
    pub fn read_commit_root(&self, commit_checksum: &Checksum) -> Result<(Checksum, Checksum)> {
        let commit = self.load_commit(commit_checksum)?;
        Ok((commit.root_contents_checksum, commit.root_metadata_checksum))
    }

    /// Materialize a commit onto the real filesystem at `destination`.
    pub fn checkout_commit(
        &self,
        commit_checksum: &Checksum,
        destination: &Path,
        options: &CheckoutOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (contents, metadata) = self.read_commit_root(commit_checksum)?;
        self.checkout_tree(&contents, &metadata, destination, options, cancel)
    }

    /// Materialize an arbitrary `(contents, metadata)` tree pair onto the
    /// real filesystem.
    pub fn checkout_tree(
        &self,
        contents_checksum: &Checksum,
        metadata_checksum: &Checksum,
        destination: &Path,
        options: &CheckoutOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        checkout::checkout_tree(self, contents_checksum, metadata_checksum, destination, options, cancel)
    }

    pub fn list_pack_indexes(&self) -> Result<(Vec<Checksum>, Vec<Checksum>)> {
        self.packs.list_pack_indexes()
    }

    pub fn load_pack_index(&self, checksum: &Checksum, is_meta: bool) -> Result<std::sync::Arc<PackIndex>> {
        self.packs.load_pack_index(checksum, is_meta)
    }

    pub fn regenerate_pack_index(&self) -> Result<()> {
        self.packs.regenerate_super_index()
    }

    pub fn add_pack_file(
        &self,
        pack_checksum: &Checksum,
        is_meta: bool,
        index_src: &Path,
        data_src: &Path,
    ) -> Result<()> {
        self.packs.add_pack_file(pack_checksum, is_meta, index_src, data_src)?;
        self.packs.regenerate_super_index()
    }

    /// Open (creating if needed) the lookaside pack cache for `remote`.
    pub fn remote_cache(&self, remote: &str) -> Result<RemotePackCache> {
        RemotePackCache::open(&self.root, remote)
    }

    /// Reconcile `remote`'s lookaside cache against a freshly fetched
    /// super-index.
    pub fn resync_remote(&self, remote: &str, new_super_index: &SuperIndex) -> Result<ResyncResult> {
        self.remote_cache(remote)?.resync(new_super_index)
    }

    /// Verify that every checksum reachable from a local ref resolves,
    /// transitively, to objects that are actually present, the same check
    /// `ostree_repo_fsck` performs by walking `ostree_repo_list_objects`.
    pub fn fsck(&self) -> Result<FsckReport> {
        let mut report = FsckReport::default();
        let mut visited = std::collections::HashSet::new();
        for (name, checksum) in self.list_refs()? {
            let mut cursor = Some(checksum);
            while let Some(commit_checksum) = cursor {
                if !visited.insert(commit_checksum) {
                    break;
                }
                match self.check_commit(&commit_checksum, &mut visited) {
                    Ok(()) => report.commits_checked += 1,
                    Err(e) => {
                        warn!("fsck: ref {:?} -> commit {} failed: {}", name, commit_checksum, e);
                        report.errors.push(format!("{}: {}", commit_checksum, e));
                    }
                }
                cursor = match self.load_commit(&commit_checksum) {
                    Ok(commit) => commit.parent,
                    Err(_) => None,
                };
            }
        }
        Ok(report)
    }

    fn check_commit(
        &self,
        checksum: &Checksum,
        visited: &mut std::collections::HashSet<Checksum>,
    ) -> Result<()> {
        let commit = self.load_commit(checksum)?;
        self.check_dir_meta(&commit.root_metadata_checksum)?;
        self.check_dir_tree(&commit.root_contents_checksum, visited)
    }

    fn check_dir_meta(&self, checksum: &Checksum) -> Result<()> {
        self.load_dir_meta(checksum).map(|_| ())
    }

    fn check_dir_tree(&self, checksum: &Checksum, visited: &mut std::collections::HashSet<Checksum>) -> Result<()> {
        if !visited.insert(*checksum) {
            return Ok(());
        }
        let tree = self.load_dir_tree(checksum)?;
        for file in &tree.files {
            if !self.has_object(&file.checksum, ObjectType::File)? {
                return Err(Error::not_found("file", file.checksum.to_hex()));
            }
        }
        for subdir in &tree.subdirs {
            self.check_dir_meta(&subdir.metadata_checksum)?;
            self.check_dir_tree(&subdir.contents_checksum, visited)?;
        }
        Ok(())
    }
}

/// Summary produced by [`Repo::fsck`].
#[derive(Clone, Debug, Default)]
pub struct FsckReport {
    pub commits_checked: u64,
    pub errors: Vec<String>,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

impl ObjectSource for Repo {
    fn load_dir_meta(&self, checksum: &Checksum) -> Result<DirMeta> {
        Repo::load_dir_meta(self, checksum)
    }

    fn load_dir_tree(&self, checksum: &Checksum) -> Result<DirTree> {
        Repo::load_dir_tree(self, checksum)
    }

    fn load_file(&self, checksum: &Checksum) -> Result<(FileHeader, Vec<u8>)> {
        Repo::load_file(self, checksum)
    }

    fn hardlink_candidate(&self, checksum: &Checksum, mode: CheckoutMode) -> Result<Option<PathBuf>> {
        let eligible = match self.config.mode {
            StorageMode::Bare => mode == CheckoutMode::None,
            StorageMode::Archive => mode == CheckoutMode::User,
        };
        if !eligible {
            return Ok(None);
        }
        if let Some(path) = self.objects.hardlink_candidate(checksum)? {
            return Ok(Some(path));
        }
        match &self.parent {
            Some(parent) => parent.hardlink_candidate(checksum, mode),
            None => Ok(None),
        }
    }
}
