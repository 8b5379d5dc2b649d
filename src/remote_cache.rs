//! Per-remote lookaside pack cache: `remote-cache/<remote>/`, holding a
//! locally-cached subset of a remote's packs plus its own copy of the
//! remote's super-index.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::checksum::Checksum;
use crate::error::{Error, IoContext, Result};
use crate::pack::format::{self, SuperIndex};

/// Directory, relative to the repository root, holding every remote's
/// lookaside cache.
pub const REMOTE_CACHE_DIR: &str = "remote-cache";

/// Result of [`RemotePackCache::resync`]: which packs (by kind) are already
/// cached locally, and which still need to be fetched.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResyncResult {
    pub cached_meta: Vec<Checksum>,
    pub cached_data: Vec<Checksum>,
    pub uncached_meta: Vec<Checksum>,
    pub uncached_data: Vec<Checksum>,
}

/// The lookaside cache directory for a single remote.
pub struct RemotePackCache {
    dir: PathBuf,
}

impl RemotePackCache {
    /// Open (creating if needed) the cache directory for `remote` under
    /// `repo_root/remote-cache/<remote>/`.
    pub fn open(repo_root: &Path, remote: &str) -> Result<Self> {
        let dir = repo_root.join(REMOTE_CACHE_DIR).join(remote);
        fs::create_dir_all(&dir).with_path(&dir)?;
        Ok(RemotePackCache { dir })
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index")
    }

    /// Reconcile the cache directory against a freshly fetched super-index:
    /// delete any cached pack not referenced by it, persist the new
    /// super-index, and report which wanted packs are cached vs. still
    /// missing.
    pub fn resync(&self, new_super_index: &SuperIndex) -> Result<ResyncResult> {
        let wanted_meta: BTreeSet<Checksum> = new_super_index
            .meta_packs
            .iter()
            .map(|p| p.pack_checksum)
            .collect();
        let wanted_data: BTreeSet<Checksum> = new_super_index
            .data_packs
            .iter()
            .map(|p| p.pack_checksum)
            .collect();

        let mut cached_meta = BTreeSet::new();
        let mut cached_data = BTreeSet::new();

        for entry in fs::read_dir(&self.dir).with_path(&self.dir)? {
            let entry = entry.with_path(&self.dir)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let (is_meta, checksum) = if let Some(c) = parse_cached_name(&name, "ostmetapack") {
                (true, c)
            } else if let Some(c) = parse_cached_name(&name, "ostdatapack") {
                (false, c)
            } else {
                continue;
            };
            let wanted = if is_meta {
                wanted_meta.contains(&checksum)
            } else {
                wanted_data.contains(&checksum)
            };
            if wanted {
                if is_meta {
                    cached_meta.insert(checksum);
                } else {
                    cached_data.insert(checksum);
                }
            } else {
                let path = entry.path();
                fs::remove_file(&path).with_path(&path)?;
            }
        }

        let uncached_meta: Vec<Checksum> = wanted_meta.difference(&cached_meta).copied().collect();
        let uncached_data: Vec<Checksum> = wanted_data.difference(&cached_data).copied().collect();

        let bytes = new_super_index.encode();
        let tmp = self.index_path().with_extension("tmp");
        fs::write(&tmp, &bytes).with_path(&tmp)?;
        fs::rename(&tmp, self.index_path()).with_path(self.index_path())?;

        Ok(ResyncResult {
            cached_meta: cached_meta.into_iter().collect(),
            cached_data: cached_data.into_iter().collect(),
            uncached_meta,
            uncached_data,
        })
    }

    /// Load the locally cached copy of the remote's super-index, if any has
    /// been persisted by a previous [`Self::resync`].
    pub fn load_cached_super_index(&self) -> Result<Option<SuperIndex>> {
        match fs::read(self.index_path()) {
            Ok(bytes) => Ok(Some(SuperIndex::decode(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(self.index_path(), e)),
        }
    }

    /// Install (or remove, if `src` is `None`) a downloaded pack data file
    /// into the cache under its content-addressed name.
    pub fn take_cached_remote_pack_data(
        &self,
        pack_checksum: &Checksum,
        is_meta: bool,
        src: Option<&Path>,
    ) -> Result<()> {
        let (_, data_name) = format::pack_file_names(pack_checksum, is_meta);
        let dest = self.dir.join(&data_name);
        match src {
            Some(src) => {
                fs::rename(src, &dest).with_path(&dest)?;
            }
            None => {
                match fs::remove_file(&dest) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::io(dest, e)),
                }
            }
        }
        Ok(())
    }

    /// Install a downloaded pack index file into the cache.
    pub fn add_cached_remote_pack_index(
        &self,
        pack_checksum: &Checksum,
        is_meta: bool,
        src: &Path,
    ) -> Result<()> {
        let (index_name, _) = format::pack_file_names(pack_checksum, is_meta);
        let dest = self.dir.join(&index_name);
        fs::rename(src, &dest).with_path(&dest)
    }
}

fn parse_cached_name(name: &str, prefix: &str) -> Option<Checksum> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    let hex = rest.strip_suffix(".index").or_else(|| rest.strip_suffix(".data"))?;
    Checksum::from_hex(hex).ok()
}
