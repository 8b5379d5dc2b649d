//! The pack engine: lists, loads, and searches the pack files and
//! super-index living under `objects/pack/`, and installs newly produced
//! packs.
//!
//! Pack data is memory-mapped with `memmap2` rather than read wholesale, and
//! every index/data cache sits behind a single per-repo mutex rather than
//! one lock per pack -- simple, and cheap enough given packs are read far
//! more often than installed.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use sha2::{Digest, Sha256};

use crate::checksum::Checksum;
use crate::error::{Error, IoContext, Result};
use crate::objects::format::ObjectType;
use crate::pack::format::{self, PackIndex, PackIndexEntry, SuperIndex, SuperIndexPack};

/// Directory, relative to the repository root, holding pack files and the
/// super-index.
pub const PACK_DIR: &str = "objects/pack";

/// Where an object was found by [`PackEngine::find_object`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PackLocation {
    pub pack_checksum: Checksum,
    pub is_meta: bool,
    pub offset: u64,
    /// The checksum of the object itself, as claimed by the index entry
    /// that produced this location -- used by `read_pack_entry`'s optional
    /// verification pass.
    pub object_checksum: Checksum,
}

struct Caches {
    super_index: Option<SuperIndex>,
    indexes: HashMap<(Checksum, bool), Arc<PackIndex>>,
    data_maps: HashMap<(Checksum, bool), Arc<Mmap>>,
}

impl Default for Caches {
    fn default() -> Self {
        Caches {
            super_index: None,
            indexes: HashMap::new(),
            data_maps: HashMap::new(),
        }
    }
}

/// Manages the pack files and super-index under one repository's
/// `objects/pack/` directory. All caches sit behind a single mutex rather
/// than one lock per pack.
pub struct PackEngine {
    pack_dir: PathBuf,
    caches: Mutex<Caches>,
}

impl PackEngine {
    /// Open the pack engine rooted at `<repo>/objects/pack`, creating the
    /// directory if it does not yet exist.
    pub fn open(repo_root: &Path) -> Result<Self> {
        let pack_dir = repo_root.join(PACK_DIR);
        fs::create_dir_all(&pack_dir).with_path(&pack_dir)?;
        Ok(PackEngine {
            pack_dir,
            caches: Mutex::new(Caches::default()),
        })
    }

    fn super_index_path(&self) -> PathBuf {
        self.pack_dir.join("index")
    }

    /// List every pack checksum known to the super-index, split by kind.
    /// Cached behind the repo mutex until invalidated by
    /// [`Self::regenerate_super_index`].
    pub fn list_pack_indexes(&self) -> Result<(Vec<Checksum>, Vec<Checksum>)> {
        let mut caches = self.caches.lock().unwrap();
        if caches.super_index.is_none() {
            caches.super_index = Some(self.load_super_index_from_disk()?);
        }
        let super_index = caches.super_index.as_ref().unwrap();
        Ok((
            super_index.meta_packs.iter().map(|p| p.pack_checksum).collect(),
            super_index.data_packs.iter().map(|p| p.pack_checksum).collect(),
        ))
    }

    fn load_super_index_from_disk(&self) -> Result<SuperIndex> {
        let path = self.super_index_path();
        match fs::read(&path) {
            Ok(bytes) => SuperIndex::decode(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SuperIndex::default()),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    /// Rebuild the super-index from the index files actually present in
    /// `objects/pack/`, and atomically replace it on disk. Invalidates the
    /// in-memory cache.
    pub fn regenerate_super_index(&self) -> Result<()> {
        let mut meta_packs = Vec::new();
        let mut data_packs = Vec::new();
        for entry in fs::read_dir(&self.pack_dir).with_path(&self.pack_dir)? {
            let entry = entry.with_path(&self.pack_dir)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(checksum) = parse_pack_index_filename(&name, "ostmetapack") {
                meta_packs.push(SuperIndexPack {
                    pack_checksum: checksum,
                    bloom: Vec::new(),
                });
            } else if let Some(checksum) = parse_pack_index_filename(&name, "ostdatapack") {
                data_packs.push(SuperIndexPack {
                    pack_checksum: checksum,
                    bloom: Vec::new(),
                });
            }
        }
        meta_packs.sort_unstable_by(|a, b| a.pack_checksum.cmp(&b.pack_checksum));
        data_packs.sort_unstable_by(|a, b| a.pack_checksum.cmp(&b.pack_checksum));
        let super_index = SuperIndex {
            meta_packs,
            data_packs,
        };
        let bytes = super_index.encode();
        atomic_write(&self.super_index_path(), &bytes)?;

        let mut caches = self.caches.lock().unwrap();
        caches.super_index = Some(super_index);
        caches.indexes.clear();
        caches.data_maps.clear();
        Ok(())
    }

    /// Load (and cache) the pack index for `checksum`.
    pub fn load_pack_index(&self, checksum: &Checksum, is_meta: bool) -> Result<Arc<PackIndex>> {
        let mut caches = self.caches.lock().unwrap();
        let key = (*checksum, is_meta);
        if let Some(index) = caches.indexes.get(&key) {
            return Ok(Arc::clone(index));
        }
        let (index_name, _) = format::pack_file_names(checksum, is_meta);
        let path = self.pack_dir.join(&index_name);
        let bytes = fs::read(&path).with_path(&path)?;
        let index = Arc::new(PackIndex::decode(&bytes)?);
        caches.indexes.insert(key, Arc::clone(&index));
        Ok(index)
    }

    /// Memory-map (and cache) the pack data file for `checksum`.
    pub fn map_pack_file(&self, checksum: &Checksum, is_meta: bool) -> Result<Arc<Mmap>> {
        let mut caches = self.caches.lock().unwrap();
        let key = (*checksum, is_meta);
        if let Some(mapping) = caches.data_maps.get(&key) {
            return Ok(Arc::clone(mapping));
        }
        let (_, data_name) = format::pack_file_names(checksum, is_meta);
        let path = self.pack_dir.join(&data_name);
        let file = File::open(&path).with_path(&path)?;
        // Safety: pack files are immutable once installed, so mapping one
        // for concurrent shared reads is sound for as long as this crate's
        // own write path is the only writer and it never mutates in place.
        let mapping = unsafe { Mmap::map(&file) }.with_path(&path)?;
        let mapping = Arc::new(mapping);
        caches.data_maps.insert(key, Arc::clone(&mapping));
        Ok(mapping)
    }

    /// Enumerate every `(checksum, object_type)` indexed by any installed
    /// pack, meta and data together.
    pub fn list_packed(&self) -> Result<Vec<(Checksum, ObjectType)>> {
        let (meta_checksums, data_checksums) = self.list_pack_indexes()?;
        let mut out = Vec::new();
        for pack_checksum in &meta_checksums {
            let index = self.load_pack_index(pack_checksum, true)?;
            out.extend(index.entries.iter().map(|e| (e.checksum, e.object_type)));
        }
        for pack_checksum in &data_checksums {
            let index = self.load_pack_index(pack_checksum, false)?;
            out.extend(index.entries.iter().map(|e| (e.checksum, e.object_type)));
        }
        Ok(out)
    }

    /// Search every pack of the matching kind for `checksum`, binary
    /// searching each pack's index. Metadata object types search meta
    /// packs; `FILE` searches data packs.
    pub fn find_object_in_packs(
        &self,
        checksum: &Checksum,
        object_type: ObjectType,
    ) -> Result<Option<PackLocation>> {
        let is_meta = object_type.prefers_packed_lookup();
        let (meta_checksums, data_checksums) = self.list_pack_indexes()?;
        let candidates = if is_meta { &meta_checksums } else { &data_checksums };
        for pack_checksum in candidates {
            let index = self.load_pack_index(pack_checksum, is_meta)?;
            if let Some(entry) = index.find(checksum) {
                return Ok(Some(PackLocation {
                    pack_checksum: *pack_checksum,
                    is_meta,
                    offset: entry.offset,
                    object_checksum: entry.checksum,
                }));
            }
        }
        Ok(None)
    }

    /// Read the object stored at `location`, optionally verifying that its
    /// content hashes to `location`'s own checksum.
    pub fn read_pack_entry(&self, location: &PackLocation, verify: bool) -> Result<Vec<u8>> {
        let mapping = self.map_pack_file(&location.pack_checksum, location.is_meta)?;
        let blob = format::read_pack_entry_blob(&mapping, location.offset)?.to_vec();
        if verify {
            let mut hasher = Sha256::new();
            hasher.update(&blob);
            let actual = Checksum::from_bytes(hasher.finalize().into());
            if actual != location.object_checksum {
                return Err(Error::CorruptedObject {
                    expected: location.object_checksum,
                    actual,
                });
            }
        }
        Ok(blob)
    }

    /// Install a newly produced pack: `index_src`/`data_src` are renamed
    /// into `objects/pack/` under names derived from `pack_checksum`. The
    /// caller must call [`Self::regenerate_super_index`] afterward.
    pub fn add_pack_file(
        &self,
        pack_checksum: &Checksum,
        is_meta: bool,
        index_src: &Path,
        data_src: &Path,
    ) -> Result<()> {
        let (index_name, data_name) = format::pack_file_names(pack_checksum, is_meta);
        let index_dest = self.pack_dir.join(&index_name);
        let data_dest = self.pack_dir.join(&data_name);
        fs::rename(index_src, &index_dest).with_path(&index_dest)?;
        fs::rename(data_src, &data_dest).with_path(&data_dest)?;
        Ok(())
    }

    /// Build a pack index's canonical bytes plus a data file blob for the
    /// given objects, writing both into `scratch_dir` ready for
    /// [`Self::add_pack_file`]. Returns the pack's own checksum (the hash
    /// of its data file).
    pub fn build_pack(
        scratch_dir: &Path,
        objects: &[(ObjectType, Checksum, Vec<u8>)],
    ) -> Result<(Checksum, PathBuf, PathBuf)> {
        fs::create_dir_all(scratch_dir).with_path(scratch_dir)?;
        let mut data = Vec::new();
        let mut entries = Vec::with_capacity(objects.len());
        for (object_type, checksum, blob) in objects {
            let offset = data.len() as u64;
            data.extend_from_slice(&format::encode_pack_entry_blob(blob));
            entries.push(PackIndexEntry {
                object_type: *object_type,
                checksum: *checksum,
                offset,
            });
        }
        let pack_checksum = Checksum::of_bytes(&data);
        let index = PackIndex::new(entries);
        let data_path = scratch_dir.join("pack.data.tmp");
        let index_path = scratch_dir.join("pack.index.tmp");
        fs::write(&data_path, &data).with_path(&data_path)?;
        fs::write(&index_path, index.encode()).with_path(&index_path)?;
        Ok((pack_checksum, index_path, data_path))
    }
}

fn parse_pack_index_filename(name: &str, prefix: &str) -> Option<Checksum> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    let hex = rest.strip_suffix(".index")?;
    Checksum::from_hex(hex).ok()
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes).with_path(&tmp_path)?;
    fs::rename(&tmp_path, path).with_path(path)?;
    Ok(())
}
