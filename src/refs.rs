//! The reference namespace: local branches under `refs/heads/` and tracked
//! remote branches under `refs/remotes/<remote>/`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::checksum::Checksum;
use crate::error::{Error, IoContext, Result};

/// Directory, relative to the repository root, holding the ref namespace.
pub const REFS_DIR: &str = "refs";

/// Validate a ref name: non-empty components, no `.`/`..`, and no component
/// that is itself a valid 64-hex checksum, which would make it ambiguous
/// with direct-checksum lookup in `resolve_rev`.
pub fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidRef {
            name: name.to_string(),
            reason: "ref name is empty",
        });
    }
    for component in name.split('/') {
        if component.is_empty() {
            return Err(Error::InvalidRef {
                name: name.to_string(),
                reason: "ref name has an empty path component",
            });
        }
        if component == "." || component == ".." {
            return Err(Error::InvalidRef {
                name: name.to_string(),
                reason: "ref name contains a `.` or `..` component",
            });
        }
        if Checksum::from_hex(component).is_ok() {
            return Err(Error::InvalidRef {
                name: name.to_string(),
                reason: "ref name component looks like a checksum",
            });
        }
    }
    Ok(())
}

/// The reference store rooted at `<repo>/refs`.
pub struct RefStore {
    refs_dir: PathBuf,
    archive_summary: bool,
}

impl RefStore {
    /// Open the ref store under `repo_root`, creating `refs/heads` and
    /// `refs/remotes` if they do not yet exist. `archive_summary` controls
    /// whether `write_ref` regenerates `refs/summary` (archive-mode repos
    /// only).
    pub fn open(repo_root: &Path, archive_summary: bool) -> Result<Self> {
        let refs_dir = repo_root.join(REFS_DIR);
        fs::create_dir_all(refs_dir.join("heads")).with_path(&refs_dir)?;
        fs::create_dir_all(refs_dir.join("remotes")).with_path(&refs_dir)?;
        Ok(RefStore {
            refs_dir,
            archive_summary,
        })
    }

    fn local_path(&self, name: &str) -> PathBuf {
        self.refs_dir.join("heads").join(name)
    }

    fn remote_path(&self, remote: &str, name: &str) -> PathBuf {
        self.refs_dir.join("remotes").join(remote).join(name)
    }

    /// Write `checksum` to the ref named `name` (a local branch if
    /// `remote` is `None`, otherwise a remote-tracking branch), atomically
    /// via write-temp-then-rename, creating parent directories as needed.
    /// In archive mode, also regenerates `refs/summary`.
    pub fn write_ref(&self, remote: Option<&str>, name: &str, checksum: &Checksum) -> Result<()> {
        validate_ref_name(name)?;
        if let Some(remote) = remote {
            validate_ref_name(remote)?;
        }
        let path = match remote {
            Some(remote) => self.remote_path(remote, name),
            None => self.local_path(name),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        let contents = format!("{}\n", checksum.to_hex());
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents.as_bytes()).with_path(&tmp)?;
        fs::rename(&tmp, &path).with_path(&path)?;

        if self.archive_summary {
            self.regenerate_summary()?;
        }
        Ok(())
    }

    /// Delete the ref named `name` (local, or remote-tracking under
    /// `remote`).
    pub fn delete_ref(&self, remote: Option<&str>, name: &str) -> Result<()> {
        let path = match remote {
            Some(remote) => self.remote_path(remote, name),
            None => self.local_path(name),
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(path, e)),
        }?;
        if self.archive_summary {
            self.regenerate_summary()?;
        }
        Ok(())
    }

    /// Read a single ref file's checksum directly, without any of
    /// `resolve_rev`'s fallback search order.
    fn read_ref_file(&self, path: &Path) -> Result<Option<Checksum>> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let hex = contents.trim_end_matches('\n').trim();
                Ok(Some(Checksum::from_hex(hex)?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    /// List every local ref name and the checksum it points to, in
    /// directory-walk order.
    pub fn list_refs(&self) -> Result<Vec<(String, Checksum)>> {
        let mut out = Vec::new();
        let heads_dir = self.refs_dir.join("heads");
        walk_refs(&heads_dir, &heads_dir, &mut out)?;
        Ok(out)
    }

    /// List every remote-tracking ref under `refs/remotes/<remote>/`.
    pub fn list_remote_refs(&self, remote: &str) -> Result<Vec<(String, Checksum)>> {
        let mut out = Vec::new();
        let dir = self.refs_dir.join("remotes").join(remote);
        walk_refs(&dir, &dir, &mut out)?;
        Ok(out)
    }

    /// Resolve `name` to a checksum by, in order: checking if `name` is
    /// already a 64-hex checksum; stripping a trailing `^` and resolving
    /// the remainder's parent commit (via `parent_lookup`); searching
    /// `refs/heads/`; searching each `refs/remotes/<remote>/`. Does not
    /// itself fall through to a parent repository -- callers chain that at
    /// a higher level.
    pub fn resolve_rev(
        &self,
        name: &str,
        parent_lookup: impl Fn(&Checksum) -> Result<Option<Checksum>>,
    ) -> Result<Option<Checksum>> {
        if let Ok(checksum) = Checksum::from_hex(name) {
            return Ok(Some(checksum));
        }
        if let Some(base) = name.strip_suffix('^') {
            let base_checksum = match self.resolve_rev(base, &parent_lookup)? {
                Some(c) => c,
                None => return Ok(None),
            };
            // The base resolved to an actual commit, so a missing parent is
            // a structural fact about that commit rather than an ordinary
            // "not found" -- it fails unconditionally, independent of the
            // caller's `allow_missing`.
            return match parent_lookup(&base_checksum)? {
                Some(parent) => Ok(Some(parent)),
                None => Err(Error::not_found("parent of commit", base_checksum.to_hex())),
            };
        }
        if let Some(checksum) = self.read_ref_file(&self.local_path(name))? {
            return Ok(Some(checksum));
        }
        let remotes_dir = self.refs_dir.join("remotes");
        if let Ok(entries) = fs::read_dir(&remotes_dir) {
            for entry in entries {
                let entry = entry.with_path(&remotes_dir)?;
                if !entry.path().is_dir() {
                    continue;
                }
                let candidate = entry.path().join(name);
                if let Some(checksum) = self.read_ref_file(&candidate)? {
                    return Ok(Some(checksum));
                }
            }
        }
        Ok(None)
    }

    fn regenerate_summary(&self) -> Result<()> {
        let mut lines = Vec::new();
        for (name, checksum) in self.list_refs()? {
            lines.push(format!("{} {}\n", checksum.to_hex(), name));
        }
        let remotes_dir = self.refs_dir.join("remotes");
        if let Ok(entries) = fs::read_dir(&remotes_dir) {
            let mut remote_names: Vec<String> = entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
                .collect();
            remote_names.sort();
            for remote in remote_names {
                for (name, checksum) in self.list_remote_refs(&remote)? {
                    lines.push(format!("{} remotes/{}/{}\n", checksum.to_hex(), remote, name));
                }
            }
        }
        let path = self.refs_dir.join("summary");
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, lines.concat()).with_path(&tmp)?;
        fs::rename(&tmp, &path).with_path(&path)
    }
}

fn walk_refs(root: &Path, dir: &Path, out: &mut Vec<(String, Checksum)>) -> Result<()> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(dir, e)),
    };
    let mut entries: Vec<_> = read_dir.collect::<std::result::Result<Vec<_>, _>>().with_path(dir)?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            walk_refs(root, &path, out)?;
            continue;
        }
        let contents = fs::read_to_string(&path).with_path(&path)?;
        let hex = contents.trim_end_matches('\n').trim();
        let checksum = Checksum::from_hex(hex)?;
        let relative = path
            .strip_prefix(root)
            .expect("walked path is under root")
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        out.push((relative, checksum));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csum(s: &[u8]) -> Checksum {
        Checksum::of_bytes(s)
    }

    #[test]
    fn test_validate_ref_name_rejects_checksum_shaped_component() {
        let hex = csum(b"x").to_hex();
        assert!(validate_ref_name(&hex).is_err());
        assert!(validate_ref_name("heads/main").is_ok());
        assert!(validate_ref_name("a/../b").is_err());
        assert!(validate_ref_name("").is_err());
    }

    #[test]
    fn test_write_and_resolve_local_ref() {
        let dir = tempfile::tempdir().unwrap();
        let store = RefStore::open(dir.path(), false).unwrap();
        let checksum = csum(b"commit");
        store.write_ref(None, "main", &checksum).unwrap();
        let resolved = store.resolve_rev("main", |_| Ok(None)).unwrap();
        assert_eq!(resolved, Some(checksum));
    }

    #[test]
    fn test_resolve_rev_direct_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = RefStore::open(dir.path(), false).unwrap();
        let checksum = csum(b"commit");
        let resolved = store.resolve_rev(&checksum.to_hex(), |_| Ok(None)).unwrap();
        assert_eq!(resolved, Some(checksum));
    }

    #[test]
    fn test_resolve_rev_parent_walk() {
        let dir = tempfile::tempdir().unwrap();
        let store = RefStore::open(dir.path(), false).unwrap();
        let head = csum(b"head");
        let parent = csum(b"parent");
        store.write_ref(None, "main", &head).unwrap();
        let resolved = store
            .resolve_rev("main^", |c| {
                if *c == head {
                    Ok(Some(parent))
                } else {
                    Ok(None)
                }
            })
            .unwrap();
        assert_eq!(resolved, Some(parent));
    }

    #[test]
    fn test_resolve_rev_falls_through_to_remotes() {
        let dir = tempfile::tempdir().unwrap();
        let store = RefStore::open(dir.path(), false).unwrap();
        let checksum = csum(b"remote-commit");
        store.write_ref(Some("origin"), "main", &checksum).unwrap();
        let resolved = store.resolve_rev("main", |_| Ok(None)).unwrap();
        assert_eq!(resolved, Some(checksum));
    }

    #[test]
    fn test_archive_mode_regenerates_summary() {
        let dir = tempfile::tempdir().unwrap();
        let store = RefStore::open(dir.path(), true).unwrap();
        store.write_ref(None, "main", &csum(b"commit")).unwrap();
        let summary = fs::read_to_string(dir.path().join("refs/summary")).unwrap();
        assert!(summary.contains("main"));
    }

    #[test]
    fn test_missing_ref_resolves_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = RefStore::open(dir.path(), false).unwrap();
        assert_eq!(store.resolve_rev("nope", |_| Ok(None)).unwrap(), None);
    }

    #[test]
    fn test_caret_on_rootless_commit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = RefStore::open(dir.path(), false).unwrap();
        let root = csum(b"root-commit");
        store.write_ref(None, "main", &root).unwrap();
        let err = store.resolve_rev("main^", |_| Ok(None)).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
