//! Repository configuration: the `config` file's `core`/`remote "<name>"`
//! INI-like grammar.
//!
//! Hand-rolled rather than pulled from a general keyfile crate, kept
//! deliberately small (section headers, `key=value` lines, `#`/`;`
//! comments) -- the same spirit in which OSTree's own `ostree-repo.c`
//! hand-parses its keyfile rather than reaching for GLib's full keyfile
//! API.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{trace, warn};

use crate::error::{Error, IoContext, Result};
use crate::objects::StorageMode;

/// Filename, relative to the repository root, of the configuration file.
pub const CONFIG_FILE: &str = "config";

/// A declared remote: `[remote "<name>"]` section.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteConfig {
    pub url: String,
    pub branches: Vec<String>,
}

/// A fully parsed repository configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    pub repo_version: String,
    pub mode: StorageMode,
    pub parent: Option<PathBuf>,
    pub remotes: BTreeMap<String, RemoteConfig>,
}

impl Config {
    /// A fresh bare-mode repository configuration with no remotes and no
    /// parent.
    pub fn default_bare() -> Config {
        Config {
            repo_version: "1".to_string(),
            mode: StorageMode::Bare,
            parent: None,
            remotes: BTreeMap::new(),
        }
    }

    /// A fresh archive-mode repository configuration.
    pub fn default_archive() -> Config {
        Config {
            mode: StorageMode::Archive,
            ..Config::default_bare()
        }
    }

    /// Load and parse the config file under `repo_root`.
    pub fn load(repo_root: &Path) -> Result<Config> {
        let path = repo_root.join(CONFIG_FILE);
        let text = fs::read_to_string(&path).with_path(&path)?;
        Config::parse(&text)
    }

    /// Load the config file if present, or `None` if the repository has not
    /// been created yet.
    pub fn load_if_exists(repo_root: &Path) -> Result<Option<Config>> {
        let path = repo_root.join(CONFIG_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(Config::parse(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    /// Write this configuration to `repo_root/config`, atomically.
    pub fn write(&self, repo_root: &Path) -> Result<()> {
        let path = repo_root.join(CONFIG_FILE);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.to_ini()).with_path(&tmp)?;
        fs::rename(&tmp, &path).with_path(&path)
    }

    /// Copy this configuration verbatim to a different repository root,
    /// used when a repository is created chained to a parent and wants to
    /// start from the parent's remotes.
    pub fn copy_to(&self, dest_repo_root: &Path) -> Result<()> {
        self.write(dest_repo_root)
    }

    fn to_ini(&self) -> String {
        let mut out = String::new();
        out.push_str("[core]\n");
        out.push_str(&format!("repo_version={}\n", self.repo_version));
        out.push_str(&format!(
            "mode={}\n",
            match self.mode {
                StorageMode::Bare => "bare",
                StorageMode::Archive => "archive",
            }
        ));
        if let Some(parent) = &self.parent {
            out.push_str(&format!("parent={}\n", parent.display()));
        }
        for (name, remote) in &self.remotes {
            out.push_str(&format!("\n[remote \"{}\"]\n", name));
            out.push_str(&format!("url={}\n", remote.url));
            if !remote.branches.is_empty() {
                out.push_str(&format!("branches={}\n", remote.branches.join(";")));
            }
        }
        out
    }

    /// Parse the INI-like `core`/`remote "<name>"` grammar.
    pub fn parse(text: &str) -> Result<Config> {
        let mut section: Option<String> = None;
        let mut core: BTreeMap<String, String> = BTreeMap::new();
        let mut remotes: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                section = Some(parse_section_header(header)?);
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| Error::InvalidConfig {
                detail: format!("line {}: expected `key=value`, got {:?}", lineno + 1, raw_line),
            })?;
            let key = key.trim().to_string();
            let value = value.trim().to_string();
            match section.as_deref() {
                Some("core") => {
                    core.insert(key, value);
                }
                Some(name) if name.starts_with("remote ") => {
                    let remote_name = remote_section_name(name)?;
                    remotes.entry(remote_name).or_default().insert(key, value);
                }
                Some(other) => {
                    warn!("config: ignoring unrecognized section [{}]", other);
                }
                None => {
                    return Err(Error::InvalidConfig {
                        detail: format!("line {}: key=value before any [section]", lineno + 1),
                    });
                }
            }
        }

        let repo_version = core
            .get("repo_version")
            .cloned()
            .ok_or_else(|| Error::InvalidConfig {
                detail: "missing core.repo_version".to_string(),
            })?;
        if repo_version != "1" {
            return Err(Error::InvalidConfig {
                detail: format!("unsupported repo_version {:?}", repo_version),
            });
        }

        let mode = parse_mode(&core)?;
        let parent = core.get("parent").map(PathBuf::from);

        let mut parsed_remotes = BTreeMap::new();
        for (name, kv) in remotes {
            let url = kv.get("url").cloned().ok_or_else(|| Error::InvalidConfig {
                detail: format!("remote {:?} missing url", name),
            })?;
            let branches = kv
                .get("branches")
                .map(|s| s.split(';').filter(|b| !b.is_empty()).map(String::from).collect())
                .unwrap_or_default();
            parsed_remotes.insert(name, RemoteConfig { url, branches });
        }

        trace!("config: parsed {} remote(s), mode {:?}", parsed_remotes.len(), mode);
        Ok(Config {
            repo_version,
            mode,
            parent,
            remotes: parsed_remotes,
        })
    }
}

fn parse_mode(core: &BTreeMap<String, String>) -> Result<StorageMode> {
    if let Some(mode) = core.get("mode") {
        return match mode.as_str() {
            "bare" => Ok(StorageMode::Bare),
            "archive" => Ok(StorageMode::Archive),
            other => Err(Error::InvalidConfig {
                detail: format!("unrecognized core.mode {:?}", other),
            }),
        };
    }
    if let Some(archive) = core.get("archive") {
        return match archive.as_str() {
            "true" => Ok(StorageMode::Archive),
            "false" => Ok(StorageMode::Bare),
            other => Err(Error::InvalidConfig {
                detail: format!("core.archive must be true or false, got {:?}", other),
            }),
        };
    }
    Err(Error::InvalidConfig {
        detail: "missing core.mode or core.archive".to_string(),
    })
}

fn parse_section_header(header: &str) -> Result<String> {
    Ok(header.trim().to_string())
}

fn remote_section_name(section: &str) -> Result<String> {
    // `remote "origin"` -> "origin"
    let rest = section.strip_prefix("remote ").unwrap_or(section).trim();
    let name = rest
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or_else(|| Error::InvalidConfig {
            detail: format!("malformed remote section header {:?}", section),
        })?;
    Ok(name.to_string())
}
