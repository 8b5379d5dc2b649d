//! Canonical, byte-exact serialization of the four object types: `FILE`,
//! `DIR_META`, `DIR_TREE`, and `COMMIT`.
//!
//! Every encode function here produces the exact bytes whose SHA-256 is the
//! object's checksum, so field order is never incidental -- it is part of
//! the wire contract, and entries are always sorted before hashing so two
//! callers building the same tree in different orders still produce the
//! same checksum.

use crate::checksum::Checksum;
use crate::encoding::{Decoder, Encoder};
use crate::error::Error;

/// Which of the four object kinds a checksum names.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ObjectType {
    /// A regular file, symlink, or device node.
    File,
    /// A directory's POSIX attributes and xattrs, no children.
    DirMeta,
    /// A directory's children.
    DirTree,
    /// A commit.
    Commit,
}

impl ObjectType {
    /// Filename extension used for the loose object of this type.
    pub fn loose_ext(self) -> &'static str {
        match self {
            ObjectType::File => "file",
            ObjectType::DirMeta => "dirmeta",
            ObjectType::DirTree => "dirtree",
            ObjectType::Commit => "commit",
        }
    }

    /// Whether this type is searched in packs before loose storage:
    /// metadata objects favor packs, content objects favor loose.
    pub fn prefers_packed_lookup(self) -> bool {
        !matches!(self, ObjectType::File)
    }
}

/// The kind of filesystem entry a `FILE` object represents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileKind {
    Regular,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileKind {
    fn tag(self) -> u8 {
        match self {
            FileKind::Regular => 0,
            FileKind::Symlink => 1,
            FileKind::CharDevice => 2,
            FileKind::BlockDevice => 3,
            FileKind::Fifo => 4,
            FileKind::Socket => 5,
        }
    }

    fn from_tag(tag: u8) -> Result<FileKind, &'static str> {
        Ok(match tag {
            0 => FileKind::Regular,
            1 => FileKind::Symlink,
            2 => FileKind::CharDevice,
            3 => FileKind::BlockDevice,
            4 => FileKind::Fifo,
            5 => FileKind::Socket,
            _ => return Err("unrecognized file kind tag"),
        })
    }

    /// Whether entries of this kind carry a content stream on disk.
    pub fn has_content(self) -> bool {
        matches!(self, FileKind::Regular)
    }
}

/// An extended attribute list: an opaque, name-sorted list of (name, value)
/// byte pairs. Reordering invalidates object identity, so this type only
/// ever constructs itself pre-sorted.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Xattrs(Vec<(String, Vec<u8>)>);

impl Xattrs {
    /// Build from an unsorted list, sorting by name.
    pub fn new(mut entries: Vec<(String, Vec<u8>)>) -> Self {
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        Xattrs(entries)
    }

    /// The empty set.
    pub fn empty() -> Self {
        Xattrs(Vec::new())
    }

    /// Iterate the (name, value) pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &(String, Vec<u8>)> {
        self.0.iter()
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.u32(self.0.len() as u32);
        for (name, value) in &self.0 {
            enc.str(name).bytes(value);
        }
    }

    fn decode(dec: &mut Decoder) -> Result<Self, Error> {
        let count = dec.u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = dec.str()?;
            let value = dec.bytes()?;
            entries.push((name, value));
        }
        Ok(Xattrs(entries))
    }
}

/// POSIX attributes and content header for a `FILE` object. The canonical
/// serialization of this header, followed immediately by the raw content
/// bytes (only present when `kind.has_content()`), is what gets hashed to
/// produce the object's checksum -- in both bare and archive storage modes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileHeader {
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Device number, meaningful only for char/block device kinds.
    pub rdev: u64,
    /// Target path, meaningful only for symlinks.
    pub symlink_target: Vec<u8>,
    /// Length of the content stream that follows the header, 0 unless
    /// `kind.has_content()`.
    pub content_length: u64,
    pub xattrs: Xattrs,
}

impl FileHeader {
    fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.u8(self.kind.tag())
            .u32(self.mode)
            .u32(self.uid)
            .u32(self.gid)
            .u64(self.rdev)
            .bytes(&self.symlink_target)
            .u64(self.content_length);
        self.xattrs.encode(&mut enc);
        enc.into_bytes()
    }

    fn decode_from(dec: &mut Decoder) -> Result<Self, Error> {
        let kind_tag = dec.u8()?;
        let kind = FileKind::from_tag(kind_tag).map_err(|detail| Error::InvalidFormat {
            context: "file header".into(),
            detail: detail.to_string(),
        })?;
        let mode = dec.u32()?;
        let uid = dec.u32()?;
        let gid = dec.u32()?;
        let rdev = dec.u64()?;
        let symlink_target = dec.bytes()?;
        let content_length = dec.u64()?;
        let xattrs = Xattrs::decode(dec)?;
        Ok(FileHeader {
            kind,
            mode,
            uid,
            gid,
            rdev,
            symlink_target,
            content_length,
            xattrs,
        })
    }

    /// Encode the header, then compute what the object's checksum would be
    /// if `content` were appended -- without requiring the caller to
    /// concatenate the buffers themselves.
    pub fn checksum_with_content(&self, content: &[u8]) -> Checksum {
        let mut bytes = self.encode();
        bytes.extend_from_slice(content);
        Checksum::of_bytes(&bytes)
    }

    /// Build the full header+content byte stream that gets hashed and
    /// staged for a `FILE` object.
    pub fn stream_with_content(&self, content: &[u8]) -> Vec<u8> {
        let mut bytes = self.encode();
        bytes.extend_from_slice(content);
        bytes
    }

    /// Parse a header from the front of `stream`, returning the header and
    /// the remaining content bytes. The split point is the header's own
    /// encoded length, so re-encoding the parsed header and re-running this
    /// is not needed to find where content starts.
    pub fn parse(stream: &[u8]) -> Result<(FileHeader, &[u8]), Error> {
        let mut dec = Decoder::new(stream, "file header");
        let header = FileHeader::decode_from(&mut dec)?;
        let header_len = header.encode().len();
        if header_len > stream.len() {
            return Err(Error::InvalidFormat {
                context: "file header".into(),
                detail: "header longer than stream".into(),
            });
        }
        let content = &stream[header_len..];
        if content.len() as u64 != header.content_length {
            return Err(Error::InvalidFormat {
                context: "file header".into(),
                detail: format!(
                    "declared content length {} does not match {} remaining bytes",
                    header.content_length,
                    content.len()
                ),
            });
        }
        Ok((header, content))
    }
}

/// POSIX attributes for a directory, with no children (`DIR_META`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirMeta {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub xattrs: Xattrs,
}

impl DirMeta {
    /// A reasonable default for freshly created directories: `0755`, owned
    /// by root, no extended attributes.
    pub fn default_mode() -> DirMeta {
        DirMeta {
            mode: 0o755,
            uid: 0,
            gid: 0,
            xattrs: Xattrs::empty(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.u32(self.mode).u32(self.uid).u32(self.gid);
        self.xattrs.encode(&mut enc);
        enc.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<DirMeta, Error> {
        let mut dec = Decoder::new(bytes, "dir meta");
        let mode = dec.u32()?;
        let uid = dec.u32()?;
        let gid = dec.u32()?;
        let xattrs = Xattrs::decode(&mut dec)?;
        dec.expect_exhausted()?;
        Ok(DirMeta {
            mode,
            uid,
            gid,
            xattrs,
        })
    }

    pub fn checksum(&self) -> Checksum {
        Checksum::of_bytes(&self.encode())
    }
}

/// A single file entry within a `DIR_TREE`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirTreeFile {
    pub name: String,
    pub checksum: Checksum,
}

/// A single subdirectory entry within a `DIR_TREE`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirTreeSubdir {
    pub name: String,
    pub contents_checksum: Checksum,
    pub metadata_checksum: Checksum,
}

/// A directory's children: files and subdirectories, each lexicographically
/// sorted by name so the serialization is canonical.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DirTree {
    pub files: Vec<DirTreeFile>,
    pub subdirs: Vec<DirTreeSubdir>,
}

impl DirTree {
    /// Build a tree from unsorted entries, sorting each list by name.
    pub fn new(mut files: Vec<DirTreeFile>, mut subdirs: Vec<DirTreeSubdir>) -> Self {
        files.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        subdirs.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        DirTree { files, subdirs }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.subdirs.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.u32(self.files.len() as u32);
        for f in &self.files {
            enc.str(&f.name).checksum(&f.checksum);
        }
        enc.u32(self.subdirs.len() as u32);
        for d in &self.subdirs {
            enc.str(&d.name)
                .checksum(&d.contents_checksum)
                .checksum(&d.metadata_checksum);
        }
        enc.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<DirTree, Error> {
        let mut dec = Decoder::new(bytes, "dir tree");
        let file_count = dec.u32()?;
        let mut files = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            let name = dec.str()?;
            let checksum = dec.checksum()?;
            files.push(DirTreeFile { name, checksum });
        }
        let subdir_count = dec.u32()?;
        let mut subdirs = Vec::with_capacity(subdir_count as usize);
        for _ in 0..subdir_count {
            let name = dec.str()?;
            let contents_checksum = dec.checksum()?;
            let metadata_checksum = dec.checksum()?;
            subdirs.push(DirTreeSubdir {
                name,
                contents_checksum,
                metadata_checksum,
            });
        }
        dec.expect_exhausted()?;
        Ok(DirTree { files, subdirs })
    }

    pub fn checksum(&self) -> Checksum {
        Checksum::of_bytes(&self.encode())
    }
}

/// A commit: a named root-of-tree plus parent, subject, body, metadata, and
/// timestamp.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Commit {
    /// Arbitrary caller-supplied key/value metadata, sorted by key for
    /// canonical encoding.
    pub metadata: Vec<(String, Vec<u8>)>,
    /// Checksum of the parent commit, if any.
    pub parent: Option<Checksum>,
    /// Additional related object checksums (e.g. detached metadata).
    pub related_objects: Vec<Checksum>,
    pub subject: String,
    pub body: Option<String>,
    /// UTC unix timestamp in seconds.
    pub timestamp: u64,
    pub root_contents_checksum: Checksum,
    pub root_metadata_checksum: Checksum,
}

impl Commit {
    pub fn encode(&self) -> Vec<u8> {
        let mut metadata = self.metadata.clone();
        metadata.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let mut enc = Encoder::new();
        enc.u32(metadata.len() as u32);
        for (k, v) in &metadata {
            enc.str(k).bytes(v);
        }
        enc.opt_checksum(self.parent.as_ref());
        enc.u32(self.related_objects.len() as u32);
        for c in &self.related_objects {
            enc.checksum(c);
        }
        enc.str(&self.subject);
        match &self.body {
            Some(b) => {
                enc.u8(1).str(b);
            }
            None => {
                enc.u8(0);
            }
        }
        enc.u64(self.timestamp);
        enc.checksum(&self.root_contents_checksum);
        enc.checksum(&self.root_metadata_checksum);
        enc.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Commit, Error> {
        let mut dec = Decoder::new(bytes, "commit");
        let meta_count = dec.u32()?;
        let mut metadata = Vec::with_capacity(meta_count as usize);
        for _ in 0..meta_count {
            let k = dec.str()?;
            let v = dec.bytes()?;
            metadata.push((k, v));
        }
        let parent = dec.opt_checksum()?;
        let related_count = dec.u32()?;
        let mut related_objects = Vec::with_capacity(related_count as usize);
        for _ in 0..related_count {
            related_objects.push(dec.checksum()?);
        }
        let subject = dec.str()?;
        let body = match dec.u8()? {
            0 => None,
            1 => Some(dec.str()?),
            other => {
                return Err(Error::InvalidFormat {
                    context: "commit".into(),
                    detail: format!("invalid body presence tag {}", other),
                })
            }
        };
        let timestamp = dec.u64()?;
        let root_contents_checksum = dec.checksum()?;
        let root_metadata_checksum = dec.checksum()?;
        dec.expect_exhausted()?;
        Ok(Commit {
            metadata,
            parent,
            related_objects,
            subject,
            body,
            timestamp,
            root_contents_checksum,
            root_metadata_checksum,
        })
    }

    pub fn checksum(&self) -> Checksum {
        Checksum::of_bytes(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum(s: &[u8]) -> Checksum {
        Checksum::of_bytes(s)
    }

    #[test]
    fn test_file_header_round_trip_with_content() {
        let header = FileHeader {
            kind: FileKind::Regular,
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            symlink_target: Vec::new(),
            content_length: 5,
            xattrs: Xattrs::new(vec![("user.foo".into(), b"bar".to_vec())]),
        };
        let stream = header.stream_with_content(b"hello");
        let (parsed, content) = FileHeader::parse(&stream).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(content, b"hello");
    }

    #[test]
    fn test_file_header_symlink_has_no_content() {
        let header = FileHeader {
            kind: FileKind::Symlink,
            mode: 0o120777,
            uid: 0,
            gid: 0,
            rdev: 0,
            symlink_target: b"/usr/bin/env".to_vec(),
            content_length: 0,
            xattrs: Xattrs::empty(),
        };
        let stream = header.stream_with_content(b"");
        let (parsed, content) = FileHeader::parse(&stream).unwrap();
        assert_eq!(parsed, header);
        assert!(content.is_empty());
    }

    #[test]
    fn test_dir_meta_round_trip() {
        let meta = DirMeta {
            mode: 0o755,
            uid: 0,
            gid: 0,
            xattrs: Xattrs::empty(),
        };
        let bytes = meta.encode();
        assert_eq!(DirMeta::decode(&bytes).unwrap(), meta);
    }

    #[test]
    fn test_dir_tree_canonical_ordering_is_insertion_independent() {
        let files_a = vec![
            DirTreeFile {
                name: "b.txt".into(),
                checksum: sum(b"b"),
            },
            DirTreeFile {
                name: "a.txt".into(),
                checksum: sum(b"a"),
            },
        ];
        let files_b = vec![
            DirTreeFile {
                name: "a.txt".into(),
                checksum: sum(b"a"),
            },
            DirTreeFile {
                name: "b.txt".into(),
                checksum: sum(b"b"),
            },
        ];
        let tree_a = DirTree::new(files_a, Vec::new());
        let tree_b = DirTree::new(files_b, Vec::new());
        assert_eq!(tree_a.encode(), tree_b.encode());
        assert_eq!(tree_a.checksum(), tree_b.checksum());
    }

    #[test]
    fn test_dir_tree_round_trip() {
        let tree = DirTree::new(
            vec![DirTreeFile {
                name: "f".into(),
                checksum: sum(b"f"),
            }],
            vec![DirTreeSubdir {
                name: "d".into(),
                contents_checksum: sum(b"dc"),
                metadata_checksum: sum(b"dm"),
            }],
        );
        let bytes = tree.encode();
        assert_eq!(DirTree::decode(&bytes).unwrap(), tree);
    }

    #[test]
    fn test_commit_round_trip() {
        let commit = Commit {
            metadata: vec![("version".into(), b"1".to_vec())],
            parent: Some(sum(b"parent")),
            related_objects: vec![sum(b"related")],
            subject: "initial import".into(),
            body: Some("long description".into()),
            timestamp: 1_700_000_000,
            root_contents_checksum: sum(b"rc"),
            root_metadata_checksum: sum(b"rm"),
        };
        let bytes = commit.encode();
        assert_eq!(Commit::decode(&bytes).unwrap(), commit);
    }

    #[test]
    fn test_commit_determinism_same_inputs_same_checksum() {
        let build = || Commit {
            metadata: vec![],
            parent: None,
            related_objects: vec![],
            subject: "init".into(),
            body: None,
            timestamp: 0,
            root_contents_checksum: sum(b"rc"),
            root_metadata_checksum: sum(b"rm"),
        };
        assert_eq!(build().checksum(), build().checksum());
    }
}
