//! End-to-end scenarios exercising `Repo` and its collaborators against a
//! real filesystem.

use ostrepo::cancel::CancellationToken;
use ostrepo::checkout::{CheckoutMode, CheckoutOptions, OverwriteMode};
use ostrepo::commit::{self, AllowAll};
use ostrepo::mtree::MutableTree;
use ostrepo::objects::{DirMeta, ObjectType, StorageMode};
use ostrepo::pack::{SuperIndex, SuperIndexPack};
use ostrepo::remote_cache::RemotePackCache;
use ostrepo::{Checksum, Error, Repo};

use std::os::unix::fs::MetadataExt;

fn open_bare_repo() -> (tempfile::TempDir, Repo) {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repo::create(dir.path(), StorageMode::Bare).unwrap();
    (dir, repo)
}

fn open_archive_repo() -> (tempfile::TempDir, Repo) {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repo::create(dir.path(), StorageMode::Archive).unwrap();
    (dir, repo)
}

/// Scenario 1: an empty directory staged with fixed metadata produces
/// exactly one `DIR_TREE`, one `DIR_META`, and one `COMMIT` object, and
/// `write_ref` + `resolve_rev` round-trip the resulting checksum.
#[test]
fn scenario_empty_commit() {
    let (_dir, repo) = open_bare_repo();

    let (mut tx, _devino) = repo.prepare_transaction().unwrap();
    let mut mtree = MutableTree::new();
    let meta = DirMeta::default_mode();
    let staged_meta = tx.stage_dir_meta(&meta).unwrap();
    mtree.set_metadata_checksum(staged_meta.checksum);
    let (root_contents, root_metadata) = commit::seal_mtree(&mut tx, &mut mtree).unwrap();
    let commit_checksum = commit::stage_commit(
        &mut tx,
        root_contents,
        root_metadata,
        None,
        "init",
        None,
        Vec::new(),
        Vec::new(),
        0,
    )
    .unwrap();
    tx.commit().unwrap();

    let objects = repo.list_objects(ostrepo::repo::ListScope::All).unwrap();
    assert_eq!(objects.len(), 3);
    assert!(objects.iter().any(|(c, t)| *t == ObjectType::DirTree && *c == root_contents));
    assert!(objects.iter().any(|(c, t)| *t == ObjectType::DirMeta && *c == root_metadata));
    assert!(objects.iter().any(|(c, t)| *t == ObjectType::Commit && *c == commit_checksum));

    repo.write_ref(None, "main", &commit_checksum).unwrap();
    assert_eq!(repo.resolve_rev("main", false).unwrap(), Some(commit_checksum));
}

/// Scenario 2: two trees differing by one file's content share every other
/// object (the file content that's unchanged, in this case `b.txt`), and
/// only the changed file plus the path of `DIR_TREE`s up to the root (here,
/// just the root) and the commits themselves differ.
#[test]
fn scenario_file_dedup() {
    let (_dir, repo) = open_archive_repo();
    let cancel = CancellationToken::new();

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), b"hello").unwrap();
    std::fs::write(src.path().join("b.txt"), b"unchanged").unwrap();
    let first = repo
        .commit_directory(src.path(), &AllowAll, None, "first", None, Vec::new(), Vec::new(), 1, &cancel)
        .unwrap();

    std::fs::write(src.path().join("a.txt"), b"goodbye").unwrap();
    let second = repo
        .commit_directory(
            src.path(),
            &AllowAll,
            Some(first),
            "second",
            None,
            Vec::new(),
            Vec::new(),
            2,
            &cancel,
        )
        .unwrap();

    assert_ne!(first, second);

    let first_commit = repo.load_commit(&first).unwrap();
    let second_commit = repo.load_commit(&second).unwrap();
    // Root DIR_TREE differs (it names a different a.txt checksum) but the
    // unchanged b.txt content is the very same loose object either way.
    assert_ne!(first_commit.root_contents_checksum, second_commit.root_contents_checksum);

    let first_tree = repo.load_dir_tree(&first_commit.root_contents_checksum).unwrap();
    let second_tree = repo.load_dir_tree(&second_commit.root_contents_checksum).unwrap();
    let b_first = first_tree.files.iter().find(|f| f.name == "b.txt").unwrap();
    let b_second = second_tree.files.iter().find(|f| f.name == "b.txt").unwrap();
    assert_eq!(b_first.checksum, b_second.checksum);

    let a_first = first_tree.files.iter().find(|f| f.name == "a.txt").unwrap();
    let a_second = second_tree.files.iter().find(|f| f.name == "a.txt").unwrap();
    assert_ne!(a_first.checksum, a_second.checksum);
}

/// Scenario 3: `resolve_rev("main^")` walks to the parent; a second `^`
/// fails once the walk reaches a rootless commit.
#[test]
fn scenario_parent_walk() {
    let (_dir, repo) = open_bare_repo();
    let cancel = CancellationToken::new();
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f.txt"), b"v1").unwrap();

    let c1 = repo
        .commit_directory(src.path(), &AllowAll, None, "c1", None, Vec::new(), Vec::new(), 1, &cancel)
        .unwrap();
    std::fs::write(src.path().join("f.txt"), b"v2").unwrap();
    let c2 = repo
        .commit_directory(src.path(), &AllowAll, Some(c1), "c2", None, Vec::new(), Vec::new(), 2, &cancel)
        .unwrap();
    repo.write_ref(None, "main", &c2).unwrap();

    assert_eq!(repo.resolve_rev("main^", false).unwrap(), Some(c1));
    let err = repo.resolve_rev("main^^", false).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

/// Scenario 4: checking out a bare repo in `CheckoutMode::None` hardlinks
/// every regular file to its loose object; symlinks are copied, never
/// linked.
#[test]
fn scenario_hardlink_checkout() {
    let (dir, repo) = open_bare_repo();
    let cancel = CancellationToken::new();
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f.txt"), b"linked content").unwrap();
    std::os::unix::fs::symlink("f.txt", src.path().join("link")).unwrap();

    let commit_checksum = repo
        .commit_directory(src.path(), &AllowAll, None, "c", None, Vec::new(), Vec::new(), 1, &cancel)
        .unwrap();

    let checkout_dir = tempfile::tempdir().unwrap();
    let target = checkout_dir.path().join("out");
    let options = CheckoutOptions {
        mode: CheckoutMode::None,
        overwrite: OverwriteMode::None,
        max_concurrency: 1,
    };
    repo.checkout_commit(&commit_checksum, &target, &options, &cancel).unwrap();

    let checked_out = std::fs::metadata(target.join("f.txt")).unwrap();
    let commit = repo.load_commit(&commit_checksum).unwrap();
    let tree = repo.load_dir_tree(&commit.root_contents_checksum).unwrap();
    let file_checksum = tree.files.iter().find(|f| f.name == "f.txt").unwrap().checksum;
    let shard = file_checksum.shard();
    let remainder = file_checksum.remainder();
    let loose_path = dir.path().join("objects").join(&shard).join(&remainder);
    let loose_meta = std::fs::metadata(&loose_path).unwrap();
    assert_eq!(checked_out.ino(), loose_meta.ino());

    let symlink_meta = std::fs::symlink_metadata(target.join("link")).unwrap();
    assert!(symlink_meta.file_type().is_symlink());
}

/// Scenario 5: resyncing a remote's lookaside cache against a new
/// super-index prunes packs no longer referenced and reports which wanted
/// packs are still missing locally.
#[test]
fn scenario_archive_resync() {
    let (dir, repo) = open_archive_repo();
    repo.remote_cache("origin").unwrap();
    let cache_dir = dir.path().join("remote-cache").join("origin");

    let p1 = Checksum::of_bytes(b"pack-1");
    let p2 = Checksum::of_bytes(b"pack-2");
    let p3 = Checksum::of_bytes(b"pack-3");
    let p4 = Checksum::of_bytes(b"pack-4");

    for p in [p1, p2, p3] {
        let (index_name, data_name) = ostrepo::pack::format::pack_file_names(&p, false);
        std::fs::write(cache_dir.join(index_name), b"idx").unwrap();
        std::fs::write(cache_dir.join(data_name), b"dat").unwrap();
    }

    let new_super_index = SuperIndex {
        meta_packs: Vec::new(),
        data_packs: vec![
            SuperIndexPack { pack_checksum: p2, bloom: Vec::new() },
            SuperIndexPack { pack_checksum: p3, bloom: Vec::new() },
            SuperIndexPack { pack_checksum: p4, bloom: Vec::new() },
        ],
    };
    let result = repo.resync_remote("origin", &new_super_index).unwrap();

    assert_eq!(result.uncached_data, vec![p4]);
    let mut cached = result.cached_data.clone();
    cached.sort();
    let mut expected = vec![p2, p3];
    expected.sort();
    assert_eq!(cached, expected);

    let (p1_index, p1_data) = ostrepo::pack::format::pack_file_names(&p1, false);
    assert!(!cache_dir.join(p1_index).exists());
    assert!(!cache_dir.join(p1_data).exists());

    let reopened = RemotePackCache::open(dir.path(), "origin").unwrap();
    assert_eq!(reopened.load_cached_super_index().unwrap().unwrap(), new_super_index);
}

/// Scenario 6: staging a file that claims a checksum its bytes don't
/// actually hash to fails with `CorruptedObject` and leaves no residue,
/// loose or temporary.
#[test]
fn scenario_corrupted_stage() {
    let (dir, repo) = open_bare_repo();
    let claimed = Checksum::of_bytes(b"what the caller thinks the content is");

    let (mut tx, _devino) = repo.prepare_transaction().unwrap();
    let header = ostrepo::objects::FileHeader {
        kind: ostrepo::objects::FileKind::Regular,
        mode: 0o100644,
        uid: 0,
        gid: 0,
        rdev: 0,
        symlink_target: Vec::new(),
        content_length: 0,
        xattrs: ostrepo::objects::Xattrs::empty(),
    };
    let err = tx
        .stage_file_trusted(claimed, header, &b"actual different bytes"[..])
        .unwrap_err();
    match err {
        Error::CorruptedObject { expected, actual } => {
            assert_eq!(expected, claimed);
            assert_ne!(actual, claimed);
        }
        other => panic!("expected CorruptedObject, got {:?}", other),
    }
    tx.abort().unwrap();

    let shard = claimed.shard();
    assert!(!dir.path().join("objects").join(shard).exists());
    let tmp_entries: Vec<_> = std::fs::read_dir(dir.path().join("tmp")).unwrap().collect();
    assert!(tmp_entries.is_empty(), "expected no residue in tmp/ after abort");
}

/// Scenario 7: a tar stream with no explicit directory entries, only a
/// deeply nested file, commits and checks out cleanly. Every implicit parent
/// directory gets a real staged `DIR_META` (not just an in-memory default),
/// so the checkout and a subsequent `fsck` both see a fully resolvable tree.
#[test]
fn scenario_archive_commit_with_implicit_parents() {
    let (_dir, repo) = open_archive_repo();

    let data = b"leaf content";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, "a/b/c.txt", &data[..]).unwrap();
    let bytes = builder.into_inner().unwrap();

    let mut archive = tar::Archive::new(&bytes[..]);
    let commit_checksum = repo
        .commit_archive(&mut archive, None, "archive import", None, Vec::new(), Vec::new(), 1)
        .unwrap();

    let checkout_dir = tempfile::tempdir().unwrap();
    let target = checkout_dir.path().join("out");
    let options = CheckoutOptions::default();
    let cancel = CancellationToken::new();
    repo.checkout_commit(&commit_checksum, &target, &options, &cancel).unwrap();

    let content = std::fs::read(target.join("a/b/c.txt")).unwrap();
    assert_eq!(content, data);

    let report = repo.fsck().unwrap();
    assert!(report.is_clean(), "expected no dangling objects, got {:?}", report.errors);
}

/// Scenario 8: checking out in `CheckoutMode::User` forces ownership to the
/// current effective uid/gid regardless of what the committed file claimed,
/// and never applies the committed xattrs.
#[test]
fn scenario_user_mode_checkout_forces_effective_owner() {
    let (_dir, repo) = open_archive_repo();
    let cancel = CancellationToken::new();
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f.txt"), b"owned content").unwrap();

    let commit_checksum = repo
        .commit_directory(src.path(), &AllowAll, None, "c", None, Vec::new(), Vec::new(), 1, &cancel)
        .unwrap();

    let checkout_dir = tempfile::tempdir().unwrap();
    let target = checkout_dir.path().join("out");
    let options = CheckoutOptions {
        mode: CheckoutMode::User,
        overwrite: OverwriteMode::None,
        max_concurrency: 1,
    };
    repo.checkout_commit(&commit_checksum, &target, &options, &cancel).unwrap();

    let checked_out = std::fs::metadata(target.join("f.txt")).unwrap();
    let effective_uid = unsafe { libc::geteuid() };
    let effective_gid = unsafe { libc::getegid() };
    assert_eq!(checked_out.uid(), effective_uid);
    assert_eq!(checked_out.gid(), effective_gid);
}
