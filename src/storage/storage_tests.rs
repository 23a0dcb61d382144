use super::*;
use crate::hash::sha256_hex;
use chrono::{TimeZone, Utc};
use std::io::Cursor;

fn test_store() -> (tempfile::TempDir, BlobStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobStore::new(dir.path().join("data")).unwrap();
    (dir, store)
}

fn upload(name: &str, content: &[u8]) -> FileUpload<Cursor<Vec<u8>>> {
    FileUpload {
        meta: FileMetadata {
            name: name.into(),
            size: content.len() as u64,
            modified: Utc.with_ymd_and_hms(2024, 3, 9, 15, 4, 5).unwrap(),
            sha256: String::new(),
        },
        reader: Cursor::new(content.to_vec()),
    }
}

fn put(store: &BlobStore, name: &str, content: &[u8], overwrite: bool) -> crate::Result<FileMetadata> {
    store.put(upload(name, content), overwrite, &CancellationToken::new())
}

#[test]
fn put_get_roundtrip() {
    let (_dir, store) = test_store();
    let content = b"yo sup mr white";

    let meta = put(&store, "/docs/readme.md", content, false).unwrap();
    assert_eq!(meta.name, "/docs/readme.md");
    assert_eq!(meta.size, content.len() as u64);
    assert_eq!(meta.sha256, sha256_hex(content));

    let (read_meta, mut reader) = store.get("/docs/readme.md").unwrap();
    assert_eq!(read_meta, meta);

    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut out).unwrap();
    assert_eq!(out, content);
}

#[test]
fn put_is_idempotent_with_overwrite() {
    let (_dir, store) = test_store();
    let content = b"same bytes";

    let first = put(&store, "/f", content, true).unwrap();
    let second = put(&store, "/f", content, true).unwrap();
    assert_eq!(first.sha256, second.sha256);
}

#[test]
fn put_without_overwrite_conflicts() {
    let (_dir, store) = test_store();
    put(&store, "/f", b"one", false).unwrap();

    let err = put(&store, "/f", b"two", false).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[test]
fn put_verifies_expected_digest() {
    let (_dir, store) = test_store();

    let mut up = upload("/f", b"content");
    up.meta.sha256 = sha256_hex(b"other content");
    let err = store.put(up, false, &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, Error::FormatIntegrity(_)));

    // fail closed: no container and no partial file left behind
    assert!(matches!(store.stat("/f"), Err(Error::NotFound(_))));
    let leftovers: Vec<_> = std::fs::read_dir(store.root())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
}

#[test]
fn put_rejects_in_flight_key() {
    let (_dir, store) = test_store();

    store.write_intents.lock().insert("/busy".into());
    let err = put(&store, "/busy", b"x", true).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    store.write_intents.lock().remove("/busy");
    put(&store, "/busy", b"x", true).unwrap();
    assert!(store.write_intents.lock().is_empty());
}

#[test]
fn invalid_names_rejected() {
    let (_dir, store) = test_store();
    assert!(matches!(put(&store, "/", b"x", false), Err(Error::InvalidName(_))));
    assert!(matches!(put(&store, "..", b"x", false), Err(Error::InvalidName(_))));
}

#[test]
fn names_are_canonicalized() {
    let (_dir, store) = test_store();
    let meta = put(&store, "docs//note.txt/", b"n", false).unwrap();
    assert_eq!(meta.name, "/docs/note.txt");
    assert!(store.stat("/docs/note.txt").is_ok());
}

#[test]
fn stat_missing_is_not_found() {
    let (_dir, store) = test_store();
    assert!(matches!(store.stat("/nope"), Err(Error::NotFound(_))));
    assert!(matches!(store.get("/nope"), Err(Error::NotFound(_))));
}

#[test]
fn rename_moves_container() {
    let (_dir, store) = test_store();
    let before = put(&store, "/a/old.txt", b"payload", false).unwrap();

    let moved = store.rename("/a/old.txt", "/b/new.txt", false).unwrap();
    assert_eq!(moved.name, "/b/new.txt");
    assert_eq!(moved.sha256, before.sha256);

    assert!(matches!(store.stat("/a/old.txt"), Err(Error::NotFound(_))));
    assert!(store.stat("/b/new.txt").is_ok());
}

#[test]
fn rename_respects_overwrite_flag() {
    let (_dir, store) = test_store();
    put(&store, "/a", b"a", false).unwrap();
    put(&store, "/b", b"b", false).unwrap();

    let err = store.rename("/a", "/b", false).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    let moved = store.rename("/a", "/b", true).unwrap();
    assert_eq!(moved.sha256, sha256_hex(b"a"));
}

#[test]
fn delete_returns_metadata() {
    let (_dir, store) = test_store();
    let meta = put(&store, "/gone", b"bye", false).unwrap();

    let deleted = store.delete("/gone").unwrap();
    assert_eq!(deleted, meta);
    assert!(matches!(store.delete("/gone"), Err(Error::NotFound(_))));
}

#[test]
fn list_missing_directory_is_empty() {
    let (_dir, store) = test_store();
    let page = store
        .list("/no/such/dir/", true, 0, 0, &CancellationToken::new())
        .unwrap();
    assert!(page.is_empty());
}

#[test]
fn list_filters_and_recurses() {
    let (_dir, store) = test_store();
    put(&store, "/docs/a.md", b"a", false).unwrap();
    put(&store, "/docs/sub/b.md", b"b", false).unwrap();
    put(&store, "/other/c.md", b"c", false).unwrap();

    let cancel = CancellationToken::new();
    let all = store.list("/", true, 0, 0, &cancel).unwrap();
    assert_eq!(all.len(), 3);

    let docs = store.list("/docs/", true, 0, 0, &cancel).unwrap();
    let names: Vec<_> = docs.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["/docs/a.md", "/docs/sub/b.md"]);

    let flat = store.list("/docs/", false, 0, 0, &cancel).unwrap();
    assert_eq!(flat.len(), 1);

    // partial file-name prefix
    let partial = store.list("/docs/a", true, 0, 0, &cancel).unwrap();
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0].name, "/docs/a.md");
}

#[test]
fn list_pagination_slices_full_listing() {
    let (_dir, store) = test_store();
    for i in 0..7 {
        put(&store, &format!("/files/f{i}.bin"), &[i as u8], false).unwrap();
    }

    let cancel = CancellationToken::new();
    let full = store.list("/files/", true, 0, 0, &cancel).unwrap();
    assert_eq!(full.len(), 7);

    for (offset, limit) in [(0usize, 3usize), (2, 2), (5, 5), (7, 1)] {
        let page = store.list("/files/", true, offset, limit, &cancel).unwrap();
        let expect: Vec<_> = full.iter().skip(offset).take(limit).cloned().collect();
        assert_eq!(page, expect, "offset={offset} limit={limit}");
    }
}

#[test]
fn list_honors_cancellation() {
    let (_dir, store) = test_store();
    put(&store, "/f", b"x", false).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = store.list("/", true, 0, 0, &cancel).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[test]
fn get_handles_stay_valid_after_delete() {
    // an open reader keeps its file handle across an unlink (POSIX)
    let (_dir, store) = test_store();
    let content = b"still readable";
    put(&store, "/f", content, false).unwrap();

    let (_, mut reader) = store.get("/f").unwrap();
    store.delete("/f").unwrap();

    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut out).unwrap();
    assert_eq!(out, content);
}
