use std::fs;
use std::path::Path;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::types::ConflictPolicy;

fn seed(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn read(dir: &Path, rel: &str) -> String {
    fs::read_to_string(dir.join(rel)).unwrap()
}

fn opts(policy: ConflictPolicy) -> SyncOptions {
    SyncOptions {
        policy,
        prune: false,
        dry_run: false,
    }
}

async fn run(src: &TempDir, dst: &TempDir, opts: &SyncOptions) -> SyncReport {
    let src = LocalTree::new(src.path());
    let dst = LocalTree::new(dst.path());
    reconcile(&src, &dst, "/", "/", opts, &CancellationToken::new())
        .await
        .unwrap()
}

#[test]
fn version_naming() {
    assert_eq!(with_file_version("/a/f.txt", 0), "/a/f.txt");
    assert_eq!(with_file_version("/a/f.txt", 1), "/a/f.txt");
    assert_eq!(with_file_version("/a/f.txt", 2), "/a/f-2.txt");
    assert_eq!(with_file_version("/a/f.txt", 12), "/a/f-12.txt");
    assert_eq!(with_file_version("/a/noext", 3), "/a/noext-3");
    assert_eq!(with_file_version("/a/.hidden", 2), "/a/.hidden-2");
    // dots in directory segments never shift the split
    assert_eq!(with_file_version("/v1.0/readme", 2), "/v1.0/readme-2");
    assert_eq!(with_file_version("/a.b/c.txt", 3), "/a.b/c-3.txt");
}

#[test]
fn version_index_handles_dotted_paths() {
    let neighbors = vec!["/v1.0/readme".to_string(), "/v1.0/readme-2".to_string()];
    assert_eq!(version_index("/v1.0/readme", &neighbors), 2);

    let hidden = vec!["/a/.hidden".to_string(), "/a/.hidden-3".to_string()];
    assert_eq!(version_index("/a/.hidden", &hidden), 3);
}

#[test]
fn prefix_matching_stops_at_segment_boundaries() {
    assert!(under_prefix("/docs/f.txt", "/docs"));
    assert!(under_prefix("/docs", "/docs"));
    assert!(!under_prefix("/docs-old/f.txt", "/docs"));
    assert!(under_prefix("/anything", "/"));

    assert_eq!(relative("/docs/f.txt", "/docs"), "/f.txt");
    assert_eq!(relative("/docs", "/docs"), "/");
    assert_eq!(relative("/docs-old/f.txt", "/docs"), "/docs-old/f.txt");
}

#[test]
fn version_index_scans_neighbors() {
    let neighbors: Vec<String> = ["/a/f.txt", "/a/f-2.txt", "/a/f-4.txt", "/a/g.txt", "/a/f-x.txt"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(version_index("/a/f.txt", &neighbors), 4);
    assert_eq!(version_index("/a/g.txt", &neighbors), 1);
    assert_eq!(version_index("/a/missing.txt", &neighbors), 0);
}

#[test]
fn version_index_escapes_pattern_chars() {
    let neighbors = vec!["/a/f.x.txt".to_string(), "/a/f.x-2.txt".to_string()];
    assert_eq!(version_index("/a/f.x.txt", &neighbors), 2);
    // the dot must not match "fAx"
    let decoys = vec!["/a/fAx-9.txt".to_string()];
    assert_eq!(version_index("/a/f.x.txt", &decoys), 0);
}

#[tokio::test]
async fn transfers_new_files() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    seed(src.path(), "a.txt", "alpha");
    seed(src.path(), "sub/b.txt", "beta");

    let report = run(&src, &dst, &opts(ConflictPolicy::Skip)).await;

    assert_eq!(report.transferred(), 2);
    assert_eq!(read(dst.path(), "a.txt"), "alpha");
    assert_eq!(read(dst.path(), "sub/b.txt"), "beta");
}

#[tokio::test]
async fn preserves_modified_time() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    seed(src.path(), "a.txt", "alpha");

    run(&src, &dst, &opts(ConflictPolicy::Skip)).await;

    let want = fs::metadata(src.path().join("a.txt")).unwrap().modified().unwrap();
    let got = fs::metadata(dst.path().join("a.txt")).unwrap().modified().unwrap();
    let drift = want
        .duration_since(got)
        .unwrap_or_else(|e| e.duration())
        .as_secs();
    assert!(drift <= 1, "mtime drift of {drift}s");
}

#[tokio::test]
async fn skip_policy_leaves_conflicts() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    seed(src.path(), "a.txt", "new content");
    seed(dst.path(), "a.txt", "old content");

    let report = run(&src, &dst, &opts(ConflictPolicy::Skip)).await;

    assert_eq!(report.actions, vec![SyncAction::Skip("/a.txt".into())]);
    assert_eq!(read(dst.path(), "a.txt"), "old content");
}

#[tokio::test]
async fn overwrite_policy_replaces_conflicts() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    seed(src.path(), "a.txt", "new content");
    seed(dst.path(), "a.txt", "old content");

    let report = run(&src, &dst, &opts(ConflictPolicy::Overwrite)).await;

    assert_eq!(report.actions, vec![SyncAction::Update("/a.txt".into())]);
    assert_eq!(read(dst.path(), "a.txt"), "new content");
}

#[tokio::test]
async fn identical_content_is_up_to_date() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    seed(src.path(), "a.txt", "same");
    seed(dst.path(), "a.txt", "same");

    let report = run(&src, &dst, &opts(ConflictPolicy::Overwrite)).await;

    assert_eq!(report.actions, vec![SyncAction::UpToDate("/a.txt".into())]);
}

#[tokio::test]
async fn versioned_copy_numbers_conflicts() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    seed(src.path(), "a.txt", "revision two");
    seed(dst.path(), "a.txt", "revision one");

    let report = run(&src, &dst, &opts(ConflictPolicy::VersionedCopy)).await;

    assert_eq!(
        report.actions,
        vec![SyncAction::Version {
            name: "/a.txt".into(),
            copy: "/a-2.txt".into(),
        }]
    );
    assert_eq!(read(dst.path(), "a.txt"), "revision one");
    assert_eq!(read(dst.path(), "a-2.txt"), "revision two");

    // a second run with the same source finds the matching copy and stops
    let report = run(&src, &dst, &opts(ConflictPolicy::VersionedCopy)).await;
    assert_eq!(report.actions, vec![SyncAction::UpToDate("/a-2.txt".into())]);

    // changed source content gets the next number
    seed(src.path(), "a.txt", "revision three");
    run(&src, &dst, &opts(ConflictPolicy::VersionedCopy)).await;
    assert_eq!(read(dst.path(), "a-3.txt"), "revision three");
}

#[tokio::test]
async fn versioned_copy_disables_prune() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    seed(src.path(), "a.txt", "new");
    seed(dst.path(), "a.txt", "old");
    seed(dst.path(), "stray.txt", "keep me");

    let options = SyncOptions {
        policy: ConflictPolicy::VersionedCopy,
        prune: true,
        dry_run: false,
    };
    run(&src, &dst, &options).await;

    assert!(dst.path().join("stray.txt").exists());
    assert!(dst.path().join("a-2.txt").exists());
}

#[tokio::test]
async fn prune_removes_unmatched_destination_files() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    seed(src.path(), "a.txt", "alpha");
    seed(dst.path(), "a.txt", "alpha");
    seed(dst.path(), "stale.txt", "gone");
    seed(dst.path(), "deep/stale.txt", "gone");

    let options = SyncOptions {
        policy: ConflictPolicy::Skip,
        prune: true,
        dry_run: false,
    };
    let report = run(&src, &dst, &options).await;

    assert_eq!(report.pruned(), 2);
    assert!(!dst.path().join("stale.txt").exists());
    assert!(!dst.path().join("deep/stale.txt").exists());
    assert!(dst.path().join("a.txt").exists());
}

#[tokio::test]
async fn dry_run_logs_without_touching_anything() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    seed(src.path(), "a.txt", "new");
    seed(src.path(), "b.txt", "fresh");
    seed(dst.path(), "a.txt", "old");
    seed(dst.path(), "stale.txt", "gone");

    let options = SyncOptions {
        policy: ConflictPolicy::Overwrite,
        prune: true,
        dry_run: true,
    };
    let dry = run(&src, &dst, &options).await;

    assert_eq!(read(dst.path(), "a.txt"), "old");
    assert!(!dst.path().join("b.txt").exists());
    assert!(dst.path().join("stale.txt").exists());

    // the real run performs exactly what the dry run promised
    let wet = run(&src, &dst, &SyncOptions { dry_run: false, ..options }).await;
    assert_eq!(dry.actions, wet.actions);
    assert_eq!(read(dst.path(), "a.txt"), "new");
    assert!(!dst.path().join("stale.txt").exists());
}

#[tokio::test]
async fn store_rejects_digest_mismatch() {
    let dst = TempDir::new().unwrap();
    let tree = LocalTree::new(dst.path());

    let meta = FileMetadata {
        name: "/a.txt".into(),
        size: 5,
        modified: chrono::Utc::now(),
        sha256: "00".repeat(32),
    };
    let err = tree.store(&meta, b"hello".to_vec(), false).await.unwrap_err();
    assert!(matches!(err, Error::FormatIntegrity(_)));
    assert!(!dst.path().join("a.txt").exists());
}

#[tokio::test]
async fn failed_transfer_aborts_the_run() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    seed(src.path(), "a.txt", "alpha");
    // make the destination path unwritable by occupying it with a directory
    fs::create_dir_all(dst.path().join("a.txt")).unwrap();

    let tree_src = LocalTree::new(src.path());
    let tree_dst = LocalTree::new(dst.path());
    let err = reconcile(
        &tree_src,
        &tree_dst,
        "/",
        "/",
        &opts(ConflictPolicy::Overwrite),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Aborted { .. }));
}

#[tokio::test]
async fn index_prefix_excludes_sibling_directories() {
    let dir = TempDir::new().unwrap();
    seed(dir.path(), "docs/a.txt", "a");
    seed(dir.path(), "docs-old/b.txt", "b");

    let tree = LocalTree::new(dir.path());
    let entries = tree.index("/docs", &CancellationToken::new()).await.unwrap();
    let names: Vec<&str> = entries.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, ["/docs/a.txt"]);
}

#[tokio::test]
async fn index_missing_root_is_io_error() {
    let dir = TempDir::new().unwrap();
    let tree = LocalTree::new(dir.path().join("absent"));

    let err = tree.index("/", &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Io { .. }));
}

#[tokio::test]
async fn cancellation_stops_the_index() {
    let src = TempDir::new().unwrap();
    seed(src.path(), "a.txt", "alpha");

    let tree = LocalTree::new(src.path());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = tree.index("/", &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}
