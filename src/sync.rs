//!
//! Directory reconciler
//! --------------------
//! One-way synchronization between two endpoints. Push and pull are the same
//! algorithm with source and destination swapped, so both sides sit behind
//! `SyncEndpoint`: a local directory tree or a remote blobsync server.
//!
//! The source index drives the run. Every source entry is transferred,
//! skipped, overwritten or version-copied according to the conflict policy,
//! and destination entries the source never mentioned are pruned when asked.
//! Dry-run produces the exact action log of a real run without moving bytes.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::client::RestClient;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::sha256_hex_stream;
use crate::storage::paths::clean_name;
use crate::types::{ConflictPolicy, FileMetadata};

/// Either side of a sync run. Names are canonical ("/a/b.txt") and rooted at
/// whatever the endpoint considers its top.
#[allow(async_fn_in_trait)]
pub trait SyncEndpoint {
    /// All files under `prefix`, recursively, with content digests.
    async fn index(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<FileMetadata>>;

    /// Immediate file names inside `dir`, non-recursive. Used to find
    /// existing versioned copies next to a conflicting destination.
    async fn neighbors(&self, dir: &str) -> Result<Vec<String>>;

    async fn fetch(&self, name: &str) -> Result<(FileMetadata, Vec<u8>)>;

    async fn store(&self, meta: &FileMetadata, content: Vec<u8>, overwrite: bool) -> Result<()>;

    async fn remove(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub policy: ConflictPolicy,
    pub prune: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// New file copied to the destination.
    Transfer(String),
    /// Existing destination file replaced.
    Update(String),
    /// Conflict left alone under the skip policy.
    Skip(String),
    /// Source and destination already carry the same content.
    UpToDate(String),
    /// Conflict resolved by writing a numbered copy.
    Version { name: String, copy: String },
    /// Destination file absent from the source, removed.
    Prune(String),
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncAction::Transfer(name) => write!(f, "transfer {name}"),
            SyncAction::Update(name) => write!(f, "update {name}"),
            SyncAction::Skip(name) => write!(f, "skip {name}"),
            SyncAction::UpToDate(name) => write!(f, "up-to-date {name}"),
            SyncAction::Version { name, copy } => write!(f, "version {name} -> {copy}"),
            SyncAction::Prune(name) => write!(f, "prune {name}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub actions: Vec<SyncAction>,
}

impl SyncReport {
    pub fn transferred(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| {
                matches!(
                    a,
                    SyncAction::Transfer(_) | SyncAction::Update(_) | SyncAction::Version { .. }
                )
            })
            .count()
    }

    pub fn pruned(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, SyncAction::Prune(_)))
            .count()
    }
}

/// Whether `name` sits at or under `prefix` on a path-segment boundary, so
/// "/docs" covers "/docs/f" but never "/docs-old/f".
fn under_prefix(name: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match name.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Strip `prefix` from a canonical name, leaving a "/"-rooted remainder.
/// Names outside the prefix come back unchanged.
fn relative(name: &str, prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    match name.strip_prefix(prefix) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => name.to_string(),
    }
}

fn join_name(prefix: &str, rel: &str) -> String {
    clean_name(&format!("{}/{}", prefix.trim_end_matches('/'), rel))
}

fn parent_dir(name: &str) -> String {
    match name.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => name[..pos].to_string(),
    }
}

/// Split a file name into stem and extension, the extension keeping its dot.
/// Only the final path segment is inspected, so dots in directory names never
/// shift the split, and dotfiles count as all stem.
fn split_stem(name: &str) -> (&str, &str) {
    let base_start = name.rfind('/').map_or(0, |pos| pos + 1);
    match name[base_start..].rfind('.') {
        Some(pos) if pos > 0 => name.split_at(base_start + pos),
        _ => (name, ""),
    }
}

/// Numbered variant of a name. Index 1 is the original file itself, copies
/// start at 2: "/a/f.txt" at index 3 is "/a/f-3.txt".
pub fn with_file_version(name: &str, idx: u64) -> String {
    if idx <= 1 {
        return name.to_string();
    }
    let (stem, ext) = split_stem(name);
    format!("{stem}-{idx}{ext}")
}

/// Highest version index already present among `neighbors` for `name`.
/// The base file itself counts as version 1; no base and no copies is 0.
pub fn version_index(name: &str, neighbors: &[String]) -> u64 {
    let (stem, ext) = split_stem(name);
    let pattern = format!("^{}-([0-9]+){}$", regex::escape(stem), regex::escape(ext));
    // the stem comes out of our own canonical names, never user regex
    let re = Regex::new(&pattern).unwrap_or_else(|_| Regex::new("$^").unwrap());

    let mut max = 0u64;
    for candidate in neighbors {
        if candidate == name {
            max = max.max(1);
            continue;
        }
        if let Some(caps) = re.captures(candidate) {
            if let Ok(idx) = caps[1].parse::<u64>() {
                max = max.max(idx);
            }
        }
    }
    max
}

fn identical(a: &FileMetadata, b: &FileMetadata) -> bool {
    if !a.sha256.is_empty() && !b.sha256.is_empty() {
        return a.sha256 == b.sha256;
    }
    a.size == b.size
}

fn abort(name: &str, source: Error) -> Error {
    Error::Aborted {
        name: name.to_string(),
        source: Box::new(source),
    }
}

/// One-way reconciliation of `src_prefix` on `src` into `dst_prefix` on
/// `dst`. Fails fast: the first transfer or delete error aborts the run.
pub async fn reconcile<S: SyncEndpoint, D: SyncEndpoint>(
    src: &S,
    dst: &D,
    src_prefix: &str,
    dst_prefix: &str,
    opts: &SyncOptions,
    cancel: &CancellationToken,
) -> Result<SyncReport> {
    let mut opts = *opts;
    if opts.prune && opts.policy == ConflictPolicy::VersionedCopy {
        // numbered copies never appear in the source index and would all be
        // pruned right back out
        info!(target: "sync", "pruning disabled under the versioned-copy policy");
        opts.prune = false;
    }

    let src_entries = src.index(src_prefix, cancel).await?;

    let mut dst_index: HashMap<String, FileMetadata> = HashMap::new();
    let mut dst_digests: HashMap<String, String> = HashMap::new();
    for meta in dst.index(dst_prefix, cancel).await? {
        dst_digests.insert(meta.name.clone(), meta.sha256.clone());
        dst_index.insert(relative(&meta.name, dst_prefix), meta);
    }

    let mut report = SyncReport::default();

    for src_meta in src_entries {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let rel = relative(&src_meta.name, src_prefix);
        let dst_name = join_name(dst_prefix, &rel);

        match dst_index.remove(&rel) {
            None => {
                debug!(target: "sync", name = %dst_name, "transfer");
                report.actions.push(SyncAction::Transfer(dst_name.clone()));
                if !opts.dry_run {
                    transfer(src, dst, &src_meta, &dst_name, opts.policy == ConflictPolicy::Overwrite)
                        .await
                        .map_err(|e| abort(&dst_name, e))?;
                }
            }
            Some(existing) if identical(&src_meta, &existing) => {
                report.actions.push(SyncAction::UpToDate(dst_name));
            }
            Some(_) => match opts.policy {
                ConflictPolicy::Skip => {
                    debug!(target: "sync", name = %dst_name, "conflict, skipping");
                    report.actions.push(SyncAction::Skip(dst_name));
                }
                ConflictPolicy::Overwrite => {
                    debug!(target: "sync", name = %dst_name, "conflict, overwriting");
                    report.actions.push(SyncAction::Update(dst_name.clone()));
                    if !opts.dry_run {
                        transfer(src, dst, &src_meta, &dst_name, true)
                            .await
                            .map_err(|e| abort(&dst_name, e))?;
                    }
                }
                ConflictPolicy::VersionedCopy => {
                    let siblings = dst
                        .neighbors(&parent_dir(&dst_name))
                        .await
                        .map_err(|e| abort(&dst_name, e))?;
                    let latest = version_index(&dst_name, &siblings);
                    let latest_name = with_file_version(&dst_name, latest);

                    // a fresh copy is pointless when the newest one already
                    // carries the source content
                    let matches_latest = dst_digests
                        .get(&latest_name)
                        .is_some_and(|d| !d.is_empty() && *d == src_meta.sha256);
                    if matches_latest {
                        report.actions.push(SyncAction::UpToDate(latest_name));
                        continue;
                    }

                    let copy = with_file_version(&dst_name, latest.max(1) + 1);
                    debug!(target: "sync", name = %dst_name, copy = %copy, "conflict, versioning");
                    report.actions.push(SyncAction::Version {
                        name: dst_name.clone(),
                        copy: copy.clone(),
                    });
                    if !opts.dry_run {
                        transfer(src, dst, &src_meta, &copy, false)
                            .await
                            .map_err(|e| abort(&copy, e))?;
                    }
                }
            },
        }
    }

    if opts.prune {
        let mut leftovers: Vec<String> = dst_index.into_values().map(|m| m.name).collect();
        leftovers.sort();
        for name in leftovers {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            debug!(target: "sync", name = %name, "prune");
            report.actions.push(SyncAction::Prune(name.clone()));
            if !opts.dry_run {
                dst.remove(&name).await.map_err(|e| abort(&name, e))?;
            }
        }
    }

    Ok(report)
}

async fn transfer<S: SyncEndpoint, D: SyncEndpoint>(
    src: &S,
    dst: &D,
    src_meta: &FileMetadata,
    dst_name: &str,
    overwrite: bool,
) -> Result<()> {
    let (mut meta, content) = src.fetch(&src_meta.name).await?;
    meta.name = dst_name.to_string();
    dst.store(&meta, content, overwrite).await
}

/// A directory on the local filesystem as a sync endpoint. Names are
/// "/"-rooted relative to `root`.
pub struct LocalTree {
    root: PathBuf,
}

impl LocalTree {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let rel = clean_name(name);
        self.root.join(rel.trim_start_matches('/'))
    }

    fn describe(&self, name: &str, path: &Path) -> Result<FileMetadata> {
        let attrs = fs::metadata(path).with_path(path)?;
        let mut file = fs::File::open(path).with_path(path)?;
        let (digest, size) = sha256_hex_stream(&mut file)?;
        let modified: DateTime<Utc> = attrs
            .modified()
            .with_path(path)
            .map(DateTime::from)?;
        Ok(FileMetadata {
            name: name.to_string(),
            size,
            modified,
            sha256: digest,
        })
    }
}

impl SyncEndpoint for LocalTree {
    async fn index(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<FileMetadata>> {
        let prefix = clean_name(prefix);
        let mut out = Vec::new();

        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.root.clone());
                match e.into_io_error() {
                    Some(source) => Error::Io { path, source },
                    None => Error::Io {
                        path,
                        source: std::io::Error::other("filesystem loop in walk"),
                    },
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|_| Error::InvalidName(entry.path().display().to_string()))?;
            let name = clean_name(&format!("/{}", rel.to_string_lossy().replace('\\', "/")));
            if !under_prefix(&name, &prefix) {
                continue;
            }
            out.push(self.describe(&name, entry.path())?);
        }
        Ok(out)
    }

    async fn neighbors(&self, dir: &str) -> Result<Vec<String>> {
        let path = self.resolve(dir);
        if !path.is_dir() {
            return Ok(Vec::new());
        }
        let dir = clean_name(dir);
        let mut out = Vec::new();
        for entry in fs::read_dir(&path).with_path(&path)? {
            let entry = entry.with_path(&path)?;
            if entry.file_type().with_path(&path)?.is_file() {
                out.push(join_name(&dir, &entry.file_name().to_string_lossy()));
            }
        }
        out.sort();
        Ok(out)
    }

    async fn fetch(&self, name: &str) -> Result<(FileMetadata, Vec<u8>)> {
        let path = self.resolve(name);
        if !path.is_file() {
            return Err(Error::NotFound(name.to_string()));
        }
        let meta = self.describe(name, &path)?;
        let content = fs::read(&path).with_path(&path)?;
        Ok((meta, content))
    }

    async fn store(&self, meta: &FileMetadata, content: Vec<u8>, overwrite: bool) -> Result<()> {
        let path = self.resolve(&meta.name);
        if path.exists() && !overwrite {
            return Err(Error::Conflict(meta.name.clone()));
        }
        if !meta.sha256.is_empty() {
            let got = crate::hash::sha256_hex(&content);
            if got != meta.sha256 {
                return Err(Error::format(format!(
                    "digest mismatch for '{}': expected {}, got {got}",
                    meta.name, meta.sha256
                )));
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        let tmp = crate::storage::paths::temp_blob_path(&path);
        fs::write(&tmp, &content).with_path(&tmp)?;
        let applied: Result<()> = (|| {
            let file = fs::File::open(&tmp).with_path(&tmp)?;
            file.set_modified(meta.modified.into()).with_path(&tmp)?;
            fs::rename(&tmp, &path).with_path(&path)?;
            Ok(())
        })();
        applied.inspect_err(|_| {
            let _ = fs::remove_file(&tmp);
        })
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let path = self.resolve(name);
        if !path.is_file() {
            return Err(Error::NotFound(name.to_string()));
        }
        fs::remove_file(&path).with_path(&path)
    }
}

impl SyncEndpoint for RestClient {
    async fn index(&self, prefix: &str, _cancel: &CancellationToken) -> Result<Vec<FileMetadata>> {
        self.list(prefix, true, 0, 0).await
    }

    async fn neighbors(&self, dir: &str) -> Result<Vec<String>> {
        let entries = self.list(dir, false, 0, 0).await?;
        Ok(entries.into_iter().map(|m| m.name).collect())
    }

    async fn fetch(&self, name: &str) -> Result<(FileMetadata, Vec<u8>)> {
        self.download(name).await
    }

    async fn store(&self, meta: &FileMetadata, content: Vec<u8>, overwrite: bool) -> Result<()> {
        self.put(meta, content, overwrite).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.delete(name).await.map(|_| ())
    }
}

#[cfg(test)]
#[path = "sync_tests.rs"]
mod sync_tests;
