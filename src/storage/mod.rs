//!
//! blobsync storage engine
//! -----------------------
//! Filesystem-backed keyed store: one blob container per key under a root
//! directory, key segments mirroring directories. Writes go to a `.part`
//! temp file in the destination's directory, are digest-verified, then
//! committed with an atomic rename; no partial container is ever visible
//! under a final name.
//!
//! Concurrency discipline:
//! - `put` takes per-key write exclusivity through an in-process intent
//!   registry; puts on different keys proceed concurrently. This is not a
//!   filesystem lock and protects nothing across processes.
//! - `list`/`rename`/`delete` serialize on one coarse store-wide mutex.
//! - `get` hands out an independent file handle; the HTTP layer tracks
//!   outstanding handles for graceful shutdown.

pub mod paths;

pub use paths::{blob_path, clean_name, strip_blob_path, validate_name};

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::blob::{self, BlobReader};
use crate::error::{Error, IoResultExt, Result};
use crate::types::{FileMetadata, FileUpload};

pub struct BlobStore {
    root: PathBuf,
    /// Serializes list/rename/delete against each other.
    structural: Mutex<()>,
    /// Keys with a put in flight. Process-local only.
    write_intents: Mutex<HashSet<String>>,
}

/// Removes the key from the write-intent registry when the put finishes,
/// successfully or not.
struct IntentGuard<'a> {
    store: &'a BlobStore,
    name: String,
}

impl Drop for IntentGuard<'_> {
    fn drop(&mut self) {
        self.store.write_intents.lock().remove(&self.name);
    }
}

impl BlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).with_path(&root)?;
        Ok(Self {
            root,
            structural: Mutex::new(()),
            write_intents: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store an upload under its canonical name. A non-empty
    /// `upload.meta.sha256` is treated as an expected digest and verified
    /// against the bytes actually written; the returned metadata always
    /// carries the computed digest.
    pub fn put<R: Read>(
        &self,
        mut upload: FileUpload<R>,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> Result<FileMetadata> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let name = validate_name(&upload.meta.name)?;

        // claim write exclusivity on this key; a racing put sees Conflict
        {
            let mut intents = self.write_intents.lock();
            if !intents.insert(name.clone()) {
                return Err(Error::Conflict(name));
            }
        }
        let _guard = IntentGuard { store: self, name: name.clone() };

        let blob_path = paths::blob_path(&self.root, &name);
        if blob_path.exists() && !overwrite {
            return Err(Error::Conflict(name));
        }

        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }

        let tmp_path = paths::temp_blob_path(&blob_path);
        let expected = upload.meta.sha256.clone();
        upload.meta.name = name.clone();

        let info = (|| -> Result<blob::BlobInfo> {
            let mut tmp = File::create(&tmp_path).with_path(&tmp_path)?;
            let info = blob::write_container(
                &mut tmp,
                &mut upload,
                (!expected.is_empty()).then_some(expected.as_str()),
            )?;
            tmp.sync_all().with_path(&tmp_path)?;
            fs::rename(&tmp_path, &blob_path).with_path(&blob_path)?;
            Ok(info)
        })()
        .inspect_err(|_| {
            let _ = fs::remove_file(&tmp_path);
        })?;

        debug!(target: "blobsync::storage", "put: committed '{}' ({} bytes)", name, info.size);

        Ok(FileMetadata {
            name,
            size: info.size,
            modified: info.modified,
            sha256: info.sha256,
        })
    }

    /// Open a stored container for reading. The returned reader seeks within
    /// the data section only.
    pub fn get(&self, name: &str) -> Result<(FileMetadata, BlobReader<File>)> {
        let name = validate_name(name)?;
        let blob_path = paths::blob_path(&self.root, &name);

        if !blob_path.is_file() {
            return Err(Error::NotFound(name));
        }

        let mut file = File::open(&blob_path).with_path(&blob_path)?;
        let info = blob::read_info(&mut file)?;

        Ok((
            FileMetadata {
                name,
                size: info.size,
                modified: info.modified,
                sha256: info.sha256,
            },
            BlobReader::new(file),
        ))
    }

    /// Identity of a stored container without touching its data bytes.
    pub fn stat(&self, name: &str) -> Result<FileMetadata> {
        let name = validate_name(name)?;
        let blob_path = paths::blob_path(&self.root, &name);

        if !blob_path.is_file() {
            return Err(Error::NotFound(name));
        }

        let mut file = File::open(&blob_path).with_path(&blob_path)?;
        let info = blob::read_info(&mut file)?;

        Ok(FileMetadata {
            name,
            size: info.size,
            modified: info.modified,
            sha256: info.sha256,
        })
    }

    /// Move a container to a new key. A pure filesystem rename; container
    /// bytes are untouched.
    pub fn rename(&self, name: &str, new_name: &str, overwrite: bool) -> Result<FileMetadata> {
        let _lock = self.structural.lock();

        let new_name = validate_name(new_name)?;
        let mut meta = self.stat(name)?;

        let old_path = paths::blob_path(&self.root, &meta.name);
        let new_path = paths::blob_path(&self.root, &new_name);
        if new_path.exists() && !overwrite {
            return Err(Error::Conflict(new_name));
        }

        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        fs::rename(&old_path, &new_path).with_path(&new_path)?;

        meta.name = new_name;
        Ok(meta)
    }

    /// Delete a container, returning what it was.
    pub fn delete(&self, name: &str) -> Result<FileMetadata> {
        let _lock = self.structural.lock();

        let meta = self.stat(name)?;
        let blob_path = paths::blob_path(&self.root, &meta.name);
        fs::remove_file(&blob_path).with_path(&blob_path)?;

        Ok(meta)
    }

    /// Ordered page of entries under a prefix. The prefix may end in a
    /// partial file name ("/docs/rea" matches "/docs/readme.md"). Pagination
    /// is a plain skip/take over the sorted traversal, stable only while the
    /// store is quiescent. A missing directory yields an empty page. `limit`
    /// and `offset` of zero mean unbounded.
    pub fn list(
        &self,
        prefix: &str,
        recursive: bool,
        offset: usize,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileMetadata>> {
        let _lock = self.structural.lock();

        let prefix = clean_name(prefix);
        let mut fs_prefix = self.root.clone();
        for segment in prefix.split('/').filter(|s| !s.is_empty()) {
            fs_prefix.push(segment);
        }

        // a prefix naming a real directory is walked directly; otherwise the
        // last segment is a partial file name and the parent is walked with a
        // string filter ("/docs/rea" matches "/docs/readme.md")
        let (walk_dir, filter) = if prefix == "/" || fs_prefix.is_dir() {
            (fs_prefix.clone(), None)
        } else {
            (
                fs_prefix.parent().unwrap_or(&self.root).to_path_buf(),
                Some(fs_prefix.to_string_lossy().into_owned()),
            )
        };
        if !walk_dir.is_dir() || !walk_dir.starts_with(&self.root) {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        let mut page_idx = 0usize;

        paths::walk_blobs(&walk_dir, recursive, &mut |path: &Path| {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(filter) = &filter {
                if !path.to_string_lossy().starts_with(filter.as_str()) {
                    return Ok(true);
                }
            }

            page_idx += 1;
            if offset > 0 && page_idx <= offset {
                return Ok(true);
            }
            if limit > 0 && results.len() >= limit {
                return Ok(false);
            }

            let mut file = File::open(path).with_path(path)?;
            let info = blob::read_info(&mut file)?;
            results.push(FileMetadata {
                name: strip_blob_path(path, &self.root),
                size: info.size,
                modified: info.modified,
                sha256: info.sha256,
            });
            Ok(true)
        })?;

        Ok(results)
    }
}

#[cfg(test)]
#[path = "storage_tests.rs"]
mod storage_tests;
