//! Canonical name handling and on-disk path mapping.
//!
//! A key is a canonical path: leading slash, no trailing slash, `.`/`..`
//! segments resolved lexically and clamped at the root. Each key maps to one
//! `<root>/<key>.blob` container; hierarchical key segments mirror real
//! directories.

use std::path::{Path, PathBuf};

use crate::blob::{FILE_EXT_BLOB, FILE_EXT_PARTIAL};
use crate::error::{Error, Result};

/// Lexically clean a name into canonical form. Never escapes the root: `..`
/// at the top is dropped, like `path.Clean` on a rooted path.
pub fn clean_name(val: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in val.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return "/".into();
    }
    format!("/{}", parts.join("/"))
}

/// Clean a name and reject keys that do not address a file.
pub fn validate_name(val: &str) -> Result<String> {
    let name = clean_name(val);
    if name == "/" {
        return Err(Error::InvalidName(val.to_string()));
    }
    Ok(name)
}

/// On-disk container path for a key.
pub fn blob_path(root: &Path, name: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for segment in clean_name(name).split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    let file = format!(
        "{}{}",
        path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default(),
        FILE_EXT_BLOB
    );
    path.set_file_name(file);
    path
}

/// Partial-file path beside the destination container, so the final rename
/// never crosses a filesystem boundary.
pub fn temp_blob_path(blob: &Path) -> PathBuf {
    let file = format!(
        "{}.{}{}",
        blob.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default(),
        uuid::Uuid::new_v4(),
        FILE_EXT_PARTIAL
    );
    blob.with_file_name(file)
}

/// Inverse of `blob_path`: recover the canonical key from a container path.
pub fn strip_blob_path(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut name = String::new();
    for segment in rel.components() {
        name.push('/');
        name.push_str(&segment.as_os_str().to_string_lossy());
    }
    if let Some(stripped) = name.strip_suffix(FILE_EXT_BLOB) {
        name = stripped.to_string();
    }
    clean_name(&name)
}

/// Sorted depth-interleaved walk over container files, mirroring a sorted
/// `read_dir` recursion: entries are visited in name order, directory
/// contents at the directory's position. The callback returns whether the
/// walk should continue.
pub fn walk_blobs<F>(dir: &Path, recursive: bool, on_file: &mut F) -> Result<bool>
where
    F: FnMut(&Path) -> Result<bool>,
{
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|source| Error::Io { path: dir.to_path_buf(), source })?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in entries {
        if path.is_dir() {
            if recursive && !walk_blobs(&path, recursive, on_file)? {
                return Ok(false);
            }
        } else if path.is_file()
            && path.extension().map(|e| e == "blob").unwrap_or(false)
            && !on_file(&path)?
        {
            return Ok(false);
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_name_cases() {
        assert_eq!(clean_name("docs/readme.md"), "/docs/readme.md");
        assert_eq!(clean_name("/docs/readme.md/"), "/docs/readme.md");
        assert_eq!(clean_name("//a//b//"), "/a/b");
        assert_eq!(clean_name("/a/./b"), "/a/b");
        assert_eq!(clean_name("/a/b/../c"), "/a/c");
        assert_eq!(clean_name("/../../etc/passwd"), "/etc/passwd");
        assert_eq!(clean_name(""), "/");
        assert_eq!(clean_name("/.."), "/");
    }

    #[test]
    fn validate_rejects_rootless_names() {
        assert!(validate_name("/").is_err());
        assert!(validate_name("..").is_err());
        assert_eq!(validate_name("a").unwrap(), "/a");
    }

    #[test]
    fn blob_path_roundtrip() {
        let root = Path::new("/var/data");
        let path = blob_path(root, "/docs/readme.md");
        assert_eq!(path, Path::new("/var/data/docs/readme.md.blob"));
        assert_eq!(strip_blob_path(&path, root), "/docs/readme.md");
    }

    #[test]
    fn temp_path_sits_beside_destination() {
        let blob = Path::new("/var/data/docs/readme.md.blob");
        let tmp = temp_blob_path(blob);
        assert_eq!(tmp.parent(), blob.parent());
        let name = tmp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("readme.md.blob."));
        assert!(name.ends_with(".part"));
    }
}
