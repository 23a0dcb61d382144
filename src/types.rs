//!
//! Shared data model
//! -----------------
//! `FileMetadata` is the identity record exchanged everywhere: computed by the
//! store on writes, serialized in the JSON envelope, carried in HTTP headers
//! for raw-body transfers, and compared by the reconciler. The sha256 digest
//! is always computed server-side from the bytes actually written; a
//! client-supplied digest is only ever verified against it.

use std::io::Read;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identity of one stored file. `name` is a canonical path key: leading
/// slash, no trailing slash, no `..` traversal (see `storage::clean_name`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "mod")]
    pub modified: DateTime<Utc>,
    pub sha256: String,
}

/// A pending write: declared identity plus the content stream.
pub struct FileUpload<R: Read> {
    pub meta: FileMetadata,
    pub reader: R,
}

/// What to do when source and destination hold different content at the same
/// path during a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Leave the destination untouched, log only.
    #[default]
    Skip,
    /// Replace the destination entry.
    Overwrite,
    /// Never overwrite; write a new `name-N.ext` version instead.
    VersionedCopy,
}

impl FromStr for ConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(ConflictPolicy::Skip),
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            "copy" | "versions" => Ok(ConflictPolicy::VersionedCopy),
            other => Err(Error::InvalidName(format!("conflict policy '{other}'"))),
        }
    }
}

/// Wire envelope wrapped around every JSON response of the storage protocol.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,
}

/// Format a timestamp the way HTTP dates are written (RFC1123, GMT).
pub fn format_http_date(ts: &DateTime<Utc>) -> String {
    ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an RFC1123 HTTP date. The RFC2822 parser accepts the obsolete GMT
/// zone name these dates carry.
pub fn parse_http_date(val: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(val)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
