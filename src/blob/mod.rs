//!
//! Blob container codec
//! --------------------
//! One stored file is one self-describing container on disk: a short magic
//! followed by self-delimiting sections. The *data* section carries the
//! declared size, the embedded modification timestamp and the raw bytes; the
//! *metadata* section is a small versioned JSON record holding the content
//! digest. The data section is written first so the digest can be computed
//! while the content streams through, then the metadata section is appended.
//!
//! Wire layout:
//!
//! ```text
//! magic    b"bsb1"
//! section  kind: u8 (1 = data, 2 = metadata)
//!          len:  u64 LE (payload bytes)
//!          payload
//! data     modified_unix_ms: i64 LE | size: u64 LE | <size raw bytes>
//! metadata JSON {"v":1,"h":"<hex sha256>"}
//! ```
//!
//! Decoding tolerates sections in any order and skips unknown kinds; a
//! container missing either section fails with a format-integrity error.
//! Containers are immutable once committed; the store replaces them whole via
//! temp file + atomic rename.

mod reader;

pub use reader::BlobReader;

use std::io::{Read, Seek, SeekFrom, Write};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, IoResultExt, Result};
use crate::types::FileUpload;

pub const FILE_EXT_BLOB: &str = ".blob";
pub const FILE_EXT_PARTIAL: &str = ".part";

const MAGIC: &[u8; 4] = b"bsb1";
const SECTION_DATA: u8 = 1;
const SECTION_METADATA: u8 = 2;
const DATA_HEADER_LEN: u64 = 16;
const METADATA_VERSION: u32 = 1;
/// The metadata record is a few dozen bytes of JSON; anything past this is a
/// corrupt length field, not a real section.
const METADATA_MAX_LEN: u64 = 4096;

/// The metadata section record. Kept deliberately small; `v` leaves room to
/// grow the record without breaking old containers.
#[derive(Debug, Serialize, Deserialize)]
struct MetadataRecord {
    v: u32,
    h: String,
}

/// What a container says about its content.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobInfo {
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub sha256: String,
}

/// Encode an upload into `writer` as a complete container.
///
/// The content is streamed through a sha256 pass; a stream shorter or longer
/// than the declared size fails, and if `expected_digest` is non-empty it is
/// verified against the computed digest (fail closed, nothing about the
/// destination is touched — the caller discards the temp file).
pub fn write_container<W, R>(
    writer: &mut W,
    upload: &mut FileUpload<R>,
    expected_digest: Option<&str>,
) -> Result<BlobInfo>
where
    W: Write,
    R: Read,
{
    let path = "<container>";
    let size = upload.meta.size;

    writer.write_all(MAGIC).with_path(path)?;
    writer.write_all(&[SECTION_DATA]).with_path(path)?;
    writer
        .write_all(&(DATA_HEADER_LEN + size).to_le_bytes())
        .with_path(path)?;
    writer
        .write_all(&upload.meta.modified.timestamp_millis().to_le_bytes())
        .with_path(path)?;
    writer.write_all(&size.to_le_bytes()).with_path(path)?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut written = 0u64;
    loop {
        let n = upload.reader.read(&mut buf).with_path(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).with_path(path)?;
        written += n as u64;
        if written > size {
            break;
        }
    }

    if written != size {
        return Err(Error::format(format!(
            "data section: declared {size} bytes but wrote {written}"
        )));
    }

    let sha256 = hex::encode(hasher.finalize());
    if let Some(expected) = expected_digest {
        if !expected.is_empty() && expected != sha256 {
            return Err(Error::format(format!(
                "sha256 checksum: expected '{expected}'; have '{sha256}'"
            )));
        }
    }

    let record = serde_json::to_vec(&MetadataRecord {
        v: METADATA_VERSION,
        h: sha256.clone(),
    })?;
    writer.write_all(&[SECTION_METADATA]).with_path(path)?;
    writer
        .write_all(&(record.len() as u64).to_le_bytes())
        .with_path(path)?;
    writer.write_all(&record).with_path(path)?;
    writer.flush().with_path(path)?;

    Ok(BlobInfo {
        size,
        modified: upload.meta.modified,
        sha256,
    })
}

/// Outcome of one pass over a container's section table.
pub(crate) struct SectionScan {
    /// Absolute offset of the raw data bytes plus the declared size and the
    /// embedded timestamp, when a data section was found.
    pub data: Option<(u64, u64, DateTime<Utc>)>,
    pub digest: Option<String>,
}

/// Walk the section table from the start of the container. The data payload
/// is skipped with a relative seek, never read.
pub(crate) fn scan_sections<R: Read + Seek>(reader: &mut R) -> Result<SectionScan> {
    let path = "<container>";

    reader.seek(SeekFrom::Start(0)).with_path(path)?;
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).with_path(path)?;
    if &magic != MAGIC {
        return Err(Error::format("bad container magic"));
    }

    let mut scan = SectionScan { data: None, digest: None };

    loop {
        let mut kind = [0u8; 1];
        match reader.read(&mut kind) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::Io { path: path.into(), source: e }),
        }

        let mut len_buf = [0u8; 8];
        reader.read_exact(&mut len_buf).with_path(path)?;
        let len = u64::from_le_bytes(len_buf);
        // a length this large cannot be seeked over and marks a corrupt table
        if len > i64::MAX as u64 {
            return Err(Error::format(format!("section length {len} out of bounds")));
        }

        match kind[0] {
            SECTION_DATA => {
                if len < DATA_HEADER_LEN {
                    return Err(Error::format("truncated data section header"));
                }
                let mut header = [0u8; 16];
                reader.read_exact(&mut header).with_path(path)?;
                let modified_ms = i64::from_le_bytes(header[..8].try_into().unwrap());
                let size = u64::from_le_bytes(header[8..].try_into().unwrap());
                if len != DATA_HEADER_LEN + size {
                    return Err(Error::format(format!(
                        "data section length {len} does not match declared size {size}"
                    )));
                }
                let start = reader.stream_position().with_path(path)?;
                scan.data = Some((
                    start,
                    size,
                    Utc.timestamp_millis_opt(modified_ms)
                        .single()
                        .ok_or_else(|| Error::format("bad data section timestamp"))?,
                ));
                reader.seek(SeekFrom::Current(size as i64)).with_path(path)?;
            }
            SECTION_METADATA => {
                if len > METADATA_MAX_LEN {
                    return Err(Error::format(format!(
                        "metadata section length {len} exceeds {METADATA_MAX_LEN}"
                    )));
                }
                let mut payload = vec![0u8; len as usize];
                reader.read_exact(&mut payload).with_path(path)?;
                let record: MetadataRecord = serde_json::from_slice(&payload)?;
                scan.digest = Some(record.h);
            }
            _ => {
                // unknown section kind from a future version, skip it
                reader.seek(SeekFrom::Current(len as i64)).with_path(path)?;
            }
        }
    }

    Ok(scan)
}

/// Decode a container's identity without reading its data bytes.
pub fn read_info<R: Read + Seek>(reader: &mut R) -> Result<BlobInfo> {
    let scan = scan_sections(reader)?;

    let (_, size, modified) = scan
        .data
        .ok_or_else(|| Error::format("missing data section"))?;
    let sha256 = scan
        .digest
        .ok_or_else(|| Error::format("missing metadata section"))?;

    Ok(BlobInfo { size, modified, sha256 })
}
