//! Random-access reader over a container's data section.
//!
//! The container format is stream-oriented: sections only declare their own
//! length, so the reader locates the data section by walking the section
//! table. A backward seek re-scans the table from the start of the container
//! before skipping forward again — O(n) in the number of sections — while
//! forward seeks skip ahead directly. Callers that care should read ranges in
//! ascending order.

use std::io::{self, Read, Seek, SeekFrom};

use super::scan_sections;
use crate::error::{Error, Result};

pub struct BlobReader<R: Read + Seek> {
    inner: R,
    /// (absolute offset of the first data byte, data size); resolved lazily.
    data: Option<(u64, u64)>,
    /// Logical offset within the data section.
    offset: u64,
}

impl<R: Read + Seek> BlobReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, data: None, offset: 0 }
    }

    /// Size of the data section. Forces the initial section scan.
    pub fn size(&mut self) -> Result<u64> {
        let (_, size) = self.init()?;
        Ok(size)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Absolute offset of the first data byte plus the data size. Forces the
    /// initial section scan; callers that stream straight from the underlying
    /// handle use this to position themselves.
    pub fn data_span(&mut self) -> Result<(u64, u64)> {
        self.init()
    }

    /// Locate the data section, positioning the inner reader at its first
    /// byte and resetting the logical offset.
    fn rescan(&mut self) -> Result<(u64, u64)> {
        let scan = scan_sections(&mut self.inner)?;
        let (start, size, _) = scan
            .data
            .ok_or_else(|| Error::format("missing data section"))?;
        self.inner
            .seek(SeekFrom::Start(start))
            .map_err(|e| Error::Io { path: "<container>".into(), source: e })?;
        self.data = Some((start, size));
        self.offset = 0;
        Ok((start, size))
    }

    fn init(&mut self) -> Result<(u64, u64)> {
        match self.data {
            Some(found) => Ok(found),
            None => self.rescan(),
        }
    }

    fn seek_to(&mut self, target: i64) -> io::Result<u64> {
        let (start, size) = self.init().map_err(to_io)?;

        if target < 0 || target as u64 >= size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek offset {target} outside of data section (size {size})"),
            ));
        }
        let target = target as u64;

        if target == self.offset {
            return Ok(self.offset);
        }

        if target < self.offset {
            self.rescan().map_err(to_io)?;
        }

        self.inner
            .seek(SeekFrom::Start(start + target))?;
        self.offset = target;
        Ok(self.offset)
    }
}

impl<R: Read + Seek> Read for BlobReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (_, size) = self.init().map_err(to_io)?;

        let remaining = size.saturating_sub(self.offset);
        if remaining == 0 {
            return Ok(0);
        }

        let want = buf.len().min(remaining as usize);
        let n = self.inner.read(&mut buf[..want])?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for BlobReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (_, size) = self.init().map_err(to_io)?;

        match pos {
            SeekFrom::Start(offset) => self.seek_to(offset as i64),
            SeekFrom::Current(offset) => self.seek_to(self.offset as i64 + offset),
            SeekFrom::End(offset) => self.seek_to(size as i64 + offset),
        }
    }
}

fn to_io(err: Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::write_container;
    use crate::types::{FileMetadata, FileUpload};
    use chrono::Utc;
    use std::io::Cursor;

    fn container(content: &[u8]) -> Cursor<Vec<u8>> {
        let mut up = FileUpload {
            meta: FileMetadata {
                name: "/f".into(),
                size: content.len() as u64,
                modified: Utc::now(),
                sha256: String::new(),
            },
            reader: Cursor::new(content.to_vec()),
        };
        let mut out = Vec::new();
        write_container(&mut out, &mut up, None).unwrap();
        Cursor::new(out)
    }

    #[test]
    fn reads_full_data_section() {
        let mut reader = BlobReader::new(container(b"hello container"));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello container");
    }

    #[test]
    fn forward_and_backward_seeks() {
        let content: Vec<u8> = (0u8..100).collect();
        let mut reader = BlobReader::new(container(&content));

        reader.seek(SeekFrom::Start(10)).unwrap();
        let mut chunk = [0u8; 10];
        reader.read_exact(&mut chunk).unwrap();
        assert_eq!(&chunk, &content[10..20]);

        // backward: forces a rescan
        reader.seek(SeekFrom::Start(5)).unwrap();
        reader.read_exact(&mut chunk).unwrap();
        assert_eq!(&chunk, &content[5..15]);

        // relative and end-anchored
        reader.seek(SeekFrom::Current(10)).unwrap();
        reader.read_exact(&mut chunk[..1]).unwrap();
        assert_eq!(chunk[0], content[25]);

        reader.seek(SeekFrom::End(-1)).unwrap();
        let mut last = Vec::new();
        reader.read_to_end(&mut last).unwrap();
        assert_eq!(last, vec![99]);
    }

    #[test]
    fn seek_outside_bounds_fails() {
        let mut reader = BlobReader::new(container(b"0123456789"));
        assert!(reader.seek(SeekFrom::Start(10)).is_err());
        assert!(reader.seek(SeekFrom::End(0)).is_err());
        assert!(reader.seek(SeekFrom::Current(-1)).is_err());
        // still usable after a failed seek
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123456789");
    }

    #[test]
    fn size_reports_declared_size() {
        let mut reader = BlobReader::new(container(b"abc"));
        assert_eq!(reader.size().unwrap(), 3);
    }
}
