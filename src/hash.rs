//! Streaming sha256 helpers. Digests travel as lowercase hex strings since
//! that is how the wire protocol and the container metadata record carry them.

use std::io::Read;

use sha2::{Digest, Sha256};

use crate::error::{IoResultExt, Result};

/// Hash a byte slice to lowercase hex.
pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Hash everything a reader yields, returning (hex digest, byte count).
pub fn sha256_hex_stream<R: Read>(reader: &mut R) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).with_path("<stream>")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn stream_matches_slice() {
        let content = b"yo sup mr white";
        let mut cursor = std::io::Cursor::new(content.as_slice());
        let (digest, n) = sha256_hex_stream(&mut cursor).unwrap();
        assert_eq!(n, content.len() as u64);
        assert_eq!(digest, sha256_hex(content));
    }
}
