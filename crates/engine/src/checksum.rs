use std::io::Read;
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::Result;
use crate::options::DEFAULT_BUFFER_SIZE;

/// Streams `reader` through `D` with a `buffer_size` read buffer, returning
/// the byte count and the hex-encoded digest.
pub(crate) fn digest_reader<D: Digest>(
    reader: &mut impl Read,
    buffer_size: usize,
) -> std::io::Result<(u64, String)> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, hex::encode(hasher.finalize())))
}

/// SHA-256 of `data`, hex-encoded.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 of a whole file, hex-encoded.
///
/// The engine never verifies final artifacts itself; callers use this on
/// the path returned by `finalise`. [`crate::ChunkStore::checksum`] does the
/// same with the configured buffer size.
pub fn calculate_file_checksum(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let (_, digest) = digest_reader::<Sha256>(&mut file, DEFAULT_BUFFER_SIZE)?;
    Ok(digest)
}

/// Per-chunk digest: MD5, hex-encoded.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}
