//! SHA-256 hex digest utilities.
//!
//! Used by the fingerprint cache to hash input content and canonicalised
//! parameter sets.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Read buffer size for streaming file hashes (1 MiB).
const HASH_CHUNK_BYTES: usize = 1024 * 1024;

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Compute a SHA-256 hex digest of a file's content.
///
/// The file is streamed in chunks so large videos never need to fit in
/// memory. This is blocking I/O; async callers should wrap it in
/// `spawn_blocking`.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
