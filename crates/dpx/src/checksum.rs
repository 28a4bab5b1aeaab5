//! 🔐 File checksums: SHA-256 over the whole file, hex encoded.
//!
//! The checksum is the file's identity: status entry key, record `origin_id`, and the
//! dedup key that stops the same dump from being ingested twice.

use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::{fs::File, io::AsyncReadExt};

// 📏 64 KiB reads: big enough to keep the disk busy, small enough to not care
const READ_BUF_BYTES: usize = 64 * 1024;

/// 🔐 SHA-256 of a file's contents, streamed so a 40 GB dump does not become 40 GB of RAM.
pub async fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .await
        .with_context(|| format!("💀 Could not open '{}' to compute its checksum", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUF_BYTES];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .await
            .with_context(|| format!("💀 Read failed halfway through checksumming '{}'", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
