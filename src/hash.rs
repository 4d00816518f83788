use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};

use repometa::Sha256Digest;

const CHUNKLEN: usize = 10485760; // 10M

/// SHA-256 of the file at `path`, reading in bounded chunks.
/// If maxlen is None, a simple read to the end of the file.
/// If maxlen is Some, read only until the given length.
pub fn hash_on_disk(path: &Path, maxlen: Option<u64>) -> Result<Sha256Digest> {
    let file = File::open(path).context(format!("failed to open path ({:?})", path.display()))?;
    let mut hasher = Sha256::new();

    let filelen = file.metadata().context(format!("failed to get metadata of {:?}", path.display()))?.len();

    let mut maxlen_to_read = match maxlen {
        Some(len) => {
            if filelen < len {
                filelen
            } else {
                len
            }
        }
        None => filelen,
    };

    let mut freader = BufReader::new(file);
    let mut databuf = vec![0u8; CHUNKLEN];

    freader.seek(SeekFrom::Start(0)).context("failed to seek(0)".to_string())?;
    while maxlen_to_read > 0 {
        if maxlen_to_read < CHUNKLEN as u64 {
            // last and submaximal chunk to read, shrink the buffer for it
            databuf.truncate(maxlen_to_read as usize);
        }

        freader.read_exact(&mut databuf).context(format!("failed to read_exact(chunklen {:?})", databuf.len()))?;

        maxlen_to_read -= databuf.len() as u64;

        hasher.update(&databuf);
    }

    Ok(Sha256Digest::from_bytes(hasher.finalize().into()))
}
