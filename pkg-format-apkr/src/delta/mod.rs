//! Binary delta patch format.
//!
//! A patch transforms one immutable package file into another:
//!
//! ```text
//! | magic "ApkD" | format version u64 | old size u64 | new size u64 |
//! | old digest (32) | new digest (32) | bzip2-compressed op stream |
//! ```
//!
//! The op stream is a sequence of `copy(old_offset, len)` and
//! `insert(len, bytes)` ops. Generation is deterministic: identical inputs
//! produce byte-identical patches, which keeps republication reproducible.

mod error;

use error::CapExceeded;
pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use log::debug;
use sha2::{Digest, Sha256};

pub const PATCH_FILE_MAGIC: &[u8] = b"ApkD";
pub const PATCH_FORMAT_VERSION: u64 = 1;

// Matching granularity over the old file. Patch quality degrades gracefully
// with a larger block; 4 KiB matches the typical archive entry alignment.
const MATCH_BLOCK_LEN: usize = 4096;
const IO_CHUNK_LEN: usize = 1 << 20;
// How many scan positions go by between cancellation checks.
const CANCEL_CHECK_MASK: usize = 0x3ff;

const OP_COPY: u8 = 0;
const OP_INSERT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchHeader {
    pub old_size: u64,
    pub new_size: u64,
    pub old_digest: [u8; 32],
    pub new_digest: [u8; 32],
}

#[derive(Debug)]
pub struct PatchStats {
    pub patch_size: u64,
}

/// rsync-style rolling checksum over a fixed window.
#[derive(Debug, Default, Clone, Copy)]
struct RollingSum {
    a: u32,
    b: u32,
}

impl RollingSum {
    fn of(block: &[u8]) -> Self {
        let mut a = 0u32;
        let mut b = 0u32;
        for (i, &x) in block.iter().enumerate() {
            a = a.wrapping_add(x as u32);
            b = b.wrapping_add(((block.len() - i) as u32).wrapping_mul(x as u32));
        }
        Self {
            a,
            b,
        }
    }

    fn roll(&mut self, outgoing: u8, incoming: u8) {
        self.a = self.a.wrapping_sub(outgoing as u32).wrapping_add(incoming as u32);
        self.b = self.b.wrapping_sub((MATCH_BLOCK_LEN as u32).wrapping_mul(outgoing as u32)).wrapping_add(self.a);
    }

    fn value(&self) -> u32 {
        (self.a & 0xffff) | (self.b << 16)
    }
}

/// File sink that fails once more than `max` bytes have been written.
struct CappedWriter<W: Write> {
    inner: W,
    written: u64,
    max: Option<u64>,
}

impl<W: Write> CappedWriter<W> {
    fn new(inner: W, max: Option<u64>) -> Self {
        Self {
            inner,
            written: 0,
            max,
        }
    }
}

impl<W: Write> Write for CappedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(max) = self.max {
            if self.written + buf.len() as u64 > max {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    CapExceeded {
                        limit: max,
                    },
                ));
            }
        }
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn read_u64(f: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    f.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// Read and validate a patch header from the start of `f`.
pub fn read_patch_header(f: &mut impl Read) -> Result<PatchHeader> {
    let mut magic = [0u8; 4];
    f.read_exact(&mut magic)?;
    if magic != PATCH_FILE_MAGIC {
        return Err(Error::BadMagic);
    }

    let format_version = read_u64(f)?;
    if format_version != PATCH_FORMAT_VERSION {
        return Err(Error::UnsupportedFormatVersion(format_version));
    }

    let old_size = read_u64(f)?;
    let new_size = read_u64(f)?;
    let mut old_digest = [0u8; 32];
    f.read_exact(&mut old_digest)?;
    let mut new_digest = [0u8; 32];
    f.read_exact(&mut new_digest)?;

    Ok(PatchHeader {
        old_size,
        new_size,
        old_digest,
        new_digest,
    })
}

/// Patch header of the file at `path`.
pub fn patch_header(path: &Path) -> Result<PatchHeader> {
    let mut f = BufReader::new(File::open(path)?);
    read_patch_header(&mut f)
}

fn digest_chunked(path: &Path) -> Result<[u8; 32]> {
    let file = File::open(path)?;
    let mut freader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut databuf = vec![0u8; IO_CHUNK_LEN];

    loop {
        let n = freader.read(&mut databuf)?;
        if n == 0 {
            break;
        }
        hasher.update(&databuf[..n]);
    }

    Ok(hasher.finalize().into())
}

/// Generate a patch from `old_path` to `new_path` into `out_path`.
///
/// Fails with [`Error::PatchTooLarge`] when the encoded patch would exceed
/// `max_patch_size`; the partial output file is removed on every error path.
pub fn generate(old_path: &Path, new_path: &Path, out_path: &Path, max_patch_size: Option<u64>, cancel: &AtomicBool) -> Result<PatchStats> {
    let result = generate_inner(old_path, new_path, out_path, max_patch_size, cancel);
    if result.is_err() {
        let _ = fs::remove_file(out_path);
    }
    result
}

fn generate_inner(old_path: &Path, new_path: &Path, out_path: &Path, max_patch_size: Option<u64>, cancel: &AtomicBool) -> Result<PatchStats> {
    let old = fs::read(old_path)?;
    let new = fs::read(new_path)?;

    let old_digest: [u8; 32] = Sha256::digest(&old).into();
    let new_digest: [u8; 32] = Sha256::digest(&new).into();

    let mut sink = CappedWriter::new(File::create(out_path)?, max_patch_size);
    sink.write_all(PATCH_FILE_MAGIC)?;
    sink.write_all(&PATCH_FORMAT_VERSION.to_be_bytes())?;
    sink.write_all(&(old.len() as u64).to_be_bytes())?;
    sink.write_all(&(new.len() as u64).to_be_bytes())?;
    sink.write_all(&old_digest)?;
    sink.write_all(&new_digest)?;

    let mut encoder = BzEncoder::new(sink, Compression::best());
    emit_ops(&old, &new, &mut encoder, cancel)?;
    let mut sink = encoder.finish()?;
    sink.flush()?;

    debug!("patch {}: {} -> {} bytes, patch {} bytes", out_path.display(), old.len(), new.len(), sink.written);

    Ok(PatchStats {
        patch_size: sink.written,
    })
}

fn write_copy(w: &mut impl Write, offset: u64, len: u64) -> Result<()> {
    w.write_all(&[OP_COPY])?;
    w.write_all(&offset.to_be_bytes())?;
    w.write_all(&len.to_be_bytes())?;
    Ok(())
}

fn write_insert(w: &mut impl Write, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    w.write_all(&[OP_INSERT])?;
    w.write_all(&(data.len() as u64).to_be_bytes())?;
    w.write_all(data)?;
    Ok(())
}

fn emit_ops(old: &[u8], new: &[u8], w: &mut impl Write, cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        return Err(Error::Cancelled);
    }

    // Index the old file by non-overlapping block checksums. Offsets are
    // pushed in ascending order and the first verified match wins, so the
    // produced op stream is a pure function of the input bytes.
    let mut index: HashMap<u32, Vec<u64>> = HashMap::new();
    for (i, block) in old.chunks_exact(MATCH_BLOCK_LEN).enumerate() {
        index.entry(RollingSum::of(block).value()).or_default().push((i * MATCH_BLOCK_LEN) as u64);
    }

    let mut pos = 0usize;
    let mut lit_start = 0usize;
    let mut copies = 0usize;
    let mut window = if new.len() >= MATCH_BLOCK_LEN {
        RollingSum::of(&new[..MATCH_BLOCK_LEN])
    } else {
        RollingSum::default()
    };

    let mut scanned = 0usize;
    while pos + MATCH_BLOCK_LEN <= new.len() {
        scanned += 1;
        if scanned & CANCEL_CHECK_MASK == 0 && cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }

        let mut matched: Option<(u64, usize)> = None;
        if let Some(offsets) = index.get(&window.value()) {
            for &offset in offsets {
                let off = offset as usize;
                if old[off..off + MATCH_BLOCK_LEN] == new[pos..pos + MATCH_BLOCK_LEN] {
                    let mut len = MATCH_BLOCK_LEN;
                    while off + len < old.len() && pos + len < new.len() && old[off + len] == new[pos + len] {
                        len += 1;
                    }
                    matched = Some((offset, len));
                    break;
                }
            }
        }

        match matched {
            Some((offset, len)) => {
                write_insert(w, &new[lit_start..pos])?;
                write_copy(w, offset, len as u64)?;
                copies += 1;
                pos += len;
                lit_start = pos;
                if pos + MATCH_BLOCK_LEN <= new.len() {
                    window = RollingSum::of(&new[pos..pos + MATCH_BLOCK_LEN]);
                }
            }
            None => {
                if pos + MATCH_BLOCK_LEN >= new.len() {
                    break;
                }
                window.roll(new[pos], new[pos + MATCH_BLOCK_LEN]);
                pos += 1;
            }
        }
    }

    write_insert(w, &new[lit_start..])?;

    debug!("emitted {} copy ops, {} literal bytes", copies, new.len() - lit_start);

    Ok(())
}

/// Apply the patch at `patch_path` to `old_path`, producing `out_path`.
///
/// Verifies the old file against the patch header before writing and the
/// output digest and size after; the output file is removed on any error.
pub fn apply(old_path: &Path, patch_path: &Path, out_path: &Path, cancel: &AtomicBool) -> Result<()> {
    let result = apply_inner(old_path, patch_path, out_path, cancel);
    if result.is_err() {
        let _ = fs::remove_file(out_path);
    }
    result
}

fn apply_inner(old_path: &Path, patch_path: &Path, out_path: &Path, cancel: &AtomicBool) -> Result<()> {
    let mut pf = BufReader::new(File::open(patch_path)?);
    let header = read_patch_header(&mut pf)?;

    let old_len = fs::metadata(old_path)?.len();
    if old_len != header.old_size {
        return Err(Error::OldSizeMismatch {
            expected: header.old_size,
            actual: old_len,
        });
    }
    if digest_chunked(old_path)? != header.old_digest {
        return Err(Error::OldDigestMismatch);
    }

    let mut old = File::open(old_path)?;
    let mut ops = BzDecoder::new(pf);
    let mut out = BufWriter::new(File::create(out_path)?);
    let mut hasher = Sha256::new();
    let mut written = 0u64;
    let mut databuf = vec![0u8; IO_CHUNK_LEN];

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }

        let mut tag = [0u8; 1];
        if ops.read(&mut tag)? == 0 {
            break;
        }
        match tag[0] {
            OP_COPY => {
                let offset = read_u64(&mut ops)?;
                let len = read_u64(&mut ops)?;
                let end = offset.checked_add(len).ok_or(Error::CopyOutOfRange {
                    offset,
                    len,
                    old_size: header.old_size,
                })?;
                if end > header.old_size {
                    return Err(Error::CopyOutOfRange {
                        offset,
                        len,
                        old_size: header.old_size,
                    });
                }
                old.seek(SeekFrom::Start(offset))?;
                let mut remaining = len;
                while remaining > 0 {
                    if cancel.load(Ordering::Relaxed) {
                        return Err(Error::Cancelled);
                    }
                    let n = remaining.min(IO_CHUNK_LEN as u64) as usize;
                    old.read_exact(&mut databuf[..n])?;
                    hasher.update(&databuf[..n]);
                    out.write_all(&databuf[..n])?;
                    remaining -= n as u64;
                }
                written += len;
            }
            OP_INSERT => {
                let len = read_u64(&mut ops)?;
                let mut remaining = len;
                while remaining > 0 {
                    if cancel.load(Ordering::Relaxed) {
                        return Err(Error::Cancelled);
                    }
                    let n = remaining.min(IO_CHUNK_LEN as u64) as usize;
                    ops.read_exact(&mut databuf[..n])?;
                    hasher.update(&databuf[..n]);
                    out.write_all(&databuf[..n])?;
                    remaining -= n as u64;
                }
                written += len;
            }
            other => return Err(Error::BadOpTag(other)),
        }
    }

    if written != header.new_size {
        return Err(Error::NewSizeMismatch {
            expected: header.new_size,
            actual: written,
        });
    }
    let digest: [u8; 32] = hasher.finalize().into();
    if digest != header.new_digest {
        return Err(Error::NewDigestMismatch);
    }

    out.flush()?;

    Ok(())
}
