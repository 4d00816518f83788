//! Signed artifact production: canonical per-application metadata and the
//! repository index, framed with a signature line from the repository key.
//!
//! The repository key attests to inclusion and ordering only; it never
//! signs package bytes.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use pkg_format_apkr::sign::{self, RepoKey};
use repometa::{AppMetadata, IndexEntry, RepoIndex, Sha256Digest};

/// Sign one application's canonical metadata payload.
pub fn build_app_artifact(key: &RepoKey, meta: &AppMetadata) -> Result<Vec<u8>> {
    sign::frame(key, meta.render().as_bytes()).context(format!("failed to sign metadata for {}", meta.id))
}

/// Index entry describing a published metadata artifact. The digest and
/// size cover the whole signed file, signature line included, which is what
/// clients download and check.
pub fn index_entry_for(meta: &AppMetadata, artifact: &[u8]) -> IndexEntry {
    let head = meta.head().expect("published metadata always has a head version");
    IndexEntry {
        id: meta.id.clone(),
        head: head.version,
        head_digest: head.digest,
        metadata_digest: Sha256Digest::of(artifact),
        metadata_size: artifact.len() as u64,
        metadata_seq: meta.seq,
    }
}

/// Sign the repository index payload.
pub fn build_index_artifact(key: &RepoKey, index: &RepoIndex) -> Result<Vec<u8>> {
    sign::frame(key, index.render().as_bytes()).context("failed to sign repository index")
}

/// Publication timestamp: wall clock, clamped so it never moves backwards
/// relative to the previous publication.
pub fn publication_timestamp(previous: u64) -> u64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    now.max(previous)
}
