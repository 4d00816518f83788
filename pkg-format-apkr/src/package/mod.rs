//! Package envelope format.
//!
//! Candidate packages arrive as a fixed binary envelope so the repository
//! never has to understand the archive payload itself:
//!
//! ```text
//! | magic "ApkR" | format version u64 | manifest size u64 | signer count u32 |
//! | manifest (UTF-8, key\tvalue lines) | signer entries | payload ... |
//! ```
//!
//! Each signer entry is `algo u32 | fp_len u32 | fingerprint bytes`, where
//! the fingerprint is the SHA-256 of the signing certificate.

mod error;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

pub const PACKAGE_FILE_MAGIC: &[u8] = b"ApkR";
pub const PACKAGE_FORMAT_VERSION: u64 = 1;

// magic + format version + manifest size + signer count
const PACKAGE_HEADER_SIZE: u64 = 4 + 8 + 8 + 4;
const MANIFEST_SIZE_LIMIT: u64 = 1 << 20;

/// Signature scheme of one package signer. The ids are part of the envelope
/// format; any other id means the repository cannot represent the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerAlgorithm {
    Rsa,
    Ec,
}

impl SignerAlgorithm {
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            1 => Ok(SignerAlgorithm::Rsa),
            2 => Ok(SignerAlgorithm::Ec),
            other => Err(Error::UnsupportedSignerAlgorithm(other)),
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            SignerAlgorithm::Rsa => 1,
            SignerAlgorithm::Ec => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerEntry {
    pub algorithm: SignerAlgorithm,
    pub fingerprint: [u8; 32],
}

/// Fields the repository extracts from the package manifest. Unknown
/// manifest keys are ignored; duplicates of known keys are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub identity: String,
    pub version_code: u64,
    pub min_platform: u32,
    pub label: Option<String>,
}

#[derive(Debug)]
pub struct PackageEnvelope {
    pub manifest: Manifest,
    pub signers: Vec<SignerEntry>,
    /// Offset of the first payload byte.
    pub payload_offset: u64,
}

fn read_u64(f: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    f.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn read_u32(f: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    f.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Read and validate the envelope of the package at `path`, leaving the
/// payload untouched.
pub fn read_envelope(path: &Path) -> Result<PackageEnvelope> {
    let file = File::open(path)?;
    let mut f = BufReader::new(file);

    let mut magic = [0u8; 4];
    f.read_exact(&mut magic)?;
    if magic != PACKAGE_FILE_MAGIC {
        return Err(Error::BadMagic);
    }

    let format_version = read_u64(&mut f)?;
    if format_version != PACKAGE_FORMAT_VERSION {
        return Err(Error::UnsupportedFormatVersion(format_version));
    }

    let manifest_size = read_u64(&mut f)?;
    if manifest_size > MANIFEST_SIZE_LIMIT {
        return Err(Error::ManifestTooLarge(manifest_size));
    }

    let signer_count = read_u32(&mut f)?;

    let manifest_bytes = {
        let mut buf = vec![0u8; manifest_size as usize];
        f.read_exact(&mut buf)?;
        buf
    };
    let manifest = parse_manifest(&manifest_bytes)?;

    if signer_count == 0 {
        return Err(Error::Unsigned);
    }

    let mut signers = Vec::with_capacity(signer_count as usize);
    let mut signer_block_len = 0u64;
    for _ in 0..signer_count {
        let algorithm = SignerAlgorithm::from_id(read_u32(&mut f)?)?;
        let fp_len = read_u32(&mut f)?;
        if fp_len != 32 {
            return Err(Error::BadFingerprintLength(fp_len));
        }
        let mut fingerprint = [0u8; 32];
        f.read_exact(&mut fingerprint)?;
        signer_block_len += 4 + 4 + 32;
        signers.push(SignerEntry {
            algorithm,
            fingerprint,
        });
    }

    Ok(PackageEnvelope {
        manifest,
        signers,
        payload_offset: PACKAGE_HEADER_SIZE + manifest_size + signer_block_len,
    })
}

fn parse_manifest(bytes: &[u8]) -> Result<Manifest> {
    let text = std::str::from_utf8(bytes).map_err(Error::ManifestNotUtf8)?;

    let mut identity: Option<String> = None;
    let mut version_minor: Option<u32> = None;
    let mut version_major: Option<u32> = None;
    let mut min_platform: Option<u32> = None;
    let mut label: Option<String> = None;

    fn set_once<T>(slot: &mut Option<T>, value: T, key: &str) -> Result<()> {
        if slot.is_some() {
            return Err(Error::DuplicateField(key.to_string()));
        }
        *slot = Some(value);
        Ok(())
    }

    fn parse_u32_field(value: &str, field: &'static str) -> Result<u32> {
        value.parse::<u32>().map_err(|_| Error::BadFieldValue {
            field,
            value: value.to_string(),
        })
    }

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('\t') else {
            return Err(Error::MalformedManifestLine(line.to_string()));
        };
        match key {
            "identity" => set_once(&mut identity, value.to_string(), key)?,
            "versioncode" => set_once(&mut version_minor, parse_u32_field(value, "versioncode")?, key)?,
            "versioncode-major" => set_once(&mut version_major, parse_u32_field(value, "versioncode-major")?, key)?,
            "minplatform" => set_once(&mut min_platform, parse_u32_field(value, "minplatform")?, key)?,
            "label" => set_once(&mut label, value.to_string(), key)?,
            // manifests may carry fields the repository does not consume
            _ => (),
        }
    }

    let minor = version_minor.ok_or(Error::MissingField("versioncode"))?;
    let major = version_major.unwrap_or(0);

    Ok(Manifest {
        identity: identity.ok_or(Error::MissingField("identity"))?,
        version_code: ((major as u64) << 32) | minor as u64,
        min_platform: min_platform.ok_or(Error::MissingField("minplatform"))?,
        label,
    })
}

/// Serialise an envelope. Production packages come from the build pipeline;
/// this writer backs the delta/ingest tooling tests and fixtures.
pub fn write_envelope(w: &mut impl Write, manifest_text: &str, signers: &[SignerEntry], payload: &[u8]) -> std::io::Result<()> {
    w.write_all(PACKAGE_FILE_MAGIC)?;
    w.write_all(&PACKAGE_FORMAT_VERSION.to_be_bytes())?;
    w.write_all(&(manifest_text.len() as u64).to_be_bytes())?;
    w.write_all(&(signers.len() as u32).to_be_bytes())?;
    w.write_all(manifest_text.as_bytes())?;
    for signer in signers {
        w.write_all(&signer.algorithm.id().to_be_bytes())?;
        w.write_all(&32u32.to_be_bytes())?;
        w.write_all(&signer.fingerprint)?;
    }
    w.write_all(payload)
}
