//! Canonical per-application metadata payload.
//!
//! The payload is the exact byte sequence the repository key signs, so both
//! rendering and parsing are strict: fields in fixed order, numbers in
//! decimal, digests in lowercase hex, blocks in `v` / `d` / `r` order with
//! entries sorted where the order carries no meaning. Readers reject any
//! deviation.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::hash_types::Sha256Digest;
use crate::types::{AppId, VersionCode};

pub const APP_SCHEMA: &str = "apkrepo-app/1";

/// Placeholder for an absent optional digest field.
const ABSENT: &str = "-";

/// Unordered set of signer certificate fingerprints, kept sorted so that
/// equality is set equality and rendering is canonical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerSet(Vec<Sha256Digest>);

impl SignerSet {
    pub fn new(mut fingerprints: Vec<Sha256Digest>) -> Self {
        fingerprints.sort_unstable();
        fingerprints.dedup();
        Self(fingerprints)
    }

    pub fn fingerprints(&self) -> &[Sha256Digest] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn render(&self) -> String {
        let hex: Vec<String> = self.0.iter().map(Sha256Digest::to_hex).collect();
        hex.join(",")
    }

    pub fn parse(field: &str, line: usize) -> Result<Self, Error> {
        if field.is_empty() {
            return Err(Error::EmptySignerSet {
                line,
            });
        }
        let mut fingerprints = Vec::new();
        for part in field.split(',') {
            fingerprints.push(Sha256Digest::from_hex(part)?);
        }
        Ok(Self::new(fingerprints))
    }
}

impl fmt::Display for SignerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    pub version: VersionCode,
    pub digest: Sha256Digest,
    pub size: u64,
    pub min_platform: u32,
    pub notes_digest: Option<Sha256Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaEntry {
    pub from: VersionCode,
    pub to: VersionCode,
    pub patch_digest: Sha256Digest,
    pub patch_size: u64,
}

/// One authorized signer transition: the head moves from `predecessor` to
/// `successor`. Entries are immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationEntry {
    pub predecessor: SignerSet,
    pub successor: SignerSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMetadata {
    pub id: AppId,
    pub seq: u64,
    pub label: String,
    pub icon_digest: Option<Sha256Digest>,
    pub versions: Vec<VersionEntry>,
    pub deltas: Vec<DeltaEntry>,
    pub rotations: Vec<RotationEntry>,
}

fn render_opt_digest(digest: &Option<Sha256Digest>) -> String {
    match digest {
        Some(d) => d.to_hex(),
        None => ABSENT.to_string(),
    }
}

fn parse_opt_digest(field: &str) -> Result<Option<Sha256Digest>, Error> {
    if field == ABSENT {
        Ok(None)
    } else {
        Ok(Some(Sha256Digest::from_hex(field)?))
    }
}

fn parse_u64(field: &str, line: usize, what: &'static str) -> Result<u64, Error> {
    u64::from_str(field).map_err(|_| Error::ParseNumber {
        line,
        what,
    })
}

fn parse_u32(field: &str, line: usize, what: &'static str) -> Result<u32, Error> {
    u32::from_str(field).map_err(|_| Error::ParseNumber {
        line,
        what,
    })
}

fn expect_fields<'a>(line: &'a str, num: usize, lineno: usize) -> Result<Vec<&'a str>, Error> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != num {
        return Err(Error::BadFieldCount {
            line: lineno,
            expected: num,
            actual: fields.len(),
        });
    }
    Ok(fields)
}

pub fn validate_label(label: &str) -> Result<(), Error> {
    if label.is_empty() || label.contains('\t') || label.contains('\n') {
        return Err(Error::BadLabel(label.to_string()));
    }
    Ok(())
}

impl AppMetadata {
    /// Fresh record for an application seen for the first time. The label
    /// defaults to the identity until the operator edits it.
    pub fn new(id: AppId) -> Self {
        let label = id.as_str().to_string();
        Self {
            id,
            seq: 0,
            label,
            icon_digest: None,
            versions: Vec::new(),
            deltas: Vec::new(),
            rotations: Vec::new(),
        }
    }

    pub fn head(&self) -> Option<&VersionEntry> {
        self.versions.last()
    }

    pub fn version(&self, version: VersionCode) -> Option<&VersionEntry> {
        self.versions.iter().find(|v| v.version == version)
    }

    /// Canonical payload bytes (without the signature line).
    pub fn render(&self) -> String {
        let mut versions: Vec<&VersionEntry> = self.versions.iter().collect();
        versions.sort_by_key(|v| v.version);

        let mut deltas: Vec<&DeltaEntry> = self.deltas.iter().collect();
        deltas.sort_by_key(|d| d.from);

        let mut out = String::new();
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\n",
            APP_SCHEMA,
            self.seq,
            self.id,
            self.label,
            render_opt_digest(&self.icon_digest)
        ));
        for v in versions {
            out.push_str(&format!(
                "v\t{}\t{}\t{}\t{}\t{}\n",
                v.version,
                v.digest.to_hex(),
                v.size,
                v.min_platform,
                render_opt_digest(&v.notes_digest)
            ));
        }
        for d in deltas {
            out.push_str(&format!("d\t{}\t{}\t{}\t{}\n", d.from, d.to, d.patch_digest.to_hex(), d.patch_size));
        }
        for r in &self.rotations {
            out.push_str(&format!("r\t{}\t{}\n", r.predecessor.render(), r.successor.render()));
        }
        out
    }

    /// Strict parse of a canonical payload. Anything that `render` would not
    /// have produced is an error.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let body = text.strip_suffix('\n').ok_or(Error::EmptyPayload)?;
        let mut lines = body.split('\n').enumerate();

        let (_, header) = lines.next().ok_or(Error::EmptyPayload)?;
        let fields = expect_fields(header, 5, 1)?;
        if fields[0] != APP_SCHEMA {
            return Err(Error::UnknownSchema(fields[0].to_string()));
        }
        let seq = parse_u64(fields[1], 1, "sequence number")?;
        let id = AppId::new(fields[2])?;
        let label = fields[3].to_string();
        validate_label(&label)?;
        let icon_digest = parse_opt_digest(fields[4])?;

        let mut meta = Self {
            id,
            seq,
            label,
            icon_digest,
            versions: Vec::new(),
            deltas: Vec::new(),
            rotations: Vec::new(),
        };

        // Blocks appear in fixed order: versions, then deltas, then rotations.
        let mut block = 0u8;
        for (idx, line) in lines {
            let lineno = idx + 1;
            let tag = line.split('\t').next().unwrap_or_default();
            match tag {
                "v" => {
                    if block > 0 {
                        return Err(Error::MisorderedBlock {
                            line: lineno,
                        });
                    }
                    let f = expect_fields(line, 6, lineno)?;
                    let version = VersionCode::from_str(f[1])?;
                    if meta.versions.last().is_some_and(|prev| prev.version >= version) {
                        return Err(Error::UnsortedEntry {
                            line: lineno,
                        });
                    }
                    meta.versions.push(VersionEntry {
                        version,
                        digest: Sha256Digest::from_hex(f[2])?,
                        size: parse_u64(f[3], lineno, "file size")?,
                        min_platform: parse_u32(f[4], lineno, "minimum platform")?,
                        notes_digest: parse_opt_digest(f[5])?,
                    });
                }
                "d" => {
                    if block > 1 {
                        return Err(Error::MisorderedBlock {
                            line: lineno,
                        });
                    }
                    block = 1;
                    let f = expect_fields(line, 5, lineno)?;
                    let from = VersionCode::from_str(f[1])?;
                    if meta.deltas.last().is_some_and(|prev| prev.from >= from) {
                        return Err(Error::UnsortedEntry {
                            line: lineno,
                        });
                    }
                    meta.deltas.push(DeltaEntry {
                        from,
                        to: VersionCode::from_str(f[2])?,
                        patch_digest: Sha256Digest::from_hex(f[3])?,
                        patch_size: parse_u64(f[4], lineno, "patch size")?,
                    });
                }
                "r" => {
                    block = 2;
                    let f = expect_fields(line, 3, lineno)?;
                    meta.rotations.push(RotationEntry {
                        predecessor: SignerSet::parse(f[1], lineno)?,
                        successor: SignerSet::parse(f[2], lineno)?,
                    });
                }
                other => {
                    return Err(Error::UnknownTag {
                        line: lineno,
                        tag: other.to_string(),
                    });
                }
            }
        }

        Ok(meta)
    }
}
