//! Canonical repository index payload: one line per application, identity
//! ascending, stamped with a strictly increasing publication sequence.

use std::str::FromStr;

use crate::error::Error;
use crate::hash_types::Sha256Digest;
use crate::types::{AppId, VersionCode};

pub const INDEX_SCHEMA: &str = "apkrepo-index/1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: AppId,
    pub head: VersionCode,
    pub head_digest: Sha256Digest,
    pub metadata_digest: Sha256Digest,
    pub metadata_size: u64,
    pub metadata_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoIndex {
    pub seq: u64,
    /// Unix seconds at publication, clamped to never decrease.
    pub timestamp: u64,
    pub entries: Vec<IndexEntry>,
}

impl RepoIndex {
    pub fn empty() -> Self {
        Self {
            seq: 0,
            timestamp: 0,
            entries: Vec::new(),
        }
    }

    pub fn entry(&self, id: &AppId) -> Option<&IndexEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    /// Canonical payload bytes (without the signature line).
    pub fn render(&self) -> String {
        let mut entries: Vec<&IndexEntry> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        let mut out = String::new();
        out.push_str(&format!("{}\t{}\t{}\n", INDEX_SCHEMA, self.seq, self.timestamp));
        for e in entries {
            out.push_str(&format!(
                "a\t{}\t{}\t{}\t{}\t{}\t{}\n",
                e.id,
                e.head,
                e.head_digest.to_hex(),
                e.metadata_digest.to_hex(),
                e.metadata_size,
                e.metadata_seq
            ));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let body = text.strip_suffix('\n').ok_or(Error::EmptyPayload)?;
        let mut lines = body.split('\n').enumerate();

        let (_, header) = lines.next().ok_or(Error::EmptyPayload)?;
        let fields: Vec<&str> = header.split('\t').collect();
        if fields.len() != 3 {
            return Err(Error::BadFieldCount {
                line: 1,
                expected: 3,
                actual: fields.len(),
            });
        }
        if fields[0] != INDEX_SCHEMA {
            return Err(Error::UnknownSchema(fields[0].to_string()));
        }
        let seq = u64::from_str(fields[1]).map_err(|_| Error::ParseNumber {
            line: 1,
            what: "repository sequence",
        })?;
        let timestamp = u64::from_str(fields[2]).map_err(|_| Error::ParseNumber {
            line: 1,
            what: "timestamp",
        })?;

        let mut index = Self {
            seq,
            timestamp,
            entries: Vec::new(),
        };

        for (idx, line) in lines {
            let lineno = idx + 1;
            let fields: Vec<&str> = line.split('\t').collect();
            if fields[0] != "a" {
                return Err(Error::UnknownTag {
                    line: lineno,
                    tag: fields[0].to_string(),
                });
            }
            if fields.len() != 7 {
                return Err(Error::BadFieldCount {
                    line: lineno,
                    expected: 7,
                    actual: fields.len(),
                });
            }
            let id = AppId::new(fields[1])?;
            if index.entries.last().is_some_and(|prev| prev.id >= id) {
                return Err(Error::UnsortedEntry {
                    line: lineno,
                });
            }
            index.entries.push(IndexEntry {
                id,
                head: VersionCode::from_str(fields[2])?,
                head_digest: Sha256Digest::from_hex(fields[3])?,
                metadata_digest: Sha256Digest::from_hex(fields[4])?,
                metadata_size: u64::from_str(fields[5]).map_err(|_| Error::ParseNumber {
                    line: lineno,
                    what: "metadata size",
                })?,
                metadata_seq: u64::from_str(fields[6]).map_err(|_| Error::ParseNumber {
                    line: lineno,
                    what: "metadata sequence",
                })?,
            });
        }

        Ok(index)
    }
}
