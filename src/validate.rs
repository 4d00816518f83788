//! Published-tree validation.
//!
//! Runs before any ingest and behind the `validate` command. A repository
//! with any issue refuses to publish until the operator resolves it; the
//! checks only read the tree, they never repair it.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use log::{debug, info};

use pkg_format_apkr::{delta, sign, sign::RepoKey};
use repometa::{AppId, AppMetadata, RepoIndex, Sha256Digest, VersionCode};

use crate::hash_on_disk;
use crate::store::{self, RepoStore};

#[derive(Debug)]
pub enum Issue {
    IndexSignatureInvalid(String),
    IndexUnparseable(String),
    MetadataSignatureInvalid {
        id: AppId,
        reason: String,
    },
    MetadataUnparseable {
        id: AppId,
        reason: String,
    },
    MetadataDigestMismatch {
        id: AppId,
    },
    IndexEntryMismatch {
        id: AppId,
        what: &'static str,
    },
    MissingMetadata {
        id: AppId,
    },
    UnindexedApp {
        id: AppId,
    },
    MissingPackage {
        id: AppId,
        version: VersionCode,
    },
    PackageSizeMismatch {
        id: AppId,
        version: VersionCode,
    },
    PackageDigestMismatch {
        id: AppId,
        version: VersionCode,
    },
    DeltaEndpointMissing {
        id: AppId,
        from: VersionCode,
        to: VersionCode,
    },
    MissingDelta {
        id: AppId,
        from: VersionCode,
        to: VersionCode,
    },
    DeltaSizeMismatch {
        id: AppId,
        from: VersionCode,
        to: VersionCode,
    },
    DeltaDigestMismatch {
        id: AppId,
        from: VersionCode,
        to: VersionCode,
    },
    OrphanedDelta {
        id: AppId,
        file: String,
    },
    DeltaApplyFailed {
        id: AppId,
        from: VersionCode,
        to: VersionCode,
        reason: String,
    },
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Issue::IndexSignatureInvalid(reason) => write!(f, "index signature is invalid: {reason}"),
            Issue::IndexUnparseable(reason) => write!(f, "index payload does not parse: {reason}"),
            Issue::MetadataSignatureInvalid {
                id,
                reason,
            } => write!(f, "{id}: metadata signature is invalid: {reason}"),
            Issue::MetadataUnparseable {
                id,
                reason,
            } => write!(f, "{id}: metadata payload does not parse: {reason}"),
            Issue::MetadataDigestMismatch {
                id,
            } => write!(f, "{id}: metadata file does not match the digest in the index"),
            Issue::IndexEntryMismatch {
                id,
                what,
            } => write!(f, "{id}: index entry disagrees with metadata about {what}"),
            Issue::MissingMetadata {
                id,
            } => write!(f, "{id}: metadata file is missing"),
            Issue::UnindexedApp {
                id,
            } => write!(f, "{id}: application directory exists but the index does not list it"),
            Issue::MissingPackage {
                id,
                version,
            } => write!(f, "{id}: package {version} is missing"),
            Issue::PackageSizeMismatch {
                id,
                version,
            } => write!(f, "{id}: package {version} size differs from metadata"),
            Issue::PackageDigestMismatch {
                id,
                version,
            } => write!(f, "{id}: package {version} digest differs from metadata"),
            Issue::DeltaEndpointMissing {
                id,
                from,
                to,
            } => write!(f, "{id}: delta {from} -> {to} references an unknown version"),
            Issue::MissingDelta {
                id,
                from,
                to,
            } => write!(f, "{id}: delta {from} -> {to} is missing"),
            Issue::DeltaSizeMismatch {
                id,
                from,
                to,
            } => write!(f, "{id}: delta {from} -> {to} size differs from metadata"),
            Issue::DeltaDigestMismatch {
                id,
                from,
                to,
            } => write!(f, "{id}: delta {from} -> {to} digest differs from metadata"),
            Issue::OrphanedDelta {
                id,
                file,
            } => write!(f, "{id}: delta file {file} is not listed in metadata"),
            Issue::DeltaApplyFailed {
                id,
                from,
                to,
                reason,
            } => write!(f, "{id}: applying delta {from} -> {to} failed: {reason}"),
        }
    }
}

/// Everything a validation pass learned about the tree.
#[derive(Debug)]
pub struct Survey {
    pub index: RepoIndex,
    pub metas: BTreeMap<AppId, AppMetadata>,
    pub issues: Vec<Issue>,
}

impl Survey {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Structural checks that run before every ingest: index and metadata
/// signatures, digest chain from index to metadata, file presence and
/// sizes, and orphaned delta files.
pub fn startup_check(store: &RepoStore, key: &RepoKey) -> Result<Survey> {
    check(store, key, false, false, &AtomicBool::new(false))
}

/// Exhaustive validation: everything in [`startup_check`] plus package and
/// patch digest recomputation, and optionally a full apply of every delta.
pub fn full_check(store: &RepoStore, key: &RepoKey, check_deltas: bool, cancel: &AtomicBool) -> Result<Survey> {
    check(store, key, true, check_deltas, cancel)
}

fn check(store: &RepoStore, key: &RepoKey, deep: bool, check_deltas: bool, cancel: &AtomicBool) -> Result<Survey> {
    let mut issues = Vec::new();
    let mut metas = BTreeMap::new();

    let app_dirs = store.list_app_dirs()?;

    if !store.exists(store::INDEX_FILE) {
        // a repository that has never published is consistent when no app
        // directories exist either
        for id in app_dirs {
            issues.push(Issue::UnindexedApp {
                id,
            });
        }
        return Ok(Survey {
            index: RepoIndex::empty(),
            metas,
            issues,
        });
    }

    let framed = store.read(store::INDEX_FILE)?;
    let payload = match sign::verify_framed(key, &framed) {
        Ok(payload) => payload,
        Err(err) => {
            issues.push(Issue::IndexSignatureInvalid(err.to_string()));
            return Ok(Survey {
                index: RepoIndex::empty(),
                metas,
                issues,
            });
        }
    };
    let index = match std::str::from_utf8(payload).map_err(|e| e.to_string()).and_then(|text| RepoIndex::parse(text).map_err(|e| e.to_string())) {
        Ok(index) => index,
        Err(reason) => {
            issues.push(Issue::IndexUnparseable(reason));
            return Ok(Survey {
                index: RepoIndex::empty(),
                metas,
                issues,
            });
        }
    };

    for id in &app_dirs {
        if index.entry(id).is_none() {
            issues.push(Issue::UnindexedApp {
                id: id.clone(),
            });
        }
    }

    for entry in &index.entries {
        let id = entry.id.clone();
        let meta_rel = store::metadata_path(&id);

        if !store.exists(&meta_rel) {
            issues.push(Issue::MissingMetadata {
                id,
            });
            continue;
        }
        let artifact = store.read(&meta_rel)?;

        if Sha256Digest::of(&artifact) != entry.metadata_digest || artifact.len() as u64 != entry.metadata_size {
            issues.push(Issue::MetadataDigestMismatch {
                id: id.clone(),
            });
        }

        let payload = match sign::verify_framed(key, &artifact) {
            Ok(payload) => payload,
            Err(err) => {
                issues.push(Issue::MetadataSignatureInvalid {
                    id,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        let meta = match std::str::from_utf8(payload).map_err(|e| e.to_string()).and_then(|text| AppMetadata::parse(text).map_err(|e| e.to_string())) {
            Ok(meta) => meta,
            Err(reason) => {
                issues.push(Issue::MetadataUnparseable {
                    id,
                    reason,
                });
                continue;
            }
        };

        if meta.id != id {
            issues.push(Issue::IndexEntryMismatch {
                id: id.clone(),
                what: "identity",
            });
        }
        if meta.seq != entry.metadata_seq {
            issues.push(Issue::IndexEntryMismatch {
                id: id.clone(),
                what: "metadata sequence",
            });
        }
        match meta.head() {
            Some(head) if head.version == entry.head && head.digest == entry.head_digest => (),
            _ => issues.push(Issue::IndexEntryMismatch {
                id: id.clone(),
                what: "head version",
            }),
        }

        check_app_files(store, &meta, deep, check_deltas, cancel, &mut issues)?;

        metas.insert(id, meta);
    }

    info!("validation pass finished: {} applications, {} issues", index.entries.len(), issues.len());
    Ok(Survey {
        index,
        metas,
        issues,
    })
}

fn check_app_files(store: &RepoStore, meta: &AppMetadata, deep: bool, check_deltas: bool, cancel: &AtomicBool, issues: &mut Vec<Issue>) -> Result<()> {
    let id = &meta.id;

    for v in &meta.versions {
        let rel = store::package_path(id, v.version);
        if !store.exists(&rel) {
            issues.push(Issue::MissingPackage {
                id: id.clone(),
                version: v.version,
            });
            continue;
        }
        if store.file_size(&rel)? != v.size {
            issues.push(Issue::PackageSizeMismatch {
                id: id.clone(),
                version: v.version,
            });
            continue;
        }
        if deep && hash_on_disk(&store.abs(&rel), None)? != v.digest {
            issues.push(Issue::PackageDigestMismatch {
                id: id.clone(),
                version: v.version,
            });
        }
    }

    for d in &meta.deltas {
        if meta.version(d.from).is_none() || meta.version(d.to).is_none() {
            issues.push(Issue::DeltaEndpointMissing {
                id: id.clone(),
                from: d.from,
                to: d.to,
            });
            continue;
        }
        let rel = store::delta_path(id, d.from, d.to);
        if !store.exists(&rel) {
            issues.push(Issue::MissingDelta {
                id: id.clone(),
                from: d.from,
                to: d.to,
            });
            continue;
        }
        if store.file_size(&rel)? != d.patch_size {
            issues.push(Issue::DeltaSizeMismatch {
                id: id.clone(),
                from: d.from,
                to: d.to,
            });
            continue;
        }
        if deep && hash_on_disk(&store.abs(&rel), None)? != d.patch_digest {
            issues.push(Issue::DeltaDigestMismatch {
                id: id.clone(),
                from: d.from,
                to: d.to,
            });
            continue;
        }
        if check_deltas {
            if let Err(reason) = apply_and_compare(store, meta, d.from, d.to, cancel) {
                issues.push(Issue::DeltaApplyFailed {
                    id: id.clone(),
                    from: d.from,
                    to: d.to,
                    reason,
                });
            }
        }
    }

    // every on-disk patch must be listed
    for file in store.list_delta_files(id)? {
        let listed = meta.deltas.iter().any(|d| format!("{}-to-{}.patch", d.from, d.to) == file);
        if !listed {
            issues.push(Issue::OrphanedDelta {
                id: id.clone(),
                file,
            });
        }
    }

    Ok(())
}

/// Apply a published delta into a scratch staging file and compare the
/// result against the recorded digest of the target version.
fn apply_and_compare(store: &RepoStore, meta: &AppMetadata, from: VersionCode, to: VersionCode, cancel: &AtomicBool) -> std::result::Result<(), String> {
    let id = &meta.id;
    let old = store.abs(&store::package_path(id, from));
    let patch = store.abs(&store::delta_path(id, from, to));
    let scratch_rel = format!("{}.check", store::delta_path(id, from, to));
    let scratch = store.staging_path(&scratch_rel).map_err(|e| e.to_string())?;

    debug!("applying {} -> {} for {}", from, to, id);
    let result = delta::apply(&old, &patch, &scratch, cancel).map_err(|e| e.to_string()).and_then(|()| {
        let restored = hash_on_disk(&scratch, None).map_err(|e| e.to_string())?;
        let expected = meta.version(to).map(|v| v.digest).ok_or_else(|| "unknown target version".to_string())?;
        if restored != expected {
            return Err("restored package digest differs from metadata".to_string());
        }
        Ok(())
    });
    let _ = std::fs::remove_file(&scratch);
    result
}
