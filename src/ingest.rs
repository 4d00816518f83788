//! Publication transactions.
//!
//! [`ingest`] drives a whole batch of candidate packages end to end:
//! inspect, admit against the ledger, stage package bytes, plan and
//! generate deltas in parallel, rebuild metadata and index, commit
//! atomically. [`edit`] reuses the same machinery for operator changes
//! (label, icon, release notes, signer rotation). Both are all-or-nothing:
//! any failure discards every staged file and leaves the published tree
//! untouched.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use rayon::prelude::*;

use pkg_format_apkr::delta;
use pkg_format_apkr::sign::RepoKey;
use repometa::metadata::{validate_label, RotationEntry};
use repometa::{AppId, AppMetadata, DeltaEntry, IndexEntry, RepoIndex, Sha256Digest, SignerSet, VersionCode};

use crate::config::RepoConfig;
use crate::hash_on_disk;
use crate::inspect;
use crate::ledger::{AppState, Ledger};
use crate::planner;
use crate::reject::Reject;
use crate::signer;
use crate::store::{self, RepoStore, StagedWrite};
use crate::validate::{self, Issue};

#[derive(Debug)]
pub struct CandidateFailure {
    pub path: PathBuf,
    pub reject: Reject,
}

#[derive(Debug)]
pub struct AcceptedCandidate {
    pub path: PathBuf,
    pub id: AppId,
    pub version: VersionCode,
}

#[derive(Debug)]
pub struct IngestReport {
    pub accepted: Vec<AcceptedCandidate>,
    pub touched: Vec<AppId>,
    pub repo_seq: u64,
    pub deltas_generated: usize,
    /// Pairs skipped because the patch would not undercut the size cap;
    /// clients fall back to the full download for these.
    pub deltas_skipped: usize,
    pub deltas_pruned: usize,
}

#[derive(Debug)]
pub enum IngestError {
    /// The published tree failed startup validation; nothing was attempted.
    Inconsistent(Vec<Issue>),
    /// One or more candidates were refused; the whole batch was rolled back.
    Rejected(Vec<CandidateFailure>),
    /// Tooling failure (filesystem, delta engine, signer); rolled back.
    Tool(anyhow::Error),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            IngestError::Inconsistent(issues) => {
                write!(f, "repository failed validation with {} issue(s)", issues.len())
            }
            IngestError::Rejected(failures) => {
                write!(f, "{} candidate(s) rejected, transaction rolled back", failures.len())
            }
            IngestError::Tool(err) => write!(f, "{err:#}"),
        }
    }
}

impl From<anyhow::Error> for IngestError {
    fn from(err: anyhow::Error) -> Self {
        IngestError::Tool(err)
    }
}

/// One delta generation work item; pure with respect to its two input
/// files, so items run freely in parallel.
struct DeltaJob {
    from: VersionCode,
    to: VersionCode,
    old: PathBuf,
    new: PathBuf,
    rel: String,
    staging: PathBuf,
    cap: u64,
}

/// Ingest a batch of candidate package files in caller order.
pub fn ingest(store: &RepoStore, key: &RepoKey, config: &RepoConfig, candidates: &[PathBuf], cancel: &AtomicBool) -> std::result::Result<IngestReport, IngestError> {
    let mut writes: Vec<StagedWrite> = Vec::new();
    let result = ingest_inner(store, key, config, candidates, cancel, &mut writes);
    if result.is_err() {
        store.abort(&writes);
    }
    result
}

fn ingest_inner(
    store: &RepoStore,
    key: &RepoKey,
    config: &RepoConfig,
    candidates: &[PathBuf],
    cancel: &AtomicBool,
    writes: &mut Vec<StagedWrite>,
) -> std::result::Result<IngestReport, IngestError> {
    if candidates.is_empty() {
        return Err(IngestError::Tool(anyhow!("no candidate packages given")));
    }

    let survey = validate::startup_check(store, key)?;
    if !survey.is_consistent() {
        return Err(IngestError::Inconsistent(survey.issues));
    }
    let prev_index = survey.index;
    let ledger = Ledger::from_metadata(survey.metas.into_values());

    // Inspect and admit every candidate, staging package bytes as we go.
    // All rejects are collected so the operator sees the whole batch's
    // verdict at once.
    let mut proposed: BTreeMap<AppId, AppState> = BTreeMap::new();
    let mut staged_rels: HashMap<String, PathBuf> = HashMap::new();
    let mut accepted = Vec::new();
    let mut failures = Vec::new();

    for path in candidates {
        let pkg = match inspect::inspect(path)? {
            Ok(pkg) => pkg,
            Err(reject) => {
                warn!("{}: rejected: {reject}", path.display());
                failures.push(CandidateFailure {
                    path: path.clone(),
                    reject,
                });
                continue;
            }
        };

        let app = match proposed.entry(pkg.id.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                let state = ledger.apps.get(&pkg.id).cloned().unwrap_or_else(|| AppState::new(pkg.id.clone()));
                v.insert(state)
            }
        };
        app.recover_head_signers(store)?;

        if let Err(reject) = app.check_candidate(&pkg, config.platform_relaxation) {
            warn!("{}: rejected: {reject}", path.display());
            failures.push(CandidateFailure {
                path: path.clone(),
                reject,
            });
            continue;
        }

        let rel = store::package_path(&pkg.id, pkg.version);
        let w = store.stage_file_copy(path, &rel).context(format!("failed to stage candidate ({:?})", path.display()))?;
        staged_rels.insert(rel, w.staged_path().to_path_buf());
        writes.push(w);
        app.propose(&pkg);
        accepted.push(AcceptedCandidate {
            path: path.clone(),
            id: pkg.id,
            version: pkg.version,
        });
    }

    if !failures.is_empty() {
        return Err(IngestError::Rejected(failures));
    }

    // Plan the delta set per touched application and (re)generate patches
    // on the worker pool.
    #[rustfmt::skip]
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers.unwrap_or(0))
        .build()
        .context("failed to build delta worker pool")?;

    let mut removals: Vec<String> = Vec::new();
    let mut deltas_generated = 0;
    let mut deltas_skipped = 0;
    let mut deltas_pruned = 0;

    for (id, app) in proposed.iter_mut() {
        let Some(plan) = planner::plan(&app.meta, config.max_deltas) else {
            continue;
        };

        let resolve = |rel: &str| staged_rels.get(rel).cloned().unwrap_or_else(|| store.abs(rel));
        let new_path = resolve(&store::package_path(id, plan.target));
        let head_size = app.meta.head().map(|h| h.size).unwrap_or(0);
        let cap = config.patch_cap_for(head_size);

        let mut jobs = Vec::new();
        for from in &plan.generate {
            let rel = store::delta_path(id, *from, plan.target);
            let staging = store.staging_path(&rel)?;
            jobs.push(DeltaJob {
                from: *from,
                to: plan.target,
                old: resolve(&store::package_path(id, *from)),
                new: new_path.clone(),
                rel,
                staging,
                cap,
            });
        }

        #[rustfmt::skip]
        let results: Vec<Result<Option<(String, DeltaEntry)>>> = pool.install(|| {
            jobs.par_iter()
                .map(|job| generate_one(job, cancel))
                .collect()
        });

        let mut deltas = plan.keep.clone();
        for result in results {
            match result? {
                Some((rel, entry)) => {
                    writes.push(store.adopt_staged(&rel)?);
                    deltas.push(entry);
                    deltas_generated += 1;
                }
                None => deltas_skipped += 1,
            }
        }
        deltas.sort_by_key(|d| d.from);
        app.meta.deltas = deltas;

        for d in &plan.prune {
            removals.push(store::delta_path(id, d.from, d.to));
            deltas_pruned += 1;
        }

        app.meta.seq += 1;
    }

    // Metadata and index reflect the same post-commit state; the index is
    // staged last so its rename is the final step of the commit.
    let touched_metas: Vec<&AppMetadata> = proposed.values().map(|a| &a.meta).collect();
    let repo_seq = publish(store, key, &prev_index, &touched_metas, writes)?;

    store.commit(writes, &removals)?;

    let touched: Vec<AppId> = proposed.keys().cloned().collect();
    info!(
        "ingested {} package(s) across {} application(s): repo sequence {}, {} delta(s) generated, {} skipped, {} pruned",
        accepted.len(),
        touched.len(),
        repo_seq,
        deltas_generated,
        deltas_skipped,
        deltas_pruned
    );

    Ok(IngestReport {
        accepted,
        touched,
        repo_seq,
        deltas_generated,
        deltas_skipped,
        deltas_pruned,
    })
}

fn generate_one(job: &DeltaJob, cancel: &AtomicBool) -> Result<Option<(String, DeltaEntry)>> {
    match delta::generate(&job.old, &job.new, &job.staging, Some(job.cap), cancel) {
        Ok(stats) => {
            let patch_digest = hash_on_disk(&job.staging, None)?;
            Ok(Some((
                job.rel.clone(),
                DeltaEntry {
                    from: job.from,
                    to: job.to,
                    patch_digest,
                    patch_size: stats.patch_size,
                },
            )))
        }
        Err(delta::Error::PatchTooLarge {
            ..
        }) => {
            info!("delta {} -> {} not worthwhile, clients will download the full package", job.from, job.to);
            Ok(None)
        }
        Err(err) => Err(err).context(format!("failed to generate delta {} -> {}", job.from, job.to)),
    }
}

/// Stage fresh metadata artifacts for `touched` and a fresh index carrying
/// the next repository sequence. Returns the new sequence number.
fn publish(store: &RepoStore, key: &RepoKey, prev_index: &RepoIndex, touched: &[&AppMetadata], writes: &mut Vec<StagedWrite>) -> Result<u64> {
    let mut entries: BTreeMap<AppId, IndexEntry> = prev_index.entries.iter().map(|e| (e.id.clone(), e.clone())).collect();

    for meta in touched {
        let artifact = signer::build_app_artifact(key, meta)?;
        writes.push(store.stage(&store::metadata_path(&meta.id), &artifact)?);
        entries.insert(meta.id.clone(), signer::index_entry_for(meta, &artifact));
    }

    let index = RepoIndex {
        seq: prev_index.seq + 1,
        timestamp: signer::publication_timestamp(prev_index.timestamp),
        entries: entries.into_values().collect(),
    };
    let artifact = signer::build_index_artifact(key, &index)?;
    writes.push(store.stage(store::INDEX_FILE, &artifact)?);

    Ok(index.seq)
}

/// Operator changes to one application's published record.
#[derive(Debug, Default)]
pub struct EditRequest {
    pub label: Option<String>,
    pub icon: Option<PathBuf>,
    pub notes: Option<(VersionCode, PathBuf)>,
    /// Record a rotation from the current head signer set to this one.
    pub rotate_to: Option<SignerSet>,
}

impl EditRequest {
    pub fn is_empty(&self) -> bool {
        self.label.is_none() && self.icon.is_none() && self.notes.is_none() && self.rotate_to.is_none()
    }
}

/// Apply an edit to one application and republish. A publication like any
/// other: bumps both sequences and rewrites metadata and index atomically.
pub fn edit(store: &RepoStore, key: &RepoKey, id: &AppId, request: &EditRequest) -> std::result::Result<u64, IngestError> {
    let mut writes: Vec<StagedWrite> = Vec::new();
    let result = edit_inner(store, key, id, request, &mut writes);
    if result.is_err() {
        store.abort(&writes);
    }
    result
}

fn edit_inner(store: &RepoStore, key: &RepoKey, id: &AppId, request: &EditRequest, writes: &mut Vec<StagedWrite>) -> std::result::Result<u64, IngestError> {
    if request.is_empty() {
        return Err(IngestError::Tool(anyhow!("nothing to edit")));
    }

    let survey = validate::startup_check(store, key)?;
    if !survey.is_consistent() {
        return Err(IngestError::Inconsistent(survey.issues));
    }

    let meta = survey.metas.get(id).cloned().ok_or_else(|| anyhow!("unknown application {id}"))?;
    let mut state = AppState::from_meta(meta);
    if request.rotate_to.is_some() {
        state.recover_head_signers(store)?;
    }
    let predecessor = state.head_signers.clone();
    let meta = &mut state.meta;

    if let Some(label) = &request.label {
        validate_label(label).map_err(|err| anyhow!("invalid label: {err}"))?;
        meta.label = label.clone();
    }

    if let Some(icon) = &request.icon {
        let bytes = fs::read(icon).context(format!("failed to read icon ({:?})", icon.display()))?;
        writes.push(store.stage(&store::icon_path(id), &bytes)?);
        meta.icon_digest = Some(Sha256Digest::of(&bytes));
    }

    if let Some((version, path)) = &request.notes {
        let bytes = fs::read(path).context(format!("failed to read release notes ({:?})", path.display()))?;
        let entry = meta.versions.iter_mut().find(|v| v.version == *version).ok_or_else(|| anyhow!("{id} has no version {version}"))?;
        entry.notes_digest = Some(Sha256Digest::of(&bytes));
        writes.push(store.stage(&store::notes_path(id, *version), &bytes)?);
    }

    if let Some(successor) = &request.rotate_to {
        let predecessor = predecessor.ok_or_else(|| anyhow!("{id} has no published head to rotate from"))?;
        if &predecessor == successor {
            return Err(IngestError::Tool(anyhow!("rotation target equals the current signer set")));
        }
        info!("{id}: recording signer rotation [{predecessor}] -> [{successor}]");
        meta.rotations.push(RotationEntry {
            predecessor,
            successor: successor.clone(),
        });
    }

    meta.seq += 1;

    let touched: Vec<&AppMetadata> = vec![&*meta];
    let repo_seq = publish(store, key, &survey.index, &touched, writes)?;
    store.commit(writes, &[])?;

    Ok(repo_seq)
}
