//! Delta set planning.
//!
//! After an ingest the only deltas worth keeping all target the new head:
//! one from each of the `max_deltas` versions immediately below it, clamped
//! to the available history. Everything else is pruned. Planning is a pure
//! function of the history and the policy knobs, so identical inputs give
//! identical plans.

use log::debug;

use repometa::{AppMetadata, DeltaEntry, VersionCode};

/// What has to happen to one application's delta set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaPlan {
    /// Head version every delta targets.
    pub target: VersionCode,
    /// Source versions that need a fresh patch to the head.
    pub generate: Vec<VersionCode>,
    /// Existing deltas that are already correct and stay published.
    pub keep: Vec<DeltaEntry>,
    /// Existing deltas to delete in the same commit.
    pub prune: Vec<DeltaEntry>,
}

/// Plan the delta set for `meta` as it will look after the transaction.
/// Returns `None` for an empty history.
pub fn plan(meta: &AppMetadata, max_deltas: usize) -> Option<DeltaPlan> {
    let head = meta.head()?.version;
    let n = meta.versions.len();

    // the `max_deltas` versions immediately below the head, ascending
    let start = (n - 1).saturating_sub(max_deltas);
    let sources: Vec<VersionCode> = meta.versions[start..n - 1].iter().map(|v| v.version).collect();

    let mut keep = Vec::new();
    let mut prune = Vec::new();
    for delta in &meta.deltas {
        if delta.to == head && sources.contains(&delta.from) {
            keep.push(delta.clone());
        } else {
            prune.push(delta.clone());
        }
    }

    let generate: Vec<VersionCode> = sources.iter().copied().filter(|from| !keep.iter().any(|d| d.from == *from)).collect();

    debug!("{}: plan targets {head}: generate {}, keep {}, prune {}", meta.id, generate.len(), keep.len(), prune.len());

    Some(DeltaPlan {
        target: head,
        generate,
        keep,
        prune,
    })
}
