//! Per-application version history and candidate admission.
//!
//! The ledger is rebuilt from the published metadata files on every open.
//! The head's signer set is not part of the metadata payload, so it is
//! recovered by re-inspecting the head package file when a candidate for an
//! existing application arrives.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use log::debug;

use repometa::{AppId, AppMetadata, SignerSet, VersionEntry};

use crate::inspect::{self, Package};
use crate::reject::Reject;
use crate::store::{self, RepoStore};

#[derive(Debug, Clone)]
pub struct AppState {
    pub meta: AppMetadata,
    /// Signer set of the head package, lazily recovered from disk; always
    /// present for versions proposed in the current transaction.
    pub head_signers: Option<SignerSet>,
}

impl AppState {
    pub fn new(id: AppId) -> Self {
        Self {
            meta: AppMetadata::new(id),
            head_signers: None,
        }
    }

    pub fn from_meta(meta: AppMetadata) -> Self {
        Self {
            meta,
            head_signers: None,
        }
    }

    /// Make sure the head's signer set is known, inspecting the published
    /// head package if needed.
    pub fn recover_head_signers(&mut self, store: &RepoStore) -> Result<()> {
        if self.head_signers.is_some() || self.meta.versions.is_empty() {
            return Ok(());
        }
        let head = self.meta.head().expect("non-empty history has a head");
        let path = store.abs(&store::package_path(&self.meta.id, head.version));
        let pkg = inspect::inspect(&path)
            .and_then(|r| r.map_err(|reject| anyhow::anyhow!("published package failed inspection: {reject}")))
            .context(format!("failed to recover signer set of {} {}", self.meta.id, head.version))?;
        self.head_signers = Some(pkg.signers);
        Ok(())
    }

    /// Admission checks for one candidate against this history, in fixed
    /// order: monotonicity, identity, signer compatibility, platform floor.
    pub fn check_candidate(&self, candidate: &Package, platform_relaxation: u32) -> std::result::Result<(), Reject> {
        let Some(head) = self.meta.head() else {
            // first version of a new application
            return Ok(());
        };

        if candidate.version <= head.version {
            return Err(Reject::DowngradeOrDuplicate {
                candidate: candidate.version,
                head: head.version,
            });
        }

        if candidate.id != self.meta.id {
            return Err(Reject::IdentityMismatch {
                expected: self.meta.id.clone(),
                actual: candidate.id.clone(),
            });
        }

        let head_signers = self.head_signers.as_ref().expect("head signer set recovered before candidate checks");
        if !self.signer_compatible(head_signers, &candidate.signers) {
            return Err(Reject::SignerMismatch {
                head: head_signers.clone(),
                candidate: candidate.signers.clone(),
            });
        }

        if candidate.min_platform.saturating_add(platform_relaxation) < head.min_platform {
            return Err(Reject::PlatformRegression {
                head: head.min_platform,
                candidate: candidate.min_platform,
            });
        }

        Ok(())
    }

    /// Equal signer sets are always compatible; otherwise a recorded
    /// rotation must authorise exactly this transition.
    fn signer_compatible(&self, head: &SignerSet, candidate: &SignerSet) -> bool {
        if head == candidate {
            return true;
        }
        self.meta.rotations.iter().any(|r| &r.predecessor == head && &r.successor == candidate)
    }

    /// Append an accepted candidate as the new head. The caller commits the
    /// bytes; this only advances the proposed history.
    pub fn propose(&mut self, candidate: &Package) {
        debug!("{}: proposing head {}", self.meta.id, candidate.version);
        self.meta.versions.push(VersionEntry {
            version: candidate.version,
            digest: candidate.digest,
            size: candidate.size,
            min_platform: candidate.min_platform,
            notes_digest: None,
        });
        if self.meta.versions.len() == 1 {
            if let Some(label) = &candidate.label {
                self.meta.label = label.clone();
            }
        }
        self.head_signers = Some(candidate.signers.clone());
    }
}

/// All application histories known to the published tree.
#[derive(Debug, Default)]
pub struct Ledger {
    pub apps: BTreeMap<AppId, AppState>,
}

impl Ledger {
    pub fn from_metadata(metas: impl IntoIterator<Item = AppMetadata>) -> Self {
        let mut apps = BTreeMap::new();
        for meta in metas {
            apps.insert(meta.id.clone(), AppState::from_meta(meta));
        }
        Self {
            apps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repometa::{metadata::RotationEntry, Sha256Digest, VersionCode};

    fn signer_set(bytes: &[u8]) -> SignerSet {
        SignerSet::new(vec![Sha256Digest::of(bytes)])
    }

    fn candidate(version: VersionCode, min_platform: u32, signers: &SignerSet) -> Package {
        Package {
            id: AppId::new("com.x.y").unwrap(),
            version,
            min_platform,
            label: None,
            signers: signers.clone(),
            digest: Sha256Digest::of(b"candidate"),
            size: 10,
        }
    }

    fn app_with_head(version: VersionCode, min_platform: u32, signers: &SignerSet) -> AppState {
        let mut app = AppState::new(AppId::new("com.x.y").unwrap());
        app.propose(&candidate(version, min_platform, signers));
        app
    }

    #[test]
    fn first_version_is_always_admissible() {
        let app = AppState::new(AppId::new("com.x.y").unwrap());
        let c = candidate(VersionCode::from_halves(1, 0), 21, &signer_set(b"k1"));
        assert!(app.check_candidate(&c, 0).is_ok());
    }

    #[test]
    fn rejects_downgrade_and_duplicate() {
        let signers = signer_set(b"k1");
        let app = app_with_head(VersionCode::from_halves(1, 1), 21, &signers);

        let duplicate = candidate(VersionCode::from_halves(1, 1), 21, &signers);
        assert!(matches!(app.check_candidate(&duplicate, 0), Err(Reject::DowngradeOrDuplicate { .. })));

        let downgrade = candidate(VersionCode::from_halves(1, 0), 21, &signers);
        assert!(matches!(app.check_candidate(&downgrade, 0), Err(Reject::DowngradeOrDuplicate { .. })));
    }

    #[test]
    fn rejects_identity_mismatch() {
        let signers = signer_set(b"k1");
        let app = app_with_head(VersionCode::from_halves(1, 0), 21, &signers);
        let mut c = candidate(VersionCode::from_halves(1, 1), 21, &signers);
        c.id = AppId::new("com.other.app").unwrap();
        assert!(matches!(app.check_candidate(&c, 0), Err(Reject::IdentityMismatch { .. })));
    }

    #[test]
    fn rejects_unknown_signer_set() {
        let app = app_with_head(VersionCode::from_halves(1, 0), 21, &signer_set(b"k1"));
        let c = candidate(VersionCode::from_halves(1, 1), 21, &signer_set(b"k2"));
        assert!(matches!(app.check_candidate(&c, 0), Err(Reject::SignerMismatch { .. })));
    }

    #[test]
    fn rotation_authorises_exactly_its_transition() {
        let old = signer_set(b"k1");
        let new = signer_set(b"k2");
        let third = signer_set(b"k3");

        let mut app = app_with_head(VersionCode::from_halves(1, 0), 21, &old);
        app.meta.rotations.push(RotationEntry {
            predecessor: old.clone(),
            successor: new.clone(),
        });

        let rotated = candidate(VersionCode::from_halves(1, 1), 21, &new);
        assert!(app.check_candidate(&rotated, 0).is_ok());

        let unauthorised = candidate(VersionCode::from_halves(1, 1), 21, &third);
        assert!(matches!(app.check_candidate(&unauthorised, 0), Err(Reject::SignerMismatch { .. })));

        // once the head has rotated, the old entry does not work backwards
        app.propose(&rotated);
        let backwards = candidate(VersionCode::from_halves(1, 2), 21, &old);
        assert!(matches!(app.check_candidate(&backwards, 0), Err(Reject::SignerMismatch { .. })));
    }

    #[test]
    fn rejects_platform_regression_unless_relaxed() {
        let signers = signer_set(b"k1");
        let app = app_with_head(VersionCode::from_halves(1, 0), 23, &signers);

        let regressing = candidate(VersionCode::from_halves(1, 1), 21, &signers);
        assert!(matches!(app.check_candidate(&regressing, 0), Err(Reject::PlatformRegression { .. })));
        assert!(app.check_candidate(&regressing, 2).is_ok());

        let raising = candidate(VersionCode::from_halves(1, 1), 30, &signers);
        assert!(app.check_candidate(&raising, 0).is_ok());
    }

    #[test]
    fn propose_advances_head_and_signers() {
        let signers = signer_set(b"k1");
        let mut app = AppState::new(AppId::new("com.x.y").unwrap());
        let mut c = candidate(VersionCode::from_halves(1, 0), 21, &signers);
        c.label = Some("First Label".to_string());
        app.propose(&c);

        assert_eq!(app.meta.head().unwrap().version, VersionCode::from_halves(1, 0));
        assert_eq!(app.meta.label, "First Label");
        assert_eq!(app.head_signers.as_ref(), Some(&signers));

        // label from later manifests does not override the operator's
        let mut c2 = candidate(VersionCode::from_halves(1, 1), 21, &signers);
        c2.label = Some("Renamed".to_string());
        app.propose(&c2);
        assert_eq!(app.meta.label, "First Label");
    }
}
