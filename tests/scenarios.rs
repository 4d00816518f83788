//! End-to-end ingest scenarios against a real on-disk repository.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use apkrepo_rs::ingest::{self, EditRequest, IngestError, IngestReport};
use apkrepo_rs::reject::Reject;
use apkrepo_rs::store::{self, RepoStore};
use apkrepo_rs::{validate, RepoConfig};
use pkg_format_apkr::package::{write_envelope, SignerAlgorithm, SignerEntry};
use pkg_format_apkr::{delta, sign, sign::RepoKey};
use repometa::{AppId, AppMetadata, RepoIndex, SignerSet, VersionCode};
use walkdir::WalkDir;

const KEY_PATH: &str = "src/testdata/repo_key_test_rsa_pkcs8.pem";

fn key() -> RepoKey {
    RepoKey::from_pem_file(Path::new(KEY_PATH)).unwrap()
}

fn signer(byte: u8) -> SignerEntry {
    SignerEntry {
        algorithm: SignerAlgorithm::Rsa,
        fingerprint: [byte; 32],
    }
}

// Deterministic pseudo-random payload bytes.
fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e3779b97f4a7c15) | 1;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

// Payload for a version: a shared base with a version-specific tail, so
// consecutive versions delta well.
fn payload_for(minor: u32) -> Vec<u8> {
    let mut payload = noise(42, 64 * 1024);
    payload.extend_from_slice(&noise(1000 + minor as u64, 4 * 1024));
    payload
}

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    inbox: PathBuf,
    key: RepoKey,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        let inbox = dir.path().join("inbox");
        fs::create_dir_all(&inbox).unwrap();
        Self {
            _dir: dir,
            root,
            inbox,
            key: key(),
        }
    }

    fn make_pkg_full(&self, name: &str, id: &str, major: u32, minor: u32, min_platform: u32, signer_byte: u8, payload: &[u8]) -> PathBuf {
        let manifest = format!("identity\t{id}\nversioncode\t{minor}\nversioncode-major\t{major}\nminplatform\t{min_platform}\n");
        let path = self.inbox.join(name);
        let mut f = File::create(&path).unwrap();
        write_envelope(&mut f, &manifest, &[signer(signer_byte)], payload).unwrap();
        path
    }

    fn make_pkg(&self, name: &str, id: &str, minor: u32) -> PathBuf {
        self.make_pkg_full(name, id, 1, minor, 21, 7, &payload_for(minor))
    }

    fn ingest(&self, store: &RepoStore, candidates: &[PathBuf]) -> Result<IngestReport, IngestError> {
        self.ingest_with(store, candidates, &RepoConfig::default())
    }

    fn ingest_with(&self, store: &RepoStore, candidates: &[PathBuf], config: &RepoConfig) -> Result<IngestReport, IngestError> {
        ingest::ingest(store, &self.key, config, candidates, &AtomicBool::new(false))
    }

    fn read_index(&self) -> RepoIndex {
        let framed = fs::read(self.root.join(store::INDEX_FILE)).unwrap();
        let payload = sign::verify_framed(&self.key, &framed).unwrap();
        RepoIndex::parse(std::str::from_utf8(payload).unwrap()).unwrap()
    }

    fn read_meta(&self, id: &str) -> AppMetadata {
        let id = AppId::new(id).unwrap();
        let framed = fs::read(self.root.join(store::metadata_path(&id))).unwrap();
        let payload = sign::verify_framed(&self.key, &framed).unwrap();
        AppMetadata::parse(std::str::from_utf8(payload).unwrap()).unwrap()
    }

    fn tree_snapshot(&self) -> BTreeSet<String> {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(&self.root).unwrap().to_string_lossy().into_owned();
                let len = e.metadata().map(|m| m.len()).unwrap_or(0);
                format!("{rel}:{len}")
            })
            .filter(|line| !line.starts_with(".lock"))
            .collect()
    }

    fn delta_files(&self, id: &str) -> Vec<String> {
        let dir = self.root.join(format!("apps/{id}/deltas"));
        if !dir.exists() {
            return Vec::new();
        }
        let mut names: Vec<String> = fs::read_dir(&dir).unwrap().map(|e| e.unwrap().file_name().to_string_lossy().into_owned()).collect();
        names.sort();
        names
    }
}

fn vc(major: u32, minor: u32) -> VersionCode {
    VersionCode::from_halves(major, minor)
}

#[test]
fn s1_first_ingest_into_an_empty_repository() {
    let h = Harness::new();
    let store = RepoStore::open(&h.root).unwrap();
    let pkg = h.make_pkg("app-1.0.pkg", "com.x.y", 0);

    let report = h.ingest(&store, &[pkg]).unwrap();
    assert_eq!(report.repo_seq, 1);
    assert_eq!(report.accepted.len(), 1);
    assert_eq!(report.deltas_generated, 0);

    let meta = h.read_meta("com.x.y");
    assert_eq!(meta.seq, 1);
    assert_eq!(meta.versions.len(), 1);
    assert_eq!(meta.head().unwrap().version, vc(1, 0));
    assert!(meta.deltas.is_empty());

    let index = h.read_index();
    assert_eq!(index.seq, 1);
    assert_eq!(index.entries.len(), 1);
    assert_eq!(index.entries[0].head, vc(1, 0));
    assert_eq!(index.entries[0].metadata_seq, 1);

    assert!(h.root.join("apps/com.x.y/4294967296.pkg").exists());
}

#[test]
fn s2_second_version_gains_a_delta_that_applies_cleanly() {
    let h = Harness::new();
    let store = RepoStore::open(&h.root).unwrap();
    h.ingest(&store, &[h.make_pkg("app-1.0.pkg", "com.x.y", 0)]).unwrap();

    let report = h.ingest(&store, &[h.make_pkg("app-1.1.pkg", "com.x.y", 1)]).unwrap();
    assert_eq!(report.repo_seq, 2);
    assert_eq!(report.deltas_generated, 1);

    let meta = h.read_meta("com.x.y");
    assert_eq!(meta.seq, 2);
    assert_eq!(meta.deltas.len(), 1);
    let d = &meta.deltas[0];
    assert_eq!((d.from, d.to), (vc(1, 0), vc(1, 1)));

    // apply(v1.0, delta) == v1.1 byte-exact
    let old = h.root.join(format!("apps/com.x.y/{}.pkg", vc(1, 0)));
    let new = h.root.join(format!("apps/com.x.y/{}.pkg", vc(1, 1)));
    let patch = h.root.join(format!("apps/com.x.y/deltas/{}-to-{}.patch", vc(1, 0), vc(1, 1)));
    let restored = h.inbox.join("restored.pkg");
    delta::apply(&old, &patch, &restored, &AtomicBool::new(false)).unwrap();
    assert_eq!(fs::read(&restored).unwrap(), fs::read(&new).unwrap());

    assert_eq!(fs::metadata(&patch).unwrap().len(), d.patch_size);
}

#[test]
fn s3_reingesting_the_head_is_rejected_and_leaves_the_tree_alone() {
    let h = Harness::new();
    let store = RepoStore::open(&h.root).unwrap();
    let pkg = h.make_pkg("app-1.0.pkg", "com.x.y", 0);
    h.ingest(&store, &[pkg.clone()]).unwrap();
    let before = h.tree_snapshot();

    let err = h.ingest(&store, &[pkg]).unwrap_err();
    match err {
        IngestError::Rejected(failures) => {
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0].reject, Reject::DowngradeOrDuplicate { .. }));
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    assert_eq!(h.tree_snapshot(), before);

    // the lock is released with the store; a fresh open succeeds
    drop(store);
    RepoStore::open(&h.root).unwrap();
}

#[test]
fn s4_five_versions_keep_exactly_four_deltas_to_the_head() {
    let h = Harness::new();
    let store = RepoStore::open(&h.root).unwrap();
    for minor in 0..5 {
        let pkg = h.make_pkg(&format!("app-1.{minor}.pkg"), "com.x.y", minor);
        h.ingest(&store, &[pkg]).unwrap();
    }

    let meta = h.read_meta("com.x.y");
    assert_eq!(meta.versions.len(), 5);
    assert_eq!(meta.deltas.len(), 4);
    for (i, d) in meta.deltas.iter().enumerate() {
        assert_eq!(d.from, vc(1, i as u32));
        assert_eq!(d.to, vc(1, 4));
    }

    // no stale patch files survive on disk
    let expect: Vec<String> = (0..4).map(|m| format!("{}-to-{}.patch", vc(1, m), vc(1, 4))).collect();
    assert_eq!(h.delta_files("com.x.y"), expect);
}

#[test]
fn s4_variant_one_batch_of_five_behaves_the_same() {
    let h = Harness::new();
    let store = RepoStore::open(&h.root).unwrap();
    let batch: Vec<PathBuf> = (0..5).map(|m| h.make_pkg(&format!("app-1.{m}.pkg"), "com.x.y", m)).collect();

    let report = h.ingest(&store, &batch).unwrap();
    assert_eq!(report.repo_seq, 1);
    assert_eq!(report.accepted.len(), 5);
    assert_eq!(report.deltas_generated, 4);

    let meta = h.read_meta("com.x.y");
    assert_eq!(meta.seq, 1);
    assert_eq!(meta.deltas.len(), 4);
    assert!(meta.deltas.iter().all(|d| d.to == vc(1, 4)));
}

#[test]
fn s5_signer_change_without_rotation_rejects_and_stages_nothing() {
    let h = Harness::new();
    let store = RepoStore::open(&h.root).unwrap();
    h.ingest(&store, &[h.make_pkg_full("a.pkg", "com.x.y", 1, 0, 21, 7, &payload_for(0))]).unwrap();
    let before = h.tree_snapshot();

    let rogue = h.make_pkg_full("b.pkg", "com.x.y", 1, 1, 21, 9, &payload_for(1));
    let err = h.ingest(&store, &[rogue.clone()]).unwrap_err();
    match err {
        IngestError::Rejected(failures) => {
            assert!(matches!(failures[0].reject, Reject::SignerMismatch { .. }));
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    assert_eq!(h.tree_snapshot(), before);
    let leftovers: Vec<_> = WalkDir::new(&h.root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "staged leftovers: {leftovers:?}");

    // a recorded rotation authorises the same candidate
    let id = AppId::new("com.x.y").unwrap();
    let successor = SignerSet::new(vec![repometa::Sha256Digest::from_bytes([9u8; 32])]);
    let request = EditRequest {
        rotate_to: Some(successor),
        ..EditRequest::default()
    };
    ingest::edit(&store, &h.key, &id, &request).unwrap();

    h.ingest(&store, &[rogue]).unwrap();
    let meta = h.read_meta("com.x.y");
    assert_eq!(meta.rotations.len(), 1);
    assert_eq!(meta.head().unwrap().version, vc(1, 1));
}

#[test]
fn s6_crash_between_stage_and_commit_recovers_to_the_old_state() {
    let h = Harness::new();
    let pkg = h.make_pkg("app-1.0.pkg", "com.x.y", 0);
    let pkg2 = h.make_pkg("app-1.1.pkg", "com.x.y", 1);

    {
        let store = RepoStore::open(&h.root).unwrap();
        h.ingest(&store, &[pkg]).unwrap();
    }
    let before = h.tree_snapshot();

    {
        // stage by hand and "crash" before commit
        let store = RepoStore::open(&h.root).unwrap();
        let id = AppId::new("com.x.y").unwrap();
        store.stage_file_copy(&pkg2, &store::package_path(&id, vc(1, 1))).unwrap();
        store.stage(store::INDEX_FILE, b"would-be index").unwrap();
        // dropped without commit: the process dies here
    }

    let store = RepoStore::open(&h.root).unwrap();
    assert_eq!(h.tree_snapshot(), before);

    // the same candidate ingests cleanly afterwards
    h.ingest(&store, &[pkg2]).unwrap();
    assert_eq!(h.read_meta("com.x.y").head().unwrap().version, vc(1, 1));
}

#[test]
fn version_code_minor_boundary_survives_the_round_trip() {
    let h = Harness::new();
    let store = RepoStore::open(&h.root).unwrap();
    let pkg = h.make_pkg_full("edge.pkg", "com.x.y", 0, u32::MAX, 21, 7, b"tiny payload");

    h.ingest(&store, &[pkg]).unwrap();
    let meta = h.read_meta("com.x.y");
    let head = meta.head().unwrap().version;
    assert_eq!(head, vc(0, u32::MAX));
    assert_eq!(head.minor(), u32::MAX);
    assert_eq!(head.major(), 0);
    assert!(h.root.join(format!("apps/com.x.y/{}.pkg", u32::MAX)).exists());
}

#[test]
fn batch_across_applications_publishes_once() {
    let h = Harness::new();
    let store = RepoStore::open(&h.root).unwrap();
    let a = h.make_pkg("a.pkg", "com.x.a", 0);
    let b = h.make_pkg("b.pkg", "com.x.b", 0);

    let report = h.ingest(&store, &[a, b]).unwrap();
    assert_eq!(report.repo_seq, 1);
    assert_eq!(report.touched.len(), 2);

    let index = h.read_index();
    assert_eq!(index.entries.len(), 2);
    // identity-sorted
    assert_eq!(index.entries[0].id.as_str(), "com.x.a");
    assert_eq!(index.entries[1].id.as_str(), "com.x.b");
    assert_eq!(h.read_meta("com.x.a").seq, 1);
    assert_eq!(h.read_meta("com.x.b").seq, 1);
}

#[test]
fn one_bad_candidate_sinks_the_whole_batch() {
    let h = Harness::new();
    let store = RepoStore::open(&h.root).unwrap();
    let good = h.make_pkg("good.pkg", "com.x.a", 0);
    let unsigned = h.make_pkg_full("bad.pkg", "com.x.b", 1, 0, 21, 7, b"p");
    // strip the signer block by rewriting with none
    {
        let manifest = "identity\tcom.x.b\nversioncode\t0\nminplatform\t21\n";
        let mut f = File::create(&unsigned).unwrap();
        write_envelope(&mut f, manifest, &[], b"p").unwrap();
    }

    let err = h.ingest(&store, &[good, unsigned]).unwrap_err();
    match err {
        IngestError::Rejected(failures) => {
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0].reject, Reject::Unsigned));
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    // the good candidate was not committed either
    assert!(!h.root.join(store::INDEX_FILE).exists());
    assert!(!h.root.join("apps/com.x.a").join(store::METADATA_FILE).exists());
}

#[test]
fn unrelated_payloads_skip_the_delta_and_fall_back_to_full_download() {
    let h = Harness::new();
    let store = RepoStore::open(&h.root).unwrap();
    let v0 = h.make_pkg_full("v0.pkg", "com.x.y", 1, 0, 21, 7, &noise(1, 96 * 1024));
    let v1 = h.make_pkg_full("v1.pkg", "com.x.y", 1, 1, 21, 7, &noise(2, 96 * 1024));

    h.ingest(&store, &[v0]).unwrap();
    let report = h.ingest(&store, &[v1]).unwrap();
    assert_eq!(report.deltas_generated, 0);
    assert_eq!(report.deltas_skipped, 1);

    let meta = h.read_meta("com.x.y");
    assert!(meta.deltas.is_empty());
    assert!(h.delta_files("com.x.y").is_empty());
}

#[test]
fn sequences_and_timestamps_never_move_backwards() {
    let h = Harness::new();
    let store = RepoStore::open(&h.root).unwrap();

    let mut last_seq = 0;
    let mut last_ts = 0;
    for minor in 0..3 {
        let pkg = h.make_pkg(&format!("app-1.{minor}.pkg"), "com.x.y", minor);
        let report = h.ingest(&store, &[pkg]).unwrap();
        assert_eq!(report.repo_seq, last_seq + 1);
        last_seq = report.repo_seq;

        let index = h.read_index();
        assert!(index.timestamp >= last_ts);
        last_ts = index.timestamp;
        assert_eq!(index.entries[0].metadata_seq, last_seq);
    }
}

#[test]
fn edits_republish_label_notes_and_icon() {
    let h = Harness::new();
    let store = RepoStore::open(&h.root).unwrap();
    h.ingest(&store, &[h.make_pkg("app-1.0.pkg", "com.x.y", 0)]).unwrap();

    let notes = h.inbox.join("notes.txt");
    fs::write(&notes, b"fixes things").unwrap();
    let icon = h.inbox.join("icon.bin");
    fs::write(&icon, b"icon-bytes").unwrap();

    let id = AppId::new("com.x.y").unwrap();
    let request = EditRequest {
        label: Some("Example".to_string()),
        icon: Some(icon),
        notes: Some((vc(1, 0), notes)),
        rotate_to: None,
    };
    let repo_seq = ingest::edit(&store, &h.key, &id, &request).unwrap();
    assert_eq!(repo_seq, 2);

    let meta = h.read_meta("com.x.y");
    assert_eq!(meta.seq, 2);
    assert_eq!(meta.label, "Example");
    assert_eq!(meta.icon_digest, Some(repometa::Sha256Digest::of(b"icon-bytes")));
    assert_eq!(meta.versions[0].notes_digest, Some(repometa::Sha256Digest::of(b"fixes things")));
    assert_eq!(fs::read(h.root.join("apps/com.x.y/4294967296.txt")).unwrap(), b"fixes things");
    assert_eq!(fs::read(h.root.join("apps/com.x.y/icon")).unwrap(), b"icon-bytes");

    // a full validation pass still holds after the edit
    let survey = validate::full_check(&store, &h.key, true, &AtomicBool::new(false)).unwrap();
    assert!(survey.is_consistent(), "issues: {:?}", survey.issues);
}

#[test]
fn published_repository_passes_deep_validation() {
    let h = Harness::new();
    let store = RepoStore::open(&h.root).unwrap();
    for minor in 0..3 {
        let pkg = h.make_pkg(&format!("app-1.{minor}.pkg"), "com.x.y", minor);
        h.ingest(&store, &[pkg]).unwrap();
    }

    let survey = validate::full_check(&store, &h.key, true, &AtomicBool::new(false)).unwrap();
    assert!(survey.is_consistent(), "issues: {:?}", survey.issues);
    assert_eq!(survey.index.seq, 3);
}
