//! On-disk repository layout and atomic publication.
//!
//! ```text
//! <root>/
//!   .lock                    exclusive advisory lock, never published
//!   .commit                  rename/remove journal, present only mid-commit
//!   index                    signed repository index
//!   apps/<identity>/
//!     metadata               signed per-application metadata
//!     <versionCode>.pkg      immutable package files
//!     <versionCode>.txt      optional release notes
//!     icon                   optional app icon blob
//!     deltas/<from>-to-<to>.patch
//! ```
//!
//! Writes are staged as fsynced `<final>.tmp` siblings and made visible by
//! a journaled batch of renames: the journal is fsynced into place first
//! (the commit point), then every rename and removal is performed, then the
//! journal is deleted. Crash recovery either rolls a present journal
//! forward or discards leftover `.tmp` files, so readers only ever observe
//! the pre-transaction or the fully committed tree.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use log::{debug, info, warn};
use walkdir::WalkDir;

use repometa::{AppId, VersionCode};

pub const INDEX_FILE: &str = "index";
pub const APPS_DIR: &str = "apps";
pub const METADATA_FILE: &str = "metadata";
pub const DELTAS_DIR: &str = "deltas";
pub const GROUPS_FILE: &str = "groups";

const LOCK_FILE: &str = ".lock";
const JOURNAL_FILE: &str = ".commit";
const STAGING_SUFFIX: &str = ".tmp";

pub fn app_dir(id: &AppId) -> String {
    format!("{APPS_DIR}/{id}")
}

pub fn metadata_path(id: &AppId) -> String {
    format!("{APPS_DIR}/{id}/{METADATA_FILE}")
}

pub fn package_path(id: &AppId, version: VersionCode) -> String {
    format!("{APPS_DIR}/{id}/{version}.pkg")
}

pub fn notes_path(id: &AppId, version: VersionCode) -> String {
    format!("{APPS_DIR}/{id}/{version}.txt")
}

pub fn icon_path(id: &AppId) -> String {
    format!("{APPS_DIR}/{id}/icon")
}

pub fn delta_path(id: &AppId, from: VersionCode, to: VersionCode) -> String {
    format!("{APPS_DIR}/{id}/{DELTAS_DIR}/{from}-to-{to}.patch")
}

/// A staged write: bytes already fsynced into a `.tmp` sibling of their
/// final path, awaiting commit.
#[derive(Debug)]
pub struct StagedWrite {
    pub target: String,
    tmp: PathBuf,
}

impl StagedWrite {
    pub fn staged_path(&self) -> &Path {
        &self.tmp
    }
}

pub struct RepoStore {
    root: PathBuf,
    lock: File,
}

impl RepoStore {
    /// Open a repository root, taking the exclusive lock and recovering
    /// from any interrupted commit.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).context(format!("failed to create repository root ({:?})", root.display()))?;
        fs::create_dir_all(root.join(APPS_DIR))?;

        #[rustfmt::skip]
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(root.join(LOCK_FILE))?;
        lock.try_lock_exclusive().context(format!("repository {:?} is locked by another process", root.display()))?;

        let store = Self {
            root: root.to_path_buf(),
            lock,
        };
        store.recover()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a repository-relative path.
    pub fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.abs(rel).exists()
    }

    pub fn file_size(&self, rel: &str) -> Result<u64> {
        let path = self.abs(rel);
        Ok(fs::metadata(&path).context(format!("failed to get metadata, path ({:?})", path.display()))?.len())
    }

    pub fn read(&self, rel: &str) -> Result<Vec<u8>> {
        let path = self.abs(rel);
        fs::read(&path).context(format!("failed to read path ({:?})", path.display()))
    }

    /// Identities that have a directory under `apps/`, whether or not the
    /// index knows them.
    pub fn list_app_dirs(&self) -> Result<Vec<AppId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join(APPS_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!("ignoring non-UTF-8 entry under {APPS_DIR}/");
                continue;
            };
            match AppId::new(name) {
                Ok(id) => ids.push(id),
                Err(_) => warn!("ignoring foreign directory {APPS_DIR}/{name}"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Published delta file names for one application.
    pub fn list_delta_files(&self, id: &AppId) -> Result<Vec<String>> {
        let dir = self.abs(&format!("{}/{DELTAS_DIR}", app_dir(id)));
        let mut names = Vec::new();
        if !dir.exists() {
            return Ok(names);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".patch") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn check_rel(rel: &str) -> Result<()> {
        if rel.is_empty() || !rel.is_ascii() || rel.starts_with('/') || rel.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            bail!("invalid repository path {rel:?}");
        }
        Ok(())
    }

    fn staging_path_for(&self, rel: &str) -> PathBuf {
        self.abs(&format!("{rel}{STAGING_SUFFIX}"))
    }

    /// Reserve the staging path for `rel`, creating parent directories.
    /// Used when an external producer (the delta engine) writes the staged
    /// bytes itself; follow up with [`RepoStore::adopt_staged`].
    pub fn staging_path(&self, rel: &str) -> Result<PathBuf> {
        Self::check_rel(rel)?;
        let tmp = self.staging_path_for(rel);
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent).context(format!("failed to create directory ({:?})", parent.display()))?;
        }
        Ok(tmp)
    }

    /// Register a file previously written to [`RepoStore::staging_path`],
    /// fsyncing it.
    pub fn adopt_staged(&self, rel: &str) -> Result<StagedWrite> {
        let tmp = self.staging_path_for(rel);
        let f = File::open(&tmp).context(format!("failed to open staged file ({:?})", tmp.display()))?;
        f.sync_all().context(format!("failed to fsync staged file ({:?})", tmp.display()))?;
        Ok(StagedWrite {
            target: rel.to_string(),
            tmp,
        })
    }

    /// Stage a byte buffer for `rel`.
    pub fn stage(&self, rel: &str, bytes: &[u8]) -> Result<StagedWrite> {
        let tmp = self.staging_path(rel)?;
        let mut f = File::create(&tmp).context(format!("failed to create staging file ({:?})", tmp.display()))?;
        f.write_all(bytes)?;
        f.sync_all()?;
        debug!("staged {} bytes for {}", bytes.len(), rel);
        Ok(StagedWrite {
            target: rel.to_string(),
            tmp,
        })
    }

    /// Stage a copy of an external file for `rel`.
    pub fn stage_file_copy(&self, src: &Path, rel: &str) -> Result<StagedWrite> {
        let tmp = self.staging_path(rel)?;
        let mut reader = File::open(src).context(format!("failed to open path ({:?})", src.display()))?;
        let mut f = File::create(&tmp).context(format!("failed to create staging file ({:?})", tmp.display()))?;
        std::io::copy(&mut reader, &mut f).context(format!("failed to copy ({:?}) into staging", src.display()))?;
        f.sync_all()?;
        Ok(StagedWrite {
            target: rel.to_string(),
            tmp,
        })
    }

    /// Delete staged files without publishing them.
    pub fn abort(&self, writes: &[StagedWrite]) {
        for w in writes {
            if let Err(err) = fs::remove_file(&w.tmp) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove staged file {:?}: {err}", w.tmp);
                }
            }
        }
    }

    /// Publish a staged set atomically: every rename in `writes` and every
    /// removal in `removals` becomes visible together or not at all.
    pub fn commit(&self, writes: &[StagedWrite], removals: &[String]) -> Result<()> {
        for r in removals {
            Self::check_rel(r)?;
        }

        // Journal first; once it is in place the commit must complete, and
        // recovery will roll it forward after a crash.
        let mut journal_text = String::new();
        for w in writes {
            journal_text.push_str(&format!("R\t{}\n", w.target));
        }
        for r in removals {
            journal_text.push_str(&format!("D\t{r}\n"));
        }

        let journal = self.root.join(JOURNAL_FILE);
        let journal_tmp = self.root.join(format!("{JOURNAL_FILE}{STAGING_SUFFIX}"));
        {
            let mut f = File::create(&journal_tmp).context("failed to create commit journal")?;
            f.write_all(journal_text.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&journal_tmp, &journal).context("failed to publish commit journal")?;
        sync_dir(&self.root)?;

        self.perform_journal(writes, removals)?;

        fs::remove_file(&journal).context("failed to retire commit journal")?;
        sync_dir(&self.root)?;

        info!("committed {} writes, {} removals", writes.len(), removals.len());
        Ok(())
    }

    fn perform_journal(&self, writes: &[StagedWrite], removals: &[String]) -> Result<()> {
        let mut dirty_dirs: BTreeSet<PathBuf> = BTreeSet::new();

        for w in writes {
            let target = self.abs(&w.target);
            fs::rename(&w.tmp, &target).context(format!("failed to rename staged file into ({:?})", target.display()))?;
            if let Some(parent) = target.parent() {
                dirty_dirs.insert(parent.to_path_buf());
            }
        }
        for r in removals {
            let target = self.abs(r);
            match fs::remove_file(&target) {
                Ok(()) => {
                    if let Some(parent) = target.parent() {
                        dirty_dirs.insert(parent.to_path_buf());
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                Err(err) => {
                    return Err(err).context(format!("failed to remove ({:?})", target.display()));
                }
            }
        }

        for dir in dirty_dirs {
            sync_dir(&dir)?;
        }
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        let journal = self.root.join(JOURNAL_FILE);
        if journal.exists() {
            info!("found commit journal, rolling the interrupted commit forward");
            self.replay_journal(&journal)?;
        }

        let removed = self.discard_orphans()?;
        if removed > 0 {
            info!("discarded {removed} orphaned staging files");
        }
        Ok(())
    }

    /// Re-run a journal found at startup. Renames whose staged file is
    /// gone already happened before the crash.
    fn replay_journal(&self, journal: &Path) -> Result<()> {
        let text = fs::read_to_string(journal).context("failed to read commit journal")?;

        let mut writes = Vec::new();
        let mut removals = Vec::new();
        for line in text.lines() {
            match line.split_once('\t') {
                Some(("R", rel)) => {
                    Self::check_rel(rel)?;
                    let tmp = self.staging_path_for(rel);
                    if tmp.exists() {
                        writes.push(StagedWrite {
                            target: rel.to_string(),
                            tmp,
                        });
                    }
                }
                Some(("D", rel)) => {
                    Self::check_rel(rel)?;
                    removals.push(rel.to_string());
                }
                _ => bail!("corrupt commit journal line {line:?}"),
            }
        }

        self.perform_journal(&writes, &removals)?;

        fs::remove_file(journal).context("failed to retire commit journal")?;
        sync_dir(&self.root)?;
        Ok(())
    }

    /// Remove staging leftovers from transactions that never reached their
    /// commit point.
    pub fn discard_orphans(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let is_orphan = entry.file_name().to_str().is_some_and(|name| name.ends_with(STAGING_SUFFIX));
            if is_orphan {
                debug!("removing orphaned staging file {:?}", entry.path());
                fs::remove_file(entry.path()).context(format!("failed to remove orphan ({:?})", entry.path().display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl Drop for RepoStore {
    fn drop(&mut self) {
        // The OS also releases the lock if the process dies.
        let _ = self.lock.unlock();
    }
}

fn sync_dir(path: &Path) -> Result<()> {
    File::open(path).and_then(|d| d.sync_all()).context(format!("failed to fsync directory ({:?})", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> RepoStore {
        RepoStore::open(dir.path()).unwrap()
    }

    #[test]
    fn commit_makes_staged_files_visible() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let id = AppId::new("com.x.y").unwrap();
        let w1 = store.stage(&package_path(&id, VersionCode::from_raw(1)), b"pkg-bytes").unwrap();
        let w2 = store.stage(INDEX_FILE, b"index-bytes").unwrap();
        assert!(!store.exists(INDEX_FILE));

        store.commit(&[w1, w2], &[]).unwrap();
        assert_eq!(store.read(INDEX_FILE).unwrap(), b"index-bytes");
        assert_eq!(store.read(&package_path(&id, VersionCode::from_raw(1))).unwrap(), b"pkg-bytes");
        assert!(!dir.path().join(".commit").exists());
    }

    #[test]
    fn commit_removals_delete_published_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = AppId::new("com.x.y").unwrap();
        let delta = delta_path(&id, VersionCode::from_raw(1), VersionCode::from_raw(2));

        let w = store.stage(&delta, b"old patch").unwrap();
        store.commit(&[w], &[]).unwrap();
        assert!(store.exists(&delta));

        store.commit(&[], &[delta.clone()]).unwrap();
        assert!(!store.exists(&delta));
        // removing an already absent path is not an error
        store.commit(&[], &[delta]).unwrap();
    }

    #[test]
    fn abort_discards_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let w = store.stage(INDEX_FILE, b"never published").unwrap();
        let tmp = w.staged_path().to_path_buf();
        assert!(tmp.exists());
        store.abort(&[w]);
        assert!(!tmp.exists());
        assert!(!store.exists(INDEX_FILE));
    }

    #[test]
    fn reopen_discards_orphans_from_a_crashed_transaction() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir);
            // stage and "crash": never commit, never abort
            store.stage(INDEX_FILE, b"halfway").unwrap();
            let id = AppId::new("com.x.y").unwrap();
            store.stage(&package_path(&id, VersionCode::from_raw(3)), b"halfway too").unwrap();
        }

        let store = open(&dir);
        assert!(!store.exists(INDEX_FILE));
        let orphans: Vec<_> = WalkDir::new(dir.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_str().is_some_and(|n| n.ends_with(".tmp")))
            .collect();
        assert!(orphans.is_empty(), "leftovers: {orphans:?}");
        // the same ingest can now be retried
        let w = store.stage(INDEX_FILE, b"retried").unwrap();
        store.commit(&[w], &[]).unwrap();
        assert_eq!(store.read(INDEX_FILE).unwrap(), b"retried");
    }

    #[test]
    fn reopen_rolls_a_journal_forward() {
        let dir = tempfile::tempdir().unwrap();
        let doomed = "apps/com.x.y/deltas/1-to-2.patch";
        {
            let store = open(&dir);
            let w = store.stage(doomed, b"stale delta").unwrap();
            store.commit(&[w], &[]).unwrap();

            // Simulate a crash after the commit point: staged files and the
            // journal are in place, but no rename or removal has happened.
            store.stage(INDEX_FILE, b"new index").unwrap();
            std::fs::write(dir.path().join(".commit"), format!("R\t{INDEX_FILE}\nD\t{doomed}\n")).unwrap();
        }

        let store = open(&dir);
        assert_eq!(store.read(INDEX_FILE).unwrap(), b"new index");
        assert!(!store.exists(doomed));
        assert!(!dir.path().join(".commit").exists());
    }

    #[test]
    fn journal_replay_is_idempotent_for_finished_renames() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir);
            let w = store.stage(INDEX_FILE, b"published").unwrap();
            store.commit(&[w], &[]).unwrap();
            // crash after the rename but before the journal was retired
            std::fs::write(dir.path().join(".commit"), format!("R\t{INDEX_FILE}\n")).unwrap();
        }

        let store = open(&dir);
        assert_eq!(store.read(INDEX_FILE).unwrap(), b"published");
    }

    #[test]
    fn second_open_fails_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let _store = open(&dir);
        assert!(RepoStore::open(dir.path()).is_err());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _store = open(&dir);
        }
        let _store = open(&dir);
    }

    #[test]
    fn rejects_path_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.stage("../outside", b"x").is_err());
        assert!(store.stage("/etc/passwd", b"x").is_err());
        assert!(store.stage("apps//gap", b"x").is_err());
    }

    #[test]
    fn staging_path_then_adopt() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let rel = "apps/com.x.y/deltas/1-to-2.patch";

        let tmp = store.staging_path(rel).unwrap();
        std::fs::write(&tmp, b"patch produced externally").unwrap();
        let w = store.adopt_staged(rel).unwrap();
        store.commit(&[w], &[]).unwrap();
        assert_eq!(store.read(rel).unwrap(), b"patch produced externally");
    }
}
