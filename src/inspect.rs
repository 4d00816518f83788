//! Candidate package inspection: identity, version, signer set and content
//! digest, without touching the archive payload.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::debug;

use pkg_format_apkr::package;
use repometa::{metadata::validate_label, AppId, Sha256Digest, SignerSet, VersionCode};

use crate::hash_on_disk;
use crate::reject::Reject;

/// Everything the repository needs to know about one candidate package.
#[derive(Debug, Clone)]
pub struct Package {
    pub id: AppId,
    pub version: VersionCode,
    pub min_platform: u32,
    pub label: Option<String>,
    pub signers: SignerSet,
    pub digest: Sha256Digest,
    pub size: u64,
}

/// Inspect the package at `path`.
///
/// The outer error is a tool failure (unreadable file and the like); the
/// inner error is a verdict on the candidate itself.
pub fn inspect(path: &Path) -> Result<std::result::Result<Package, Reject>> {
    let envelope = match package::read_envelope(path) {
        Ok(envelope) => envelope,
        Err(err) => return classify(err, path).map(Err),
    };

    let manifest = envelope.manifest;
    let id = match AppId::new(&manifest.identity) {
        Ok(id) => id,
        Err(err) => return Ok(Err(Reject::Malformed(err.to_string()))),
    };
    if let Some(label) = &manifest.label {
        if validate_label(label).is_err() {
            return Ok(Err(Reject::Malformed(format!("invalid label {label:?}"))));
        }
    }

    let signers = SignerSet::new(envelope.signers.iter().map(|s| Sha256Digest::from_bytes(s.fingerprint)).collect());

    let size = fs::metadata(path).context(format!("failed to get metadata, path ({:?})", path.display()))?.len();
    let digest = hash_on_disk(path, None).context(format!("failed to hash_on_disk, path ({:?})", path.display()))?;

    debug!("inspected {}: {} version {} ({} signers, {} bytes)", path.display(), id, VersionCode::from_raw(manifest.version_code), signers.fingerprints().len(), size);

    Ok(Ok(Package {
        id,
        version: VersionCode::from_raw(manifest.version_code),
        min_platform: manifest.min_platform,
        label: manifest.label,
        signers,
        digest,
        size,
    }))
}

/// Sort a format error into the candidate taxonomy. Anything that is not a
/// defect of the candidate itself surfaces as a tool failure.
fn classify(err: package::Error, path: &Path) -> Result<Reject> {
    use package::Error::*;
    match err {
        Unsigned => Ok(Reject::Unsigned),
        UnsupportedSignerAlgorithm(id) => Ok(Reject::UnsupportedIdentityScheme(id)),
        Io(io_err) if io_err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Ok(Reject::Malformed("truncated file".to_string()))
        }
        Io(io_err) => Err(io_err).context(format!("failed to read package ({:?})", path.display())),
        other => Ok(Reject::Malformed(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_format_apkr::package::{write_envelope, SignerAlgorithm, SignerEntry};
    use std::fs::File;

    fn signer(byte: u8) -> SignerEntry {
        SignerEntry {
            algorithm: SignerAlgorithm::Rsa,
            fingerprint: [byte; 32],
        }
    }

    fn write_pkg(dir: &tempfile::TempDir, name: &str, manifest: &str, signers: &[SignerEntry]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        write_envelope(&mut f, manifest, signers, b"archive payload").unwrap();
        path
    }

    #[test]
    fn extracts_package_facts() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pkg(
            &dir,
            "a.pkg",
            "identity\tcom.x.y\nversioncode\t7\nminplatform\t23\nlabel\tHello\n",
            &[signer(1), signer(2)],
        );

        let pkg = inspect(&path).unwrap().unwrap();
        assert_eq!(pkg.id.as_str(), "com.x.y");
        assert_eq!(pkg.version, VersionCode::from_halves(0, 7));
        assert_eq!(pkg.min_platform, 23);
        assert_eq!(pkg.label.as_deref(), Some("Hello"));
        assert_eq!(pkg.signers.fingerprints().len(), 2);
        assert_eq!(pkg.size, fs::metadata(&path).unwrap().len());
        assert_eq!(pkg.digest, hash_on_disk(&path, None).unwrap());
    }

    #[test]
    fn rejects_unsigned_and_unknown_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let unsigned = write_pkg(&dir, "u.pkg", "identity\tcom.x.y\nversioncode\t1\nminplatform\t1\n", &[]);
        assert!(matches!(inspect(&unsigned).unwrap(), Err(Reject::Unsigned)));
    }

    #[test]
    fn rejects_bad_identity_as_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pkg(&dir, "b.pkg", "identity\tNotAnId\nversioncode\t1\nminplatform\t1\n", &[signer(1)]);
        assert!(matches!(inspect(&path).unwrap(), Err(Reject::Malformed(_))));
    }

    #[test]
    fn truncated_file_is_malformed_not_a_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.pkg");
        std::fs::write(&path, b"ApkR\x00").unwrap();
        assert!(matches!(inspect(&path).unwrap(), Err(Reject::Malformed(_))));
    }

    #[test]
    fn missing_file_is_a_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(inspect(&dir.path().join("absent.pkg")).is_err());
    }
}
