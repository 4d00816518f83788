//! Reasons a candidate package is refused before anything is published.
//! A single rejected candidate aborts the whole ingest batch; the report
//! names every rejected candidate with its reason.

use repometa::{AppId, SignerSet, VersionCode};

#[derive(Debug)]
pub enum Reject {
    Malformed(String),
    Unsigned,
    UnsupportedIdentityScheme(u32),
    DowngradeOrDuplicate {
        candidate: VersionCode,
        head: VersionCode,
    },
    IdentityMismatch {
        expected: AppId,
        actual: AppId,
    },
    SignerMismatch {
        head: SignerSet,
        candidate: SignerSet,
    },
    PlatformRegression {
        head: u32,
        candidate: u32,
    },
}

impl std::error::Error for Reject {}

impl std::fmt::Display for Reject {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Reject::Malformed(reason) => write!(f, "malformed package: {reason}"),
            Reject::Unsigned => write!(f, "package is unsigned"),
            Reject::UnsupportedIdentityScheme(id) => {
                write!(f, "package signer uses unsupported algorithm id {id}")
            }
            Reject::DowngradeOrDuplicate {
                candidate,
                head,
            } => {
                write!(f, "version code {candidate} does not exceed the current head {head}")
            }
            Reject::IdentityMismatch {
                expected,
                actual,
            } => {
                write!(f, "package identity {actual} does not match application {expected}")
            }
            Reject::SignerMismatch {
                head,
                candidate,
            } => {
                write!(f, "signer set [{candidate}] is not compatible with the head's [{head}] and no rotation authorises the change")
            }
            Reject::PlatformRegression {
                head,
                candidate,
            } => {
                write!(f, "minimum platform {candidate} regresses below the head's {head}")
            }
        }
    }
}
