mod hash_types;
pub use self::hash_types::*;

mod types;
pub use self::types::*;

mod error;
pub use self::error::Error;

pub mod metadata;
pub use metadata::{AppMetadata, DeltaEntry, RotationEntry, SignerSet, VersionEntry};

pub mod index;
pub use index::{IndexEntry, RepoIndex};
