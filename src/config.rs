/// How many previous versions get a delta to the new head.
pub const DEFAULT_MAX_DELTAS: usize = 4;

/// A patch bigger than this share of the new package is not worth serving.
pub const DEFAULT_PATCH_CAP_PERCENT: u8 = 75;

/// Ingest policy knobs. All of these are configuration, not format:
/// changing them never invalidates an existing repository.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// Delta history depth: deltas are kept from this many versions below
    /// the head.
    pub max_deltas: usize,
    /// Per-pair patch size cap as a percentage of the new package size.
    pub patch_cap_percent: u8,
    /// Worker threads for delta generation; `None` means one per core.
    pub workers: Option<usize>,
    /// Maximum permitted decrease of a candidate's minimum platform
    /// version relative to the head. 0 means never regress.
    pub platform_relaxation: u32,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            max_deltas: DEFAULT_MAX_DELTAS,
            patch_cap_percent: DEFAULT_PATCH_CAP_PERCENT,
            workers: None,
            platform_relaxation: 0,
        }
    }
}

impl RepoConfig {
    /// Byte cap for a patch against a new file of `new_size` bytes.
    pub fn patch_cap_for(&self, new_size: u64) -> u64 {
        new_size.saturating_mul(self.patch_cap_percent as u64) / 100
    }
}
