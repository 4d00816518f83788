use std::fmt;
use std::str;

use crate::error::Error;

/// Longest accepted application identity, in bytes.
pub const APP_ID_MAX_LEN: usize = 255;

/// Reverse-DNS application identity, e.g. `org.example.app`.
///
/// Identities double as path components under `apps/`, so validation is
/// conservative: ASCII only, `[a-z0-9_]` segments joined by single dots,
/// at least two segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppId(String);

impl AppId {
    pub fn new(id: &str) -> Result<Self, Error> {
        if id.len() > APP_ID_MAX_LEN || !Self::is_valid(id) {
            return Err(Error::InvalidAppId(id.to_string()));
        }
        Ok(Self(id.to_string()))
    }

    fn is_valid(id: &str) -> bool {
        let mut segments = 0;
        for segment in id.split('.') {
            if segment.is_empty() {
                return false;
            }
            if !segment.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_') {
                return false;
            }
            segments += 1;
        }
        segments >= 2
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl str::FromStr for AppId {
    type Err = Error;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        Self::new(id)
    }
}

/// 64-bit version identifier, ordered as (major, minor) unsigned
/// lexicographic, which is exactly the unsigned order of the raw value.
///
/// Sources that only carry a 32-bit version code map it into the minor
/// half with a zero major half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VersionCode(u64);

impl VersionCode {
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn from_halves(major: u32, minor: u32) -> Self {
        Self(((major as u64) << 32) | minor as u64)
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn major(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn minor(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for VersionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl str::FromStr for VersionCode {
    type Err = Error;

    fn from_str(x: &str) -> Result<Self, Self::Err> {
        u64::from_str(x).map(Self).map_err(Error::ParseVersionCode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_id_accepts_reverse_dns() {
        assert!(AppId::new("org.example.app").is_ok());
        assert!(AppId::new("com.x.y").is_ok());
        assert!(AppId::new("a_1.b2").is_ok());
    }

    #[test]
    fn app_id_rejects_path_hostile_input() {
        for bad in ["", "single", "Upper.Case", "dot..dot", ".lead", "trail.", "sp ace.x", "a/b.c", "../b.c"] {
            assert!(AppId::new(bad).is_err(), "accepted {bad:?}");
        }
        assert!(AppId::new(&"a.".repeat(200)).is_err());
    }

    #[test]
    fn version_code_halves_round_trip() {
        for (major, minor) in [(0, 0), (0, 1), (1, 0), (7, 42), (u32::MAX, u32::MAX), (0, u32::MAX)] {
            let vc = VersionCode::from_halves(major, minor);
            assert_eq!(vc.major(), major);
            assert_eq!(vc.minor(), minor);
            assert_eq!(VersionCode::from_raw(vc.raw()), vc);
        }
    }

    #[test]
    fn version_code_orders_major_then_minor() {
        assert!(VersionCode::from_halves(0, u32::MAX) < VersionCode::from_halves(1, 0));
        assert!(VersionCode::from_halves(1, 0) < VersionCode::from_halves(1, 1));
    }

    #[test]
    fn version_code_parses_decimal() {
        let vc: VersionCode = "4294967296".parse().unwrap();
        assert_eq!(vc, VersionCode::from_halves(1, 0));
        assert!("".parse::<VersionCode>().is_err());
        assert!("-1".parse::<VersionCode>().is_err());
    }
}
