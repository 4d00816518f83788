use std::fmt;
use std::str;

#[rustfmt::skip]
use ct_codecs::{
    Error as CodecError,

    Hex,

    Encoder,
    Decoder
};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// SHA-256 digest of a file, a metadata payload, or a signer certificate.
///
/// The canonical text rendering is lowercase hex, which is also what
/// `Display` and `FromStr` speak.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct Sha256Digest([u8; Self::LEN]);

impl Sha256Digest {
    pub const LEN: usize = 32;

    pub fn from_bytes(digest: [u8; Self::LEN]) -> Self {
        Self(digest)
    }

    pub fn from_slice(digest: &[u8]) -> Result<Self, Error> {
        let arr: [u8; Self::LEN] = digest.try_into().map_err(|_| Error::InvalidDigestLength {
            expected: Self::LEN,
            actual: digest.len(),
        })?;
        Ok(Self(arr))
    }

    /// One-shot digest of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    pub fn from_hex(hash_hex: &str) -> Result<Self, CodecError> {
        let mut digest = [0u8; Self::LEN];
        let decoded = Hex::decode(&mut digest, hash_hex, None)?;
        if decoded.len() != Self::LEN {
            return Err(CodecError::InvalidInput);
        }
        Ok(Self(digest))
    }

    pub fn to_hex(&self) -> String {
        // 32-byte input cannot overflow the encoder.
        Hex::encode_to_string(self.0.as_ref()).unwrap_or_default()
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[rustfmt::skip]
        let hash_hex = Hex::encode_to_string(self.0.as_ref())
            .map_err(|_| fmt::Error)?;

        f.debug_tuple("Sha256Digest").field(&hash_hex).finish()
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[rustfmt::skip]
        let hash_hex = Hex::encode_to_string(self.0.as_ref())
            .map_err(|_| fmt::Error)?;

        f.write_str(&hash_hex)
    }
}

impl str::FromStr for Sha256Digest {
    type Err = CodecError;

    fn from_str(hash_hex: &str) -> Result<Self, Self::Err> {
        Self::from_hex(hash_hex)
    }
}
