/// Marker smuggled through `std::io::Error` when the patch sink hits its
/// size cap, so `From<io::Error>` can surface `PatchTooLarge` instead of a
/// generic i/o failure.
#[derive(Debug)]
pub(super) struct CapExceeded {
    pub limit: u64,
}

impl std::fmt::Display for CapExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "patch size cap of {} bytes exceeded", self.limit)
    }
}

impl std::error::Error for CapExceeded {}

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    BadMagic,
    UnsupportedFormatVersion(u64),
    PatchTooLarge {
        limit: u64,
    },
    Cancelled,
    OldSizeMismatch {
        expected: u64,
        actual: u64,
    },
    OldDigestMismatch,
    NewSizeMismatch {
        expected: u64,
        actual: u64,
    },
    NewDigestMismatch,
    BadOpTag(u8),
    CopyOutOfRange {
        offset: u64,
        len: u64,
        old_size: u64,
    },
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "i/o error: {err}"),
            Error::BadMagic => write!(f, "bad patch file magic"),
            Error::UnsupportedFormatVersion(v) => write!(f, "unsupported patch format version {v}"),
            Error::PatchTooLarge {
                limit,
            } => write!(f, "patch would exceed the size cap of {limit} bytes"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::OldSizeMismatch {
                expected,
                actual,
            } => {
                write!(f, "old file size {actual} does not match patch header {expected}")
            }
            Error::OldDigestMismatch => write!(f, "old file digest does not match patch header"),
            Error::NewSizeMismatch {
                expected,
                actual,
            } => {
                write!(f, "patched output size {actual} does not match patch header {expected}")
            }
            Error::NewDigestMismatch => write!(f, "patched output digest does not match patch header"),
            Error::BadOpTag(tag) => write!(f, "unknown patch op tag {tag}"),
            Error::CopyOutOfRange {
                offset,
                len,
                old_size,
            } => {
                write!(f, "copy op ({offset}+{len}) reaches past the old file ({old_size} bytes)")
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if let Some(cap) = err.get_ref().and_then(|inner| inner.downcast_ref::<CapExceeded>()) {
            return Error::PatchTooLarge {
                limit: cap.limit,
            };
        }
        Error::Io(err)
    }
}
