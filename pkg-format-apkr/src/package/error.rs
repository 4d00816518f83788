#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    BadMagic,
    UnsupportedFormatVersion(u64),
    ManifestTooLarge(u64),
    ManifestNotUtf8(std::str::Utf8Error),
    MalformedManifestLine(String),
    MissingField(&'static str),
    DuplicateField(String),
    BadFieldValue {
        field: &'static str,
        value: String,
    },
    Unsigned,
    UnsupportedSignerAlgorithm(u32),
    BadFingerprintLength(u32),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "i/o error: {err}"),
            Error::BadMagic => write!(f, "bad file magic"),
            Error::UnsupportedFormatVersion(v) => write!(f, "unsupported file format version {v}"),
            Error::ManifestTooLarge(size) => write!(f, "manifest size {size} exceeds limit"),
            Error::ManifestNotUtf8(err) => write!(f, "manifest is not valid UTF-8: {err}"),
            Error::MalformedManifestLine(line) => write!(f, "malformed manifest line: {line:?}"),
            Error::MissingField(field) => write!(f, "manifest is missing required field {field:?}"),
            Error::DuplicateField(field) => write!(f, "manifest repeats field {field:?}"),
            Error::BadFieldValue {
                field,
                value,
            } => write!(f, "manifest field {field:?} has invalid value {value:?}"),
            Error::Unsigned => write!(f, "package carries no signer entries"),
            Error::UnsupportedSignerAlgorithm(id) => write!(f, "unsupported signer algorithm id {id}"),
            Error::BadFingerprintLength(len) => write!(f, "signer fingerprint length {len} is not 32"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}
