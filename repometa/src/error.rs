use std::fmt::Display;
use std::num::ParseIntError;

#[derive(Debug)]
pub enum Error {
    Decode(ct_codecs::Error),
    InvalidDigestLength {
        expected: usize,
        actual: usize,
    },
    InvalidAppId(String),
    ParseVersionCode(ParseIntError),
    ParseNumber {
        line: usize,
        what: &'static str,
    },
    UnknownSchema(String),
    EmptyPayload,
    BadFieldCount {
        line: usize,
        expected: usize,
        actual: usize,
    },
    UnknownTag {
        line: usize,
        tag: String,
    },
    MisorderedBlock {
        line: usize,
    },
    UnsortedEntry {
        line: usize,
    },
    BadLabel(String),
    EmptySignerSet {
        line: usize,
    },
}

impl Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Decode(err) => write!(fmt, "failed to decode: {}", err),
            Error::InvalidDigestLength {
                expected,
                actual,
            } => {
                write!(fmt, "invalid digest length: expected {}, actual {}", expected, actual)
            }
            Error::InvalidAppId(id) => write!(fmt, "invalid application id: {:?}", id),
            Error::ParseVersionCode(err) => write!(fmt, "failed to parse version code: {}", err),
            Error::ParseNumber {
                line,
                what,
            } => write!(fmt, "line {}: failed to parse {}", line, what),
            Error::UnknownSchema(header) => write!(fmt, "unknown schema header: {:?}", header),
            Error::EmptyPayload => write!(fmt, "payload is empty"),
            Error::BadFieldCount {
                line,
                expected,
                actual,
            } => {
                write!(fmt, "line {}: expected {} fields, found {}", line, expected, actual)
            }
            Error::UnknownTag {
                line,
                tag,
            } => write!(fmt, "line {}: unknown line tag {:?}", line, tag),
            Error::MisorderedBlock {
                line,
            } => write!(fmt, "line {}: block out of canonical order", line),
            Error::UnsortedEntry {
                line,
            } => write!(fmt, "line {}: entry not in canonical sort order", line),
            Error::BadLabel(label) => write!(fmt, "label contains forbidden characters: {:?}", label),
            Error::EmptySignerSet {
                line,
            } => write!(fmt, "line {}: empty signer set", line),
        }
    }
}

impl std::error::Error for Error {}

impl From<ct_codecs::Error> for Error {
    fn from(err: ct_codecs::Error) -> Self {
        Error::Decode(err)
    }
}
