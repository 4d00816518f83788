#[derive(Debug)]
pub enum Error {
    ReadKey(std::io::Error),
    UnrecognisedPem,
    DeserialisePkcs1(rsa::pkcs1::Error),
    DeserialisePkcs8(rsa::pkcs8::Error),
    DeserialiseEcPkcs8(p256::pkcs8::Error),
    DeserialiseSec1(p256::elliptic_curve::Error),
    SignRsa(rsa::signature::Error),
    SignEc(p256::ecdsa::Error),
    InvalidRsaSignature(rsa::signature::Error),
    InvalidEcSignature(p256::ecdsa::Error),
    CouldNotVerifySignature,
    MissingSignatureLine,
    SignatureLineNotUtf8(std::str::Utf8Error),
    DecodeSignatureLine(ct_codecs::Error),
    EncodeSignatureLine(ct_codecs::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::ReadKey(err) => write!(f, "failed to read key file: {err}"),
            Error::UnrecognisedPem => write!(f, "key file is not a recognised private key PEM"),
            Error::DeserialisePkcs1(err) => write!(f, "failed to deserialise PKCS1 PEM: {err}"),
            Error::DeserialisePkcs8(err) => write!(f, "failed to deserialise PKCS8 PEM: {err}"),
            Error::DeserialiseEcPkcs8(err) => write!(f, "failed to deserialise EC PKCS8 PEM: {err}"),
            Error::DeserialiseSec1(err) => write!(f, "failed to deserialise SEC1 PEM: {err}"),
            Error::SignRsa(err) => write!(f, "RSA signing failed: {err}"),
            Error::SignEc(err) => write!(f, "ECDSA signing failed: {err}"),
            Error::InvalidRsaSignature(err) => write!(f, "invalid RSA signature encoding: {err}"),
            Error::InvalidEcSignature(err) => write!(f, "invalid ECDSA signature encoding: {err}"),
            Error::CouldNotVerifySignature => write!(f, "signature verification failed"),
            Error::MissingSignatureLine => write!(f, "signed file has no signature line"),
            Error::SignatureLineNotUtf8(err) => write!(f, "signature line is not valid UTF-8: {err}"),
            Error::DecodeSignatureLine(err) => write!(f, "failed to decode signature line: {err}"),
            Error::EncodeSignatureLine(err) => write!(f, "failed to encode signature line: {err}"),
        }
    }
}
