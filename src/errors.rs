use crate::ber::Tag;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Input ran out in the middle of a tag, length or value.
    #[error("TLV data truncated")]
    Truncated,
    /// A value declares more bytes than its enclosing buffer holds.
    #[error("TLV length {declared} overruns the {available} bytes left")]
    LengthOverrun { declared: usize, available: usize },
    /// Only short lengths and the single-byte long form (0x81 xx) are supported.
    #[error("unsupported BER length form {0:#04x} (at most one length byte)")]
    UnsupportedLength(u8),
    /// The encoder shares the parser's limit of 255 value bytes.
    #[error("TLV value of {0} bytes can't be encoded (max 255)")]
    ValueTooLong(usize),
    #[error("{0} trailing bytes after TLV")]
    TrailingData(usize),
    #[error("parser error: {0:?}")]
    Nom(nom::error::ErrorKind),

    /// Kept as kind and message so the error stays `Clone` and comparable.
    #[error("I/O error: {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("invalid CA key line: {0}")]
    KeyStore(String),
    #[error("no CA key for RID {rid:02X?} index {index:#04x}")]
    KeyNotFound { rid: [u8; 5], index: u8 },
    #[error("public key exponent of {0} bytes not supported (max 3)")]
    ExponentTooLong(usize),

    #[error("tag {0:#06x} not found")]
    MissingTag(Tag),
    #[error("tag {tag:#06x} has invalid length {len}")]
    TagLength { tag: Tag, len: usize },
    #[error("certificate length ({cert}) not equal to key length ({key})")]
    CertificateLength { cert: usize, key: usize },
    #[error("bad certificate format (header {header:#04x}, type {msgtype:#04x}, trailer {trailer:#04x})")]
    CertificateFormat { header: u8, msgtype: u8, trailer: u8 },
    #[error("recovered message too short ({0} bytes)")]
    MessageTooShort(usize),
    #[error("unsupported hash algorithm {0:#04x}")]
    UnsupportedHash(u8),
    #[error("unsupported public key algorithm {0:#04x}")]
    UnsupportedPkAlgo(u8),
    #[error("calculated wrong hash")]
    HashMismatch,
    #[error("invalid PAN lengths (card {card} digits, certificate {cert} digits)")]
    PanLength { card: usize, cert: usize },
    #[error("PAN data mismatch")]
    PanMismatch,
    #[error("invalid public key length {0}")]
    ModulusLength(usize),
    #[error("exponent length {cert} in certificate, {tlv} in TLV")]
    ExponentLength { cert: usize, tlv: usize },
    #[error("invalid dynamic data length {0}")]
    DynamicDataLength(u8),
    #[error("invalid ICC dynamic number length {0}")]
    IdnLength(u8),
    #[error("cryptogram information data mismatch")]
    CidMismatch,
    #[error("transaction data hash mismatch")]
    TransactionHashMismatch,
    #[error("ATC in the signature and ATC in the card data differ")]
    AtcMismatch,

    #[error("RSA: {0}")]
    Crypto(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<rsa::Error> for Error {
    fn from(e: rsa::Error) -> Self {
        Self::Crypto(e.to_string())
    }
}
