use std::io;

use thiserror::Error;

/// Everything that can go wrong between reading a header and handing
/// a plaintext key to the payload cipher.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Header magic did not match the wrapping scheme.
    #[error("invalid encrypted key header format: {0}")]
    Format(String),

    #[error("scheme version {found} is not supported (expected {expected})")]
    Version { found: u8, expected: u8 },

    /// Stream ended before the declared number of bytes arrived.
    #[error("truncated input: {0}")]
    Truncated(String),

    #[error("header of {len} bytes exceeds the {max} byte limit")]
    HeaderTooLarge { len: usize, max: usize },

    /// Any failure reported by the KMS. Transient and permanent
    /// failures are not told apart.
    #[error("kms: {0:#}")]
    Kms(anyhow::Error),

    #[error("configuration: {0}")]
    Config(String),

    #[error("payload cipher: {0}")]
    Cipher(String),

    #[error(transparent)]
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;

impl EnvelopeError {
    /// Map a failed header read. Running out of stream is a truncation,
    /// anything else is a plain I/O failure.
    pub(crate) fn from_read(err: io::Error, what: &str) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            EnvelopeError::Truncated(format!("stream ended while reading {what}"))
        } else {
            EnvelopeError::Io(err)
        }
    }
}

impl From<io::Error> for EnvelopeError {
    fn from(err: io::Error) -> Self {
        EnvelopeError::Io(err)
    }
}

impl From<EnvelopeError> for io::Error {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Io(e) => e,
            EnvelopeError::Truncated(_) => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            EnvelopeError::Format(_)
            | EnvelopeError::Version { .. }
            | EnvelopeError::HeaderTooLarge { .. }
            | EnvelopeError::Cipher(_) => io::Error::new(io::ErrorKind::InvalidData, err),
            other => io::Error::other(other),
        }
    }
}
