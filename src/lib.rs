//! Envelope encryption over a KMS.
//!
//! A data-encryption key (DEK) is stored wrapped by the KMS in a small
//! header in front of the payload. Reading a stream parses that header,
//! unwraps the DEK (through a TTL cache that falls back to stale keys
//! when the KMS is down) and decrypts the rest with the payload cipher.

pub mod cipher;
pub mod config;
pub mod crypter;
pub mod error;
pub mod header;
pub mod keys;
pub mod kms;
pub mod wrapper;

pub use config::{EnvelopeConfig, crypter_from_env};
pub use crypter::{EnvelopeCrypter, EnvelopeWriter, KeySource};
pub use error::{EnvelopeError, Result};
pub use keys::{Dek, WrappedKey};
pub use wrapper::{KeyWrapper, cached::CachedKeyWrapper, kms::KmsKeyWrapper};
