pub mod cached;
pub mod kms;

use std::io::Read;

use crate::{
    error::Result,
    keys::{Dek, WrappedKey},
};

/// A key-wrapping scheme: owns its header format and knows how to turn
/// a wrapped key back into a plaintext DEK.
pub trait KeyWrapper: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Read this scheme's header from the front of `reader`, consuming
    /// exactly the header bytes and nothing after them.
    fn read_wrapped_key(&self, reader: &mut dyn Read) -> Result<WrappedKey>;

    /// Unwrap a key through the KMS.
    fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<Dek>;

    /// Header bytes to place in front of a ciphertext stream.
    fn serialize_wrapped_key(&self, wrapped: &WrappedKey) -> Vec<u8>;
}

impl<T: KeyWrapper + ?Sized> KeyWrapper for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read_wrapped_key(&self, reader: &mut dyn Read) -> Result<WrappedKey> {
        (**self).read_wrapped_key(reader)
    }

    fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<Dek> {
        (**self).unwrap_key(wrapped)
    }

    fn serialize_wrapped_key(&self, wrapped: &WrappedKey) -> Vec<u8> {
        (**self).serialize_wrapped_key(wrapped)
    }
}
