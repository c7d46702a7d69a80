use std::io::Read;

use super::KeyWrapper;
use crate::{
    error::{EnvelopeError, Result},
    header::Scheme,
    keys::{Dek, WrappedKey},
    kms::KmsClient,
};

/// Header scheme for keys wrapped by Yandex Cloud KMS.
pub const YC_KMS_SCHEME: Scheme = Scheme::new(b"envelope-yc-kms", 1);

/// Key wrapper backed by a KMS client.
pub struct KmsKeyWrapper<C> {
    client: C,
    scheme: Scheme,
}

impl<C: KmsClient> KmsKeyWrapper<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            scheme: YC_KMS_SCHEME,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Wrap a freshly generated DEK so it can be configured on a crypter.
    pub fn wrap_key(&self, dek: &Dek) -> Result<WrappedKey> {
        self.client
            .encrypt(dek.as_bytes())
            .map(WrappedKey::new)
            .map_err(EnvelopeError::Kms)
    }
}

impl<C: KmsClient> KeyWrapper for KmsKeyWrapper<C> {
    fn name(&self) -> &str {
        "yckms"
    }

    fn read_wrapped_key(&self, reader: &mut dyn Read) -> Result<WrappedKey> {
        self.scheme.read(reader)
    }

    fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<Dek> {
        // No associated-data context is bound to the ciphertext.
        self.client
            .decrypt(wrapped.as_bytes())
            .map(Dek::from_bytes)
            .map_err(EnvelopeError::Kms)
    }

    fn serialize_wrapped_key(&self, wrapped: &WrappedKey) -> Vec<u8> {
        self.scheme.serialize(wrapped)
    }
}
