pub mod cloud;
pub mod local;

/// Synchronous client for an external key-management service.
///
/// Authentication, retries and deadlines are the client's business;
/// callers only see success or an opaque error.
pub trait KmsClient: Send + Sync + 'static {
    /// Ask the KMS to unwrap a key ciphertext.
    fn decrypt(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Optional: ask the KMS to wrap a plaintext key.
    fn encrypt(&self, _plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("direct wrap not supported by this KMS client")
    }
}
