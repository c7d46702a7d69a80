use std::path::PathBuf;

use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};
use parking_lot::Mutex;
use zeroize::Zeroizing;

use super::KmsClient;

const NONCE_LEN: usize = 12;

/// Local stand-in for a cloud KMS. Wraps keys under a 32-byte master
/// key with AES-256-GCM; the ciphertext is `nonce || sealed key`.
///
/// Meant for development and tests where no real KMS is reachable.
pub struct LocalKms {
    /// Master key bytes, loaded once then reused.
    cached: Mutex<Option<Zeroizing<Vec<u8>>>>,
    source: MasterKeySource,
}

enum MasterKeySource {
    File(PathBuf),
    Bytes,
}

impl LocalKms {
    pub fn from_keyfile(path: PathBuf) -> Self {
        Self {
            cached: Mutex::new(None),
            source: MasterKeySource::File(path),
        }
    }

    pub fn from_bytes(master_key: [u8; 32]) -> Self {
        Self {
            cached: Mutex::new(Some(Zeroizing::new(master_key.to_vec()))),
            source: MasterKeySource::Bytes,
        }
    }

    fn cipher(&self) -> anyhow::Result<Aes256Gcm> {
        let mut guard = self.cached.lock();
        if guard.is_none() {
            let MasterKeySource::File(path) = &self.source else {
                anyhow::bail!("master key missing");
            };
            let bytes = Zeroizing::new(std::fs::read(path)?);
            anyhow::ensure!(
                bytes.len() == 32,
                "master keyfile must be exactly 32 bytes, got {}",
                bytes.len()
            );
            *guard = Some(bytes);
        }
        match guard.as_ref() {
            Some(key) => Ok(Aes256Gcm::new_from_slice(key)?),
            None => anyhow::bail!("master key missing"),
        }
    }
}

impl KmsClient for LocalKms {
    fn decrypt(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        anyhow::ensure!(
            ciphertext.len() > NONCE_LEN,
            "wrapped key too short: {} bytes",
            ciphertext.len()
        );
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| anyhow::anyhow!("unwrap decrypt failed: {e}"))
    }

    fn encrypt(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce).map_err(|e| anyhow::anyhow!("getrandom failed: {e}"))?;
        let sealed = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| anyhow::anyhow!("wrap encrypt failed: {e}"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}
