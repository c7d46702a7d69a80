use std::{
    collections::HashMap,
    io::Read,
    time::{Duration, Instant},
};

use parking_lot::RwLock;

use super::KeyWrapper;
use crate::{
    error::Result,
    keys::{Dek, KeyDigest, WrappedKey},
};

struct CacheEntry {
    dek: Dek,
    /// `None` never expires.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Memoizes `unwrap_key` results of another wrapper, keyed by a digest
/// of the wrapped key.
///
/// The lock is never held across a call into the inner wrapper, so a
/// slow or unreachable KMS does not block lookups of other keys.
/// Concurrent misses on the same key may each reach the KMS; the last
/// one to finish wins.
///
/// When the KMS fails and a stale entry exists, the stale key is served
/// instead of the error. This applies to every failure kind, including
/// a revoked key, until a refresh succeeds.
pub struct CachedKeyWrapper<W> {
    wrapped: W,
    entries: RwLock<HashMap<KeyDigest, CacheEntry>>,
    expiration: Duration,
}

impl<W: KeyWrapper> CachedKeyWrapper<W> {
    /// A zero `expiration` caches keys forever.
    pub fn new(wrapped: W, expiration: Duration) -> Self {
        Self {
            wrapped,
            entries: RwLock::new(HashMap::new()),
            expiration,
        }
    }

    pub fn inner(&self) -> &W {
        &self.wrapped
    }

    /// Number of distinct wrapped keys held.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn expires_at(&self, now: Instant) -> Option<Instant> {
        if self.expiration.is_zero() {
            None
        } else {
            now.checked_add(self.expiration)
        }
    }
}

impl<W: KeyWrapper> KeyWrapper for CachedKeyWrapper<W> {
    fn name(&self) -> &str {
        self.wrapped.name()
    }

    fn read_wrapped_key(&self, reader: &mut dyn Read) -> Result<WrappedKey> {
        log::debug!("extracting wrapped key");
        self.wrapped.read_wrapped_key(reader)
    }

    fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<Dek> {
        let digest = wrapped.digest();
        log::debug!("unwrapping key {digest}");

        // Fast path.
        let cached = {
            let entries = self.entries.read();
            entries
                .get(&digest)
                .map(|entry| (entry.dek.clone(), entry.is_fresh(Instant::now())))
        };
        if let Some((dek, true)) = cached.as_ref() {
            log::debug!("using cached key {digest}");
            return Ok(dek.clone());
        }

        match self.wrapped.unwrap_key(wrapped) {
            Ok(dek) => {
                let entry = CacheEntry {
                    dek: dek.clone(),
                    expires_at: self.expires_at(Instant::now()),
                };
                self.entries.write().insert(digest, entry);
                Ok(dek)
            }
            Err(err) => match cached {
                Some((stale, _)) => {
                    log::warn!("unable to unwrap key {digest}, using stale cached key: {err}");
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }

    fn serialize_wrapped_key(&self, wrapped: &WrappedKey) -> Vec<u8> {
        self.wrapped.serialize_wrapped_key(wrapped)
    }
}
