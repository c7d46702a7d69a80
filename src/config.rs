//! Environment-driven setup.
//!
//! | variable                    | meaning                                  |
//! |-----------------------------|------------------------------------------|
//! | `ENVELOPE_KEY`              | base64 wrapped key                       |
//! | `ENVELOPE_KEY_PATH`         | file holding the base64 wrapped key      |
//! | `ENVELOPE_KMS_KEY_ID`       | KMS key id used to unwrap                |
//! | `ENVELOPE_KMS_ENDPOINT`     | KMS REST endpoint override               |
//! | `ENVELOPE_KMS_IAM_TOKEN`    | bearer token sent to the KMS             |
//! | `ENVELOPE_CACHE_EXPIRATION` | unwrap cache TTL in seconds, 0 = forever |

use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::Deserialize;

use crate::{
    cipher::StreamCipher,
    crypter::{EnvelopeCrypter, KeySource},
    error::{EnvelopeError, Result},
    kms::cloud::CloudKms,
    wrapper::{cached::CachedKeyWrapper, kms::KmsKeyWrapper},
};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    pub key: Option<String>,
    pub key_path: Option<PathBuf>,
    pub kms_key_id: Option<String>,
    pub kms_endpoint: Option<String>,
    pub iam_token: Option<String>,
    /// Seconds.
    pub cache_expiration: u64,
}

impl EnvelopeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let cache_expiration = match get("ENVELOPE_CACHE_EXPIRATION") {
            Some(raw) => raw.trim().parse().map_err(|e| {
                EnvelopeError::Config(format!("ENVELOPE_CACHE_EXPIRATION {raw:?}: {e}"))
            })?,
            None => 0,
        };
        Ok(Self {
            key: get("ENVELOPE_KEY"),
            key_path: get("ENVELOPE_KEY_PATH").map(PathBuf::from),
            kms_key_id: get("ENVELOPE_KMS_KEY_ID"),
            kms_endpoint: get("ENVELOPE_KMS_ENDPOINT"),
            iam_token: get("ENVELOPE_KMS_IAM_TOKEN"),
            cache_expiration,
        })
    }

    /// Exactly one of `key` / `key_path` must be set.
    pub fn key_source(&self) -> Result<KeySource> {
        match (&self.key, &self.key_path) {
            (Some(key), None) => Ok(KeySource::Inline(key.clone())),
            (None, Some(path)) => Ok(KeySource::Path(path.clone())),
            (Some(_), Some(_)) => Err(EnvelopeError::Config(
                "ENVELOPE_KEY and ENVELOPE_KEY_PATH are mutually exclusive".into(),
            )),
            (None, None) => Err(EnvelopeError::Config(
                "one of ENVELOPE_KEY or ENVELOPE_KEY_PATH is required".into(),
            )),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_expiration)
    }

    /// Cloud KMS wrapper behind the unwrap cache, with the default
    /// payload cipher.
    pub fn build(&self) -> Result<EnvelopeCrypter> {
        let source = self.key_source()?;
        let key_id = self
            .kms_key_id
            .clone()
            .ok_or_else(|| EnvelopeError::Config("ENVELOPE_KMS_KEY_ID is required".into()))?;
        let kms = CloudKms::new(key_id, self.kms_endpoint.clone(), self.iam_token.clone());
        let wrapper = CachedKeyWrapper::new(KmsKeyWrapper::new(kms), self.cache_ttl());
        Ok(EnvelopeCrypter::new(
            source,
            Arc::new(wrapper),
            Arc::new(StreamCipher),
        ))
    }
}

/// Build a crypter from `ENVELOPE_*` variables, installing the default
/// logger if none is set.
pub fn crypter_from_env() -> Result<EnvelopeCrypter> {
    let _ = env_logger::try_init();
    let crypter = EnvelopeConfig::from_env()?.build()?;
    log::info!("envelope crypter {} configured", crypter.name());
    Ok(crypter)
}
