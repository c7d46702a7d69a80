use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

use super::KmsClient;

pub const DEFAULT_ENDPOINT: &str = "https://kms.yandex/kms/v1/keys";

/// Yandex Cloud KMS symmetric-crypto client speaking the REST API.
///
/// The IAM token is supplied by the caller; obtaining and refreshing it
/// happens elsewhere.
pub struct CloudKms {
    key_id: String,
    endpoint: Option<String>,
    iam_token: Option<String>,
}

#[derive(Serialize)]
struct DecryptRequest<'a> {
    ciphertext: &'a str,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: String, // base64
}

#[derive(Serialize)]
struct EncryptRequest<'a> {
    plaintext: &'a str,
}

#[derive(Deserialize)]
struct EncryptResponse {
    ciphertext: String, // base64
}

impl CloudKms {
    pub fn new(key_id: String, endpoint: Option<String>, iam_token: Option<String>) -> Self {
        Self {
            key_id,
            endpoint,
            iam_token,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn base_url(&self) -> &str {
        self.endpoint
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT)
            .trim_end_matches('/')
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/{}:{action}", self.base_url(), self.key_id)
    }

    fn post(&self, action: &str) -> ureq::Request {
        let req = ureq::post(&self.action_url(action)).set("Content-Type", "application/json");
        match &self.iam_token {
            Some(token) => req.set("Authorization", &format!("Bearer {token}")),
            None => req,
        }
    }
}

impl KmsClient for CloudKms {
    fn decrypt(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let encoded = STANDARD.encode(ciphertext);
        let body = DecryptRequest {
            ciphertext: &encoded,
        };

        let resp: DecryptResponse = self
            .post("decrypt")
            .send_json(serde_json::to_value(&body)?)?
            .into_json()?;

        Ok(STANDARD.decode(resp.plaintext)?)
    }

    fn encrypt(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let encoded = STANDARD.encode(plaintext);
        let body = EncryptRequest {
            plaintext: &encoded,
        };

        let resp: EncryptResponse = self
            .post("encrypt")
            .send_json(serde_json::to_value(&body)?)?
            .into_json()?;

        Ok(STANDARD.decode(resp.ciphertext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_urls() {
        let kms = CloudKms::new("abj123".into(), None, None);
        assert_eq!(
            kms.action_url("decrypt"),
            "https://kms.yandex/kms/v1/keys/abj123:decrypt"
        );

        let kms = CloudKms::new("k".into(), Some("http://localhost:8080/keys/".into()), None);
        assert_eq!(kms.action_url("encrypt"), "http://localhost:8080/keys/k:encrypt");
    }

    #[test]
    fn request_shape() {
        let body = DecryptRequest { ciphertext: "AQID" };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"ciphertext":"AQID"}"#
        );
        let resp: DecryptResponse =
            serde_json::from_str(r#"{"keyId":"k","plaintext":"AQID"}"#).unwrap();
        assert_eq!(STANDARD.decode(resp.plaintext).unwrap(), vec![1, 2, 3]);
    }
}
