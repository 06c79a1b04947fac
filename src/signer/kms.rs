//! Remote key service client
//!
//! The key service holds the secp256k1 key; the settler only ever sees its
//! public key and raw ECDSA signatures (DER-encoded, no recovery id).

use alloy::primitives::{Bytes, B256};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use eyre::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

const MESSAGE_TYPE_DIGEST: &str = "DIGEST";
const SIGNING_ALGORITHM: &str = "ECDSA_SHA_256";

/// Operations the remote key service offers
pub trait KeyService: Send + Sync {
    /// DER-encoded SubjectPublicKeyInfo of the signing key
    fn public_key(&self) -> impl Future<Output = Result<Bytes>> + Send;

    /// DER-encoded ECDSA signature `(r, s)` over a prehashed digest
    fn sign_digest(&self, digest: B256) -> impl Future<Output = Result<Bytes>> + Send;
}

/// HTTP key service client
///
/// Each call is one round-trip; failures are returned to the caller and never
/// retried here.
pub struct HttpKeyService {
    /// Base URL of the key service
    endpoint: String,
    /// Key identifier
    key_id: String,
    /// Optional bearer token
    access_token: Option<String>,
    /// HTTP client
    client: Client,
}

// ========== API Request/Response Types ==========

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SignRequest<'a> {
    key_id: &'a str,
    message: String,
    message_type: &'a str,
    signing_algorithm: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SignResponse {
    signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PublicKeyResponse {
    public_key: String,
}

impl HttpKeyService {
    /// Create a client for `key_id` at `endpoint`
    pub fn new(
        endpoint: impl Into<String>,
        key_id: impl Into<String>,
        access_token: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            key_id: key_id.into(),
            access_token,
            client,
        })
    }

    fn key_url(&self, action: &str) -> String {
        format!("{}/keys/{}/{}", self.endpoint, self.key_id, action)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl KeyService for HttpKeyService {
    async fn public_key(&self) -> Result<Bytes> {
        let resp = self
            .authorize(self.client.get(self.key_url("public-key")))
            .send()
            .await
            .context("Failed to fetch public key")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            eyre::bail!("Failed to fetch public key: {} - {}", status, body);
        }

        let result: PublicKeyResponse = resp
            .json()
            .await
            .context("Failed to parse public key response")?;

        let der = BASE64
            .decode(result.public_key.trim())
            .context("Public key is not valid base64")?;
        Ok(der.into())
    }

    async fn sign_digest(&self, digest: B256) -> Result<Bytes> {
        let request = SignRequest {
            key_id: &self.key_id,
            message: BASE64.encode(digest.as_slice()),
            message_type: MESSAGE_TYPE_DIGEST,
            signing_algorithm: SIGNING_ALGORITHM,
        };

        let resp = self
            .authorize(self.client.post(self.key_url("sign")))
            .json(&request)
            .send()
            .await
            .context("Failed to request signature")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            eyre::bail!("Key service refused to sign: {} - {}", status, body);
        }

        let result: SignResponse = resp
            .json()
            .await
            .context("Failed to parse sign response")?;

        let der = BASE64
            .decode(result.signature.trim())
            .context("Signature is not valid base64")?;
        Ok(der.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_url() {
        let service = HttpKeyService::new("https://kms.internal/", "settler", None).unwrap();
        assert_eq!(service.key_url("sign"), "https://kms.internal/keys/settler/sign");
        assert_eq!(
            service.key_url("public-key"),
            "https://kms.internal/keys/settler/public-key"
        );
    }

    #[test]
    fn test_sign_request_shape() {
        let request = SignRequest {
            key_id: "settler",
            message: BASE64.encode([0u8; 32]),
            message_type: MESSAGE_TYPE_DIGEST,
            signing_algorithm: SIGNING_ALGORITHM,
        };
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["KeyId"], "settler");
        assert_eq!(json["MessageType"], "DIGEST");
        assert_eq!(json["SigningAlgorithm"], "ECDSA_SHA_256");
        assert_eq!(
            BASE64.decode(json["Message"].as_str().unwrap()).unwrap(),
            vec![0u8; 32]
        );
    }
}
