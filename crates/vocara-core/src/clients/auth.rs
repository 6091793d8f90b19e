//! Thin wrapper over the external auth provider's token verification.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};

const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a bearer token and return the owning user id.
    async fn verify(&self, bearer: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    user_id: String,
}

pub struct RemoteTokenVerifier {
    http: reqwest::Client,
    verify_url: String,
}

impl RemoteTokenVerifier {
    pub fn new(verify_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(VERIFY_TIMEOUT)
            .build()
            .map_err(|err| Error::internal(format!("failed to build auth client: {err}")))?;
        Ok(Self { http, verify_url })
    }
}

#[async_trait]
impl TokenVerifier for RemoteTokenVerifier {
    async fn verify(&self, bearer: &str) -> Result<String> {
        let token = bearer.trim();
        if token.is_empty() {
            return Err(Error::Unauthorized);
        }

        let response = self
            .http
            .post(&self.verify_url)
            .json(&json!({ "token": token }))
            .send()
            .await
            .map_err(|err| Error::UpstreamUnavailable {
                service: "auth",
                reason: err.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::Unauthorized);
        }

        let parsed: VerifyResponse = response
            .json()
            .await
            .map_err(|_| Error::Unauthorized)?;
        Ok(parsed.user_id)
    }
}
