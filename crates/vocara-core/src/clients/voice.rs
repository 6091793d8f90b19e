//! Voice-synthesis service client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::VoiceServiceSettings;
use crate::error::{Error, Result};
use crate::token;

const SYNTH_TIMEOUT: Duration = Duration::from_secs(60);

/// One REST synthesis call.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisRequest {
    pub voice_id: String,
    /// URL of the voice sample the service clones from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clone_ref: Option<String>,
    pub text: String,
    pub language: String,
}

#[async_trait]
pub trait VoiceSynth: Send + Sync {
    /// Synthesize `request.text` and return the WAV payload.
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>>;

    /// Reachability probe for the health endpoint.
    async fn healthy(&self) -> bool;
}

pub struct HttpVoiceClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl HttpVoiceClient {
    pub fn new(settings: &VoiceServiceSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(SYNTH_TIMEOUT)
            .build()
            .map_err(|err| Error::internal(format!("failed to build voice client: {err}")))?;
        Ok(Self {
            http,
            base_url: settings.rest_base_url.trim_end_matches('/').to_string(),
            secret_key: settings.secret_key.clone(),
        })
    }
}

#[async_trait]
impl VoiceSynth for HttpVoiceClient {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        let response = self
            .http
            .post(format!("{}/synthesize", self.base_url))
            .header("Authorization", token::mint_now(&self.secret_key))
            .json(request)
            .send()
            .await
            .map_err(|err| Error::UpstreamUnavailable {
                service: "voice",
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamRejected {
                service: "voice",
                body: format!("{status}: {body}"),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| Error::UpstreamUnavailable {
                service: "voice",
                reason: format!("body read failed: {err}"),
            })?;
        Ok(bytes.to_vec())
    }

    async fn healthy(&self) -> bool {
        self.http
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
