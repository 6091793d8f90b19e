//! Video-synthesis (talking-head render) service client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::config::VideoServiceSettings;
use crate::error::{Error, Result};
use crate::job::JobQuality;

const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// One observation of a render task. The status endpoint content-negotiates:
/// `video/mp4` means the body *is* the finished artifact, anything else is
/// a JSON progress report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollReply {
    Ready(Vec<u8>),
    Processing,
    Failed(String),
    /// The service has not indexed the task yet; treated as transient.
    NotFound,
}

#[async_trait]
pub trait VideoRender: Send + Sync {
    /// Enqueue a render and return the upstream task id.
    async fn enqueue(&self, image_url: &str, audio_url: &str, quality: JobQuality)
        -> Result<String>;

    async fn status(&self, task_id: &str) -> Result<PollReply>;

    /// Provision a realtime lip-sync stream before opening its websocket.
    async fn init_stream(&self, session_id: &str, image_url: &str) -> Result<()>;

    /// Release upstream stream resources at session teardown.
    async fn end_stream(&self, session_id: &str) -> Result<()>;

    /// Reachability probe for the health endpoint.
    async fn healthy(&self) -> bool;
}

#[derive(Debug, Deserialize)]
struct EnqueueResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpVideoClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpVideoClient {
    pub fn new(settings: &VideoServiceSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(POLL_TIMEOUT)
            .build()
            .map_err(|err| Error::internal(format!("failed to build video client: {err}")))?;
        Ok(Self {
            http,
            base_url: settings.rest_base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        })
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key)
    }
}

#[async_trait]
impl VideoRender for HttpVideoClient {
    async fn enqueue(
        &self,
        image_url: &str,
        audio_url: &str,
        quality: JobQuality,
    ) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/enqueue", self.base_url))
            .timeout(ENQUEUE_TIMEOUT)
            .header("Authorization", self.bearer())
            .json(&json!({
                "image_url": image_url,
                "audio_url": audio_url,
                "quality": quality.as_str(),
            }))
            .send()
            .await
            .map_err(|err| Error::UpstreamUnavailable {
                service: "video",
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::VideoEnqueueFailed(format!("{status}: {body}")));
        }

        let parsed: EnqueueResponse = response
            .json()
            .await
            .map_err(|err| Error::VideoEnqueueFailed(format!("malformed enqueue reply: {err}")))?;
        Ok(parsed.task_id)
    }

    async fn status(&self, task_id: &str) -> Result<PollReply> {
        let response = self
            .http
            .get(format!("{}/status/{task_id}", self.base_url))
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|err| Error::UpstreamUnavailable {
                service: "video",
                reason: err.to_string(),
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(PollReply::NotFound);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamUnavailable {
                service: "video",
                reason: format!("status poll returned {status}: {body}"),
            });
        }

        let is_mp4 = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("video/mp4"))
            .unwrap_or(false);

        if is_mp4 {
            let bytes = response
                .bytes()
                .await
                .map_err(|err| Error::UpstreamUnavailable {
                    service: "video",
                    reason: format!("artifact read failed: {err}"),
                })?;
            return Ok(PollReply::Ready(bytes.to_vec()));
        }

        let parsed: StatusResponse = response.json().await.map_err(|err| {
            Error::UpstreamUnavailable {
                service: "video",
                reason: format!("malformed status reply: {err}"),
            }
        })?;

        match parsed.status.as_str() {
            "failed" => Ok(PollReply::Failed(
                parsed.error.unwrap_or_else(|| "render failed".to_string()),
            )),
            _ => Ok(PollReply::Processing),
        }
    }

    async fn init_stream(&self, session_id: &str, image_url: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/init-stream", self.base_url))
            .header("Authorization", self.bearer())
            .json(&json!({
                "session_id": session_id,
                "image_url": image_url,
            }))
            .send()
            .await
            .map_err(|err| Error::UpstreamUnavailable {
                service: "video",
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamRejected {
                service: "video",
                body: format!("init-stream returned {status}: {body}"),
            });
        }
        Ok(())
    }

    async fn end_stream(&self, session_id: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/end-stream", self.base_url))
            .header("Authorization", self.bearer())
            .json(&json!({ "session_id": session_id }))
            .send()
            .await
            .map_err(|err| Error::UpstreamUnavailable {
                service: "video",
                reason: err.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamRejected {
                service: "video",
                body: format!("end-stream returned {status}: {body}"),
            });
        }
        Ok(())
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
