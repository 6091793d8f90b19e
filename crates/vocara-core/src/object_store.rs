//! Blob persistence behind the hosted object-storage service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;

use crate::config::StorageSettings;
use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `key` and return the public URL. Fails if the key
    /// already exists: generated artifacts are immutable.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove a blob. Deleting a missing key is a no-op success.
    async fn delete(&self, key: &str) -> Result<()>;

    fn public_url(&self, key: &str) -> String;
}

/// Key layout for generated artifacts. Timestamps keep retried uploads
/// from colliding with the no-upsert rule.
pub mod keys {
    use uuid::Uuid;

    use crate::job::JobQuality;

    pub fn temp_audio(owner_id: &str, job_id: Uuid, epoch_ms: u64) -> String {
        format!("temp_audio/{owner_id}/{job_id}-{epoch_ms}.wav")
    }

    pub fn generated_audio(owner_id: &str, job_id: Uuid, epoch_ms: u64) -> String {
        format!("generated_audio/{owner_id}/{job_id}-{epoch_ms}.wav")
    }

    pub fn generated_video(job_id: Uuid, quality: JobQuality, epoch_ms: u64) -> String {
        format!(
            "generated_videos/{job_id}/{}-{epoch_ms}.mp4",
            quality.as_str()
        )
    }

    /// Variant used by the worker callback, which does not know the
    /// quality it rendered at.
    pub fn callback_video(job_id: Uuid, epoch_ms: u64) -> String {
        format!("generated_videos/{job_id}/{epoch_ms}.mp4")
    }
}

/// HTTP backend for the hosted storage API.
pub struct RestObjectStore {
    http: reqwest::Client,
    base_url: String,
    bucket: String,
}

impl RestObjectStore {
    pub fn new(settings: &StorageSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {}", settings.service_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|err| Error::store(format!("invalid storage service key: {err}")))?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| Error::store(format!("failed to build storage client: {err}")))?;

        Ok(Self {
            http,
            base_url: settings.url.trim_end_matches('/').to_string(),
            bucket: settings.bucket.clone(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/storage/v1/object/{}/{key}", self.base_url, self.bucket)
    }
}

#[async_trait]
impl ObjectStore for RestObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let response = self
            .http
            .post(self.object_url(key))
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .map_err(|err| Error::StorageUploadFailed {
                key: key.to_string(),
                reason: err.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Err(Error::StorageUploadFailed {
                key: key.to_string(),
                reason: "key already exists".into(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::StorageUploadFailed {
                key: key.to_string(),
                reason: format!("storage returned {status}: {body}"),
            });
        }

        Ok(self.public_url(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(self.object_url(key))
            .send()
            .await
            .map_err(|err| Error::UpstreamUnavailable {
                service: "storage",
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::store(format!(
                "storage get `{key}` returned {status}: {body}"
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| Error::store(format!("storage get `{key}` body read failed: {err}")))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.object_url(key))
            .send()
            .await
            .map_err(|err| Error::UpstreamUnavailable {
                service: "storage",
                reason: err.to_string(),
            })?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::store(format!(
            "storage delete `{key}` returned {status}: {body}"
        )))
    }

    fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{key}",
            self.base_url, self.bucket
        )
    }
}

/// Best-effort reverse of [`ObjectStore::public_url`], for deleting a blob
/// given only the URL a job row stored.
pub fn key_from_public_url(url: &str) -> Option<&str> {
    let (_, tail) = url.split_once("/object/public/")?;
    let (_bucket, key) = tail.split_once('/')?;
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn key_layout_matches_contract() {
        let job = Uuid::nil();
        assert_eq!(
            keys::temp_audio("u1", job, 42),
            format!("temp_audio/u1/{job}-42.wav")
        );
        assert_eq!(
            keys::generated_audio("u1", job, 42),
            format!("generated_audio/u1/{job}-42.wav")
        );
        assert_eq!(
            keys::generated_video(job, crate::job::JobQuality::Fast, 42),
            format!("generated_videos/{job}/fast-42.mp4")
        );
        assert_eq!(
            keys::callback_video(job, 42),
            format!("generated_videos/{job}/42.mp4")
        );
    }

    #[test]
    fn public_url_round_trips_to_key() {
        let url = "https://store.vocara.ai/storage/v1/object/public/avatar-media/generated_audio/u1/x-1.wav";
        assert_eq!(
            key_from_public_url(url),
            Some("generated_audio/u1/x-1.wav")
        );
        assert_eq!(key_from_public_url("https://elsewhere/foo"), None);
    }
}
