//! Row persistence behind the hosted relational service.
//!
//! The control plane never talks SQL; rows live in a hosted service that
//! exposes PostgREST-style table endpoints. [`Database`] is the seam the
//! rest of the crate depends on; [`RestDatabase`] is the production
//! backend and `testing::MemoryDatabase` the in-process one.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::avatar::Avatar;
use crate::config::DatabaseSettings;
use crate::error::{Error, Result};
use crate::job::{GenerationJob, JobKind, JobStatus, JobUpdate};
use crate::session::SessionRecord;
use crate::usage::{UsageCounter, UsageResource};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait Database: Send + Sync {
    async fn fetch_avatar(&self, avatar_id: &str) -> Result<Option<Avatar>>;

    async fn insert_job(&self, job: GenerationJob) -> Result<GenerationJob>;
    async fn fetch_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>>;
    async fn update_job(&self, job_id: Uuid, update: &JobUpdate) -> Result<GenerationJob>;
    async fn list_jobs(
        &self,
        owner_id: &str,
        kind: JobKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GenerationJob>>;
    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<GenerationJob>>;
    async fn delete_job(&self, job_id: Uuid, owner_id: &str) -> Result<bool>;

    async fn fetch_usage(
        &self,
        owner_id: &str,
        resource: UsageResource,
    ) -> Result<Option<UsageCounter>>;
    async fn upsert_usage(&self, counter: &UsageCounter) -> Result<()>;

    async fn insert_session(&self, session: &SessionRecord) -> Result<()>;

    /// Reachability probe for the health endpoint.
    async fn healthy(&self) -> bool;
}

/// PostgREST-style HTTP backend for the hosted store.
pub struct RestDatabase {
    http: reqwest::Client,
    base_url: String,
}

impl RestDatabase {
    pub fn new(settings: &DatabaseSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {}", settings.service_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|err| Error::store(format!("invalid database service key: {err}")))?,
        );
        headers.insert(
            "apikey",
            HeaderValue::from_str(&settings.service_key)
                .map_err(|err| Error::store(format!("invalid database service key: {err}")))?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| Error::store(format!("failed to build database client: {err}")))?;

        Ok(Self {
            http,
            base_url: settings.url.trim_end_matches('/').to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    async fn select<T: DeserializeOwned>(&self, table: &str, filter: &[(&str, String)]) -> Result<Vec<T>> {
        let response = self
            .http
            .get(self.table_url(table))
            .query(filter)
            .send()
            .await
            .map_err(|err| Error::store(format!("{table} select failed: {err}")))?;
        read_rows(table, response).await
    }

    async fn insert<B: Serialize, T: DeserializeOwned>(&self, table: &str, body: &B) -> Result<T> {
        let response = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await
            .map_err(|err| Error::store(format!("{table} insert failed: {err}")))?;
        let mut rows: Vec<T> = read_rows(table, response).await?;
        rows.pop()
            .ok_or_else(|| Error::store(format!("{table} insert returned no row")))
    }

    async fn patch<B: Serialize, T: DeserializeOwned>(
        &self,
        table: &str,
        filter: &[(&str, String)],
        body: &B,
    ) -> Result<Vec<T>> {
        let response = self
            .http
            .patch(self.table_url(table))
            .query(filter)
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await
            .map_err(|err| Error::store(format!("{table} update failed: {err}")))?;
        read_rows(table, response).await
    }
}

async fn read_rows<T: DeserializeOwned>(table: &str, response: reqwest::Response) -> Result<Vec<T>> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::store(format!("{table} request returned {status}: {body}")));
    }
    response
        .json::<Vec<T>>()
        .await
        .map_err(|err| Error::store(format!("{table} returned malformed rows: {err}")))
}

#[async_trait]
impl Database for RestDatabase {
    async fn fetch_avatar(&self, avatar_id: &str) -> Result<Option<Avatar>> {
        let mut rows: Vec<Avatar> = self
            .select("avatars", &[("id", format!("eq.{avatar_id}")), ("limit", "1".into())])
            .await?;
        Ok(rows.pop())
    }

    async fn insert_job(&self, job: GenerationJob) -> Result<GenerationJob> {
        self.insert("generation_jobs", &job).await
    }

    async fn fetch_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>> {
        let mut rows: Vec<GenerationJob> = self
            .select(
                "generation_jobs",
                &[("id", format!("eq.{job_id}")), ("limit", "1".into())],
            )
            .await?;
        Ok(rows.pop())
    }

    async fn update_job(&self, job_id: Uuid, update: &JobUpdate) -> Result<GenerationJob> {
        let body = job_update_body(update);
        let mut rows: Vec<GenerationJob> = self
            .patch("generation_jobs", &[("id", format!("eq.{job_id}"))], &body)
            .await?;
        rows.pop()
            .ok_or_else(|| Error::store(format!("job {job_id} not found for update")))
    }

    async fn list_jobs(
        &self,
        owner_id: &str,
        kind: JobKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GenerationJob>> {
        self.select(
            "generation_jobs",
            &[
                ("owner_id", format!("eq.{owner_id}")),
                ("kind", format!("eq.{}", kind.as_db_value())),
                ("order", "created_at_ms.desc".into()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ],
        )
        .await
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<GenerationJob>> {
        self.select(
            "generation_jobs",
            &[("status", format!("eq.{}", status.as_db_value()))],
        )
        .await
    }

    async fn delete_job(&self, job_id: Uuid, owner_id: &str) -> Result<bool> {
        let response = self
            .http
            .delete(self.table_url("generation_jobs"))
            .query(&[
                ("id", format!("eq.{job_id}")),
                ("owner_id", format!("eq.{owner_id}")),
            ])
            .header("Prefer", "return=representation")
            .send()
            .await
            .map_err(|err| Error::store(format!("job delete failed: {err}")))?;
        let rows: Vec<serde_json::Value> = read_rows("generation_jobs", response).await?;
        Ok(!rows.is_empty())
    }

    async fn fetch_usage(
        &self,
        owner_id: &str,
        resource: UsageResource,
    ) -> Result<Option<UsageCounter>> {
        let mut rows: Vec<UsageCounter> = self
            .select(
                "usage_counters",
                &[
                    ("owner_id", format!("eq.{owner_id}")),
                    ("resource", format!("eq.{}", resource.as_db_value())),
                    ("limit", "1".into()),
                ],
            )
            .await?;
        Ok(rows.pop())
    }

    async fn upsert_usage(&self, counter: &UsageCounter) -> Result<()> {
        let response = self
            .http
            .post(self.table_url("usage_counters"))
            .header("Prefer", "resolution=merge-duplicates")
            .json(counter)
            .send()
            .await
            .map_err(|err| Error::store(format!("usage upsert failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::store(format!("usage upsert returned {status}: {body}")));
        }
        Ok(())
    }

    async fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        let response = self
            .http
            .post(self.table_url("conversation_sessions"))
            .json(session)
            .send()
            .await
            .map_err(|err| Error::store(format!("session insert failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::store(format!(
                "session insert returned {status}: {body}"
            )));
        }
        Ok(())
    }

    async fn healthy(&self) -> bool {
        match self
            .http
            .head(self.table_url("generation_jobs"))
            .query(&[("limit", "1")])
            .send()
            .await
        {
            Ok(response) => response.status() != StatusCode::SERVICE_UNAVAILABLE,
            Err(_) => false,
        }
    }
}

fn job_update_body(update: &JobUpdate) -> serde_json::Value {
    let mut body = serde_json::Map::new();
    if let Some(status) = update.status {
        body.insert("status".into(), status.as_db_value().into());
    }
    if let Some(progress) = update.progress {
        body.insert("progress".into(), progress.into());
    }
    if let Some(result_url) = &update.result_url {
        body.insert("result_url".into(), result_url.clone().into());
    }
    if let Some(error_message) = &update.error_message {
        body.insert("error_message".into(), error_message.clone().into());
    }
    if let Some(task_id) = &update.upstream_task_id {
        body.insert("upstream_task_id".into(), task_id.clone().into());
    }
    if let Some(audio_url) = &update.source_audio_url {
        body.insert("source_audio_url".into(), audio_url.clone().into());
    }
    if let Some(completed_at) = update.completed_at_ms {
        body.insert("completed_at_ms".into(), completed_at.into());
    }
    serde_json::Value::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;

    #[test]
    fn update_body_only_carries_set_fields() {
        let update = JobUpdate {
            status: Some(JobStatus::Failed),
            error_message: Some("synthesis died".into()),
            ..JobUpdate::default()
        };
        let body = job_update_body(&update);
        let object = body.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(object["status"], "failed");
        assert_eq!(object["error_message"], "synthesis died");
    }
}
