//! Turn-based LLM client with per-session rolling history.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::LlmServiceSettings;
use crate::error::{Error, Result};

/// How many prior messages (user and model alike) travel with each turn.
pub const HISTORY_WINDOW: usize = 10;

const TURN_TIMEOUT: Duration = Duration::from_secs(45);

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run one turn for `session_id` and return the model's reply.
    async fn generate(
        &self,
        session_id: &str,
        user_text: &str,
        system_prompt: &str,
        language: &str,
    ) -> Result<String>;

    /// Drop the session's rolling history.
    async fn forget(&self, session_id: &str);
}

#[derive(Debug, Clone, Serialize)]
struct HistoryMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    text: String,
}

pub struct HttpChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    history: Mutex<HashMap<String, Vec<HistoryMessage>>>,
}

impl HttpChatClient {
    pub fn new(settings: &LlmServiceSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(TURN_TIMEOUT)
            .build()
            .map_err(|err| Error::internal(format!("failed to build LLM client: {err}")))?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            history: Mutex::new(HashMap::new()),
        })
    }

    /// Snapshot the rolling window for a session, oldest first.
    async fn window(&self, session_id: &str) -> Vec<HistoryMessage> {
        self.history
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn remember(&self, session_id: &str, role: &'static str, content: String) {
        let mut history = self.history.lock().await;
        let messages = history.entry(session_id.to_string()).or_default();
        messages.push(HistoryMessage { role, content });
        if messages.len() > HISTORY_WINDOW {
            let excess = messages.len() - HISTORY_WINDOW;
            messages.drain(..excess);
        }
    }
}

#[async_trait]
impl ChatModel for HttpChatClient {
    async fn generate(
        &self,
        session_id: &str,
        user_text: &str,
        system_prompt: &str,
        language: &str,
    ) -> Result<String> {
        let window = self.window(session_id).await;

        let response = self
            .http
            .post(format!("{}/generate", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "session_id": session_id,
                "system_prompt": system_prompt,
                "language": language,
                "history": window,
                "user_text": user_text,
            }))
            .send()
            .await
            .map_err(|err| Error::UpstreamUnavailable {
                service: "llm",
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamRejected {
                service: "llm",
                body: format!("{status}: {body}"),
            });
        }

        let parsed: GenerateResponse = response.json().await.map_err(|err| {
            Error::UpstreamUnavailable {
                service: "llm",
                reason: format!("malformed generate reply: {err}"),
            }
        })?;

        self.remember(session_id, "user", user_text.to_string()).await;
        self.remember(session_id, "model", parsed.text.clone()).await;
        Ok(parsed.text)
    }

    async fn forget(&self, session_id: &str) {
        self.history.lock().await.remove(session_id);
    }
}
