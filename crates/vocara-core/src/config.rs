//! Environment-derived settings.
//!
//! Invalid numeric values warn and fall back to defaults rather than
//! aborting startup; missing service credentials only fail once the
//! corresponding client is actually used.

use std::time::Duration;

use tracing::warn;

/// Which side finishes a video job: the in-process poll loop (default) or
/// the GPU worker pushing to `/worker/callback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSource {
    Poll,
    Callback,
}

#[derive(Debug, Clone)]
pub struct VoiceServiceSettings {
    /// REST synthesis endpoint base.
    pub rest_base_url: String,
    /// Realtime websocket endpoint.
    pub ws_url: String,
    /// Shared secret for `VOICE_CLONE_AUTH` tokens.
    pub secret_key: String,
}

#[derive(Debug, Clone)]
pub struct VideoServiceSettings {
    pub rest_base_url: String,
    pub ws_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct LlmServiceSettings {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub service_key: String,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub url: String,
    pub service_key: String,
    pub bucket: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub voice: VoiceServiceSettings,
    pub video: VideoServiceSettings,
    pub llm: LlmServiceSettings,
    pub database: DatabaseSettings,
    pub storage: StorageSettings,
    /// Static token authenticating the GPU worker's callback.
    pub worker_callback_token: String,
    /// Worker-pool width; the only global backpressure knob.
    pub max_concurrent_jobs: usize,
    /// Soft bound of the in-memory job queue.
    pub queue_capacity: usize,
    /// Allowed browser origin; `None` means permissive development CORS.
    pub frontend_origin: Option<String>,
    /// External auth provider's token-verification endpoint.
    pub auth_verify_url: Option<String>,
    pub completion_source: CompletionSource,
    /// Pause between per-chunk synthesis calls in the audio pipeline.
    pub chunk_pause: Duration,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            voice: VoiceServiceSettings {
                rest_base_url: trimmed_env("COQUI_XTTS_BASE_URL")
                    .unwrap_or_else(|| "http://localhost:8020".to_string()),
                ws_url: trimmed_env("VOICE_SERVICE_WS_URL")
                    .unwrap_or_else(|| "ws://localhost:8020/voice-chat".to_string()),
                secret_key: trimmed_env("VOICE_SERVICE_SECRET_KEY").unwrap_or_default(),
            },
            video: VideoServiceSettings {
                rest_base_url: trimmed_env("VIDEO_SERVICE_URL")
                    .unwrap_or_else(|| "http://localhost:8021".to_string()),
                ws_url: trimmed_env("VIDEO_SERVICE_WS_URL")
                    .unwrap_or_else(|| "ws://localhost:8021".to_string()),
                api_key: trimmed_env("VIDEO_SERVICE_API_KEY").unwrap_or_default(),
            },
            llm: LlmServiceSettings {
                base_url: trimmed_env("LLM_SERVICE_URL")
                    .unwrap_or_else(|| "http://localhost:8022".to_string()),
                api_key: trimmed_env("LLM_SERVICE_API_KEY").unwrap_or_default(),
            },
            database: DatabaseSettings {
                url: trimmed_env("DATABASE_URL").unwrap_or_default(),
                service_key: trimmed_env("DATABASE_SERVICE_KEY").unwrap_or_default(),
            },
            storage: StorageSettings {
                url: trimmed_env("STORAGE_URL").unwrap_or_default(),
                service_key: trimmed_env("STORAGE_SERVICE_KEY").unwrap_or_default(),
                bucket: trimmed_env("STORAGE_BUCKET")
                    .unwrap_or_else(|| "avatar-media".to_string()),
            },
            worker_callback_token: trimmed_env("WORKER_CALLBACK_TOKEN").unwrap_or_default(),
            max_concurrent_jobs: numeric_env("MAX_CONCURRENT_JOBS", 1),
            queue_capacity: numeric_env("JOB_QUEUE_CAPACITY", 100),
            frontend_origin: trimmed_env("FRONTEND_URL").map(|raw| normalize_origin(&raw)),
            auth_verify_url: trimmed_env("AUTH_VERIFY_URL"),
            completion_source: completion_source_from_env(),
            chunk_pause: Duration::from_millis(numeric_env("SYNTH_CHUNK_PAUSE_MS", 3_000)),
        }
    }
}

fn trimmed_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn numeric_env<T: std::str::FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid {key}='{raw}', falling back to {default}");
                default
            }
        },
        Err(_) => default,
    }
}

fn completion_source_from_env() -> CompletionSource {
    match std::env::var("VIDEO_COMPLETION_SOURCE") {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "callback" => CompletionSource::Callback,
            "poll" | "" => CompletionSource::Poll,
            other => {
                warn!("Invalid VIDEO_COMPLETION_SOURCE='{other}', falling back to poll");
                CompletionSource::Poll
            }
        },
        Err(_) => CompletionSource::Poll,
    }
}

/// Browsers send the `Origin` header without a trailing slash; tolerate a
/// configured value that carries one.
fn normalize_origin(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    fn env_lock() -> MutexGuard<'static, ()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("environment lock poisoned")
    }

    #[test]
    fn frontend_origin_tolerates_trailing_slash() {
        assert_eq!(
            normalize_origin("https://app.vocara.ai/"),
            "https://app.vocara.ai"
        );
        assert_eq!(
            normalize_origin("https://app.vocara.ai"),
            "https://app.vocara.ai"
        );
    }

    #[test]
    fn worker_pool_width_falls_back_on_garbage() {
        let _guard = env_lock();
        std::env::set_var("MAX_CONCURRENT_JOBS", "not-a-number");
        let settings = Settings::from_env();
        assert_eq!(settings.max_concurrent_jobs, 1);
        std::env::remove_var("MAX_CONCURRENT_JOBS");
    }

    #[test]
    fn completion_source_defaults_to_poll() {
        let _guard = env_lock();
        std::env::remove_var("VIDEO_COMPLETION_SOURCE");
        assert_eq!(completion_source_from_env(), CompletionSource::Poll);

        std::env::set_var("VIDEO_COMPLETION_SOURCE", "callback");
        assert_eq!(completion_source_from_env(), CompletionSource::Callback);

        std::env::set_var("VIDEO_COMPLETION_SOURCE", "push");
        assert_eq!(completion_source_from_env(), CompletionSource::Poll);
        std::env::remove_var("VIDEO_COMPLETION_SOURCE");
    }

    #[test]
    fn storage_bucket_has_a_default() {
        let _guard = env_lock();
        std::env::remove_var("STORAGE_BUCKET");
        let settings = Settings::from_env();
        assert_eq!(settings.storage.bucket, "avatar-media");
    }
}
