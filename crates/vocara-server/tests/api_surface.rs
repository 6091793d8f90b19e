//! End-to-end exercises of the HTTP surface over in-memory backends.
//! The real scheduler and runners execute; only the network upstreams are
//! scripted.

use std::time::Duration;

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use vocara_core::config::{
    CompletionSource, DatabaseSettings, LlmServiceSettings, Settings, StorageSettings,
    VideoServiceSettings, VoiceServiceSettings,
};
use vocara_core::testing::TestHarness;
use vocara_core::usage::UsageResource;

use vocara_server::api::create_router;
use vocara_server::state::{AppState, Services};

const WORKER_TOKEN: &str = "worker-secret";

fn test_settings() -> Settings {
    Settings {
        voice: VoiceServiceSettings {
            rest_base_url: "http://voice.test".into(),
            ws_url: "ws://voice.test/voice-chat".into(),
            secret_key: "voice-secret".into(),
        },
        video: VideoServiceSettings {
            rest_base_url: "http://video.test".into(),
            ws_url: "ws://video.test".into(),
            api_key: "video-key".into(),
        },
        llm: LlmServiceSettings {
            base_url: "http://llm.test".into(),
            api_key: "llm-key".into(),
        },
        database: DatabaseSettings {
            url: String::new(),
            service_key: String::new(),
        },
        storage: StorageSettings {
            url: String::new(),
            service_key: String::new(),
            bucket: "avatar-media".into(),
        },
        worker_callback_token: WORKER_TOKEN.into(),
        max_concurrent_jobs: 2,
        queue_capacity: 32,
        frontend_origin: None,
        auth_verify_url: None,
        completion_source: CompletionSource::Callback,
        chunk_pause: Duration::ZERO,
    }
}

async fn app() -> (Router, TestHarness, AppState) {
    let harness = TestHarness::with_default_avatar().await;
    let state = AppState::new(Services {
        settings: test_settings(),
        db: harness.db.clone(),
        storage: harness.storage.clone(),
        voice: harness.voice.clone(),
        video: harness.video.clone(),
        chat: harness.chat.clone(),
        verifier: harness.verifier.clone(),
    });
    (create_router(state.clone()), harness, state)
}

async fn send_json(router: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(AUTHORIZATION, "Bearer valid-token")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(router, request).await
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024 * 1024)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn wait_for(router: &Router, uri: &str, predicate: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..400 {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header(AUTHORIZATION, "Bearer valid-token")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router, request).await;
        if status == StatusCode::OK && predicate(&body) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never reached for {uri}");
}

fn multipart_body(task_id: &str, status: &str, file: Option<&[u8]>) -> (String, Vec<u8>) {
    let boundary = "vocara-test-boundary";
    let mut body = Vec::new();
    let mut push_field = |name: &str, value: &str| {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    };
    push_field("task_id", task_id);
    push_field("status", status);
    if let Some(bytes) = file {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; \
                 filename=\"render.mp4\"\r\nContent-Type: video/mp4\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

#[tokio::test]
async fn health_reports_all_services() {
    let (router, _harness, _state) = app().await;
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["services"]["voice_service"], "up");
    assert_eq!(body["services"]["video_service"], "up");
    assert_eq!(body["services"]["database"], "up");
}

#[tokio::test]
async fn generation_requires_a_bearer_token() {
    let (router, _harness, _state) = app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/api/audio-generation/generate")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "text": "Hello.", "voiceId": "avatar-1" }).to_string(),
        ))
        .unwrap();
    let (status, _body) = send(&router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn audio_script_length_boundary() {
    let (router, _harness, _state) = app().await;

    let exactly_1000 = "a".repeat(1000);
    let (status, _) = send_json(
        &router,
        "POST",
        "/api/audio-generation/generate",
        json!({ "text": exactly_1000, "voiceId": "avatar-1" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let too_long = "a".repeat(1001);
    let (status, body) = send_json(
        &router,
        "POST",
        "/api/audio-generation/generate",
        json!({ "text": too_long, "voiceId": "avatar-1" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("1000"));
}

#[tokio::test]
async fn unknown_avatar_is_a_404() {
    let (router, _harness, _state) = app().await;
    let (status, _) = send_json(
        &router,
        "POST",
        "/api/audio-generation/generate",
        json!({ "text": "Hello.", "voiceId": "ghost" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn over_quota_returns_403_with_the_pre_image() {
    let (router, harness, _state) = app().await;
    harness
        .db
        .seed_usage("user-1", UsageResource::AudioMinutes, 59.9, 60.0)
        .await;

    let (status, body) = send_json(
        &router,
        "POST",
        "/api/audio-generation/generate",
        json!({ "text": "Hello there, how are you today.", "voiceId": "avatar-1" }),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["used"], 59.9);
    assert_eq!(body["limit"], 60.0);
    assert!((body["remaining"].as_f64().unwrap() - 0.1).abs() < 1e-9);

    // No job row was created.
    let jobs = harness
        .store()
        .list_by_owner("user-1", vocara_core::job::JobKind::Audio, 10, 0)
        .await
        .unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn audio_job_runs_to_completion_through_the_api() {
    let (router, harness, _state) = app().await;

    let (status, body) = send_json(
        &router,
        "POST",
        "/api/audio-generation/generate",
        json!({ "text": "Hello, world.", "voiceId": "avatar-1" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    let task_id = body["taskId"].as_str().unwrap().to_string();

    let done = wait_for(
        &router,
        &format!("/api/audio-generation/status/{task_id}"),
        |body| body["status"] == "completed",
    )
    .await;

    assert_eq!(done["progress"], 100);
    let audio_url = done["audio_url"].as_str().unwrap();
    assert!(audio_url.contains("generated_audio/user-1/"));
    assert!(done["error_message"].is_null());

    let used = harness
        .usage_used("user-1", UsageResource::AudioMinutes)
        .await;
    assert!((used - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn worker_callback_completes_a_video_job_idempotently() {
    let (router, harness, _state) = app().await;

    let (status, body) = send_json(
        &router,
        "POST",
        "/api/video-generation/generate",
        json!({
            "text": "Hello, world.",
            "avatarId": "avatar-1",
            "quality": "fast",
            "inputType": "script",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = body["taskId"].as_str().unwrap().to_string();

    // Callback deployment: the runner parks the row at processing/70.
    wait_for(
        &router,
        &format!("/api/video-generation/status/{task_id}"),
        |body| body["status"] == "processing" && body["progress"] == 70,
    )
    .await;

    let mp4 = vec![0x42u8; 1024 * 1024];
    let (content_type, payload) = multipart_body(&task_id, "completed", Some(&mp4));
    let request = Request::builder()
        .method("POST")
        .uri("/worker/callback")
        .header(AUTHORIZATION, format!("Bearer {WORKER_TOKEN}"))
        .header(CONTENT_TYPE, content_type.clone())
        .body(Body::from(payload.clone()))
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["changed"], true);

    let done = wait_for(
        &router,
        &format!("/api/video-generation/status/{task_id}"),
        |body| body["status"] == "completed",
    )
    .await;
    let video_url = done["video_url"].as_str().unwrap().to_string();
    assert!(video_url.contains(&format!("generated_videos/{task_id}/")));

    let used_once = harness
        .usage_used("user-1", UsageResource::VideoMinutes)
        .await;
    assert!((used_once - 0.5).abs() < 1e-9);
    let blobs_before = harness.storage.len().await;

    // Redelivering the identical payload succeeds without changing the
    // row, re-billing, or uploading a second blob.
    let request = Request::builder()
        .method("POST")
        .uri("/worker/callback")
        .header(AUTHORIZATION, format!("Bearer {WORKER_TOKEN}"))
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(payload))
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], false);

    let after = wait_for(
        &router,
        &format!("/api/video-generation/status/{task_id}"),
        |body| body["status"] == "completed",
    )
    .await;
    assert_eq!(after["video_url"].as_str().unwrap(), video_url);
    assert_eq!(harness.storage.len().await, blobs_before);
    let used_twice = harness
        .usage_used("user-1", UsageResource::VideoMinutes)
        .await;
    assert!((used_twice - used_once).abs() < 1e-9);
}

#[tokio::test]
async fn worker_callback_rejects_bad_tokens_without_a_body() {
    let (router, _harness, _state) = app().await;
    let (content_type, payload) =
        multipart_body("00000000-0000-0000-0000-000000000000", "processing", None);

    let request = Request::builder()
        .method("POST")
        .uri("/worker/callback")
        .header(AUTHORIZATION, "Bearer wrong-token")
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(payload))
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn worker_callback_accepts_the_dedicated_header_and_rejects_unknown_ids() {
    let (router, _harness, _state) = app().await;
    let (content_type, payload) =
        multipart_body("00000000-0000-0000-0000-000000000001", "processing", None);

    let request = Request::builder()
        .method("POST")
        .uri("/worker/callback")
        .header("x-worker-token", WORKER_TOKEN)
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(payload))
        .unwrap();
    let (status, _body) = send(&router, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_is_idempotent_and_clears_the_row() {
    let (router, _harness, _state) = app().await;

    let (status, body) = send_json(
        &router,
        "POST",
        "/api/audio-generation/generate",
        json!({ "text": "Hello, world.", "voiceId": "avatar-1" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = body["taskId"].as_str().unwrap().to_string();

    wait_for(
        &router,
        &format!("/api/audio-generation/status/{task_id}"),
        |body| body["status"] == "completed",
    )
    .await;

    let (status, body) = send_json(
        &router,
        "DELETE",
        &format!("/api/audio-generation/{task_id}"),
        Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);

    let request = Request::builder()
        .method("GET")
        .uri(format!("/api/audio-generation/status/{task_id}"))
        .header(AUTHORIZATION, "Bearer valid-token")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Re-delete is a no-op success.
    let (status, body) = send_json(
        &router,
        "DELETE",
        &format!("/api/audio-generation/{task_id}"),
        Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);
}

#[tokio::test]
async fn queued_status_derives_coarse_progress() {
    let (router, harness, _state) = app().await;

    // Bypass the scheduler so the row stays queued with progress zero.
    let job = harness
        .store()
        .create(vocara_core::job::NewJob {
            owner_id: "user-1".into(),
            avatar_id: "avatar-1".into(),
            kind: vocara_core::job::JobKind::Audio,
            input: vocara_core::job::JobInput::Script,
            script_text: Some("Hello.".into()),
            source_audio_url: None,
            quality: vocara_core::job::JobQuality::Fast,
            language: "en".into(),
        })
        .await
        .unwrap();

    let request = Request::builder()
        .method("GET")
        .uri(format!("/api/audio-generation/status/{}", job.id))
        .header(AUTHORIZATION, "Bearer valid-token")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["progress"], 10);
}
