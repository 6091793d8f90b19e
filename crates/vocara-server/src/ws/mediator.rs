//! Per-connection session mediator.
//!
//! One browser websocket is bridged to the voice service websocket, the
//! video service websocket (video sessions only), and the turn-based LLM.
//! Reader tasks feed a single event channel; every state transition
//! happens in the one consumer loop, so the session state needs no locks.
//!
//! Frames to the client are either JSON text or binary with a one-byte
//! discriminator: `0x01` audio chunk, `0x02` video frame.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::FutureExt;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vocara_core::avatar::Avatar;
use vocara_core::clients::{ChatModel, VideoRender};
use vocara_core::db::Database;
use vocara_core::session::{SessionKind, SessionRecord, TranscriptEntry, TranscriptRole};
use vocara_core::time_ms;
use vocara_core::usage::{UsageAccountant, UsageResource};

use crate::state::AppState;
use crate::ws::upstream::{self, UpstreamKind};

/// Binary frame discriminators toward the client.
pub const FRAME_AUDIO: u8 = 0x01;
pub const FRAME_VIDEO: u8 = 0x02;

const VOICE_READY_TIMEOUT: Duration = Duration::from_secs(20);
const VIDEO_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Sessions shorter than this commit no conversation minutes.
const MIN_BILLABLE_MINUTES: f64 = 0.1;

/// Spoken when the LLM fails a turn; the client must still hear something.
const FALLBACK_REPLY: &str =
    "I'm sorry, I lost my train of thought for a moment. Could you say that again?";

pub struct SessionParams {
    pub kind: SessionKind,
    pub owner_id: String,
    pub avatar: Avatar,
    pub voice_clone_url: Option<String>,
    pub language: String,
}

/// A frame queued toward one socket; writer tasks translate to the
/// concrete websocket message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Json(serde_json::Value),
    Binary(Vec<u8>),
    Close(u16),
}

/// Everything the event loop reacts to, from any reader task.
#[derive(Debug)]
pub enum SessionEvent {
    ClientText(String),
    ClientGone,
    VoiceText(String),
    VoiceAudio(Vec<u8>),
    VoiceGone,
    VideoText(String),
    VideoBinary(Vec<u8>),
    VideoGone,
    TurnFinished { reply: Option<String> },
    WatchdogFired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Ready,
    Active,
    Draining,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    UpstreamClosed,
    UpstreamError,
    ReadinessTimeout,
    Internal,
}

impl CloseReason {
    pub const fn close_code(self) -> u16 {
        match self {
            Self::ClientClosed => 1000,
            Self::UpstreamClosed => 1001,
            Self::UpstreamError => 4002,
            Self::ReadinessTimeout => 4008,
            Self::Internal => 1011,
        }
    }
}

enum Flow {
    Continue,
    Stop(CloseReason),
}

/// What one event produced: whether the loop keeps running, and a user
/// turn to dispatch to the LLM off-loop.
struct StepOutcome {
    flow: Flow,
    turn: Option<String>,
}

impl StepOutcome {
    fn proceed() -> Self {
        Self {
            flow: Flow::Continue,
            turn: None,
        }
    }

    fn stop(reason: CloseReason) -> Self {
        Self {
            flow: Flow::Stop(reason),
            turn: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    UserText { text: String },
    StopSpeaking,
}

#[derive(Debug, Deserialize)]
struct UpstreamSignal {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<String>,
}

/// The session state machine. All methods run on the event loop; the only
/// shared state are the outbound channels.
pub struct SessionCore {
    pub session_id: Uuid,
    kind: SessionKind,
    owner_id: String,
    avatar: Avatar,
    language: String,
    phase: Phase,
    voice_ready: bool,
    video_ready: bool,
    turn_in_flight: bool,
    pending_turns: VecDeque<String>,
    transcript: Vec<TranscriptEntry>,
    client_tx: mpsc::UnboundedSender<Outbound>,
    voice_tx: mpsc::UnboundedSender<Outbound>,
    video_tx: Option<mpsc::UnboundedSender<Outbound>>,
}

impl SessionCore {
    pub fn new(
        params: &SessionParams,
        client_tx: mpsc::UnboundedSender<Outbound>,
        voice_tx: mpsc::UnboundedSender<Outbound>,
        video_tx: Option<mpsc::UnboundedSender<Outbound>>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            kind: params.kind,
            owner_id: params.owner_id.clone(),
            avatar: params.avatar.clone(),
            language: params.language.clone(),
            phase: Phase::Connecting,
            voice_ready: false,
            video_ready: false,
            turn_in_flight: false,
            pending_turns: VecDeque::new(),
            transcript: Vec::new(),
            client_tx,
            voice_tx,
            video_tx,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    fn handle(&mut self, event: SessionEvent) -> StepOutcome {
        match event {
            SessionEvent::ClientText(raw) => self.on_client_text(&raw),
            SessionEvent::ClientGone => {
                self.phase = Phase::Draining;
                StepOutcome::stop(CloseReason::ClientClosed)
            }
            SessionEvent::VoiceText(raw) => self.on_upstream_signal(UpstreamKind::Voice, &raw),
            SessionEvent::VoiceAudio(bytes) => {
                // Lip-sync gets the chunk verbatim; the client gets it
                // behind the audio discriminator.
                if let Some(video_tx) = &self.video_tx {
                    let _ = video_tx.send(Outbound::Binary(bytes.clone()));
                }
                self.send_client_binary(FRAME_AUDIO, bytes);
                StepOutcome::proceed()
            }
            SessionEvent::VoiceGone => {
                self.phase = Phase::Draining;
                StepOutcome::stop(CloseReason::UpstreamClosed)
            }
            SessionEvent::VideoText(raw) => self.on_upstream_signal(UpstreamKind::Video, &raw),
            SessionEvent::VideoBinary(bytes) => {
                self.send_client_binary(FRAME_VIDEO, bytes);
                StepOutcome::proceed()
            }
            SessionEvent::VideoGone => {
                self.phase = Phase::Draining;
                StepOutcome::stop(CloseReason::UpstreamClosed)
            }
            SessionEvent::TurnFinished { reply } => self.on_turn_finished(reply),
            SessionEvent::WatchdogFired => {
                if self.phase == Phase::Connecting {
                    self.send_client(json!({
                        "type": "error",
                        "code": "readiness_timeout",
                        "message": "upstream services did not become ready in time",
                    }));
                    self.phase = Phase::Failed;
                    StepOutcome::stop(CloseReason::ReadinessTimeout)
                } else {
                    StepOutcome::proceed()
                }
            }
        }
    }

    fn on_client_text(&mut self, raw: &str) -> StepOutcome {
        let message: ClientMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(err) => {
                self.send_client(json!({
                    "type": "error",
                    "message": format!("invalid message: {err}"),
                }));
                return StepOutcome::proceed();
            }
        };

        match message {
            ClientMessage::UserText { text } => self.on_user_text(text),
            ClientMessage::StopSpeaking => {
                // Barge-in: forward to both upstreams, and confirm to the
                // client immediately; the UI must not wait on upstream.
                let stop = json!({ "type": "stop_speaking" });
                let _ = self.voice_tx.send(Outbound::Json(stop.clone()));
                if let Some(video_tx) = &self.video_tx {
                    let _ = video_tx.send(Outbound::Json(stop));
                }
                self.send_client(json!({ "type": "speech_end" }));
                StepOutcome::proceed()
            }
        }
    }

    fn on_user_text(&mut self, text: String) -> StepOutcome {
        let text = text.trim().to_string();
        if text.is_empty() {
            return StepOutcome::proceed();
        }

        if matches!(self.phase, Phase::Connecting) {
            self.send_client(json!({
                "type": "error",
                "message": "session is not ready yet",
            }));
            return StepOutcome::proceed();
        }
        self.phase = Phase::Active;

        self.transcript.push(TranscriptEntry {
            role: TranscriptRole::User,
            text: text.clone(),
        });

        // Turns are strictly serialized: turn N+1 waits until turn N has
        // produced its text_to_speak.
        if self.turn_in_flight {
            self.pending_turns.push_back(text);
            return StepOutcome::proceed();
        }
        self.turn_in_flight = true;
        StepOutcome {
            flow: Flow::Continue,
            turn: Some(text),
        }
    }

    fn on_turn_finished(&mut self, reply: Option<String>) -> StepOutcome {
        let text = match reply.as_deref().map(str::trim) {
            Some(reply) if !reply.is_empty() => reply.to_string(),
            _ => FALLBACK_REPLY.to_string(),
        };

        self.transcript.push(TranscriptEntry {
            role: TranscriptRole::Model,
            text: text.clone(),
        });
        self.send_client(json!({ "type": "llm_response_text", "text": &text }));
        let _ = self
            .voice_tx
            .send(Outbound::Json(json!({ "type": "text_to_speak", "text": &text })));

        self.turn_in_flight = false;
        match self.pending_turns.pop_front() {
            Some(next) => {
                self.turn_in_flight = true;
                StepOutcome {
                    flow: Flow::Continue,
                    turn: Some(next),
                }
            }
            None => StepOutcome::proceed(),
        }
    }

    fn on_upstream_signal(&mut self, from: UpstreamKind, raw: &str) -> StepOutcome {
        let signal: UpstreamSignal = match serde_json::from_str(raw) {
            Ok(signal) => signal,
            Err(err) => {
                debug!(?from, "ignoring malformed upstream frame: {err}");
                return StepOutcome::proceed();
            }
        };

        match (from, signal.kind.as_str()) {
            (UpstreamKind::Voice, "ready") => {
                self.voice_ready = true;
                self.check_ready();
                StepOutcome::proceed()
            }
            (UpstreamKind::Video, "ready") => {
                self.video_ready = true;
                self.check_ready();
                StepOutcome::proceed()
            }
            (UpstreamKind::Voice, "speech_start") => {
                self.send_client(json!({ "type": "speech_start" }));
                StepOutcome::proceed()
            }
            (UpstreamKind::Voice, "speech_end") => {
                self.send_client(json!({ "type": "speech_end" }));
                StepOutcome::proceed()
            }
            (_, "error") => {
                let detail = signal.message.unwrap_or_else(|| "upstream error".to_string());
                self.send_client(json!({
                    "type": "error",
                    "message": format!("{} service error: {detail}", service_label(from)),
                }));
                self.phase = Phase::Failed;
                StepOutcome::stop(CloseReason::UpstreamError)
            }
            _ => StepOutcome::proceed(),
        }
    }

    /// Video sessions unlock the client-facing ready signal only once
    /// BOTH upstreams have reported in.
    fn check_ready(&mut self) {
        if self.phase != Phase::Connecting {
            return;
        }
        let required = match self.kind {
            SessionKind::Voice => self.voice_ready,
            SessionKind::Video => self.voice_ready && self.video_ready,
        };
        if required {
            self.phase = Phase::Ready;
            self.send_client(json!({ "type": "ready" }));
        }
    }

    fn send_client(&self, value: serde_json::Value) {
        let _ = self.client_tx.send(Outbound::Json(value));
    }

    fn send_client_binary(&self, discriminator: u8, bytes: Vec<u8>) {
        let mut framed = Vec::with_capacity(bytes.len() + 1);
        framed.push(discriminator);
        framed.extend_from_slice(&bytes);
        let _ = self.client_tx.send(Outbound::Binary(framed));
    }

    /// Ask both upstream writers to close their sockets.
    fn close_upstreams(&self) {
        let _ = self.voice_tx.send(Outbound::Close(1000));
        if let Some(video_tx) = &self.video_tx {
            let _ = video_tx.send(Outbound::Close(1000));
        }
    }
}

fn service_label(kind: UpstreamKind) -> &'static str {
    match kind {
        UpstreamKind::Voice => "voice",
        UpstreamKind::Video => "video",
    }
}

/// Drive one upgraded client socket to completion.
pub async fn run_session(socket: WebSocket, state: AppState, params: SessionParams) {
    let started = Instant::now();
    let started_at_ms = time_ms();
    let root = CancellationToken::new();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SessionEvent>();

    // Client writer/reader.
    let (ws_sink, ws_stream) = socket.split();
    let (client_tx, client_rx) = mpsc::unbounded_channel::<Outbound>();
    let writer = tokio::spawn(client_writer(ws_sink, client_rx));
    tokio::spawn(client_reader(ws_stream, event_tx.clone(), root.child_token()));

    let _ = client_tx.send(Outbound::Json(json!({ "type": "connecting" })));

    // Voice upstream, authenticated with a freshly minted token.
    let voice_token = vocara_core::token::mint_now(&state.settings.voice.secret_key);
    let voice_tx = match upstream::connect(
        &state.settings.voice.ws_url,
        Some(voice_token),
        UpstreamKind::Voice,
        event_tx.clone(),
        root.child_token(),
    )
    .await
    {
        Ok(tx) => tx,
        Err(err) => {
            warn!("voice upstream connect failed: {err}");
            fail_before_start(client_tx, writer, root).await;
            return;
        }
    };

    let mut core = SessionCore::new(&params, client_tx.clone(), voice_tx, None);

    // Video upstream: provision over REST, then open the stream socket.
    if params.kind == SessionKind::Video {
        let image_url = match params.avatar.image_url.as_deref() {
            Some(url) => url.to_string(),
            None => {
                let _ = client_tx.send(Outbound::Json(json!({
                    "type": "error",
                    "message": "avatar has no image to animate",
                })));
                fail_before_start(client_tx, writer, root).await;
                return;
            }
        };

        let session_id = core.session_id.to_string();
        let video_tx = match state.video.init_stream(&session_id, &image_url).await {
            Ok(()) => {
                let stream_url =
                    format!("{}/stream/{}", state.settings.video.ws_url, session_id);
                upstream::connect(
                    &stream_url,
                    Some(format!("Bearer {}", state.settings.video.api_key)),
                    UpstreamKind::Video,
                    event_tx.clone(),
                    root.child_token(),
                )
                .await
            }
            Err(err) => Err(err),
        };

        match video_tx {
            Ok(tx) => core.video_tx = Some(tx),
            Err(err) => {
                warn!("video upstream connect failed: {err}");
                let _ = state.video.end_stream(&session_id).await;
                fail_before_start(client_tx, writer, root).await;
                return;
            }
        }
    }

    // Voice init handshake.
    let _ = core.voice_tx.send(Outbound::Json(json!({
        "type": "init",
        "userId": &params.owner_id,
        "avatarId": &params.avatar.id,
        "voice_clone_url": &params.voice_clone_url,
        "language": &params.language,
    })));

    // One watchdog covers readiness of everything required.
    let watchdog = root.child_token();
    {
        let timeout = match params.kind {
            SessionKind::Voice => VOICE_READY_TIMEOUT,
            SessionKind::Video => VIDEO_READY_TIMEOUT,
        };
        let watchdog = watchdog.clone();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let _ = event_tx.send(SessionEvent::WatchdogFired);
                }
                _ = watchdog.cancelled() => {}
            }
        });
    }

    info!(
        session_id = %core.session_id,
        kind = params.kind.as_db_value(),
        owner_id = %params.owner_id,
        "session opened"
    );

    // The event loop is the only writer of session state. Teardown below
    // must run even if a handler panics.
    let loop_outcome = AssertUnwindSafe(event_loop(
        &mut core,
        &mut event_rx,
        &state,
        &event_tx,
        &watchdog,
    ))
    .catch_unwind()
    .await;
    let reason = match loop_outcome {
        Ok(reason) => reason,
        Err(_) => {
            warn!(session_id = %core.session_id, "session event loop panicked");
            CloseReason::Internal
        }
    };

    let elapsed_minutes = started.elapsed().as_secs_f64() / 60.0;
    finalize(
        &state.db,
        &state.usage,
        &state.chat,
        &state.video,
        &mut core,
        reason,
        elapsed_minutes,
        started_at_ms,
    )
    .await;

    // Stop the readers, then let the client writer flush the close frame.
    root.cancel();
    drop(client_tx);
    let _ = tokio::time::timeout(Duration::from_secs(5), writer).await;

    info!(session_id = %core.session_id, ?reason, "session closed");
}

async fn event_loop(
    core: &mut SessionCore,
    event_rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    state: &AppState,
    event_tx: &mpsc::UnboundedSender<SessionEvent>,
    watchdog: &CancellationToken,
) -> CloseReason {
    loop {
        let Some(event) = event_rx.recv().await else {
            return CloseReason::ClientClosed;
        };

        let outcome = core.handle(event);

        if core.phase() != Phase::Connecting && !watchdog.is_cancelled() {
            watchdog.cancel();
        }

        if let Some(user_text) = outcome.turn {
            // Post the intention and move on; the reply re-enters as an
            // event. The loop never awaits the LLM while holding state.
            let chat = state.chat.clone();
            let event_tx = event_tx.clone();
            let session_id = core.session_id.to_string();
            let system_prompt = core.avatar.persona_prompt();
            let language = core.language.clone();
            tokio::spawn(async move {
                let reply = match chat
                    .generate(&session_id, &user_text, &system_prompt, &language)
                    .await
                {
                    Ok(reply) => Some(reply),
                    Err(err) => {
                        warn!(session_id, "llm turn failed: {err}");
                        None
                    }
                };
                let _ = event_tx.send(SessionEvent::TurnFinished { reply });
            });
        }

        if let Flow::Stop(reason) = outcome.flow {
            return reason;
        }
    }
}

/// Teardown, in contract order: upstream sockets, end-stream, usage,
/// transcript, client close. Runs on every terminal path.
#[allow(clippy::too_many_arguments)]
async fn finalize(
    db: &Arc<dyn Database>,
    usage: &Arc<UsageAccountant>,
    chat: &Arc<dyn ChatModel>,
    video: &Arc<dyn VideoRender>,
    core: &mut SessionCore,
    reason: CloseReason,
    elapsed_minutes: f64,
    started_at_ms: u64,
) {
    core.close_upstreams();

    let session_id = core.session_id.to_string();
    if core.kind == SessionKind::Video {
        if let Err(err) = video.end_stream(&session_id).await {
            warn!(session_id, "end-stream failed: {err}");
        }
    }

    if elapsed_minutes > MIN_BILLABLE_MINUTES {
        usage
            .commit(
                &core.owner_id,
                UsageResource::ConversationMinutes,
                elapsed_minutes,
            )
            .await;
    }

    if !core.transcript.is_empty() {
        let record = SessionRecord {
            id: core.session_id,
            owner_id: core.owner_id.clone(),
            avatar_id: core.avatar.id.clone(),
            kind: core.kind,
            language: core.language.clone(),
            started_at_ms,
            ended_at_ms: time_ms(),
            transcript: core.transcript.clone(),
        };
        if let Err(err) = db.insert_session(&record).await {
            warn!(session_id, "failed to persist transcript: {err}");
        }
    }

    chat.forget(&session_id).await;

    let _ = core.client_tx.send(Outbound::Close(reason.close_code()));
}

/// A connect failure before the session properly starts: tell the client
/// once, close, and bail. No usage is committed.
async fn fail_before_start(
    client_tx: mpsc::UnboundedSender<Outbound>,
    writer: tokio::task::JoinHandle<()>,
    root: CancellationToken,
) {
    let _ = client_tx.send(Outbound::Json(json!({
        "type": "error",
        "message": "failed to reach upstream services",
    })));
    let _ = client_tx.send(Outbound::Close(CloseReason::UpstreamError.close_code()));
    root.cancel();
    drop(client_tx);
    let _ = tokio::time::timeout(Duration::from_secs(5), writer).await;
}

async fn client_writer(
    mut sink: futures_util::stream::SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(frame) = rx.recv().await {
        let message = match frame {
            Outbound::Json(value) => WsMessage::Text(value.to_string()),
            Outbound::Binary(bytes) => WsMessage::Binary(bytes),
            Outbound::Close(code) => {
                let _ = sink
                    .send(WsMessage::Close(Some(CloseFrame {
                        code,
                        reason: "".into(),
                    })))
                    .await;
                break;
            }
        };
        if sink.send(message).await.is_err() {
            break;
        }
    }
}

async fn client_reader(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(WsMessage::Text(text))) => {
                    if events.send(SessionEvent::ClientText(text)).is_err() {
                        break;
                    }
                }
                // The client protocol is JSON-only inbound; stray binary
                // frames are dropped.
                Some(Ok(WsMessage::Binary(_)))
                | Some(Ok(WsMessage::Ping(_)))
                | Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                    let _ = events.send(SessionEvent::ClientGone);
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vocara_core::testing::{default_avatar, TestHarness};

    struct TestSession {
        core: SessionCore,
        client_rx: mpsc::UnboundedReceiver<Outbound>,
        voice_rx: mpsc::UnboundedReceiver<Outbound>,
        video_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
    }

    fn session(kind: SessionKind) -> TestSession {
        let params = SessionParams {
            kind,
            owner_id: "user-1".to_string(),
            avatar: default_avatar(),
            voice_clone_url: Some("https://cdn.example/maya.wav".to_string()),
            language: "en".to_string(),
        };
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (voice_tx, voice_rx) = mpsc::unbounded_channel();
        let (video_tx, video_rx) = mpsc::unbounded_channel();
        let video = matches!(kind, SessionKind::Video);
        let core = SessionCore::new(
            &params,
            client_tx,
            voice_tx,
            video.then_some(video_tx),
        );
        TestSession {
            core,
            client_rx,
            voice_rx,
            video_rx: video.then_some(video_rx),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn json_types(frames: &[Outbound]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                Outbound::Json(value) => value["type"].as_str().map(str::to_string),
                _ => None,
            })
            .collect()
    }

    fn ready(kind: &str) -> String {
        json!({ "type": kind }).to_string()
    }

    #[tokio::test]
    async fn video_readiness_requires_both_upstreams() {
        let mut s = session(SessionKind::Video);

        s.core.handle(SessionEvent::VoiceText(ready("ready")));
        assert_eq!(s.core.phase(), Phase::Connecting);
        assert!(json_types(&drain(&mut s.client_rx)).is_empty());

        s.core.handle(SessionEvent::VideoText(ready("ready")));
        assert_eq!(s.core.phase(), Phase::Ready);
        assert_eq!(json_types(&drain(&mut s.client_rx)), vec!["ready"]);
    }

    #[tokio::test]
    async fn voice_only_readiness_needs_just_the_voice_service() {
        let mut s = session(SessionKind::Voice);
        s.core.handle(SessionEvent::VoiceText(ready("ready")));
        assert_eq!(s.core.phase(), Phase::Ready);
        assert_eq!(json_types(&drain(&mut s.client_rx)), vec!["ready"]);
    }

    #[tokio::test]
    async fn barge_in_confirms_without_waiting_for_upstream() {
        let mut s = session(SessionKind::Video);
        s.core.handle(SessionEvent::VoiceText(ready("ready")));
        s.core.handle(SessionEvent::VideoText(ready("ready")));
        drain(&mut s.client_rx);

        let stop = json!({ "type": "stop_speaking" }).to_string();
        let outcome = s.core.handle(SessionEvent::ClientText(stop));
        assert!(matches!(outcome.flow, Flow::Continue));

        // The client hears speech_end in the same event-loop turn.
        assert_eq!(json_types(&drain(&mut s.client_rx)), vec!["speech_end"]);
        assert_eq!(
            json_types(&drain(&mut s.voice_rx)),
            vec!["stop_speaking"]
        );
        assert_eq!(
            json_types(&drain(s.video_rx.as_mut().unwrap())),
            vec!["stop_speaking"]
        );
    }

    #[tokio::test]
    async fn turns_are_strictly_serialized() {
        let mut s = session(SessionKind::Voice);
        s.core.handle(SessionEvent::VoiceText(ready("ready")));
        drain(&mut s.client_rx);

        let user = |text: &str| json!({ "type": "user_text", "text": text }).to_string();

        let first = s.core.handle(SessionEvent::ClientText(user("one")));
        assert_eq!(first.turn.as_deref(), Some("one"));
        assert_eq!(s.core.phase(), Phase::Active);

        // Second turn arrives while the first is thinking: queued, not run.
        let second = s.core.handle(SessionEvent::ClientText(user("two")));
        assert!(second.turn.is_none());

        let done = s.core.handle(SessionEvent::TurnFinished {
            reply: Some("reply one".to_string()),
        });
        assert_eq!(done.turn.as_deref(), Some("two"));

        assert_eq!(
            json_types(&drain(&mut s.client_rx)),
            vec!["llm_response_text"]
        );
        assert_eq!(json_types(&drain(&mut s.voice_rx)), vec!["text_to_speak"]);

        // Transcript holds user, model, user in order.
        let roles: Vec<_> = s.core.transcript().iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![
                TranscriptRole::User,
                TranscriptRole::User,
                TranscriptRole::Model
            ]
        );
    }

    #[tokio::test]
    async fn llm_failure_speaks_the_fallback_line() {
        let mut s = session(SessionKind::Voice);
        s.core.handle(SessionEvent::VoiceText(ready("ready")));
        let user = json!({ "type": "user_text", "text": "hello" }).to_string();
        s.core.handle(SessionEvent::ClientText(user));
        drain(&mut s.client_rx);
        drain(&mut s.voice_rx);

        s.core.handle(SessionEvent::TurnFinished { reply: None });

        let frames = drain(&mut s.client_rx);
        let text = frames
            .iter()
            .find_map(|f| match f {
                Outbound::Json(v) if v["type"] == "llm_response_text" => {
                    v["text"].as_str().map(str::to_string)
                }
                _ => None,
            })
            .expect("llm_response_text frame");
        assert_eq!(text, FALLBACK_REPLY);

        let spoken = drain(&mut s.voice_rx);
        assert_eq!(json_types(&spoken), vec!["text_to_speak"]);
    }

    #[tokio::test]
    async fn voice_audio_fans_out_to_video_and_client() {
        let mut s = session(SessionKind::Video);
        s.core.handle(SessionEvent::VoiceAudio(vec![9, 8, 7]));

        let to_video = drain(s.video_rx.as_mut().unwrap());
        assert_eq!(to_video, vec![Outbound::Binary(vec![9, 8, 7])]);

        let to_client = drain(&mut s.client_rx);
        assert_eq!(
            to_client,
            vec![Outbound::Binary(vec![FRAME_AUDIO, 9, 8, 7])]
        );
    }

    #[tokio::test]
    async fn video_frames_reach_the_client_with_their_discriminator() {
        let mut s = session(SessionKind::Video);
        s.core.handle(SessionEvent::VideoBinary(vec![5, 5]));
        assert_eq!(
            drain(&mut s.client_rx),
            vec![Outbound::Binary(vec![FRAME_VIDEO, 5, 5])]
        );
    }

    #[tokio::test]
    async fn watchdog_only_fires_while_connecting() {
        let mut s = session(SessionKind::Video);
        let outcome = s.core.handle(SessionEvent::WatchdogFired);
        assert!(matches!(
            outcome.flow,
            Flow::Stop(CloseReason::ReadinessTimeout)
        ));
        assert_eq!(s.core.phase(), Phase::Failed);

        let mut active = session(SessionKind::Voice);
        active.core.handle(SessionEvent::VoiceText(ready("ready")));
        let outcome = active.core.handle(SessionEvent::WatchdogFired);
        assert!(matches!(outcome.flow, Flow::Continue));
    }

    #[tokio::test]
    async fn upstream_error_fails_the_session_once() {
        let mut s = session(SessionKind::Voice);
        let error = json!({ "type": "error", "message": "voice model crashed" }).to_string();
        let outcome = s.core.handle(SessionEvent::VoiceText(error));
        assert!(matches!(outcome.flow, Flow::Stop(CloseReason::UpstreamError)));

        let frames = drain(&mut s.client_rx);
        assert_eq!(json_types(&frames), vec!["error"]);
    }

    #[tokio::test]
    async fn finalize_commits_minutes_once_and_persists_transcript() {
        let harness = TestHarness::with_default_avatar().await;
        let mut s = session(SessionKind::Video);
        s.core.handle(SessionEvent::VoiceText(ready("ready")));
        s.core.handle(SessionEvent::VideoText(ready("ready")));
        let user = json!({ "type": "user_text", "text": "hi" }).to_string();
        s.core.handle(SessionEvent::ClientText(user));
        s.core.handle(SessionEvent::TurnFinished {
            reply: Some("hello!".to_string()),
        });

        let db: Arc<dyn Database> = harness.db.clone();
        let video: Arc<dyn VideoRender> = harness.video.clone();
        let chat: Arc<dyn ChatModel> = harness.chat.clone();
        finalize(
            &db,
            &harness.usage,
            &chat,
            &video,
            &mut s.core,
            CloseReason::ClientClosed,
            2.0,
            1_000,
        )
        .await;

        let used = harness
            .usage_used("user-1", UsageResource::ConversationMinutes)
            .await;
        assert!((used - 2.0).abs() < 1e-9);

        let sessions = harness.db.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].transcript.len(), 2);

        // end-stream was called for the video session and the LLM window
        // was dropped.
        let calls = harness.video.stream_calls().await;
        assert_eq!(calls, vec![format!("end:{}", s.core.session_id)]);
        assert_eq!(
            harness.chat.forgotten().await,
            vec![s.core.session_id.to_string()]
        );

        // The client got a close frame with the normal code.
        let frames: Vec<_> = drain(&mut s.client_rx)
            .into_iter()
            .filter(|f| matches!(f, Outbound::Close(_)))
            .collect();
        assert_eq!(frames, vec![Outbound::Close(1000)]);
    }

    #[tokio::test]
    async fn short_or_empty_sessions_bill_and_persist_nothing() {
        let harness = TestHarness::with_default_avatar().await;
        let mut s = session(SessionKind::Voice);

        let db: Arc<dyn Database> = harness.db.clone();
        let video: Arc<dyn VideoRender> = harness.video.clone();
        let chat: Arc<dyn ChatModel> = harness.chat.clone();
        finalize(
            &db,
            &harness.usage,
            &chat,
            &video,
            &mut s.core,
            CloseReason::ReadinessTimeout,
            0.05,
            1_000,
        )
        .await;

        let used = harness
            .usage_used("user-1", UsageResource::ConversationMinutes)
            .await;
        assert_eq!(used, 0.0);
        assert!(harness.db.sessions().await.is_empty());
        // Voice-only teardown never calls end-stream.
        assert!(harness.video.stream_calls().await.is_empty());

        let closes: Vec<_> = drain(&mut s.client_rx)
            .into_iter()
            .filter(|f| matches!(f, Outbound::Close(_)))
            .collect();
        assert_eq!(
            closes,
            vec![Outbound::Close(CloseReason::ReadinessTimeout.close_code())]
        );
    }
}
