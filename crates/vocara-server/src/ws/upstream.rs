//! Websocket plumbing toward the voice and video services.
//!
//! Each upstream gets a writer task fed by an [`Outbound`] channel and a
//! reader task that translates frames into [`SessionEvent`]s. Readers stop
//! on the session's root cancellation; writers stop when their channel
//! closes or after sending a close frame.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vocara_core::error::{Error, Result};

use crate::ws::mediator::{Outbound, SessionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpstreamKind {
    Voice,
    Video,
}

impl UpstreamKind {
    const fn service_name(self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Video => "video",
        }
    }

    fn text_event(self, raw: String) -> SessionEvent {
        match self {
            Self::Voice => SessionEvent::VoiceText(raw),
            Self::Video => SessionEvent::VideoText(raw),
        }
    }

    fn binary_event(self, bytes: Vec<u8>) -> SessionEvent {
        match self {
            Self::Voice => SessionEvent::VoiceAudio(bytes),
            Self::Video => SessionEvent::VideoBinary(bytes),
        }
    }

    fn gone_event(self) -> SessionEvent {
        match self {
            Self::Voice => SessionEvent::VoiceGone,
            Self::Video => SessionEvent::VideoGone,
        }
    }
}

/// Open the upstream socket and start its reader/writer tasks. Returns
/// the sender the mediator writes through.
pub(crate) async fn connect(
    url: &str,
    auth_header: Option<String>,
    kind: UpstreamKind,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) -> Result<mpsc::UnboundedSender<Outbound>> {
    let unavailable = |reason: String| Error::UpstreamUnavailable {
        service: kind.service_name(),
        reason,
    };

    let mut request = url
        .into_client_request()
        .map_err(|err| unavailable(format!("invalid websocket url: {err}")))?;
    if let Some(value) = auth_header {
        let value = value
            .parse()
            .map_err(|_| unavailable("auth header is not valid header text".to_string()))?;
        request.headers_mut().insert("Authorization", value);
    }

    let (stream, _) = connect_async(request)
        .await
        .map_err(|err| unavailable(err.to_string()))?;
    debug!(service = kind.service_name(), url, "upstream websocket open");

    let (mut sink, mut source) = stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let message = match frame {
                Outbound::Json(value) => Message::Text(value.to_string()),
                Outbound::Binary(bytes) => Message::Binary(bytes),
                Outbound::Close(code) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
            };
            if let Err(err) = sink.send(message).await {
                warn!(service = kind.service_name(), "upstream send failed: {err}");
                break;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = source.next() => match next {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(kind.text_event(text)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if events.send(kind.binary_event(bytes)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        let _ = events.send(kind.gone_event());
                        break;
                    }
                },
            }
        }
    });

    Ok(out_tx)
}
