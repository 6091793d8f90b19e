//! Typed clients for the upstream services the control plane orchestrates.

mod auth;
mod llm;
mod video;
mod voice;

pub use auth::{RemoteTokenVerifier, TokenVerifier};
pub use llm::{ChatModel, HttpChatClient, HISTORY_WINDOW};
pub use video::{HttpVideoClient, PollReply, VideoRender};
pub use voice::{HttpVoiceClient, SynthesisRequest, VoiceSynth};
