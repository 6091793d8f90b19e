//! Core domain and pipeline machinery for the Vocara avatar platform.
//!
//! The server crate wires these pieces to the HTTP/WebSocket surface:
//! typed clients for the upstream GPU services ([`clients`]), the hosted
//! persistence abstractions ([`db`], [`object_store`]), the generation-job
//! pipeline ([`jobs`]), and the usage accounting that gates it all
//! ([`usage`]).

pub mod api_key;
pub mod avatar;
pub mod chunker;
pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod jobs;
pub mod object_store;
pub mod session;
pub mod testing;
pub mod token;
pub mod usage;
pub mod wav;

pub use error::{Error, Result};

/// Current unix time in milliseconds.
pub fn time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
