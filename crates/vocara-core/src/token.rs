//! Short-lived HMAC tokens for the voice-synthesis service.
//!
//! Wire form: `VOICE_CLONE_AUTH-` ++ base64url(`<hex_signature>.<unix_seconds>`)
//! where `hex_signature = hex(HMAC-SHA256(secret, utf8(unix_seconds)))`.
//! Minting is stateless per call; the service re-derives and compares.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Literal prefix the voice service matches on.
pub const TOKEN_PREFIX: &str = "VOICE_CLONE_AUTH-";

/// Token parts recovered by [`decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedToken {
    pub unix_seconds: u64,
    pub hex_signature: String,
}

/// Mint a token for the current clock second.
pub fn mint_now(secret: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    mint(secret, now)
}

/// Mint a token for an explicit timestamp.
pub fn mint(secret: &str, unix_seconds: u64) -> String {
    let signature = sign(secret, unix_seconds);
    let payload = format!("{signature}.{unix_seconds}");
    format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(payload))
}

/// Recover `(hex_signature, unix_seconds)` from a token without checking
/// the signature.
pub fn decode(token: &str) -> Result<DecodedToken> {
    let encoded = token
        .strip_prefix(TOKEN_PREFIX)
        .ok_or(Error::Unauthorized)?;
    let payload = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| Error::Unauthorized)?;
    let payload = String::from_utf8(payload).map_err(|_| Error::Unauthorized)?;

    let (signature, seconds) = payload.rsplit_once('.').ok_or(Error::Unauthorized)?;
    let unix_seconds = seconds.parse::<u64>().map_err(|_| Error::Unauthorized)?;

    Ok(DecodedToken {
        unix_seconds,
        hex_signature: signature.to_string(),
    })
}

/// Re-derive the signature under `secret` and compare.
pub fn verify(secret: &str, token: &str) -> Result<DecodedToken> {
    let decoded = decode(token)?;
    if sign(secret, decoded.unix_seconds) != decoded.hex_signature {
        return Err(Error::Unauthorized);
    }
    Ok(decoded)
}

fn sign(secret: &str, unix_seconds: u64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(unix_seconds.to_string().as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}
