//! Bearer credential decoding.
//!
//! Access and refresh credentials are JWT-shaped: three dot-separated
//! base64url segments. Only the payload is read here. Signature
//! verification is the server's job, so nothing in this module should be
//! used to make a trust decision.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Credential is not a three-segment token (found {0} segments)")]
    Malformed(usize),

    #[error("Credential payload is not base64url: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Credential payload is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Credential carries no expiry claim")]
    MissingExpiry,

    #[error("Credential expiry {0} is out of range")]
    ExpiryOutOfRange(i64),
}

/// The subset of registered and private claims the session layer reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    pub exp: Option<i64>,
    pub sub: Option<String>,
    pub role: Option<String>,
}

/// Decode the payload segment of a bearer credential without verifying it.
pub fn decode_claims(credential: &str) -> Result<Claims, DecodeError> {
    let segments: Vec<&str> = credential.split('.').collect();
    if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
        return Err(DecodeError::Malformed(segments.len()));
    }

    // Some issuers pad their segments even though RFC 7515 forbids it
    let payload = URL_SAFE_NO_PAD.decode(segments[1].trim_end_matches('='))?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Decode the `exp` claim of a bearer credential as an instant.
pub fn decode_expiry(credential: &str) -> Result<DateTime<Utc>, DecodeError> {
    let exp = decode_claims(credential)?
        .exp
        .ok_or(DecodeError::MissingExpiry)?;
    DateTime::from_timestamp(exp, 0).ok_or(DecodeError::ExpiryOutOfRange(exp))
}

/// A raw bearer credential paired with its derived expiry.
#[derive(Debug, Clone)]
pub struct Credential<'a> {
    pub raw: &'a str,
    pub expires_at: Option<DateTime<Utc>>,
}

impl<'a> Credential<'a> {
    pub fn parse(raw: &'a str) -> Self {
        Self {
            raw,
            expires_at: decode_expiry(raw).ok(),
        }
    }

    /// Time left before expiry. An undecodable credential counts as
    /// already expired.
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> chrono::Duration {
        match self.expires_at {
            Some(expiry) => expiry - now,
            None => chrono::Duration::zero(),
        }
    }

    /// Whether the credential should be exchanged before it is used again.
    pub fn needs_refresh(&self, window: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.time_until_expiry(now) <= window
    }
}
