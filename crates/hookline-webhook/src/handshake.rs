//! Subscription verification handshake
//!
//! Answers the provider's `GET` challenge issued when a webhook endpoint is
//! registered.

use crate::signature::{compare_digests, SubtleComparator};
use serde::Deserialize;
use tracing::{info, warn};

/// The only mode the provider uses for endpoint registration
pub const SUBSCRIBE_MODE: &str = "subscribe";

/// Query parameters of the verification request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

impl HandshakeQuery {
    pub fn answer(&self, expected_token: &str) -> Option<String> {
        verify_handshake(
            self.mode.as_deref(),
            self.verify_token.as_deref(),
            self.challenge.as_deref(),
            expected_token,
        )
    }
}

/// Return the challenge verbatim when mode and token both match.
///
/// Absence means failure; callers must not reveal which check failed.
pub fn verify_handshake(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&str>,
    expected_token: &str,
) -> Option<String> {
    let challenge = challenge?;

    if mode != Some(SUBSCRIBE_MODE) {
        warn!(mode = ?mode, "Webhook handshake rejected");
        return None;
    }

    let token_matches = !expected_token.is_empty()
        && token.is_some_and(|t| {
            compare_digests(&SubtleComparator, expected_token.as_bytes(), t.as_bytes())
        });
    if !token_matches {
        warn!("Webhook handshake rejected");
        return None;
    }

    info!("Webhook handshake verified");
    Some(challenge.to_string())
}
