//! Webhook trust and ingestion pipeline for Hookline
//!
//! This crate authenticates and ingests provider push notifications:
//! - Request signature verification over the exact received bytes
//! - Signed-request (`signature.payload`) decoding and validation
//! - The subscription verification handshake
//! - Event classification and dedup identity derivation
//! - At-least-once ingestion with duplicate detection
//! - Retry bookkeeping and per-account statistics
//!
//! # Example
//!
//! ```rust,ignore
//! use hookline_webhook::{InMemoryWebhookStore, StaticAccountDirectory, WebhookState};
//! use std::sync::Arc;
//!
//! let state = WebhookState::build(
//!     &webhook_config,
//!     &ingestion_config,
//!     Arc::new(InMemoryWebhookStore::default()),
//!     Arc::new(StaticAccountDirectory::from_bindings(&bindings)),
//!     handler,
//! );
//! let router = hookline_webhook::create_webhook_router(Arc::new(state));
//! ```

// Module order matters due to dependencies
pub mod events;
pub mod signature;
pub mod signed_request;
pub mod handshake;
pub mod classifier;
pub mod store;
pub mod accounts;
pub mod ledger;
pub mod stats;
pub mod dispatch;
pub mod subscriptions;
pub mod ingestion;
pub mod inbound;

pub use events::*;
pub use signature::*;
pub use signed_request::*;
pub use handshake::*;
pub use classifier::*;
pub use store::*;
pub use accounts::*;
pub use ledger::*;
pub use stats::*;
pub use dispatch::*;
pub use subscriptions::*;
pub use ingestion::*;
pub use inbound::*;

use thiserror::Error;
use tracing::warn;

/// Reasons an inbound payload failed to prove it came from the provider.
///
/// These never leave the process: [`TrustError::reject`] logs the kind and
/// collapses it into the opaque [`WebhookError::Rejected`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrustError {
    #[error("Signature invalid")]
    SignatureInvalid,

    #[error("Timestamp out of range: {0} seconds of skew")]
    TimestampOutOfRange(i64),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Handshake mismatch")]
    HandshakeMismatch,
}

impl TrustError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SignatureInvalid => "signature_invalid",
            Self::TimestampOutOfRange(_) => "timestamp_out_of_range",
            Self::MalformedInput(_) => "malformed_input",
            Self::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            Self::HandshakeMismatch => "handshake_mismatch",
        }
    }

    /// Log the detailed reason and return the uniform rejection
    pub fn reject(self) -> WebhookError {
        warn!(kind = self.kind(), reason = %self, "Rejecting unauthenticated request");
        WebhookError::Rejected
    }
}

/// Webhook errors
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Request rejected")]
    Rejected,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden")]
    Forbidden,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for WebhookError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WebhookError>;
