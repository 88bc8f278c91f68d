//! Core configuration for the Hookline webhook ingestion service.
//!
//! Every tunable of the trust and ingestion pipeline lives here so the
//! server binary and the library crates agree on defaults.

pub mod config;

pub use config::*;

/// Header carrying the HMAC-SHA256 signature of a webhook delivery.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Legacy SHA-1 signature header. Logged, never used for verification.
pub const LEGACY_SIGNATURE_HEADER: &str = "x-hub-signature";

/// Header the upstream auth layer uses to pass the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";
