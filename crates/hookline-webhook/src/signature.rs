//! Webhook signature handling
//!
//! Verifies `X-Hub-Signature-256` HMAC-SHA256 signatures over the raw body.
//! The bytes handed to [`SignatureVerifier::verify`] must be exactly the
//! bytes received on the wire; hashing a re-serialized body yields a
//! different digest than the provider computed.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the `X-Hub-Signature-256` header value
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Equality primitive used once digest lengths are known to match
pub trait DigestComparator: Send + Sync {
    fn equals(&self, expected: &[u8], actual: &[u8]) -> bool;
}

/// Constant-time comparison backed by `subtle`
#[derive(Debug, Default, Clone, Copy)]
pub struct SubtleComparator;

impl DigestComparator for SubtleComparator {
    fn equals(&self, expected: &[u8], actual: &[u8]) -> bool {
        expected.ct_eq(actual).into()
    }
}

/// Compare two digests, checking lengths before the constant-time primitive.
///
/// Mismatched lengths return `false` without invoking `comparator`.
pub fn compare_digests(comparator: &dyn DigestComparator, expected: &[u8], actual: &[u8]) -> bool {
    if expected.len() != actual.len() {
        return false;
    }
    comparator.equals(expected, actual)
}

/// Compute raw HMAC-SHA256
pub fn compute_hmac(secret: &[u8], data: &[u8]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(data);
    Some(mac.finalize().into_bytes().to_vec())
}

/// Produce an `X-Hub-Signature-256` header value for `raw_body`
pub fn sign_body(raw_body: &[u8], secret: &str) -> Option<String> {
    compute_hmac(secret.as_bytes(), raw_body)
        .map(|digest| format!("{}{}", SIGNATURE_PREFIX, hex::encode(digest)))
}

/// Verifier for provider request signatures
#[derive(Clone)]
pub struct SignatureVerifier {
    comparator: Arc<dyn DigestComparator>,
}

impl SignatureVerifier {
    pub fn new() -> Self {
        Self {
            comparator: Arc::new(SubtleComparator),
        }
    }

    /// Create with a custom comparison primitive
    pub fn with_comparator(comparator: Arc<dyn DigestComparator>) -> Self {
        Self { comparator }
    }

    /// Verify a signature header against the raw request body.
    ///
    /// Never errors: every failure is logged and reported as `false`.
    pub fn verify(&self, signature_header: Option<&str>, raw_body: &[u8], secret: &str) -> bool {
        let Some(header) = signature_header.map(str::trim).filter(|h| !h.is_empty()) else {
            warn!("Missing webhook signature header");
            return false;
        };

        if secret.is_empty() {
            warn!("Webhook secret is not configured");
            return false;
        }

        let hex_signature = header.strip_prefix(SIGNATURE_PREFIX).unwrap_or(header);
        let provided = match hex::decode(hex_signature) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to decode webhook signature hex");
                return false;
            }
        };

        let Some(expected) = compute_hmac(secret.as_bytes(), raw_body) else {
            warn!("Failed to initialise HMAC");
            return false;
        };

        let valid = compare_digests(self.comparator.as_ref(), &expected, &provided);
        if valid {
            debug!(body_len = raw_body.len(), "Webhook signature verified");
        } else {
            warn!(
                expected_len = expected.len(),
                provided_len = provided.len(),
                "Webhook signature mismatch"
            );
        }
        valid
    }
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self::new()
    }
}
