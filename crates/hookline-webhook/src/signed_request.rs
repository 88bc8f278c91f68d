//! Signed request handling
//!
//! Decodes and validates the provider's compact `signature.payload` format
//! used by authorization-flow callbacks. Both halves are base64url; the
//! signature is HMAC-SHA256 over the encoded payload segment, and the JSON
//! payload must carry `algorithm` and `issued_at`.

use crate::{
    signature::{compare_digests, compute_hmac, DigestComparator, SubtleComparator},
    Result, TrustError,
};
use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// The only algorithm the provider signs with
pub const SIGNED_REQUEST_ALGORITHM: &str = "HMAC-SHA256";

/// Default freshness window for `issued_at`, in seconds
pub const DEFAULT_TOLERANCE_SECONDS: i64 = 300;

/// base64url that accepts padded and unpadded input and emits unpadded output
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decoded signed request payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignedRequestPayload {
    pub algorithm: String,
    /// Unix seconds
    pub issued_at: i64,
    /// Provider-defined fields (user id, etc.)
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl SignedRequestPayload {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Codec for `base64url(signature).base64url(json)` signed requests
#[derive(Clone)]
pub struct SignedPayloadCodec {
    tolerance_seconds: i64,
    comparator: Arc<dyn DigestComparator>,
}

impl SignedPayloadCodec {
    pub fn new() -> Self {
        Self {
            tolerance_seconds: DEFAULT_TOLERANCE_SECONDS,
            comparator: Arc::new(SubtleComparator),
        }
    }

    pub fn with_tolerance(mut self, tolerance_seconds: i64) -> Self {
        self.tolerance_seconds = tolerance_seconds;
        self
    }

    pub fn with_comparator(mut self, comparator: Arc<dyn DigestComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Decode without checking the signature or freshness
    pub fn decode(&self, signed_request: &str) -> std::result::Result<SignedRequestPayload, TrustError> {
        let (_, payload_segment) = split_segments(signed_request)?;

        let payload_bytes = URL_SAFE_LENIENT
            .decode(payload_segment)
            .map_err(|e| TrustError::MalformedInput(format!("payload is not base64url: {}", e)))?;

        let value: Value = serde_json::from_slice(&payload_bytes)
            .map_err(|e| TrustError::MalformedInput(format!("payload is not JSON: {}", e)))?;
        let Value::Object(mut fields) = value else {
            return Err(TrustError::MalformedInput(
                "payload is not a JSON object".to_string(),
            ));
        };

        let algorithm = match fields.remove("algorithm") {
            Some(Value::String(algorithm)) => algorithm,
            _ => {
                return Err(TrustError::MalformedInput(
                    "missing algorithm".to_string(),
                ))
            }
        };

        let issued_at = match fields.remove("issued_at") {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| TrustError::MalformedInput("issued_at out of range".to_string()))?,
            _ => {
                return Err(TrustError::MalformedInput(
                    "missing or non-numeric issued_at".to_string(),
                ))
            }
        };

        if !algorithm.eq_ignore_ascii_case(SIGNED_REQUEST_ALGORITHM) {
            return Err(TrustError::UnsupportedAlgorithm(algorithm));
        }

        Ok(SignedRequestPayload {
            algorithm,
            issued_at,
            fields,
        })
    }

    /// Decode, check the signature, then check freshness against `now`
    pub fn verify_at(
        &self,
        signed_request: &str,
        secret: &str,
        now: i64,
    ) -> std::result::Result<SignedRequestPayload, TrustError> {
        let payload = self.decode(signed_request)?;
        let (signature_segment, payload_segment) = split_segments(signed_request)?;

        if secret.is_empty() {
            return Err(TrustError::SignatureInvalid);
        }

        let provided = URL_SAFE_LENIENT
            .decode(signature_segment)
            .map_err(|e| TrustError::MalformedInput(format!("signature is not base64url: {}", e)))?;
        let expected = compute_hmac(secret.as_bytes(), payload_segment.as_bytes())
            .ok_or(TrustError::SignatureInvalid)?;

        if !compare_digests(self.comparator.as_ref(), &expected, &provided) {
            return Err(TrustError::SignatureInvalid);
        }

        let skew = now.abs_diff(payload.issued_at);
        if skew > self.tolerance_seconds.unsigned_abs() {
            return Err(TrustError::TimestampOutOfRange(
                i64::try_from(skew).unwrap_or(i64::MAX),
            ));
        }

        debug!(issued_at = payload.issued_at, "Signed request verified");
        Ok(payload)
    }

    /// Validate against the current clock.
    ///
    /// Every failure is logged and collapsed to [`crate::WebhookError::Rejected`].
    pub fn validate(&self, signed_request: &str, secret: &str) -> Result<SignedRequestPayload> {
        self.verify_at(signed_request, secret, Utc::now().timestamp())
            .map_err(TrustError::reject)
    }

    /// Build a signed request carrying `fields` issued at `issued_at`
    pub fn encode(
        &self,
        fields: Map<String, Value>,
        issued_at: i64,
        secret: &str,
    ) -> Result<String> {
        let mut payload = fields;
        payload.insert(
            "algorithm".to_string(),
            Value::String(SIGNED_REQUEST_ALGORITHM.to_string()),
        );
        payload.insert("issued_at".to_string(), Value::from(issued_at));

        let json = serde_json::to_vec(&Value::Object(payload))?;
        let payload_segment = URL_SAFE_LENIENT.encode(json);
        let signature = compute_hmac(secret.as_bytes(), payload_segment.as_bytes())
            .ok_or_else(|| crate::WebhookError::InvalidPayload("unusable secret".to_string()))?;

        Ok(format!(
            "{}.{}",
            URL_SAFE_LENIENT.encode(signature),
            payload_segment
        ))
    }
}

impl Default for SignedPayloadCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn split_segments(signed_request: &str) -> std::result::Result<(&str, &str), TrustError> {
    if signed_request.trim().is_empty() {
        return Err(TrustError::MalformedInput("empty signed request".to_string()));
    }

    let mut parts = signed_request.split('.');
    let (Some(signature), Some(payload), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(TrustError::MalformedInput(
            "expected exactly one '.' separator".to_string(),
        ));
    };

    if signature.is_empty() || payload.is_empty() {
        return Err(TrustError::MalformedInput("empty segment".to_string()));
    }

    Ok((signature, payload))
}
