//! Webhook signature verification
//!
//! The provider signs deliveries with the Standard Webhooks scheme:
//!
//! ```text
//! webhook-id:        msg_2KWPBgLlAfxdpx2AI54pPJ85f4W
//! webhook-timestamp: 1674087231
//! webhook-signature: v1,K5oZfzN95Z9UVu1EsfQmfVNQhnkZ2pj9o9NDN/H/pI4=
//! ```
//!
//! The MAC is HMAC-SHA256 over `{id}.{timestamp}.{raw body}`, keyed by the
//! base64 secret that follows the `whsec_` prefix. Several space-separated
//! signatures may be present during secret rotation; any match is accepted.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use subtle::{Choice, ConstantTimeEq};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_WEBHOOK_ID: &str = "webhook-id";
pub const HEADER_WEBHOOK_SIGNATURE: &str = "webhook-signature";
pub const HEADER_WEBHOOK_TIMESTAMP: &str = "webhook-timestamp";

const SECRET_PREFIX: &str = "whsec_";
const SIGNATURE_VERSION: &str = "v1";

/// Default accepted clock skew between the provider and us
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

/// The three transport headers every delivery must carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookHeaders {
    /// Delivery id, stable across retries of one delivery
    pub id: String,
    pub signature: String,
    pub timestamp: String,
}

impl WebhookHeaders {
    /// Collect the headers, failing on the first one that is absent or blank
    pub fn from_parts(
        id: Option<&str>,
        signature: Option<&str>,
        timestamp: Option<&str>,
    ) -> BillingResult<Self> {
        fn required(value: Option<&str>, name: &'static str) -> BillingResult<String> {
            match value.map(str::trim) {
                Some(v) if !v.is_empty() => Ok(v.to_string()),
                _ => Err(BillingError::MissingHeader(name)),
            }
        }

        Ok(Self {
            id: required(id, HEADER_WEBHOOK_ID)?,
            signature: required(signature, HEADER_WEBHOOK_SIGNATURE)?,
            timestamp: required(timestamp, HEADER_WEBHOOK_TIMESTAMP)?,
        })
    }
}

/// Verifies inbound deliveries against the shared secret
#[derive(Clone)]
pub struct SignatureVerifier {
    key: Vec<u8>,
    tolerance: Duration,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("key", &"[REDACTED]")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl SignatureVerifier {
    /// Build a verifier from the configured secret.
    ///
    /// An empty secret is a configuration error, never an open door.
    pub fn new(secret: &str, tolerance: Duration) -> BillingResult<Self> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(BillingError::Config(
                "webhook secret must not be empty".to_string(),
            ));
        }

        let key = match secret.strip_prefix(SECRET_PREFIX) {
            Some(encoded) => BASE64.decode(encoded).map_err(|_| {
                BillingError::Config("webhook secret is not valid base64".to_string())
            })?,
            None => secret.as_bytes().to_vec(),
        };

        if key.is_empty() {
            return Err(BillingError::Config(
                "webhook secret decodes to an empty key".to_string(),
            ));
        }

        Ok(Self { key, tolerance })
    }

    /// Verify a delivery and parse its body
    pub fn verify(
        &self,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> BillingResult<serde_json::Value> {
        self.verify_at(headers, body, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify against an explicit clock, in Unix seconds
    pub fn verify_at(
        &self,
        headers: &WebhookHeaders,
        body: &[u8],
        now: i64,
    ) -> BillingResult<serde_json::Value> {
        // Both checks always run so the failure path is the same for either cause
        let timestamp_ok = headers
            .timestamp
            .trim()
            .parse::<i64>()
            .map(|ts| now.abs_diff(ts) <= self.tolerance.as_secs())
            .unwrap_or(false);

        let expected = self.compute(&headers.id, headers.timestamp.trim(), body)?;

        let mut signature_ok = Choice::from(0u8);
        for entry in headers.signature.split_whitespace() {
            let Some((version, encoded)) = entry.split_once(',') else {
                continue;
            };
            if version != SIGNATURE_VERSION {
                continue;
            }
            if let Ok(provided) = BASE64.decode(encoded) {
                signature_ok |= expected.as_slice().ct_eq(provided.as_slice());
            }
        }

        if !(bool::from(signature_ok) && timestamp_ok) {
            tracing::warn!(
                delivery_id = %headers.id,
                body_len = body.len(),
                "Webhook signature verification failed"
            );
            return Err(BillingError::InvalidSignature);
        }

        serde_json::from_slice(body)
            .map_err(|e| BillingError::InvalidEnvelope(format!("body is not valid JSON: {e}")))
    }

    /// Produce a `v1,<base64>` signature header value
    pub fn sign(&self, id: &str, timestamp: i64, body: &[u8]) -> BillingResult<String> {
        let mac = self.compute(id, &timestamp.to_string(), body)?;
        Ok(format!("{SIGNATURE_VERSION},{}", BASE64.encode(mac)))
    }

    fn compute(&self, id: &str, timestamp: &str, body: &[u8]) -> BillingResult<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| BillingError::Internal("invalid webhook key length".to_string()))?;
        mac.update(id.as_bytes());
        mac.update(b".");
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";
    const NOW: i64 = 1_736_850_000;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE).unwrap()
    }

    fn signed(body: &[u8], timestamp: i64) -> WebhookHeaders {
        let signature = verifier().sign("msg_1", timestamp, body).unwrap();
        WebhookHeaders {
            id: "msg_1".to_string(),
            signature,
            timestamp: timestamp.to_string(),
        }
    }

    #[test]
    fn test_valid_signature_returns_parsed_body() {
        let body = br#"{"id":"evt_1","type":"payment.succeeded","data":{"object":{}}}"#;
        let headers = signed(body, NOW);

        let value = verifier().verify_at(&headers, body, NOW).unwrap();
        assert_eq!(value["id"], "evt_1");
    }

    #[test]
    fn test_every_single_byte_mutation_is_rejected() {
        let body = br#"{"id":"evt_1","type":"payment.succeeded","data":{"object":{"amount":1999}}}"#;
        let headers = signed(body, NOW);

        for i in 0..body.len() {
            let mut tampered = body.to_vec();
            tampered[i] ^= 0x01;
            let result = verifier().verify_at(&headers, &tampered, NOW);
            assert!(
                matches!(result, Err(BillingError::InvalidSignature)),
                "mutation at byte {} was accepted",
                i
            );
        }
    }

    #[test]
    fn test_stale_and_future_timestamps_rejected() {
        let body = br#"{"id":"evt_1"}"#;

        let stale = signed(body, NOW - 301);
        assert!(matches!(
            verifier().verify_at(&stale, body, NOW),
            Err(BillingError::InvalidSignature)
        ));

        let future = signed(body, NOW + 301);
        assert!(matches!(
            verifier().verify_at(&future, body, NOW),
            Err(BillingError::InvalidSignature)
        ));

        let edge = signed(body, NOW - 300);
        assert!(verifier().verify_at(&edge, body, NOW).is_ok());
    }

    #[test]
    fn test_timestamp_is_part_of_the_mac() {
        let body = br#"{"id":"evt_1"}"#;
        let mut headers = signed(body, NOW);
        headers.timestamp = (NOW - 1).to_string();

        assert!(matches!(
            verifier().verify_at(&headers, body, NOW),
            Err(BillingError::InvalidSignature)
        ));
    }

    #[test]
    fn test_delivery_id_is_part_of_the_mac() {
        let body = br#"{"id":"evt_1"}"#;
        let mut headers = signed(body, NOW);
        headers.id = "msg_2".to_string();

        assert!(verifier().verify_at(&headers, body, NOW).is_err());
    }

    #[test]
    fn test_any_of_several_signatures_matches() {
        let body = br#"{"id":"evt_1"}"#;
        let mut headers = signed(body, NOW);
        headers.signature = format!("v1,Zm9vYmFy v1a,ignored {}", headers.signature);

        assert!(verifier().verify_at(&headers, body, NOW).is_ok());
    }

    #[test]
    fn test_malformed_signature_headers_rejected() {
        let body = br#"{"id":"evt_1"}"#;
        for signature in ["", "v1", "v1,", "v1,not base64!", "v2,abcd", "garbage"] {
            let headers = WebhookHeaders {
                id: "msg_1".to_string(),
                signature: signature.to_string(),
                timestamp: NOW.to_string(),
            };
            assert!(matches!(
                verifier().verify_at(&headers, body, NOW),
                Err(BillingError::InvalidSignature)
            ));
        }
    }

    #[test]
    fn test_non_numeric_timestamp_rejected() {
        let body = br#"{"id":"evt_1"}"#;
        let mut headers = signed(body, NOW);
        headers.timestamp = "yesterday".to_string();

        assert!(matches!(
            verifier().verify_at(&headers, body, NOW),
            Err(BillingError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = br#"{"id":"evt_1"}"#;
        let headers = signed(body, NOW);
        let other = SignatureVerifier::new("whsec_b3RoZXItc2VjcmV0", DEFAULT_TOLERANCE).unwrap();

        assert!(other.verify_at(&headers, body, NOW).is_err());
    }

    #[test]
    fn test_signed_non_json_body_is_an_envelope_error() {
        let body = b"not json";
        let headers = signed(body, NOW);

        assert!(matches!(
            verifier().verify_at(&headers, body, NOW),
            Err(BillingError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_empty_secret_is_config_error() {
        assert!(matches!(
            SignatureVerifier::new("  ", DEFAULT_TOLERANCE),
            Err(BillingError::Config(_))
        ));
        assert!(matches!(
            SignatureVerifier::new("whsec_", DEFAULT_TOLERANCE),
            Err(BillingError::Config(_))
        ));
        assert!(matches!(
            SignatureVerifier::new("whsec_%%%", DEFAULT_TOLERANCE),
            Err(BillingError::Config(_))
        ));
    }

    #[test]
    fn test_missing_headers_are_named() {
        let err = WebhookHeaders::from_parts(Some("msg_1"), None, Some("1")).unwrap_err();
        assert!(matches!(err, BillingError::MissingHeader(HEADER_WEBHOOK_SIGNATURE)));

        let err = WebhookHeaders::from_parts(Some(" "), Some("v1,x"), Some("1")).unwrap_err();
        assert!(matches!(err, BillingError::MissingHeader(HEADER_WEBHOOK_ID)));

        let headers = WebhookHeaders::from_parts(Some("msg_1"), Some("v1,x"), Some("1")).unwrap();
        assert_eq!(headers.id, "msg_1");
    }

    #[test]
    fn test_debug_output_redacts_key() {
        let debug = format!("{:?}", verifier());
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("MfKQ9r8"));
    }
}
