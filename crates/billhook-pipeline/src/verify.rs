//! Signature verification for inbound event notifications.
//!
//! The processor signs `"{timestamp}.{raw body}"` with HMAC-SHA256 and sends
//! `t=<unix>,v1=<hex>` in the signature header. Verification recomputes the
//! MAC, compares in constant time, and enforces a clock-skew window on the
//! timestamp. Secret rotation is handled by checking against an ordered set
//! of current-then-previous secrets.
//!
//! Fails closed: a malformed header, stale timestamp, or mismatched digest
//! stops the event before any later stage runs.

use std::{fmt, time::Duration};

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::value::RawValue;
use sha2::Sha256;

use billhook_core::{Clock, EventKind};

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance for signature timestamp skew.
pub const DEFAULT_SKEW_TOLERANCE: Duration = Duration::from_secs(5 * 60);

/// Signature verification errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// Signature header missing or empty.
    MissingSignature,
    /// Signature header could not be parsed.
    InvalidFormat(String),
    /// Timestamp outside the skew window.
    StaleTimestamp {
        /// Allowed skew in seconds.
        tolerance_secs: u64,
    },
    /// Digest did not match under any configured secret.
    VerificationFailed,
    /// Body is not a well-formed event envelope.
    MalformedEnvelope(String),
    /// A configured secret could not be used as an HMAC key.
    InvalidSecret,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSignature => write!(f, "signature header missing"),
            Self::InvalidFormat(detail) => write!(f, "invalid signature format: {detail}"),
            Self::StaleTimestamp { tolerance_secs } => {
                write!(f, "timestamp outside {tolerance_secs}s skew window")
            },
            Self::VerificationFailed => write!(f, "signature verification failed"),
            Self::MalformedEnvelope(detail) => write!(f, "malformed envelope: {detail}"),
            Self::InvalidSecret => write!(f, "invalid secret key"),
        }
    }
}

impl std::error::Error for VerifyError {}

/// Ordered set of signing secrets, current first.
///
/// During rotation both the new and the old secret verify, so in-flight
/// notifications signed with the previous secret are not rejected.
#[derive(Clone)]
pub struct SecretSet {
    secrets: Vec<String>,
}

impl SecretSet {
    /// Creates a secret set from current-then-previous secrets.
    ///
    /// Empty strings are discarded; at least one non-empty secret must
    /// remain.
    pub fn new(secrets: Vec<String>) -> Option<Self> {
        let secrets: Vec<String> = secrets.into_iter().filter(|s| !s.is_empty()).collect();
        if secrets.is_empty() {
            return None;
        }
        Some(Self { secrets })
    }

    /// Creates a set holding a single secret.
    pub fn single(secret: impl Into<String>) -> Option<Self> {
        Self::new(vec![secret.into()])
    }

    fn iter(&self) -> impl Iterator<Item = &str> {
        self.secrets.iter().map(String::as_str)
    }
}

impl fmt::Debug for SecretSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secrets never appear in logs.
        f.debug_struct("SecretSet").field("count", &self.secrets.len()).finish()
    }
}

/// Parsed signature header: `t=<unix seconds>,v1=<hex digest>`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SignatureHeader {
    timestamp: i64,
    digest: String,
}

/// Event envelope extracted from an authenticated body.
#[derive(Debug, Clone)]
pub struct VerifiedEnvelope {
    /// Processor-assigned globally unique event id.
    pub external_id: String,
    /// Declared event type.
    pub event_type: EventKind,
    /// The envelope's `data` object, uninterpreted.
    pub payload: serde_json::Value,
    /// Processor-side creation time (unix seconds).
    pub created: i64,
}

#[derive(Deserialize)]
struct RawEnvelope<'a> {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(borrow)]
    data: &'a RawValue,
    created: i64,
}

/// Verifies signatures and parses envelopes for one processor source.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    secrets: SecretSet,
    skew_tolerance: Duration,
}

impl SignatureVerifier {
    /// Creates a verifier with the default ±5 minute skew window.
    pub fn new(secrets: SecretSet) -> Self {
        Self { secrets, skew_tolerance: DEFAULT_SKEW_TOLERANCE }
    }

    /// Overrides the skew tolerance.
    pub fn with_skew_tolerance(mut self, tolerance: Duration) -> Self {
        self.skew_tolerance = tolerance;
        self
    }

    /// Verifies the signature over the raw body and parses the envelope.
    ///
    /// The digest is computed over `"{timestamp}.{raw body}"` using each
    /// configured secret in order; the first match wins. The envelope is
    /// only parsed after authentication succeeds.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError` on any header, timestamp, digest, or envelope
    /// problem. No partial state is produced.
    pub fn verify(
        &self,
        body: &[u8],
        signature_header: &str,
        clock: &dyn Clock,
    ) -> Result<VerifiedEnvelope, VerifyError> {
        let header = parse_signature_header(signature_header)?;

        let now = clock.now_utc().timestamp();
        let tolerance_secs = self.skew_tolerance.as_secs();
        if (now - header.timestamp).unsigned_abs() > tolerance_secs {
            return Err(VerifyError::StaleTimestamp { tolerance_secs });
        }

        let mut authenticated = false;
        for secret in self.secrets.iter() {
            let expected = signed_digest(header.timestamp, body, secret)?;
            if timing_safe_eq(&header.digest, &expected) {
                authenticated = true;
                break;
            }
        }
        if !authenticated {
            return Err(VerifyError::VerificationFailed);
        }

        parse_envelope(body)
    }
}

/// Computes the hex HMAC-SHA256 digest of `"{timestamp}.{body}"`.
pub fn signed_digest(timestamp: i64, body: &[u8], secret: &str) -> Result<String, VerifyError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerifyError::InvalidSecret)?;

    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Builds the signature header value for a body, used by tests and tooling.
pub fn sign(timestamp: i64, body: &[u8], secret: &str) -> Result<String, VerifyError> {
    let digest = signed_digest(timestamp, body, secret)?;
    Ok(format!("t={timestamp},v1={digest}"))
}

fn parse_signature_header(header: &str) -> Result<SignatureHeader, VerifyError> {
    if header.is_empty() {
        return Err(VerifyError::MissingSignature);
    }

    let mut timestamp = None;
    let mut digest = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse::<i64>().map_err(|_| {
                    VerifyError::InvalidFormat(format!("bad timestamp: {value}"))
                })?);
            },
            Some(("v1", value)) => {
                if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(VerifyError::InvalidFormat(
                        "digest must be 64 hex characters".to_string(),
                    ));
                }
                digest = Some(value.to_string());
            },
            // Unknown fields are ignored so the processor can add them.
            Some(_) => {},
            None => {
                return Err(VerifyError::InvalidFormat(format!(
                    "expected key=value pairs, got: {part}"
                )));
            },
        }
    }

    match (timestamp, digest) {
        (Some(timestamp), Some(digest)) => Ok(SignatureHeader { timestamp, digest }),
        _ => Err(VerifyError::InvalidFormat("missing t= or v1= field".to_string())),
    }
}

fn parse_envelope(body: &[u8]) -> Result<VerifiedEnvelope, VerifyError> {
    let raw: RawEnvelope<'_> = serde_json::from_slice(body)
        .map_err(|e| VerifyError::MalformedEnvelope(e.to_string()))?;

    if raw.id.is_empty() {
        return Err(VerifyError::MalformedEnvelope("empty event id".to_string()));
    }

    let payload = serde_json::from_str(raw.data.get())
        .map_err(|e| VerifyError::MalformedEnvelope(format!("bad data object: {e}")))?;

    Ok(VerifiedEnvelope {
        external_id: raw.id,
        event_type: EventKind::parse(&raw.kind),
        payload,
        created: raw.created,
    })
}

/// Constant-time string comparison.
///
/// Avoids leaking digest prefixes through timing analysis.
fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (a_byte, b_byte) in a.as_bytes().iter().zip(b.as_bytes()) {
        result |= a_byte ^ b_byte;
    }

    result == 0
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use billhook_core::TestClock;
    use proptest::prelude::*;

    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn clock_at(unix_secs: u64) -> TestClock {
        TestClock::with_start_time(SystemTime::UNIX_EPOCH + Duration::from_secs(unix_secs))
    }

    fn body() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": "evt_001",
            "type": "payment_succeeded",
            "data": {"charge": "ch_1", "amount": 4200},
            "created": 1_700_000_000,
        }))
        .unwrap()
    }

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(SecretSet::single(SECRET).unwrap())
    }

    #[test]
    fn valid_signature_yields_envelope() {
        let body = body();
        let header = sign(1_700_000_000, &body, SECRET).unwrap();
        let clock = clock_at(1_700_000_000);

        let envelope = verifier().verify(&body, &header, &clock).unwrap();
        assert_eq!(envelope.external_id, "evt_001");
        assert_eq!(envelope.event_type, EventKind::PaymentSucceeded);
        assert_eq!(envelope.payload["amount"], 4200);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = body();
        let header = sign(1_700_000_000, &body, "whsec_other").unwrap();
        let clock = clock_at(1_700_000_000);

        assert_eq!(
            verifier().verify(&body, &header, &clock).unwrap_err(),
            VerifyError::VerificationFailed
        );
    }

    #[test]
    fn previous_secret_still_verifies_during_rotation() {
        let body = body();
        let header = sign(1_700_000_000, &body, "whsec_old").unwrap();
        let clock = clock_at(1_700_000_000);

        let secrets =
            SecretSet::new(vec!["whsec_new".to_string(), "whsec_old".to_string()]).unwrap();
        let verifier = SignatureVerifier::new(secrets);

        assert!(verifier.verify(&body, &header, &clock).is_ok());
    }

    #[test]
    fn timestamp_outside_window_is_stale() {
        let body = body();
        let header = sign(1_700_000_000, &body, SECRET).unwrap();
        // Six minutes after signing, one past the tolerance.
        let clock = clock_at(1_700_000_000 + 360);

        assert_eq!(
            verifier().verify(&body, &header, &clock).unwrap_err(),
            VerifyError::StaleTimestamp { tolerance_secs: 300 }
        );
    }

    #[test]
    fn future_timestamp_within_window_is_accepted() {
        let body = body();
        let header = sign(1_700_000_000 + 120, &body, SECRET).unwrap();
        let clock = clock_at(1_700_000_000);

        assert!(verifier().verify(&body, &header, &clock).is_ok());
    }

    #[test]
    fn malformed_header_is_rejected() {
        let body = body();
        let clock = clock_at(1_700_000_000);

        for header in ["", "v1=deadbeef", "t=notanumber,v1=ab", "garbage"] {
            assert!(
                verifier().verify(&body, header, &clock).is_err(),
                "header {header:?} should fail"
            );
        }
    }

    #[test]
    fn authenticated_but_malformed_body_is_rejected() {
        let body = b"{\"not\": \"an envelope\"}".to_vec();
        let header = sign(1_700_000_000, &body, SECRET).unwrap();
        let clock = clock_at(1_700_000_000);

        assert!(matches!(
            verifier().verify(&body, &header, &clock).unwrap_err(),
            VerifyError::MalformedEnvelope(_)
        ));
    }

    #[test]
    fn unknown_header_fields_are_ignored() {
        let body = body();
        let digest = signed_digest(1_700_000_000, &body, SECRET).unwrap();
        let header = format!("t=1700000000,v0=legacy,v1={digest}");
        let clock = clock_at(1_700_000_000);

        assert!(verifier().verify(&body, &header, &clock).is_ok());
    }

    #[test]
    fn secret_set_rejects_all_empty() {
        assert!(SecretSet::new(vec![String::new()]).is_none());
        assert!(SecretSet::new(Vec::new()).is_none());
    }

    #[test]
    fn debug_never_prints_secrets() {
        let secrets = SecretSet::single("whsec_super_secret").unwrap();
        let rendered = format!("{secrets:?}");
        assert!(!rendered.contains("whsec_super_secret"));
    }

    proptest! {
        /// Any single flipped bit in the body invalidates the signature.
        #[test]
        fn bit_flip_always_rejected(byte_index in 0usize..180, bit in 0u8..8) {
            let original = body();
            prop_assume!(byte_index < original.len());

            let header = sign(1_700_000_000, &original, SECRET).unwrap();
            let clock = clock_at(1_700_000_000);

            let mut tampered = original.clone();
            tampered[byte_index] ^= 1 << bit;
            prop_assume!(tampered != original);

            prop_assert!(verifier().verify(&tampered, &header, &clock).is_err());
        }
    }
}
