#![forbid(unsafe_code)]

//! Push-style gateway notifications.
//!
//! Signature header format: `t=<unix_secs>,v1=<hex hmac_sha256(secret, "<t>.<body>")>`.
//! Several `v1` entries may be present during secret rotation; any match passes.

use std::env;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tally_contracts::gateway::GatewayPayment;
use thiserror::Error;

use crate::gateway::parse_payment_object;

type HmacSha256 = Hmac<Sha256>;

pub const WEBHOOK_TOLERANCE_SECS_DEFAULT: u64 = 300;

/// Event types whose `data.object` is a payment the ledger may count.
pub const PAYMENT_UPDATE_EVENT_TYPES: &[&str] = &[
    "payment_intent.succeeded",
    "payment_intent.processing",
    "payment_intent.amount_capturable_updated",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebhookError {
    #[error("webhook handler is disabled")]
    Disabled,
    #[error("missing signature header")]
    MissingSignature,
    #[error("invalid signature format: {0}")]
    InvalidSignatureFormat(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("signature timestamp outside tolerance")]
    StaleTimestamp,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub secret: String,
    pub tolerance_secs: u64,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("secret", &"<redacted>")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl WebhookConfig {
    /// `None` when no signing secret is configured; the endpoint is then disabled.
    pub fn from_env() -> Option<Self> {
        let secret = env::var("TALLY_WEBHOOK_SECRET")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())?;
        let tolerance_secs = env::var("TALLY_WEBHOOK_TOLERANCE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (1..=3_600).contains(v))
            .unwrap_or(WEBHOOK_TOLERANCE_SECS_DEFAULT);
        Some(Self {
            secret,
            tolerance_secs,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayWebhookEvent {
    PaymentUpdate {
        event_id: String,
        event_type: String,
        payment: GatewayPayment,
    },
    Ignored {
        event_id: String,
        event_type: String,
    },
}

struct SignatureHeader {
    timestamp: u64,
    signatures: Vec<Vec<u8>>,
}

fn parse_signature_header(header: &str) -> Result<SignatureHeader, WebhookError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    let mut saw_v1 = false;
    for part in header.split(',') {
        let Some((k, v)) = part.trim().split_once('=') else {
            return Err(WebhookError::InvalidSignatureFormat(
                "expected key=value pairs".to_string(),
            ));
        };
        match k {
            "t" => {
                let t = v.parse::<u64>().map_err(|_| {
                    WebhookError::InvalidSignatureFormat("timestamp is not an integer".to_string())
                })?;
                timestamp = Some(t);
            }
            "v1" => {
                saw_v1 = true;
                // Undecodable candidates are skipped; another v1 may still match.
                if let Ok(bytes) = hex::decode(v) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }
    let timestamp = timestamp
        .ok_or_else(|| WebhookError::InvalidSignatureFormat("missing timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(if saw_v1 {
            WebhookError::InvalidSignatureFormat("signature is not hex".to_string())
        } else {
            WebhookError::MissingSignature
        });
    }
    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

fn mac_for(secret: &str, timestamp: u64, payload: &[u8]) -> Result<HmacSha256, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Checks the signature header against the payload. Comparison is constant-time.
pub fn verify_signature(
    config: &WebhookConfig,
    payload: &[u8],
    header: Option<&str>,
    now_unix_secs: u64,
) -> Result<(), WebhookError> {
    let header = header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(WebhookError::MissingSignature)?;
    let parsed = parse_signature_header(header)?;
    if now_unix_secs.abs_diff(parsed.timestamp) > config.tolerance_secs {
        return Err(WebhookError::StaleTimestamp);
    }
    for candidate in &parsed.signatures {
        let mac = mac_for(&config.secret, parsed.timestamp, payload)?;
        if mac.verify_slice(candidate).is_ok() {
            return Ok(());
        }
    }
    Err(WebhookError::InvalidSignature)
}

/// Builds a valid signature header; used by failure drills and tests.
pub fn sign_payload(secret: &str, timestamp: u64, payload: &[u8]) -> Result<String, WebhookError> {
    let mac = mac_for(secret, timestamp, payload)?;
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

pub fn parse_event(payload: &[u8]) -> Result<GatewayWebhookEvent, WebhookError> {
    let root: Value = serde_json::from_slice(payload)
        .map_err(|_| WebhookError::InvalidPayload("body is not JSON".to_string()))?;
    let event_id = root
        .pointer("/id")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| WebhookError::InvalidPayload("missing event id".to_string()))?
        .to_string();
    let event_type = root
        .pointer("/type")
        .and_then(Value::as_str)
        .ok_or_else(|| WebhookError::InvalidPayload("missing event type".to_string()))?
        .to_string();
    if !PAYMENT_UPDATE_EVENT_TYPES.contains(&event_type.as_str()) {
        return Ok(GatewayWebhookEvent::Ignored {
            event_id,
            event_type,
        });
    }
    let object = root
        .pointer("/data/object")
        .ok_or_else(|| WebhookError::InvalidPayload("missing data.object".to_string()))?;
    let payment = parse_payment_object(object, None)
        .map_err(|e| WebhookError::InvalidPayload(e.error_kind.to_string()))?;
    Ok(GatewayWebhookEvent::PaymentUpdate {
        event_id,
        event_type,
        payment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tally_contracts::gateway::GatewayPaymentStatus;

    const SECRET: &str = "whsec_test123secret456";
    const NOW: u64 = 1_760_000_000;

    fn config() -> WebhookConfig {
        WebhookConfig {
            secret: SECRET.to_string(),
            tolerance_secs: WEBHOOK_TOLERANCE_SECS_DEFAULT,
        }
    }

    fn succeeded_event() -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": {"object": {
                "id": "pi_1",
                "status": "succeeded",
                "amount": 2500,
                "currency": "gbp",
                "metadata": {"campaignId": "camp_roof", "donorName": "Amira"}
            }}
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn at_webhook_01_valid_signature_accepted() {
        let payload = succeeded_event();
        let header = sign_payload(SECRET, NOW, &payload).unwrap();
        assert_eq!(verify_signature(&config(), &payload, Some(&header), NOW), Ok(()));
    }

    #[test]
    fn at_webhook_02_modified_payload_rejected() {
        let payload = succeeded_event();
        let header = sign_payload(SECRET, NOW, &payload).unwrap();
        let mut tampered = payload.clone();
        tampered.extend_from_slice(b" ");
        assert_eq!(
            verify_signature(&config(), &tampered, Some(&header), NOW),
            Err(WebhookError::InvalidSignature)
        );
    }

    #[test]
    fn at_webhook_03_wrong_secret_and_stale_timestamp_rejected() {
        let payload = succeeded_event();
        let header = sign_payload("whsec_other", NOW, &payload).unwrap();
        assert_eq!(
            verify_signature(&config(), &payload, Some(&header), NOW),
            Err(WebhookError::InvalidSignature)
        );
        let old = sign_payload(SECRET, NOW - 600, &payload).unwrap();
        assert_eq!(
            verify_signature(&config(), &payload, Some(&old), NOW),
            Err(WebhookError::StaleTimestamp)
        );
    }

    #[test]
    fn at_webhook_04_header_format_errors() {
        let payload = succeeded_event();
        assert_eq!(
            verify_signature(&config(), &payload, None, NOW),
            Err(WebhookError::MissingSignature)
        );
        assert_eq!(
            verify_signature(&config(), &payload, Some("  "), NOW),
            Err(WebhookError::MissingSignature)
        );
        assert!(matches!(
            verify_signature(&config(), &payload, Some("garbage"), NOW),
            Err(WebhookError::InvalidSignatureFormat(_))
        ));
        assert!(matches!(
            verify_signature(&config(), &payload, Some("v1=abcd"), NOW),
            Err(WebhookError::InvalidSignatureFormat(_))
        ));
        assert_eq!(
            verify_signature(&config(), &payload, Some(&format!("t={NOW}")), NOW),
            Err(WebhookError::MissingSignature)
        );
    }

    #[test]
    fn at_webhook_05_rotated_secret_any_v1_matches() {
        let payload = succeeded_event();
        let good = sign_payload(SECRET, NOW, &payload).unwrap();
        let good_sig = good.split_once(",v1=").unwrap().1;
        let header = format!("t={NOW},v1={},v1={good_sig}", "00".repeat(32));
        assert_eq!(verify_signature(&config(), &payload, Some(&header), NOW), Ok(()));
    }

    #[test]
    fn at_webhook_06_parse_payment_update_event() {
        match parse_event(&succeeded_event()).unwrap() {
            GatewayWebhookEvent::PaymentUpdate {
                event_id, payment, ..
            } => {
                assert_eq!(event_id, "evt_1");
                assert_eq!(payment.payment_reference.as_str(), "pi_1");
                assert_eq!(payment.status, GatewayPaymentStatus::Succeeded);
                assert_eq!(payment.amount, Decimal::new(25, 0));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn at_webhook_07_other_event_types_ignored() {
        let payload = serde_json::json!({
            "id": "evt_2",
            "type": "charge.refunded",
            "data": {"object": {"id": "ch_1"}}
        })
        .to_string();
        assert_eq!(
            parse_event(payload.as_bytes()).unwrap(),
            GatewayWebhookEvent::Ignored {
                event_id: "evt_2".to_string(),
                event_type: "charge.refunded".to_string(),
            }
        );
        assert!(matches!(
            parse_event(b"not json"),
            Err(WebhookError::InvalidPayload(_))
        ));
    }

    #[test]
    fn at_webhook_08_undecodable_v1_skipped_when_another_matches() {
        let payload = succeeded_event();
        let good = sign_payload(SECRET, NOW, &payload).unwrap();
        let good_sig = good.split_once(",v1=").unwrap().1;
        let header = format!("t={NOW},v1=not-hex,v1={good_sig}");
        assert_eq!(verify_signature(&config(), &payload, Some(&header), NOW), Ok(()));

        let header = format!("t={NOW},v1=not-hex,v1={}", "00".repeat(32));
        assert_eq!(
            verify_signature(&config(), &payload, Some(&header), NOW),
            Err(WebhookError::InvalidSignature)
        );
        assert!(matches!(
            verify_signature(&config(), &payload, Some(&format!("t={NOW},v1=zz")), NOW),
            Err(WebhookError::InvalidSignatureFormat(_))
        ));
    }
}
