#![forbid(unsafe_code)]

use tally_contracts::gateway::GatewayPaymentStatus;
use tally_contracts::ledger::PaymentReference;
use tally_contracts::{MonotonicTimeNs, ReasonCodeId};
use tally_engines::webhook::{
    parse_event, verify_signature, GatewayWebhookEvent, WebhookConfig, WebhookError,
};
use tally_storage::repo::ReconcileTxnRepo;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::reconcile::{
    count_confirmed_payment, ConfirmedPayment, ReconcileConfig, ReconcileError, ReconcileOutcome,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WebhookIngressError {
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookIngressOutcome {
    Reconciled {
        event_id: String,
        outcome: ReconcileOutcome,
    },
    Ignored {
        event_id: String,
        event_type: String,
    },
    /// Confirmed payment that can never be counted as delivered (no campaign, bad amount).
    /// Acknowledged so the gateway stops redelivering; left for operators.
    Unroutable {
        event_id: String,
        payment_reference: PaymentReference,
        reason_code: ReasonCodeId,
        reason: String,
    },
}

/// Push path: a signed gateway event is counted through the same ledger step as
/// the pull path, so a payment seen by both is counted once.
pub fn handle_gateway_webhook<S: ReconcileTxnRepo + ?Sized>(
    store: &S,
    webhook: Option<&WebhookConfig>,
    reconcile: &ReconcileConfig,
    payload: &[u8],
    signature_header: Option<&str>,
    now: MonotonicTimeNs,
) -> Result<WebhookIngressOutcome, WebhookIngressError> {
    let webhook = webhook.ok_or(WebhookError::Disabled)?;
    if let Err(e) = verify_signature(webhook, payload, signature_header, now.as_unix_secs()) {
        warn!(error = %e, "gateway webhook rejected");
        return Err(e.into());
    }

    let (event_id, event_type, payment) = match parse_event(payload)? {
        GatewayWebhookEvent::Ignored {
            event_id,
            event_type,
        } => {
            debug!(event_id = %event_id, event_type = %event_type, "gateway event ignored");
            return Ok(WebhookIngressOutcome::Ignored {
                event_id,
                event_type,
            });
        }
        GatewayWebhookEvent::PaymentUpdate {
            event_id,
            event_type,
            payment,
        } => (event_id, event_type, payment),
    };

    if !payment.status.is_countable() {
        info!(
            event_id = %event_id,
            payment_reference = payment.payment_reference.as_str(),
            gateway_status = payment.status.as_str(),
            "webhook payment not confirmed yet"
        );
        return Ok(not_confirmed(event_id, payment.payment_reference, payment.status));
    }

    info!(
        event_id = %event_id,
        event_type = %event_type,
        payment_reference = payment.payment_reference.as_str(),
        "gateway webhook accepted"
    );
    let confirmed = match ConfirmedPayment::from_gateway(&payment, None) {
        Ok(confirmed) => confirmed,
        Err(e @ (ReconcileError::MissingCampaign | ReconcileError::InvalidPayment { .. })) => {
            error!(
                event_id = %event_id,
                payment_reference = payment.payment_reference.as_str(),
                error = %e,
                "confirmed gateway payment cannot be routed to a campaign"
            );
            return Ok(WebhookIngressOutcome::Unroutable {
                event_id,
                payment_reference: payment.payment_reference,
                reason_code: e.reason_code(),
                reason: e.to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };
    let outcome = count_confirmed_payment(store, &confirmed, now, reconcile)?;
    Ok(WebhookIngressOutcome::Reconciled { event_id, outcome })
}

fn not_confirmed(
    event_id: String,
    payment_reference: PaymentReference,
    gateway_status: GatewayPaymentStatus,
) -> WebhookIngressOutcome {
    WebhookIngressOutcome::Reconciled {
        event_id,
        outcome: ReconcileOutcome::NotConfirmedYet {
            payment_reference,
            gateway_status,
        },
    }
}
