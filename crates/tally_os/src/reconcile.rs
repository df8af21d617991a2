#![forbid(unsafe_code)]

use std::env;
use std::thread;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tally_contracts::campaign::{normalize_donor_name, CampaignId};
use tally_contracts::donation::{DonationId, DonationRecord};
use tally_contracts::gateway::{GatewayPayment, GatewayPaymentStatus};
use tally_contracts::ledger::{PaymentLedgerEntry, PaymentReference};
use tally_contracts::money::CurrencyCode;
use tally_contracts::{MonotonicTimeNs, ReasonCodeId, Validate};
use tally_engines::gateway::{GatewayCallError, PaymentGateway};
use tally_storage::repo::ReconcileTxnRepo;
use tally_storage::store::{StorageError, TABLE_DONATIONS};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub mod reason_codes {
    use tally_contracts::ReasonCodeId;

    // Reconciliation reason-code namespace.
    pub const RECONCILE_COUNTED: ReasonCodeId = ReasonCodeId(0x5443_0001);
    pub const RECONCILE_ALREADY_COUNTED: ReasonCodeId = ReasonCodeId(0x5443_0002);
    pub const RECONCILE_NOT_CONFIRMED_YET: ReasonCodeId = ReasonCodeId(0x5443_0003);
    pub const RECONCILE_RETRYABLE: ReasonCodeId = ReasonCodeId(0x5443_0101);
    pub const RECONCILE_CAMPAIGN_NOT_FOUND: ReasonCodeId = ReasonCodeId(0x5443_0102);
    pub const RECONCILE_CURRENCY_MISMATCH: ReasonCodeId = ReasonCodeId(0x5443_0103);
    pub const RECONCILE_INVALID_PAYMENT: ReasonCodeId = ReasonCodeId(0x5443_0104);
    pub const RECONCILE_MISSING_CAMPAIGN: ReasonCodeId = ReasonCodeId(0x5443_0105);
    pub const RECONCILE_UNKNOWN_PAYMENT_REFERENCE: ReasonCodeId = ReasonCodeId(0x5443_0106);
    pub const RECONCILE_GATEWAY_REJECTED: ReasonCodeId = ReasonCodeId(0x5443_0107);
    pub const RECONCILE_STORAGE_FAILED: ReasonCodeId = ReasonCodeId(0x5443_01F1);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Overall budget for the store retry loop, sleeps included.
    pub store_deadline_ms: u64,
}

impl ReconcileConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 25,
            max_backoff_ms: 1_000,
            store_deadline_ms: 10_000,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::mvp_v1();
        let max_attempts = env::var("TALLY_RECONCILE_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| (1..=20).contains(v))
            .unwrap_or(defaults.max_attempts);
        let base_backoff_ms = env::var("TALLY_RECONCILE_BASE_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v <= 10_000)
            .unwrap_or(defaults.base_backoff_ms);
        let max_backoff_ms = env::var("TALLY_RECONCILE_MAX_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (base_backoff_ms..=60_000).contains(v))
            .unwrap_or_else(|| defaults.max_backoff_ms.max(base_backoff_ms));
        let store_deadline_ms = env::var("TALLY_STORE_DEADLINE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (100..=120_000).contains(v))
            .unwrap_or(defaults.store_deadline_ms);
        Self {
            max_attempts,
            base_backoff_ms,
            max_backoff_ms,
            store_deadline_ms,
        }
    }

    /// `min(base * 2^(attempt-1), max)` for a 1-based attempt number.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconcileError {
    #[error("retryable failure kind={kind}: {detail}")]
    Retryable { kind: &'static str, detail: String },
    #[error("campaign not found campaign_id={campaign_id}")]
    CampaignNotFound { campaign_id: String },
    #[error("currency mismatch campaign={campaign_currency} payment={payment_currency}")]
    CurrencyMismatch {
        campaign_currency: String,
        payment_currency: String,
    },
    #[error("invalid payment: {reason}")]
    InvalidPayment { reason: String },
    #[error("payment carries no campaign id and no campaign hint was supplied")]
    MissingCampaign,
    #[error("payment reference is unknown to the gateway")]
    UnknownPaymentReference,
    #[error("gateway rejected the request: {detail}")]
    GatewayRejected { detail: String },
    #[error("storage failure: {0}")]
    Storage(StorageError),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            Self::Retryable { .. } => reason_codes::RECONCILE_RETRYABLE,
            Self::CampaignNotFound { .. } => reason_codes::RECONCILE_CAMPAIGN_NOT_FOUND,
            Self::CurrencyMismatch { .. } => reason_codes::RECONCILE_CURRENCY_MISMATCH,
            Self::InvalidPayment { .. } => reason_codes::RECONCILE_INVALID_PAYMENT,
            Self::MissingCampaign => reason_codes::RECONCILE_MISSING_CAMPAIGN,
            Self::UnknownPaymentReference => reason_codes::RECONCILE_UNKNOWN_PAYMENT_REFERENCE,
            Self::GatewayRejected { .. } => reason_codes::RECONCILE_GATEWAY_REJECTED,
            Self::Storage(_) => reason_codes::RECONCILE_STORAGE_FAILED,
        }
    }
}

impl From<StorageError> for ReconcileError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<GatewayCallError> for ReconcileError {
    fn from(e: GatewayCallError) -> Self {
        if e.retryable {
            Self::Retryable {
                kind: e.error_kind,
                detail: e.safe_detail(),
            }
        } else if e.is_unknown_reference() {
            Self::UnknownPaymentReference
        } else {
            Self::GatewayRejected {
                detail: e.safe_detail(),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyAndCountRequest {
    pub payment_reference: PaymentReference,
    pub campaign_id_hint: Option<CampaignId>,
}

/// A payment the gateway reports as countable, resolved to its target campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedPayment {
    pub payment_reference: PaymentReference,
    pub campaign_id: CampaignId,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub donor_name: String,
}

impl ConfirmedPayment {
    /// Metadata campaign id wins; the hint is only a fallback.
    pub fn from_gateway(
        payment: &GatewayPayment,
        campaign_id_hint: Option<&CampaignId>,
    ) -> Result<Self, ReconcileError> {
        payment
            .validate()
            .map_err(|v| ReconcileError::InvalidPayment {
                reason: format!("{v:?}"),
            })?;
        if payment.amount <= Decimal::ZERO {
            return Err(ReconcileError::InvalidPayment {
                reason: "amount must be > 0".to_string(),
            });
        }
        let campaign_id = payment
            .metadata
            .campaign_id
            .as_ref()
            .or(campaign_id_hint)
            .cloned()
            .ok_or(ReconcileError::MissingCampaign)?;
        Ok(Self {
            payment_reference: payment.payment_reference.clone(),
            campaign_id,
            amount: payment.amount,
            currency: payment.currency.clone(),
            donor_name: normalize_donor_name(payment.metadata.donor_name.as_deref()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountedPayment {
    pub donation_id: DonationId,
    pub campaign_id: CampaignId,
    pub payment_reference: PaymentReference,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    /// Store attempts used by this call; 1 when there was no conflict.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Counted(CountedPayment),
    /// Idempotent replay; carries the donation recorded by the first count.
    AlreadyCounted(CountedPayment),
    NotConfirmedYet {
        payment_reference: PaymentReference,
        gateway_status: GatewayPaymentStatus,
    },
}

impl ReconcileOutcome {
    pub fn counted_payment(&self) -> Option<&CountedPayment> {
        match self {
            Self::Counted(c) | Self::AlreadyCounted(c) => Some(c),
            Self::NotConfirmedYet { .. } => None,
        }
    }

    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            Self::Counted(_) => reason_codes::RECONCILE_COUNTED,
            Self::AlreadyCounted(_) => reason_codes::RECONCILE_ALREADY_COUNTED,
            Self::NotConfirmedYet { .. } => reason_codes::RECONCILE_NOT_CONFIRMED_YET,
        }
    }
}

fn new_donation_id() -> Result<DonationId, ReconcileError> {
    DonationId::new(format!("don_{:032x}", rand::random::<u128>())).map_err(|v| {
        ReconcileError::InvalidPayment {
            reason: format!("generated donation id rejected: {v:?}"),
        }
    })
}

fn retry_on(e: &StorageError) -> bool {
    // A donation id collision is handled like a lost race: next attempt draws a new id.
    e.is_conflict()
        || matches!(
            e,
            StorageError::DuplicateKey {
                table: TABLE_DONATIONS,
                ..
            }
        )
}

/// One pass of the ledger-guarded count: every read is issued before the first write.
fn count_once<S: ReconcileTxnRepo + ?Sized>(
    store: &S,
    confirmed: &ConfirmedPayment,
    donation_id: DonationId,
    now: MonotonicTimeNs,
    attempts: u32,
) -> Result<ReconcileOutcome, ReconcileError> {
    let mut tx = store.begin_reconcile_txn();

    if let Some(entry) = tx.read_payment_ledger(&confirmed.payment_reference)? {
        if entry.counted {
            if let Some(recorded) = entry.donation_id {
                return Ok(ReconcileOutcome::AlreadyCounted(CountedPayment {
                    donation_id: recorded,
                    campaign_id: entry.campaign_id,
                    payment_reference: entry.payment_reference,
                    amount: entry.amount,
                    currency: entry.currency,
                    attempts,
                }));
            }
        }
    }

    let campaign = tx.read_campaign(&confirmed.campaign_id)?.ok_or_else(|| {
        ReconcileError::CampaignNotFound {
            campaign_id: confirmed.campaign_id.as_str().to_string(),
        }
    })?;
    if campaign.currency != confirmed.currency {
        return Err(ReconcileError::CurrencyMismatch {
            campaign_currency: campaign.currency.as_str().to_string(),
            payment_currency: confirmed.currency.as_str().to_string(),
        });
    }

    let next = campaign
        .fold_counted_donation(&confirmed.donor_name, confirmed.amount, now)
        .map_err(|v| ReconcileError::InvalidPayment {
            reason: format!("{v:?}"),
        })?;
    let donation = DonationRecord::confirmed_v1(
        donation_id.clone(),
        confirmed.campaign_id.clone(),
        confirmed.donor_name.clone(),
        confirmed.amount,
        confirmed.currency.clone(),
        confirmed.payment_reference.clone(),
        now,
    )
    .map_err(|v| ReconcileError::InvalidPayment {
        reason: format!("{v:?}"),
    })?;
    let ledger = PaymentLedgerEntry::counted_v1(
        confirmed.payment_reference.clone(),
        donation_id.clone(),
        confirmed.campaign_id.clone(),
        confirmed.amount,
        confirmed.currency.clone(),
        now,
    )
    .map_err(|v| ReconcileError::InvalidPayment {
        reason: format!("{v:?}"),
    })?;

    tx.insert_donation(donation)?;
    tx.merge_campaign(next)?;
    tx.merge_payment_ledger(ledger)?;
    tx.commit()?;

    Ok(ReconcileOutcome::Counted(CountedPayment {
        donation_id,
        campaign_id: confirmed.campaign_id.clone(),
        payment_reference: confirmed.payment_reference.clone(),
        amount: confirmed.amount,
        currency: confirmed.currency.clone(),
        attempts,
    }))
}

/// Counts a confirmed payment exactly once across every entry path (pull and push).
///
/// Optimistic conflicts restart the whole read-then-write pass with bounded
/// exponential backoff. Exhausting `max_attempts` or the store deadline surfaces
/// `ReconcileError::Retryable`; nothing is written by a failed pass.
pub fn count_confirmed_payment<S: ReconcileTxnRepo + ?Sized>(
    store: &S,
    confirmed: &ConfirmedPayment,
    now: MonotonicTimeNs,
    config: &ReconcileConfig,
) -> Result<ReconcileOutcome, ReconcileError> {
    let started = Instant::now();
    let deadline = Duration::from_millis(config.store_deadline_ms);
    let max_attempts = config.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let donation_id = new_donation_id()?;
        match count_once(store, confirmed, donation_id, now, attempt) {
            Ok(outcome) => {
                match &outcome {
                    ReconcileOutcome::Counted(c) => info!(
                        payment_reference = confirmed.payment_reference.as_str(),
                        campaign_id = confirmed.campaign_id.as_str(),
                        donation_id = c.donation_id.as_str(),
                        amount = %confirmed.amount,
                        attempt,
                        "payment counted"
                    ),
                    _ => debug!(
                        payment_reference = confirmed.payment_reference.as_str(),
                        attempt,
                        "payment already counted"
                    ),
                }
                return Ok(outcome);
            }
            Err(ReconcileError::Storage(e)) if retry_on(&e) => {
                if attempt >= max_attempts {
                    warn!(
                        payment_reference = confirmed.payment_reference.as_str(),
                        campaign_id = confirmed.campaign_id.as_str(),
                        attempt,
                        "store conflicts exhausted retry budget"
                    );
                    return Err(ReconcileError::Retryable {
                        kind: "store_conflict_exhausted",
                        detail: format!("{e} after {attempt} attempts"),
                    });
                }
                let backoff = config.backoff_for_attempt(attempt);
                if started.elapsed().saturating_add(backoff) > deadline {
                    warn!(
                        payment_reference = confirmed.payment_reference.as_str(),
                        attempt,
                        deadline_ms = config.store_deadline_ms,
                        "store deadline exceeded"
                    );
                    return Err(ReconcileError::Retryable {
                        kind: "store_timeout",
                        detail: format!("deadline {}ms exceeded", config.store_deadline_ms),
                    });
                }
                debug!(
                    payment_reference = confirmed.payment_reference.as_str(),
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "store conflict, retrying"
                );
                thread::sleep(backoff);
            }
            Err(e @ ReconcileError::CampaignNotFound { .. }) => {
                error!(
                    payment_reference = confirmed.payment_reference.as_str(),
                    campaign_id = confirmed.campaign_id.as_str(),
                    "confirmed payment targets a missing campaign"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    payment_reference = confirmed.payment_reference.as_str(),
                    error = %e,
                    "payment not counted"
                );
                return Err(e);
            }
        }
    }
}

/// Pull path: resolve the payment with the gateway, then count it.
#[derive(Debug, Clone)]
pub struct ReconcileRuntime<G: PaymentGateway> {
    gateway: G,
    config: ReconcileConfig,
}

impl<G: PaymentGateway> ReconcileRuntime<G> {
    pub fn new(gateway: G, config: ReconcileConfig) -> Self {
        Self { gateway, config }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Gateway failures return before any transaction is opened.
    pub fn verify_and_count<S: ReconcileTxnRepo + ?Sized>(
        &self,
        store: &S,
        req: &VerifyAndCountRequest,
        now: MonotonicTimeNs,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let payment = self
            .gateway
            .retrieve_payment(&req.payment_reference)
            .map_err(|e| {
                warn!(
                    payment_reference = req.payment_reference.as_str(),
                    error_kind = e.error_kind,
                    retryable = e.retryable,
                    "gateway lookup failed"
                );
                ReconcileError::from(e)
            })?;

        if !payment.status.is_countable() {
            info!(
                payment_reference = req.payment_reference.as_str(),
                gateway_status = payment.status.as_str(),
                "payment not confirmed yet"
            );
            return Ok(ReconcileOutcome::NotConfirmedYet {
                payment_reference: req.payment_reference.clone(),
                gateway_status: payment.status,
            });
        }

        let confirmed = ConfirmedPayment::from_gateway(&payment, req.campaign_id_hint.as_ref())?;
        count_confirmed_payment(store, &confirmed, now, &self.config)
    }
}
