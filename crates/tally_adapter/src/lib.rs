#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use tally_contracts::campaign::{CampaignAggregate, CampaignId};
use tally_contracts::donation::DonationRecord;
use tally_contracts::ledger::PaymentReference;
use tally_contracts::money::CurrencyCode;
use tally_contracts::MonotonicTimeNs;
use tally_engines::gateway::{FixturePaymentGateway, PaymentGatewayRuntime};
use tally_engines::webhook::{WebhookConfig, WebhookError};
use tally_os::audit::{audit_campaign_consistency_with_baseline, CampaignConsistencyReport};
use tally_os::display_merge::PollSchedule;
use tally_os::reconcile::{
    ReconcileConfig, ReconcileError, ReconcileOutcome, ReconcileRuntime, VerifyAndCountRequest,
};
use tally_os::webhook_ingress::{
    handle_gateway_webhook, WebhookIngressError, WebhookIngressOutcome,
};
use tally_storage::repo::{DonationTablesRepo, ReconcileTxnRepo};
use tally_storage::store::{DonationStore, StorageError};
use tracing::{info, warn};

/// Header carrying the gateway's webhook signature.
pub const WEBHOOK_SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VerifyDonationAdapterRequest {
    pub payment_reference: String,
    pub campaign_id_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct PollHint {
    pub reconciliation_offsets_ms: Vec<u64>,
    pub background_interval_ms: u64,
}

impl PollHint {
    fn from_schedule(schedule: &PollSchedule) -> Self {
        Self {
            reconciliation_offsets_ms: schedule.reconciliation_offsets_ms(),
            background_interval_ms: schedule.background_interval.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RecentDonorView {
    pub donor_name: String,
    pub amount: String,
    pub at_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CampaignAdapterView {
    pub campaign_id: String,
    pub total_donated: String,
    pub donors_count: u64,
    pub currency: String,
    pub goal_amount: Option<String>,
    pub goal_reached: bool,
    pub last_donors: Vec<RecentDonorView>,
    pub updated_at_ns: u64,
}

impl CampaignAdapterView {
    fn from_aggregate(c: &CampaignAggregate) -> Self {
        Self {
            campaign_id: c.campaign_id.as_str().to_string(),
            total_donated: format_amount(c.total_donated, &c.currency),
            donors_count: c.donors_count,
            currency: c.currency.as_str().to_string(),
            goal_amount: c.goal_amount.map(|g| format_amount(g, &c.currency)),
            goal_reached: c.goal_reached(),
            last_donors: c
                .last_donors
                .iter()
                .map(|d| RecentDonorView {
                    donor_name: d.donor_name.clone(),
                    amount: format_amount(d.amount, &c.currency),
                    at_ns: d.at.0,
                })
                .collect(),
            updated_at_ns: c.updated_at.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DonationAdapterView {
    pub donation_id: String,
    pub campaign_id: String,
    pub donor_name: String,
    pub amount: String,
    pub currency: String,
    pub payment_reference: String,
    pub status: String,
    pub created_at_ns: u64,
}

impl DonationAdapterView {
    fn from_record(d: &DonationRecord) -> Self {
        Self {
            donation_id: d.donation_id.as_str().to_string(),
            campaign_id: d.campaign_id.as_str().to_string(),
            donor_name: d.donor_name.clone(),
            amount: format_amount(d.amount, &d.currency),
            currency: d.currency.as_str().to_string(),
            payment_reference: d.payment_reference.as_str().to_string(),
            status: d.status.as_str().to_string(),
            created_at_ns: d.created_at.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct VerifyDonationAdapterResponse {
    /// `confirmed`, `pending` or `error`.
    pub status: String,
    pub outcome: String,
    pub ok: bool,
    pub retryable: bool,
    pub donation_id: Option<String>,
    pub campaign_id: Option<String>,
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub gateway_status: Option<String>,
    pub campaign: Option<CampaignAdapterView>,
    pub poll_hint: Option<PollHint>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct CampaignAdapterResponse {
    pub status: String,
    pub campaign: Option<CampaignAdapterView>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct CampaignDonationsAdapterResponse {
    pub status: String,
    pub campaign_id: String,
    pub donations: Vec<DonationAdapterView>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct CampaignAuditAdapterResponse {
    pub status: String,
    pub campaign_id: String,
    pub consistent: bool,
    pub stored_total: Option<String>,
    pub expected_total: Option<String>,
    pub stored_donors_count: u64,
    pub expected_donors_count: u64,
    pub counted_ledger_entries: u64,
    pub unbound_donations: Vec<String>,
    pub dangling_ledger_entries: Vec<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct WebhookAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub event_id: Option<String>,
    pub donation_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct AdapterStoreCounters {
    pub campaigns: u32,
    pub donations: u32,
    pub payment_ledger: u32,
    pub commits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub gateway_mode: String,
    pub webhook_enabled: bool,
    pub store: AdapterStoreCounters,
}

/// HTTP status plus JSON body; the binary maps it onto axum types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterReply<T> {
    pub http_status: u16,
    pub body: T,
}

impl<T> AdapterReply<T> {
    fn new(http_status: u16, body: T) -> Self {
        Self { http_status, body }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct CampaignSeedFile {
    campaigns: Vec<CampaignSeed>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct CampaignSeed {
    campaign_id: String,
    currency: String,
    goal_amount: Option<String>,
    total_donated: Option<String>,
    donors_count: Option<u64>,
}

/// Amount rendered at the currency's minor-unit precision.
pub fn format_amount(amount: Decimal, currency: &CurrencyCode) -> String {
    let mut a = amount;
    a.rescale(currency.minor_unit_exponent());
    a.to_string()
}

pub fn reconcile_error_http_status(e: &ReconcileError) -> u16 {
    match e {
        ReconcileError::Retryable { .. } => 503,
        ReconcileError::CampaignNotFound { .. } | ReconcileError::UnknownPaymentReference => 404,
        ReconcileError::CurrencyMismatch { .. }
        | ReconcileError::InvalidPayment { .. }
        | ReconcileError::MissingCampaign => 422,
        ReconcileError::GatewayRejected { .. } => 502,
        ReconcileError::Storage(_) => 500,
    }
}

pub fn webhook_error_http_status(e: &WebhookIngressError) -> u16 {
    match e {
        WebhookIngressError::Webhook(WebhookError::Disabled) => 404,
        WebhookIngressError::Webhook(WebhookError::InvalidPayload(_)) => 400,
        WebhookIngressError::Webhook(_) => 401,
        WebhookIngressError::Reconcile(r) => reconcile_error_http_status(r),
    }
}

fn outcome_label(e: &ReconcileError) -> &'static str {
    if e.is_retryable() {
        "RETRY"
    } else {
        "REJECTED"
    }
}

#[derive(Debug)]
pub struct AdapterRuntime {
    store: Arc<DonationStore>,
    reconcile: ReconcileRuntime<PaymentGatewayRuntime>,
    webhook: Option<WebhookConfig>,
    poll_schedule: PollSchedule,
    // Seeded totals not backed by donation rows; the audit starts from them.
    opening_balances: BTreeMap<CampaignId, (Decimal, u64)>,
    // Transaction time for every write; never taken from a request.
    clock: fn() -> MonotonicTimeNs,
}

impl Default for AdapterRuntime {
    fn default() -> Self {
        Self::new(
            PaymentGatewayRuntime::Fixture(Arc::new(FixturePaymentGateway::new())),
            ReconcileConfig::mvp_v1(),
            None,
        )
    }
}

impl AdapterRuntime {
    pub fn new(
        gateway: PaymentGatewayRuntime,
        reconcile: ReconcileConfig,
        webhook: Option<WebhookConfig>,
    ) -> Self {
        Self {
            store: Arc::new(DonationStore::new_in_memory()),
            reconcile: ReconcileRuntime::new(gateway, reconcile),
            webhook,
            poll_schedule: PollSchedule::mvp_v1(),
            opening_balances: BTreeMap::new(),
            clock: MonotonicTimeNs::now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> MonotonicTimeNs) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_from_env() -> Result<Self, String> {
        let mut runtime = Self::new(
            PaymentGatewayRuntime::from_env_or_fixture(),
            ReconcileConfig::from_env(),
            WebhookConfig::from_env(),
        );
        if let Some(path) = env::var("TALLY_CAMPAIGN_SEED_PATH")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            let raw = fs::read_to_string(&path)
                .map_err(|err| format!("failed to read campaign seed file '{path}': {err}"))?;
            let seeded = runtime.seed_campaigns_from_json(&raw)?;
            info!(path = %path, seeded, "campaign seed file loaded");
        }
        Ok(runtime)
    }

    pub fn store(&self) -> &DonationStore {
        &self.store
    }

    pub fn gateway_mode(&self) -> &'static str {
        self.reconcile.gateway().mode_label()
    }

    pub fn webhook_enabled(&self) -> bool {
        self.webhook.is_some()
    }

    /// Fixture table behind the gateway, when not talking to a real gateway.
    pub fn fixture_gateway(&self) -> Option<Arc<FixturePaymentGateway>> {
        match self.reconcile.gateway() {
            PaymentGatewayRuntime::Fixture(f) => Some(f.clone()),
            _ => None,
        }
    }

    pub fn seed_campaigns_from_json(&mut self, raw: &str) -> Result<usize, String> {
        let file: CampaignSeedFile = serde_json::from_str(raw)
            .map_err(|err| format!("campaign seed file is not valid JSON: {err}"))?;
        let now = (self.clock)();
        let mut seeded = 0usize;
        for seed in file.campaigns {
            let campaign_id = CampaignId::new(seed.campaign_id.clone())
                .map_err(|v| format!("campaign '{}': {v:?}", seed.campaign_id))?;
            let currency = CurrencyCode::new(seed.currency.clone())
                .map_err(|v| format!("campaign '{}': {v:?}", seed.campaign_id))?;
            let goal_amount = seed
                .goal_amount
                .as_deref()
                .map(|g| parse_amount("goal_amount", g))
                .transpose()?;
            let total = seed
                .total_donated
                .as_deref()
                .map(|t| parse_amount("total_donated", t))
                .transpose()?
                .unwrap_or(Decimal::ZERO);
            let donors = seed.donors_count.unwrap_or(0);
            let aggregate = CampaignAggregate::v1(
                campaign_id.clone(),
                total,
                donors,
                currency,
                goal_amount,
                Vec::new(),
                now,
            )
            .map_err(|v| format!("campaign '{}': {v:?}", seed.campaign_id))?;
            self.store
                .insert_campaign_row(aggregate)
                .map_err(|e| format!("campaign '{}': {e}", seed.campaign_id))?;
            self.opening_balances.insert(campaign_id, (total, donors));
            seeded += 1;
        }
        Ok(seeded)
    }

    pub fn verify_donation(
        &self,
        request: VerifyDonationAdapterRequest,
    ) -> AdapterReply<VerifyDonationAdapterResponse> {
        let payment_reference = match PaymentReference::new(request.payment_reference.trim()) {
            Ok(r) => r,
            Err(v) => return verify_rejected(422, format!("invalid payment_reference: {v:?}")),
        };
        let campaign_id_hint = match request
            .campaign_id_hint
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(CampaignId::new)
            .transpose()
        {
            Ok(h) => h,
            Err(v) => return verify_rejected(422, format!("invalid campaign_id_hint: {v:?}")),
        };
        let now = (self.clock)();
        let req = VerifyAndCountRequest {
            payment_reference,
            campaign_id_hint,
        };

        match self.reconcile.verify_and_count(self.store.as_ref(), &req, now) {
            Ok(ReconcileOutcome::NotConfirmedYet { gateway_status, .. }) => AdapterReply::new(
                202,
                VerifyDonationAdapterResponse {
                    status: "pending".to_string(),
                    outcome: "NOT_CONFIRMED_YET".to_string(),
                    ok: false,
                    retryable: true,
                    gateway_status: Some(gateway_status.as_str().to_string()),
                    poll_hint: Some(PollHint::from_schedule(&self.poll_schedule)),
                    ..Default::default()
                },
            ),
            Ok(outcome) => {
                let outcome_name = match outcome {
                    ReconcileOutcome::Counted(_) => "COUNTED",
                    _ => "ALREADY_COUNTED",
                };
                let Some(c) = outcome.counted_payment() else {
                    return verify_rejected(500, "counted outcome without payment".to_string());
                };
                let campaign = self
                    .store
                    .campaign_row(&c.campaign_id)
                    .ok()
                    .flatten()
                    .map(|a| CampaignAdapterView::from_aggregate(&a));
                AdapterReply::new(
                    200,
                    VerifyDonationAdapterResponse {
                        status: "confirmed".to_string(),
                        outcome: outcome_name.to_string(),
                        ok: true,
                        retryable: false,
                        donation_id: Some(c.donation_id.as_str().to_string()),
                        campaign_id: Some(c.campaign_id.as_str().to_string()),
                        amount: Some(format_amount(c.amount, &c.currency)),
                        currency: Some(c.currency.as_str().to_string()),
                        gateway_status: None,
                        campaign,
                        poll_hint: Some(PollHint::from_schedule(&self.poll_schedule)),
                        reason: None,
                    },
                )
            }
            Err(e) => AdapterReply::new(
                reconcile_error_http_status(&e),
                VerifyDonationAdapterResponse {
                    status: "error".to_string(),
                    outcome: outcome_label(&e).to_string(),
                    ok: false,
                    retryable: e.is_retryable(),
                    reason: Some(e.to_string()),
                    ..Default::default()
                },
            ),
        }
    }

    pub fn campaign(&self, campaign_id: &str) -> AdapterReply<CampaignAdapterResponse> {
        let fail = |status: u16, reason: String| {
            AdapterReply::new(
                status,
                CampaignAdapterResponse {
                    status: "error".to_string(),
                    campaign: None,
                    reason: Some(reason),
                },
            )
        };
        let id = match CampaignId::new(campaign_id) {
            Ok(id) => id,
            Err(v) => return fail(422, format!("invalid campaign_id: {v:?}")),
        };
        match self.store.campaign_row(&id) {
            Ok(Some(c)) => AdapterReply::new(
                200,
                CampaignAdapterResponse {
                    status: "ok".to_string(),
                    campaign: Some(CampaignAdapterView::from_aggregate(&c)),
                    reason: None,
                },
            ),
            Ok(None) => fail(404, format!("campaign '{campaign_id}' not found")),
            Err(e) => fail(500, e.to_string()),
        }
    }

    pub fn campaign_donations(
        &self,
        campaign_id: &str,
    ) -> AdapterReply<CampaignDonationsAdapterResponse> {
        let fail = |status: u16, reason: String| {
            AdapterReply::new(
                status,
                CampaignDonationsAdapterResponse {
                    status: "error".to_string(),
                    campaign_id: campaign_id.to_string(),
                    donations: Vec::new(),
                    reason: Some(reason),
                },
            )
        };
        let id = match CampaignId::new(campaign_id) {
            Ok(id) => id,
            Err(v) => return fail(422, format!("invalid campaign_id: {v:?}")),
        };
        match self.store.campaign_row(&id) {
            Ok(Some(_)) => {}
            Ok(None) => return fail(404, format!("campaign '{campaign_id}' not found")),
            Err(e) => return fail(500, e.to_string()),
        }
        match DonationTablesRepo::donation_rows_for_campaign(self.store.as_ref(), &id) {
            Ok(rows) => AdapterReply::new(
                200,
                CampaignDonationsAdapterResponse {
                    status: "ok".to_string(),
                    campaign_id: campaign_id.to_string(),
                    donations: rows.iter().map(DonationAdapterView::from_record).collect(),
                    reason: None,
                },
            ),
            Err(e) => fail(500, e.to_string()),
        }
    }

    pub fn campaign_audit(&self, campaign_id: &str) -> AdapterReply<CampaignAuditAdapterResponse> {
        let fail = |status: u16, reason: String| {
            AdapterReply::new(
                status,
                CampaignAuditAdapterResponse {
                    status: "error".to_string(),
                    campaign_id: campaign_id.to_string(),
                    reason: Some(reason),
                    ..Default::default()
                },
            )
        };
        let id = match CampaignId::new(campaign_id) {
            Ok(id) => id,
            Err(v) => return fail(422, format!("invalid campaign_id: {v:?}")),
        };
        let (baseline_total, baseline_donors) = self
            .opening_balances
            .get(&id)
            .copied()
            .unwrap_or((Decimal::ZERO, 0));
        match audit_campaign_consistency_with_baseline(
            self.store.as_ref(),
            &id,
            baseline_total,
            baseline_donors,
        ) {
            Ok(report) => AdapterReply::new(200, audit_response(&report)),
            Err(e) => fail(reconcile_error_http_status(&e), e.to_string()),
        }
    }

    pub fn handle_webhook(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> AdapterReply<WebhookAdapterResponse> {
        let result = handle_gateway_webhook(
            self.store.as_ref(),
            self.webhook.as_ref(),
            self.reconcile.config(),
            payload,
            signature_header,
            (self.clock)(),
        );
        match result {
            Ok(WebhookIngressOutcome::Ignored { event_id, .. }) => AdapterReply::new(
                200,
                WebhookAdapterResponse {
                    status: "ok".to_string(),
                    outcome: "IGNORED".to_string(),
                    event_id: Some(event_id),
                    ..Default::default()
                },
            ),
            Ok(WebhookIngressOutcome::Unroutable {
                event_id, reason, ..
            }) => AdapterReply::new(
                200,
                WebhookAdapterResponse {
                    status: "ok".to_string(),
                    outcome: "REJECTED_UNROUTABLE".to_string(),
                    event_id: Some(event_id),
                    donation_id: None,
                    reason: Some(reason),
                },
            ),
            Ok(WebhookIngressOutcome::Reconciled { event_id, outcome }) => {
                let label = match &outcome {
                    ReconcileOutcome::Counted(_) => "COUNTED",
                    ReconcileOutcome::AlreadyCounted(_) => "ALREADY_COUNTED",
                    ReconcileOutcome::NotConfirmedYet { .. } => "NOT_CONFIRMED_YET",
                };
                AdapterReply::new(
                    200,
                    WebhookAdapterResponse {
                        status: "ok".to_string(),
                        outcome: label.to_string(),
                        event_id: Some(event_id),
                        donation_id: outcome
                            .counted_payment()
                            .map(|c| c.donation_id.as_str().to_string()),
                        reason: None,
                    },
                )
            }
            Err(e) => {
                warn!(error = %e, "gateway webhook failed");
                AdapterReply::new(
                    webhook_error_http_status(&e),
                    WebhookAdapterResponse {
                        status: "error".to_string(),
                        outcome: "REJECTED".to_string(),
                        reason: Some(e.to_string()),
                        ..Default::default()
                    },
                )
            }
        }
    }

    pub fn health_report(&self) -> Result<AdapterHealthResponse, String> {
        let counts = self
            .store
            .store_row_counts()
            .map_err(|e: StorageError| e.to_string())?;
        Ok(AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            reason: None,
            gateway_mode: self.gateway_mode().to_string(),
            webhook_enabled: self.webhook_enabled(),
            store: AdapterStoreCounters {
                campaigns: counts.campaigns,
                donations: counts.donations,
                payment_ledger: counts.payment_ledger,
                commits: counts.commits,
            },
        })
    }
}

fn parse_amount(field: &str, raw: &str) -> Result<Decimal, String> {
    Decimal::from_str(raw.trim()).map_err(|err| format!("{field} '{raw}' is not a decimal: {err}"))
}

fn verify_rejected(
    http_status: u16,
    reason: String,
) -> AdapterReply<VerifyDonationAdapterResponse> {
    AdapterReply::new(
        http_status,
        VerifyDonationAdapterResponse {
            status: "error".to_string(),
            outcome: "REJECTED".to_string(),
            reason: Some(reason),
            ..Default::default()
        },
    )
}

fn audit_response(report: &CampaignConsistencyReport) -> CampaignAuditAdapterResponse {
    CampaignAuditAdapterResponse {
        status: "ok".to_string(),
        campaign_id: report.campaign_id.as_str().to_string(),
        consistent: report.consistent,
        stored_total: Some(report.stored_total.to_string()),
        expected_total: Some(report.expected_total.to_string()),
        stored_donors_count: report.stored_donors_count,
        expected_donors_count: report.expected_donors_count,
        counted_ledger_entries: report.counted_ledger_entries,
        unbound_donations: report
            .unbound_donations
            .iter()
            .map(|d| d.as_str().to_string())
            .collect(),
        dangling_ledger_entries: report
            .dangling_ledger_entries
            .iter()
            .map(|r| r.as_str().to_string())
            .collect(),
        reason: None,
    }
}
