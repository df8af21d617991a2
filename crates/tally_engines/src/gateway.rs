#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tally_contracts::campaign::CampaignId;
use tally_contracts::gateway::{GatewayPayment, GatewayPaymentMetadata, GatewayPaymentStatus};
use tally_contracts::ledger::PaymentReference;
use tally_contracts::money::CurrencyCode;
use tally_contracts::Validate;
use url::Url;

pub const GATEWAY_PROVIDER: &str = "payment_gateway";
pub const GATEWAY_BASE_URL_DEFAULT: &str = "https://api.stripe.com/v1/payment_intents";
pub const GATEWAY_TIMEOUT_MS_DEFAULT: u64 = 10_000;
pub const GATEWAY_CONNECT_TIMEOUT_MS_DEFAULT: u64 = 3_000;

/// Failure to resolve a payment from the gateway. `safe_detail` never carries
/// credentials or response bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCallError {
    pub provider: &'static str,
    pub error_kind: &'static str,
    pub http_status: Option<u16>,
    pub retryable: bool,
}

impl GatewayCallError {
    pub fn retryable(error_kind: &'static str, http_status: Option<u16>) -> Self {
        Self {
            provider: GATEWAY_PROVIDER,
            error_kind,
            http_status,
            retryable: true,
        }
    }

    pub fn fatal(error_kind: &'static str, http_status: Option<u16>) -> Self {
        Self {
            provider: GATEWAY_PROVIDER,
            error_kind,
            http_status,
            retryable: false,
        }
    }

    pub fn is_unknown_reference(&self) -> bool {
        self.error_kind == "payment_not_found"
    }

    pub fn safe_detail(&self) -> String {
        match self.http_status {
            Some(status) => format!(
                "provider={} error={} status={} retryable={}",
                self.provider, self.error_kind, status, self.retryable
            ),
            None => format!(
                "provider={} error={} retryable={}",
                self.provider, self.error_kind, self.retryable
            ),
        }
    }
}

impl fmt::Display for GatewayCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.safe_detail())
    }
}

impl std::error::Error for GatewayCallError {}

/// Pull-style lookup of the authoritative state of one payment.
pub trait PaymentGateway: Send + Sync {
    fn retrieve_payment(
        &self,
        payment_reference: &PaymentReference,
    ) -> Result<GatewayPayment, GatewayCallError>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct GatewayHttpConfig {
    pub base_url: String,
    pub secret_key: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub user_agent: String,
}

impl fmt::Debug for GatewayHttpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayHttpConfig")
            .field("base_url", &self.base_url)
            .field("secret_key", &"<redacted>")
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl GatewayHttpConfig {
    /// `None` when no secret key is configured.
    pub fn from_env() -> Option<Self> {
        let secret_key = env::var("TALLY_GATEWAY_SECRET_KEY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())?;
        let base_url = env::var("TALLY_GATEWAY_BASE_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| GATEWAY_BASE_URL_DEFAULT.to_string());
        let request_timeout_ms = env::var("TALLY_GATEWAY_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (100..=60_000).contains(v))
            .unwrap_or(GATEWAY_TIMEOUT_MS_DEFAULT);
        let user_agent = env::var("TALLY_GATEWAY_USER_AGENT")
            .unwrap_or_else(|_| "tally-reconcile/1.0".to_string());
        Some(Self {
            base_url,
            secret_key,
            connect_timeout_ms: GATEWAY_CONNECT_TIMEOUT_MS_DEFAULT.min(request_timeout_ms),
            request_timeout_ms,
            user_agent,
        })
    }

    pub fn payment_url(
        &self,
        payment_reference: &PaymentReference,
    ) -> Result<Url, GatewayCallError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|_| GatewayCallError::fatal("config_invalid", None))?;
        url.path_segments_mut()
            .map_err(|_| GatewayCallError::fatal("config_invalid", None))?
            .pop_if_empty()
            .push(payment_reference.as_str());
        Ok(url)
    }
}

/// In-memory gateway used by local runs and tests.
#[derive(Debug, Default)]
pub struct FixturePaymentGateway {
    payments: Mutex<BTreeMap<PaymentReference, GatewayPayment>>,
    failures: Mutex<Vec<GatewayCallError>>,
    calls: Mutex<u64>,
}

impl FixturePaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_payment(&self, payment: GatewayPayment) {
        if let Ok(mut payments) = self.payments.lock() {
            payments.insert(payment.payment_reference.clone(), payment);
        }
    }

    /// Queues errors returned (in order) by the next calls, before any lookup.
    pub fn queue_failure(&self, err: GatewayCallError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(err);
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.lock().map(|c| *c).unwrap_or(0)
    }
}

impl PaymentGateway for FixturePaymentGateway {
    fn retrieve_payment(
        &self,
        payment_reference: &PaymentReference,
    ) -> Result<GatewayPayment, GatewayCallError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls = calls.saturating_add(1);
        }
        let mut failures = self
            .failures
            .lock()
            .map_err(|_| GatewayCallError::retryable("fixture_poisoned", None))?;
        if !failures.is_empty() {
            return Err(failures.remove(0));
        }
        drop(failures);
        let payments = self
            .payments
            .lock()
            .map_err(|_| GatewayCallError::retryable("fixture_poisoned", None))?;
        payments
            .get(payment_reference)
            .cloned()
            .ok_or_else(|| GatewayCallError::fatal("payment_not_found", Some(404)))
    }
}

#[derive(Debug, Clone)]
pub enum PaymentGatewayRuntime {
    Http(GatewayHttpConfig),
    Fixture(Arc<FixturePaymentGateway>),
    AlwaysFail { error_kind: &'static str },
}

impl Default for PaymentGatewayRuntime {
    fn default() -> Self {
        Self::from_env_or_fixture()
    }
}

impl PaymentGatewayRuntime {
    pub fn from_env_or_fixture() -> Self {
        if let Some(config) = GatewayHttpConfig::from_env() {
            return Self::Http(config);
        }
        Self::Fixture(Arc::new(FixturePaymentGateway::new()))
    }

    pub fn mode_label(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Fixture(_) => "fixture",
            Self::AlwaysFail { .. } => "always_fail",
        }
    }
}

impl PaymentGateway for PaymentGatewayRuntime {
    fn retrieve_payment(
        &self,
        payment_reference: &PaymentReference,
    ) -> Result<GatewayPayment, GatewayCallError> {
        match self {
            Self::Http(config) => retrieve_payment_http(config, payment_reference),
            Self::Fixture(fixture) => fixture.retrieve_payment(payment_reference),
            Self::AlwaysFail { error_kind } => Err(GatewayCallError::retryable(*error_kind, None)),
        }
    }
}

fn retrieve_payment_http(
    config: &GatewayHttpConfig,
    payment_reference: &PaymentReference,
) -> Result<GatewayPayment, GatewayCallError> {
    let url = config.payment_url(payment_reference)?;
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
        .timeout_read(Duration::from_millis(config.request_timeout_ms))
        .timeout_write(Duration::from_millis(config.request_timeout_ms))
        .user_agent(&config.user_agent)
        .build();
    let response = agent
        .get(url.as_str())
        .set("Accept", "application/json")
        .set("Authorization", &format!("Bearer {}", config.secret_key))
        .call()
        .map_err(gateway_error_from_ureq)?;
    let body: Value = serde_json::from_reader(response.into_reader())
        .map_err(|_| GatewayCallError::fatal("json_parse", None))?;
    parse_payment_object(&body, Some(payment_reference))
}

fn gateway_error_from_ureq(err: ureq::Error) -> GatewayCallError {
    match err {
        ureq::Error::Status(status, _) => gateway_error_from_status(status),
        ureq::Error::Transport(transport) => {
            let combined = format!("{:?} {}", transport.kind(), transport);
            GatewayCallError::retryable(classify_transport_error_kind(&combined), None)
        }
    }
}

fn gateway_error_from_status(status: u16) -> GatewayCallError {
    match status {
        404 => GatewayCallError::fatal("payment_not_found", Some(status)),
        401 | 403 => GatewayCallError::fatal("auth_rejected", Some(status)),
        408 | 409 | 429 => GatewayCallError::retryable("http_non_200", Some(status)),
        500..=599 => GatewayCallError::retryable("http_non_200", Some(status)),
        _ => GatewayCallError::fatal("http_non_200", Some(status)),
    }
}

fn classify_transport_error_kind(raw: &str) -> &'static str {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("tls") || lower.contains("ssl") {
        "tls"
    } else if lower.contains("dns") {
        "dns"
    } else if lower.contains("connection") || lower.contains("connect") {
        "connection"
    } else {
        "transport"
    }
}

fn str_at<'a>(root: &'a Value, pointers: &[&str]) -> Option<&'a str> {
    pointers
        .iter()
        .find_map(|p| root.pointer(p).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Parses a gateway payment object (pull response body or webhook `data.object`).
///
/// `amount` is read in minor units and converted with the currency exponent.
pub fn parse_payment_object(
    root: &Value,
    expected_reference: Option<&PaymentReference>,
) -> Result<GatewayPayment, GatewayCallError> {
    let shape_err = || GatewayCallError::fatal("json_shape", None);

    let payment_reference = str_at(root, &["/id"])
        .and_then(|id| PaymentReference::new(id).ok())
        .ok_or_else(shape_err)?;
    if let Some(expected) = expected_reference {
        if expected != &payment_reference {
            return Err(GatewayCallError::fatal("reference_mismatch", None));
        }
    }
    let status = str_at(root, &["/status"])
        .map(GatewayPaymentStatus::parse)
        .ok_or_else(shape_err)?;
    let currency = str_at(root, &["/currency"])
        .and_then(|c| CurrencyCode::new(c).ok())
        .ok_or_else(shape_err)?;
    let amount_minor = root
        .pointer("/amount")
        .and_then(Value::as_i64)
        .ok_or_else(shape_err)?;
    let amount = currency
        .from_minor_units(amount_minor)
        .map_err(|_| shape_err())?;
    let metadata = GatewayPaymentMetadata {
        campaign_id: str_at(root, &["/metadata/campaignId", "/metadata/campaign_id"])
            .and_then(|c| CampaignId::new(c).ok()),
        donor_name: str_at(root, &["/metadata/donorName", "/metadata/donor_name"])
            .map(str::to_string),
    };
    let payment = GatewayPayment {
        payment_reference,
        status,
        amount,
        currency,
        metadata,
    };
    payment.validate().map_err(|_| shape_err())?;
    Ok(payment)
}
