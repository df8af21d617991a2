#![forbid(unsafe_code)]

use rust_decimal::Decimal;

use crate::campaign::CampaignId;
use crate::common::{validate_id, validate_time};
use crate::donation::DonationId;
use crate::money::{validate_positive_amount, CurrencyCode};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const PAYMENT_LEDGER_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Gateway-issued payment identifier; globally unique per payment attempt.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PaymentReference(String);

impl PaymentReference {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = v.into();
        validate_id("payment_reference", &v, 255)?;
        Ok(Self(v))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PaymentReference {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("payment_reference", &self.0, 255)
    }
}

/// Idempotency marker for one payment reference.
///
/// `counted` is write-once: the store rejects any write that would flip it back to
/// false or rebind a counted reference to a different donation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentLedgerEntry {
    pub schema_version: SchemaVersion,
    pub payment_reference: PaymentReference,
    pub counted: bool,
    pub donation_id: Option<DonationId>,
    pub campaign_id: CampaignId,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub last_counted_at: Option<MonotonicTimeNs>,
}

impl PaymentLedgerEntry {
    pub fn counted_v1(
        payment_reference: PaymentReference,
        donation_id: DonationId,
        campaign_id: CampaignId,
        amount: Decimal,
        currency: CurrencyCode,
        counted_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let e = Self {
            schema_version: PAYMENT_LEDGER_CONTRACT_VERSION,
            payment_reference,
            counted: true,
            donation_id: Some(donation_id),
            campaign_id,
            amount,
            currency,
            last_counted_at: Some(counted_at),
        };
        e.validate()?;
        Ok(e)
    }
}

impl Validate for PaymentLedgerEntry {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PAYMENT_LEDGER_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "payment_ledger_entry.schema_version",
                reason: "must match PAYMENT_LEDGER_CONTRACT_VERSION",
            });
        }
        self.payment_reference.validate()?;
        self.campaign_id.validate()?;
        self.currency.validate()?;
        validate_positive_amount("payment_ledger_entry.amount", self.amount)?;
        if let Some(id) = &self.donation_id {
            id.validate()?;
        }
        if let Some(at) = self.last_counted_at {
            validate_time("payment_ledger_entry.last_counted_at", at)?;
        }
        if self.counted && (self.donation_id.is_none() || self.last_counted_at.is_none()) {
            return Err(ContractViolation::InvalidValue {
                field: "payment_ledger_entry.counted",
                reason: "counted=true requires donation_id and last_counted_at",
            });
        }
        Ok(())
    }
}
