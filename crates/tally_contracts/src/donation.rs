#![forbid(unsafe_code)]

use rust_decimal::Decimal;

use crate::campaign::{CampaignId, DONOR_NAME_MAX_CHARS};
use crate::common::{validate_id, validate_time};
use crate::ledger::PaymentReference;
use crate::money::{validate_positive_amount, CurrencyCode};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const DONATION_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DonationId(String);

impl DonationId {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = v.into();
        validate_id("donation_id", &v, 64)?;
        Ok(Self(v))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for DonationId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("donation_id", &self.0, 64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DonationStatus {
    Confirmed,
}

impl DonationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
        }
    }
}

/// One counted payment. Written once, never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationRecord {
    pub schema_version: SchemaVersion,
    pub donation_id: DonationId,
    pub campaign_id: CampaignId,
    pub donor_name: String,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub payment_reference: PaymentReference,
    pub status: DonationStatus,
    pub created_at: MonotonicTimeNs,
}

impl DonationRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn confirmed_v1(
        donation_id: DonationId,
        campaign_id: CampaignId,
        donor_name: String,
        amount: Decimal,
        currency: CurrencyCode,
        payment_reference: PaymentReference,
        created_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: DONATION_CONTRACT_VERSION,
            donation_id,
            campaign_id,
            donor_name,
            amount,
            currency,
            payment_reference,
            status: DonationStatus::Confirmed,
            created_at,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for DonationRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != DONATION_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "donation_record.schema_version",
                reason: "must match DONATION_CONTRACT_VERSION",
            });
        }
        self.donation_id.validate()?;
        self.campaign_id.validate()?;
        self.currency.validate()?;
        self.payment_reference.validate()?;
        if self.donor_name.trim().is_empty()
            || self.donor_name.chars().count() > DONOR_NAME_MAX_CHARS
        {
            return Err(ContractViolation::InvalidValue {
                field: "donation_record.donor_name",
                reason: "must be 1..=80 chars",
            });
        }
        validate_positive_amount("donation_record.amount", self.amount)?;
        validate_time("donation_record.created_at", self.created_at)
    }
}
