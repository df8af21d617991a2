#![forbid(unsafe_code)]

use rust_decimal::Decimal;

use crate::common::{validate_id, validate_time};
use crate::money::{validate_non_negative_amount, validate_positive_amount, CurrencyCode};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const CAMPAIGN_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Upper bound of `CampaignAggregate::last_donors`.
pub const RECENT_DONORS_CAP: usize = 10;
pub const DONOR_NAME_MAX_CHARS: usize = 80;
pub const ANONYMOUS_DONOR_NAME: &str = "Anonymous";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CampaignId(String);

impl CampaignId {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = v.into();
        validate_id("campaign_id", &v, 128)?;
        Ok(Self(v))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for CampaignId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("campaign_id", &self.0, 128)
    }
}

/// Display name used for a donation; blank input becomes `ANONYMOUS_DONOR_NAME`.
pub fn normalize_donor_name(raw: Option<&str>) -> String {
    let trimmed = raw.map(str::trim).unwrap_or("");
    if trimmed.is_empty() {
        return ANONYMOUS_DONOR_NAME.to_string();
    }
    trimmed.chars().take(DONOR_NAME_MAX_CHARS).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentDonor {
    pub donor_name: String,
    pub amount: Decimal,
    pub at: MonotonicTimeNs,
}

impl Validate for RecentDonor {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.donor_name.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "recent_donor.donor_name",
                reason: "must not be empty",
            });
        }
        if self.donor_name.chars().count() > DONOR_NAME_MAX_CHARS {
            return Err(ContractViolation::InvalidValue {
                field: "recent_donor.donor_name",
                reason: "exceeds max length",
            });
        }
        validate_positive_amount("recent_donor.amount", self.amount)?;
        validate_time("recent_donor.at", self.at)
    }
}

/// Running totals for one campaign. Mutated only by the reconciliation transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignAggregate {
    pub schema_version: SchemaVersion,
    pub campaign_id: CampaignId,
    pub total_donated: Decimal,
    pub donors_count: u64,
    pub currency: CurrencyCode,
    pub goal_amount: Option<Decimal>,
    /// Most-recent-first, at most `RECENT_DONORS_CAP` entries.
    pub last_donors: Vec<RecentDonor>,
    pub updated_at: MonotonicTimeNs,
}

impl CampaignAggregate {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        campaign_id: CampaignId,
        total_donated: Decimal,
        donors_count: u64,
        currency: CurrencyCode,
        goal_amount: Option<Decimal>,
        last_donors: Vec<RecentDonor>,
        updated_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let c = Self {
            schema_version: CAMPAIGN_CONTRACT_VERSION,
            campaign_id,
            total_donated,
            donors_count,
            currency,
            goal_amount,
            last_donors,
            updated_at,
        };
        c.validate()?;
        Ok(c)
    }

    pub fn empty_v1(
        campaign_id: CampaignId,
        currency: CurrencyCode,
        goal_amount: Option<Decimal>,
        created_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        Self::v1(
            campaign_id,
            Decimal::ZERO,
            0,
            currency,
            goal_amount,
            Vec::new(),
            created_at,
        )
    }

    /// Aggregate after counting one more donation: total and donor count grow,
    /// the donor is prepended to `last_donors` and the list is capped.
    pub fn fold_counted_donation(
        &self,
        donor_name: &str,
        amount: Decimal,
        at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        validate_positive_amount("campaign_aggregate.fold.amount", amount)?;
        let donor = RecentDonor {
            donor_name: normalize_donor_name(Some(donor_name)),
            amount,
            at,
        };
        let mut last_donors = Vec::with_capacity(RECENT_DONORS_CAP);
        last_donors.push(donor);
        last_donors.extend(
            self.last_donors
                .iter()
                .take(RECENT_DONORS_CAP - 1)
                .cloned(),
        );
        let donors_count =
            self.donors_count
                .checked_add(1)
                .ok_or(ContractViolation::InvalidValue {
                    field: "campaign_aggregate.donors_count",
                    reason: "overflow",
                })?;
        let total_donated =
            self.total_donated
                .checked_add(amount)
                .ok_or(ContractViolation::InvalidValue {
                    field: "campaign_aggregate.total_donated",
                    reason: "overflow",
                })?;
        Self::v1(
            self.campaign_id.clone(),
            total_donated,
            donors_count,
            self.currency.clone(),
            self.goal_amount,
            last_donors,
            at.max(self.updated_at),
        )
    }

    pub fn goal_reached(&self) -> bool {
        self.goal_amount
            .map(|goal| self.total_donated >= goal)
            .unwrap_or(false)
    }
}

impl Validate for CampaignAggregate {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != CAMPAIGN_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "campaign_aggregate.schema_version",
                reason: "must match CAMPAIGN_CONTRACT_VERSION",
            });
        }
        self.campaign_id.validate()?;
        self.currency.validate()?;
        validate_non_negative_amount("campaign_aggregate.total_donated", self.total_donated)?;
        if let Some(goal) = self.goal_amount {
            validate_positive_amount("campaign_aggregate.goal_amount", goal)?;
        }
        if self.last_donors.len() > RECENT_DONORS_CAP {
            return Err(ContractViolation::InvalidValue {
                field: "campaign_aggregate.last_donors",
                reason: "exceeds RECENT_DONORS_CAP",
            });
        }
        if self.last_donors.len() as u64 > self.donors_count {
            return Err(ContractViolation::InvalidValue {
                field: "campaign_aggregate.last_donors",
                reason: "must not exceed donors_count",
            });
        }
        for d in &self.last_donors {
            d.validate()?;
        }
        validate_time("campaign_aggregate.updated_at", self.updated_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campaign(total: i64, donors: u64) -> CampaignAggregate {
        CampaignAggregate::v1(
            CampaignId::new("camp_roof_fund").unwrap(),
            Decimal::new(total, 0),
            donors,
            CurrencyCode::new("GBP").unwrap(),
            Some(Decimal::new(1_000, 0)),
            Vec::new(),
            MonotonicTimeNs(1),
        )
        .unwrap()
    }

    #[test]
    fn at_campaign_01_fold_adds_amount_and_donor() {
        let c = campaign(100, 2);
        let next = c
            .fold_counted_donation("Amira", Decimal::new(25, 0), MonotonicTimeNs(10))
            .unwrap();
        assert_eq!(next.total_donated, Decimal::new(125, 0));
        assert_eq!(next.donors_count, 3);
        assert_eq!(next.last_donors[0].amount, Decimal::new(25, 0));
        assert_eq!(next.last_donors[0].donor_name, "Amira");
        assert_eq!(next.updated_at, MonotonicTimeNs(10));
    }

    #[test]
    fn at_campaign_02_last_donors_capped_most_recent_first() {
        let mut c = campaign(0, 0);
        for i in 1..=12u64 {
            let name = format!("donor_{i}");
            c = c
                .fold_counted_donation(&name, Decimal::new(1, 0), MonotonicTimeNs(i))
                .unwrap();
        }
        assert_eq!(c.donors_count, 12);
        assert_eq!(c.last_donors.len(), RECENT_DONORS_CAP);
        assert_eq!(c.last_donors[0].donor_name, "donor_12");
        assert_eq!(c.last_donors[9].donor_name, "donor_3");
    }

    #[test]
    fn at_campaign_03_blank_donor_becomes_anonymous() {
        assert_eq!(normalize_donor_name(None), ANONYMOUS_DONOR_NAME);
        assert_eq!(normalize_donor_name(Some("   ")), ANONYMOUS_DONOR_NAME);
        let long = "x".repeat(200);
        assert_eq!(normalize_donor_name(Some(&long)).chars().count(), DONOR_NAME_MAX_CHARS);
    }

    #[test]
    fn at_campaign_04_non_positive_fold_rejected() {
        let c = campaign(10, 1);
        assert!(c
            .fold_counted_donation("x", Decimal::ZERO, MonotonicTimeNs(2))
            .is_err());
    }

    #[test]
    fn at_campaign_05_goal_reached() {
        let c = campaign(999, 5);
        assert!(!c.goal_reached());
        let c = c
            .fold_counted_donation("x", Decimal::new(1, 0), MonotonicTimeNs(2))
            .unwrap();
        assert!(c.goal_reached());
    }
}
