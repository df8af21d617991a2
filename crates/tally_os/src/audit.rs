#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use tally_contracts::campaign::CampaignId;
use tally_contracts::donation::DonationId;
use tally_contracts::ledger::PaymentReference;
use tally_storage::repo::{DonationTablesRepo, PaymentLedgerRepo};
use tracing::warn;

use crate::reconcile::ReconcileError;

/// Campaign totals recomputed from the donation rows and the payment ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignConsistencyReport {
    pub campaign_id: CampaignId,
    pub consistent: bool,
    pub stored_total: Decimal,
    pub expected_total: Decimal,
    pub stored_donors_count: u64,
    pub expected_donors_count: u64,
    pub counted_ledger_entries: u64,
    /// Donations with no counted ledger entry bound to them.
    pub unbound_donations: Vec<DonationId>,
    /// Counted ledger entries whose donation row is missing.
    pub dangling_ledger_entries: Vec<PaymentReference>,
}

/// Campaigns seeded with an opening balance cannot be recomputed from rows alone;
/// `baseline_total` and `baseline_donors` carry that opening balance.
pub fn audit_campaign_consistency_with_baseline<S>(
    store: &S,
    campaign_id: &CampaignId,
    baseline_total: Decimal,
    baseline_donors: u64,
) -> Result<CampaignConsistencyReport, ReconcileError>
where
    S: DonationTablesRepo + PaymentLedgerRepo + ?Sized,
{
    let campaign = store.campaign_row(campaign_id)?.ok_or_else(|| {
        ReconcileError::CampaignNotFound {
            campaign_id: campaign_id.as_str().to_string(),
        }
    })?;
    let donations = store.donation_rows_for_campaign(campaign_id)?;
    let ledger: Vec<_> = store
        .payment_ledger_rows()?
        .into_iter()
        .filter(|e| e.counted && &e.campaign_id == campaign_id)
        .collect();

    let bound: BTreeSet<&DonationId> =
        ledger.iter().filter_map(|e| e.donation_id.as_ref()).collect();
    let present: BTreeSet<&DonationId> = donations.iter().map(|d| &d.donation_id).collect();

    let expected_total = donations
        .iter()
        .fold(baseline_total, |acc, d| acc + d.amount);
    let expected_donors_count = baseline_donors + donations.len() as u64;
    let unbound_donations: Vec<DonationId> = donations
        .iter()
        .filter(|d| !bound.contains(&d.donation_id))
        .map(|d| d.donation_id.clone())
        .collect();
    let dangling_ledger_entries: Vec<PaymentReference> = ledger
        .iter()
        .filter(|e| e.donation_id.as_ref().map_or(true, |id| !present.contains(id)))
        .map(|e| e.payment_reference.clone())
        .collect();

    let consistent = expected_total == campaign.total_donated
        && expected_donors_count == campaign.donors_count
        && unbound_donations.is_empty()
        && dangling_ledger_entries.is_empty();
    if !consistent {
        warn!(
            campaign_id = campaign_id.as_str(),
            stored_total = %campaign.total_donated,
            expected_total = %expected_total,
            "campaign aggregate drifted from donation rows"
        );
    }

    Ok(CampaignConsistencyReport {
        campaign_id: campaign_id.clone(),
        consistent,
        stored_total: campaign.total_donated,
        expected_total,
        stored_donors_count: campaign.donors_count,
        expected_donors_count,
        counted_ledger_entries: ledger.len() as u64,
        unbound_donations,
        dangling_ledger_entries,
    })
}

/// Audit for a campaign created empty: the aggregate must equal its donation rows.
pub fn audit_campaign_consistency<S>(
    store: &S,
    campaign_id: &CampaignId,
) -> Result<CampaignConsistencyReport, ReconcileError>
where
    S: DonationTablesRepo + PaymentLedgerRepo + ?Sized,
{
    audit_campaign_consistency_with_baseline(store, campaign_id, Decimal::ZERO, 0)
}
