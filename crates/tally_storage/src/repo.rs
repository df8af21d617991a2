#![forbid(unsafe_code)]

use tally_contracts::campaign::{CampaignAggregate, CampaignId};
use tally_contracts::donation::{DonationId, DonationRecord};
use tally_contracts::ledger::{PaymentLedgerEntry, PaymentReference};

use crate::store::{DonationStore, StorageError, StoreRowCounts, StoreTransaction};

/// Typed repository interface for the `campaigns` + `donations` tables.
pub trait DonationTablesRepo {
    fn insert_campaign_row(&self, record: CampaignAggregate) -> Result<(), StorageError>;
    fn campaign_row(&self, campaign_id: &CampaignId)
        -> Result<Option<CampaignAggregate>, StorageError>;
    fn donation_row(&self, donation_id: &DonationId)
        -> Result<Option<DonationRecord>, StorageError>;
    fn donation_rows_for_campaign(
        &self,
        campaign_id: &CampaignId,
    ) -> Result<Vec<DonationRecord>, StorageError>;
}

/// Typed repository interface for the `payment_ledger` idempotency table.
pub trait PaymentLedgerRepo {
    fn payment_ledger_row(
        &self,
        payment_reference: &PaymentReference,
    ) -> Result<Option<PaymentLedgerEntry>, StorageError>;
    fn payment_ledger_rows(&self) -> Result<Vec<PaymentLedgerEntry>, StorageError>;
}

/// Entry point for the only writer path of campaign totals.
pub trait ReconcileTxnRepo {
    fn begin_reconcile_txn(&self) -> StoreTransaction<'_>;
    fn store_row_counts(&self) -> Result<StoreRowCounts, StorageError>;
}

impl DonationTablesRepo for DonationStore {
    fn insert_campaign_row(&self, record: CampaignAggregate) -> Result<(), StorageError> {
        self.insert_campaign(record)
    }

    fn campaign_row(
        &self,
        campaign_id: &CampaignId,
    ) -> Result<Option<CampaignAggregate>, StorageError> {
        self.campaign(campaign_id)
    }

    fn donation_row(
        &self,
        donation_id: &DonationId,
    ) -> Result<Option<DonationRecord>, StorageError> {
        self.donation(donation_id)
    }

    fn donation_rows_for_campaign(
        &self,
        campaign_id: &CampaignId,
    ) -> Result<Vec<DonationRecord>, StorageError> {
        DonationStore::donation_rows_for_campaign(self, campaign_id)
    }
}

impl PaymentLedgerRepo for DonationStore {
    fn payment_ledger_row(
        &self,
        payment_reference: &PaymentReference,
    ) -> Result<Option<PaymentLedgerEntry>, StorageError> {
        self.payment_ledger_entry(payment_reference)
    }

    fn payment_ledger_rows(&self) -> Result<Vec<PaymentLedgerEntry>, StorageError> {
        DonationStore::payment_ledger_rows(self)
    }
}

impl ReconcileTxnRepo for DonationStore {
    fn begin_reconcile_txn(&self) -> StoreTransaction<'_> {
        self.begin_transaction()
    }

    fn store_row_counts(&self) -> Result<StoreRowCounts, StorageError> {
        self.row_counts()
    }
}
