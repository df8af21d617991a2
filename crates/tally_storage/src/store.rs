#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tally_contracts::campaign::{CampaignAggregate, CampaignId};
use tally_contracts::donation::{DonationId, DonationRecord};
use tally_contracts::ledger::{PaymentLedgerEntry, PaymentReference};
use tally_contracts::{ContractViolation, Validate};
use thiserror::Error;

pub const TABLE_CAMPAIGNS: &str = "campaigns";
pub const TABLE_DONATIONS: &str = "donations";
pub const TABLE_PAYMENT_LEDGER: &str = "payment_ledger";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("foreign key violation table={table} key={key}")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("duplicate key table={table} key={key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("append-only violation table={table}")]
    AppendOnlyViolation { table: &'static str },
    /// A document in the read set changed between read and commit.
    #[error("transaction conflict table={table} key={key}")]
    TransactionConflict { table: &'static str, key: String },
    #[error("read issued after a staged write in the same transaction")]
    ReadAfterWrite,
    #[error("write to unread document table={table} key={key}")]
    UnreadWrite { table: &'static str, key: String },
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("contract violation: {0:?}")]
    ContractViolation(ContractViolation),
}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

impl StorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::TransactionConflict { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum DocKey {
    Campaign(CampaignId),
    PaymentLedger(PaymentReference),
}

impl DocKey {
    fn table(&self) -> &'static str {
        match self {
            DocKey::Campaign(_) => TABLE_CAMPAIGNS,
            DocKey::PaymentLedger(_) => TABLE_PAYMENT_LEDGER,
        }
    }

    fn key(&self) -> String {
        match self {
            DocKey::Campaign(id) => id.as_str().to_string(),
            DocKey::PaymentLedger(r) => r.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct VersionedRow<T> {
    version: u64,
    row: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreRowCounts {
    pub campaigns: u32,
    pub donations: u32,
    pub payment_ledger: u32,
    pub commits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    pub commit_seq: u64,
    pub written_rows: u16,
}

#[derive(Debug, Default)]
struct DonationTables {
    next_version: u64,
    commit_seq: u64,
    campaigns: BTreeMap<CampaignId, VersionedRow<CampaignAggregate>>,
    // Append-only; indexes point into this vector.
    donations: Vec<DonationRecord>,
    donation_index: BTreeMap<DonationId, usize>,
    donations_by_campaign: BTreeMap<CampaignId, Vec<usize>>,
    payment_ledger: BTreeMap<PaymentReference, VersionedRow<PaymentLedgerEntry>>,
    armed_commit_conflicts: u32,
}

impl DonationTables {
    fn bump_version(&mut self) -> u64 {
        self.next_version = self.next_version.saturating_add(1);
        self.next_version
    }

    fn current_version(&self, key: &DocKey) -> Option<u64> {
        match key {
            DocKey::Campaign(id) => self.campaigns.get(id).map(|r| r.version),
            DocKey::PaymentLedger(r) => self.payment_ledger.get(r).map(|r| r.version),
        }
    }
}

/// In-memory document store for campaign aggregates, donations and the payment
/// ledger, with optimistic multi-document transactions.
///
/// The table lock is held only for point reads and for commit validation + apply;
/// a transaction holds no lock between its reads and its commit.
#[derive(Debug, Default)]
pub struct DonationStore {
    tables: Mutex<DonationTables>,
}

impl DonationStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, DonationTables>, StorageError> {
        self.tables.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Seeds a campaign row. Campaign authoring owns this path; reconciliation
    /// never creates campaigns.
    pub fn insert_campaign(&self, record: CampaignAggregate) -> Result<(), StorageError> {
        record.validate()?;
        let mut t = self.lock()?;
        if t.campaigns.contains_key(&record.campaign_id) {
            return Err(StorageError::DuplicateKey {
                table: TABLE_CAMPAIGNS,
                key: record.campaign_id.as_str().to_string(),
            });
        }
        let version = t.bump_version();
        t.campaigns.insert(
            record.campaign_id.clone(),
            VersionedRow {
                version,
                row: record,
            },
        );
        Ok(())
    }

    pub fn campaign(
        &self,
        campaign_id: &CampaignId,
    ) -> Result<Option<CampaignAggregate>, StorageError> {
        let t = self.lock()?;
        Ok(t.campaigns.get(campaign_id).map(|r| r.row.clone()))
    }

    pub fn campaign_ids(&self) -> Result<Vec<CampaignId>, StorageError> {
        let t = self.lock()?;
        Ok(t.campaigns.keys().cloned().collect())
    }

    pub fn donation(
        &self,
        donation_id: &DonationId,
    ) -> Result<Option<DonationRecord>, StorageError> {
        let t = self.lock()?;
        Ok(t
            .donation_index
            .get(donation_id)
            .and_then(|idx| t.donations.get(*idx))
            .cloned())
    }

    pub fn donation_rows(&self) -> Result<Vec<DonationRecord>, StorageError> {
        let t = self.lock()?;
        Ok(t.donations.clone())
    }

    /// Donations for one campaign, newest first.
    pub fn donation_rows_for_campaign(
        &self,
        campaign_id: &CampaignId,
    ) -> Result<Vec<DonationRecord>, StorageError> {
        let t = self.lock()?;
        let Some(indexes) = t.donations_by_campaign.get(campaign_id) else {
            return Ok(Vec::new());
        };
        Ok(indexes
            .iter()
            .rev()
            .filter_map(|idx| t.donations.get(*idx))
            .cloned()
            .collect())
    }

    pub fn payment_ledger_entry(
        &self,
        payment_reference: &PaymentReference,
    ) -> Result<Option<PaymentLedgerEntry>, StorageError> {
        let t = self.lock()?;
        Ok(t.payment_ledger.get(payment_reference).map(|r| r.row.clone()))
    }

    pub fn payment_ledger_rows(&self) -> Result<Vec<PaymentLedgerEntry>, StorageError> {
        let t = self.lock()?;
        Ok(t.payment_ledger.values().map(|r| r.row.clone()).collect())
    }

    pub fn row_counts(&self) -> Result<StoreRowCounts, StorageError> {
        let t = self.lock()?;
        Ok(StoreRowCounts {
            campaigns: t.campaigns.len() as u32,
            donations: t.donations.len() as u32,
            payment_ledger: t.payment_ledger.len() as u32,
            commits: t.commit_seq,
        })
    }

    pub fn begin_transaction(&self) -> StoreTransaction<'_> {
        StoreTransaction {
            store: self,
            read_set: BTreeMap::new(),
            writes: Vec::new(),
        }
    }

    /// Fault drill: the next `count` commits fail with `TransactionConflict` as if
    /// a concurrent writer had won the race.
    pub fn arm_commit_conflicts(&self, count: u32) -> Result<(), StorageError> {
        let mut t = self.lock()?;
        t.armed_commit_conflicts = count;
        Ok(())
    }

    fn observe(
        &self,
        key: &DocKey,
    ) -> Result<(Option<u64>, Option<ObservedRow>), StorageError> {
        let t = self.lock()?;
        Ok(match key {
            DocKey::Campaign(id) => match t.campaigns.get(id) {
                Some(r) => (Some(r.version), Some(ObservedRow::Campaign(r.row.clone()))),
                None => (None, None),
            },
            DocKey::PaymentLedger(reference) => match t.payment_ledger.get(reference) {
                Some(r) => (
                    Some(r.version),
                    Some(ObservedRow::PaymentLedger(r.row.clone())),
                ),
                None => (None, None),
            },
        })
    }

    fn commit_staged(
        &self,
        read_set: &BTreeMap<DocKey, Option<u64>>,
        writes: Vec<StagedWrite>,
    ) -> Result<CommitReceipt, StorageError> {
        let mut t = self.lock()?;

        if t.armed_commit_conflicts > 0 {
            t.armed_commit_conflicts -= 1;
            let (table, key) = read_set
                .keys()
                .next()
                .map(|k| (k.table(), k.key()))
                .unwrap_or((TABLE_CAMPAIGNS, String::new()));
            return Err(StorageError::TransactionConflict { table, key });
        }

        for (key, observed) in read_set {
            if t.current_version(key) != *observed {
                return Err(StorageError::TransactionConflict {
                    table: key.table(),
                    key: key.key(),
                });
            }
        }

        validate_staged_writes(&t, &writes)?;

        let written_rows = writes.len() as u16;
        for w in writes {
            match w {
                StagedWrite::InsertDonation(row) => {
                    let idx = t.donations.len();
                    t.donation_index.insert(row.donation_id.clone(), idx);
                    t.donations_by_campaign
                        .entry(row.campaign_id.clone())
                        .or_default()
                        .push(idx);
                    t.donations.push(row);
                }
                StagedWrite::MergeCampaign(row) => {
                    let version = t.bump_version();
                    t.campaigns
                        .insert(row.campaign_id.clone(), VersionedRow { version, row });
                }
                StagedWrite::MergePaymentLedger(row) => {
                    let version = t.bump_version();
                    t.payment_ledger
                        .insert(row.payment_reference.clone(), VersionedRow { version, row });
                }
            }
        }
        t.commit_seq = t.commit_seq.saturating_add(1);
        Ok(CommitReceipt {
            commit_seq: t.commit_seq,
            written_rows,
        })
    }
}

fn validate_staged_writes(
    t: &DonationTables,
    writes: &[StagedWrite],
) -> Result<(), StorageError> {
    for w in writes {
        match w {
            StagedWrite::InsertDonation(row) => {
                if t.donation_index.contains_key(&row.donation_id) {
                    return Err(StorageError::DuplicateKey {
                        table: TABLE_DONATIONS,
                        key: row.donation_id.as_str().to_string(),
                    });
                }
                let campaign_known = t.campaigns.contains_key(&row.campaign_id)
                    || writes.iter().any(|other| match other {
                        StagedWrite::MergeCampaign(c) => c.campaign_id == row.campaign_id,
                        _ => false,
                    });
                if !campaign_known {
                    return Err(StorageError::ForeignKeyViolation {
                        table: TABLE_DONATIONS,
                        key: row.campaign_id.as_str().to_string(),
                    });
                }
            }
            StagedWrite::MergeCampaign(_) => {}
            StagedWrite::MergePaymentLedger(row) => {
                if let Some(existing) = t.payment_ledger.get(&row.payment_reference) {
                    if existing.row.counted
                        && (!row.counted || existing.row.donation_id != row.donation_id)
                    {
                        return Err(StorageError::AppendOnlyViolation {
                            table: TABLE_PAYMENT_LEDGER,
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
enum ObservedRow {
    Campaign(CampaignAggregate),
    PaymentLedger(PaymentLedgerEntry),
}

#[derive(Debug, Clone)]
enum StagedWrite {
    InsertDonation(DonationRecord),
    MergeCampaign(CampaignAggregate),
    MergePaymentLedger(PaymentLedgerEntry),
}

/// Optimistic transaction over campaigns, donations and the payment ledger.
///
/// All reads must precede all writes. Commit fails with `TransactionConflict` when
/// any document in the read set (including one observed as absent) changed.
#[derive(Debug)]
pub struct StoreTransaction<'a> {
    store: &'a DonationStore,
    read_set: BTreeMap<DocKey, Option<u64>>,
    writes: Vec<StagedWrite>,
}

impl<'a> StoreTransaction<'a> {
    fn read(&mut self, key: DocKey) -> Result<Option<ObservedRow>, StorageError> {
        if !self.writes.is_empty() {
            return Err(StorageError::ReadAfterWrite);
        }
        let (version, row) = self.store.observe(&key)?;
        if let Some(first) = self.read_set.get(&key) {
            if *first != version {
                return Err(StorageError::TransactionConflict {
                    table: key.table(),
                    key: key.key(),
                });
            }
        } else {
            self.read_set.insert(key, version);
        }
        Ok(row)
    }

    pub fn read_payment_ledger(
        &mut self,
        payment_reference: &PaymentReference,
    ) -> Result<Option<PaymentLedgerEntry>, StorageError> {
        match self.read(DocKey::PaymentLedger(payment_reference.clone()))? {
            Some(ObservedRow::PaymentLedger(row)) => Ok(Some(row)),
            _ => Ok(None),
        }
    }

    pub fn read_campaign(
        &mut self,
        campaign_id: &CampaignId,
    ) -> Result<Option<CampaignAggregate>, StorageError> {
        match self.read(DocKey::Campaign(campaign_id.clone()))? {
            Some(ObservedRow::Campaign(row)) => Ok(Some(row)),
            _ => Ok(None),
        }
    }

    pub fn insert_donation(&mut self, row: DonationRecord) -> Result<(), StorageError> {
        row.validate()?;
        self.writes.push(StagedWrite::InsertDonation(row));
        Ok(())
    }

    pub fn merge_campaign(&mut self, row: CampaignAggregate) -> Result<(), StorageError> {
        row.validate()?;
        let key = DocKey::Campaign(row.campaign_id.clone());
        self.require_read(&key)?;
        self.writes.push(StagedWrite::MergeCampaign(row));
        Ok(())
    }

    pub fn merge_payment_ledger(&mut self, row: PaymentLedgerEntry) -> Result<(), StorageError> {
        row.validate()?;
        let key = DocKey::PaymentLedger(row.payment_reference.clone());
        self.require_read(&key)?;
        self.writes.push(StagedWrite::MergePaymentLedger(row));
        Ok(())
    }

    fn require_read(&self, key: &DocKey) -> Result<(), StorageError> {
        if !self.read_set.contains_key(key) {
            return Err(StorageError::UnreadWrite {
                table: key.table(),
                key: key.key(),
            });
        }
        Ok(())
    }

    pub fn staged_write_count(&self) -> usize {
        self.writes.len()
    }

    pub fn commit(self) -> Result<CommitReceipt, StorageError> {
        self.store.commit_staged(&self.read_set, self.writes)
    }
}
