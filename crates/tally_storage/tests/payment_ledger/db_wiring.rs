#![forbid(unsafe_code)]

use rust_decimal::Decimal;
use tally_contracts::campaign::{CampaignAggregate, CampaignId};
use tally_contracts::donation::DonationId;
use tally_contracts::ledger::{PaymentLedgerEntry, PaymentReference};
use tally_contracts::money::CurrencyCode;
use tally_contracts::MonotonicTimeNs;
use tally_storage::repo::{DonationTablesRepo, PaymentLedgerRepo};
use tally_storage::store::{DonationStore, StorageError};

fn reference(r: &str) -> PaymentReference {
    PaymentReference::new(r).unwrap()
}

fn store_with_campaign() -> DonationStore {
    let s = DonationStore::new_in_memory();
    s.insert_campaign_row(
        CampaignAggregate::empty_v1(
            CampaignId::new("camp_ledger").unwrap(),
            CurrencyCode::new("GBP").unwrap(),
            None,
            MonotonicTimeNs(1),
        )
        .unwrap(),
    )
    .unwrap();
    s
}

fn counted(r: &str, donation_id: &str, at: u64) -> PaymentLedgerEntry {
    PaymentLedgerEntry::counted_v1(
        reference(r),
        DonationId::new(donation_id).unwrap(),
        CampaignId::new("camp_ledger").unwrap(),
        Decimal::new(10, 0),
        CurrencyCode::new("GBP").unwrap(),
        MonotonicTimeNs(at),
    )
    .unwrap()
}

fn write_entry(s: &DonationStore, entry: PaymentLedgerEntry) -> Result<(), StorageError> {
    let mut tx = s.begin_transaction();
    tx.read_payment_ledger(&entry.payment_reference)?;
    tx.merge_payment_ledger(entry)?;
    tx.commit().map(|_| ())
}

#[test]
fn at_ledger_db_01_entry_created_lazily_and_keyed_by_reference() {
    let s = store_with_campaign();
    assert!(s.payment_ledger_row(&reference("pi_1")).unwrap().is_none());
    write_entry(&s, counted("pi_1", "don_1", 5)).unwrap();

    let row = s.payment_ledger_row(&reference("pi_1")).unwrap().unwrap();
    assert!(row.counted);
    assert_eq!(row.donation_id.as_ref().map(|d| d.as_str()), Some("don_1"));
    assert_eq!(s.payment_ledger_rows().unwrap().len(), 1);
}

#[test]
fn at_ledger_db_02_counted_flag_never_reverts() {
    let s = store_with_campaign();
    write_entry(&s, counted("pi_1", "don_1", 5)).unwrap();

    let mut reverted = counted("pi_1", "don_1", 6);
    reverted.counted = false;
    let res = write_entry(&s, reverted);
    assert!(matches!(
        res,
        Err(StorageError::AppendOnlyViolation { table: "payment_ledger" })
    ));
    assert!(s.payment_ledger_row(&reference("pi_1")).unwrap().unwrap().counted);
}

#[test]
fn at_ledger_db_03_counted_reference_cannot_rebind_donation() {
    let s = store_with_campaign();
    write_entry(&s, counted("pi_1", "don_1", 5)).unwrap();
    let res = write_entry(&s, counted("pi_1", "don_2", 6));
    assert!(matches!(res, Err(StorageError::AppendOnlyViolation { .. })));

    // Same binding rewritten is accepted (merge is idempotent).
    write_entry(&s, counted("pi_1", "don_1", 7)).unwrap();
    let row = s.payment_ledger_row(&reference("pi_1")).unwrap().unwrap();
    assert_eq!(row.last_counted_at, Some(MonotonicTimeNs(7)));
}

#[test]
fn at_ledger_db_04_blind_ledger_write_rejected() {
    let s = store_with_campaign();
    let mut tx = s.begin_transaction();
    let res = tx.merge_payment_ledger(counted("pi_9", "don_9", 5));
    assert!(matches!(
        res,
        Err(StorageError::UnreadWrite { table: "payment_ledger", .. })
    ));
    assert_eq!(tx.staged_write_count(), 0);
}

#[test]
fn at_ledger_db_05_campaign_lookup_unaffected_by_ledger_writes() {
    let s = store_with_campaign();
    write_entry(&s, counted("pi_1", "don_1", 5)).unwrap();
    let c = s
        .campaign_row(&CampaignId::new("camp_ledger").unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(c.donors_count, 0);
    assert_eq!(c.total_donated, Decimal::ZERO);
}
