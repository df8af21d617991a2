#![forbid(unsafe_code)]

use std::sync::Barrier;
use std::thread;

use rust_decimal::Decimal;
use tally_contracts::campaign::{CampaignAggregate, CampaignId};
use tally_contracts::donation::{DonationId, DonationRecord};
use tally_contracts::ledger::{PaymentLedgerEntry, PaymentReference};
use tally_contracts::money::CurrencyCode;
use tally_contracts::MonotonicTimeNs;
use tally_storage::repo::ReconcileTxnRepo;
use tally_storage::store::{DonationStore, StorageError};

fn camp() -> CampaignId {
    CampaignId::new("camp_tx").unwrap()
}

fn gbp() -> CurrencyCode {
    CurrencyCode::new("GBP").unwrap()
}

fn store_with_campaign() -> DonationStore {
    let s = DonationStore::new_in_memory();
    s.insert_campaign(CampaignAggregate::empty_v1(camp(), gbp(), None, MonotonicTimeNs(1)).unwrap())
        .unwrap();
    s
}

fn donation(id: &str, reference: &str, amount: i64) -> DonationRecord {
    DonationRecord::confirmed_v1(
        DonationId::new(id).unwrap(),
        camp(),
        "Tx Donor".to_string(),
        Decimal::new(amount, 0),
        gbp(),
        PaymentReference::new(reference).unwrap(),
        MonotonicTimeNs(10),
    )
    .unwrap()
}

fn ledger(reference: &str, donation_id: &str, amount: i64) -> PaymentLedgerEntry {
    PaymentLedgerEntry::counted_v1(
        PaymentReference::new(reference).unwrap(),
        DonationId::new(donation_id).unwrap(),
        camp(),
        Decimal::new(amount, 0),
        gbp(),
        MonotonicTimeNs(10),
    )
    .unwrap()
}

/// Read ledger + campaign, then write donation, aggregate and ledger.
fn count_once(
    s: &DonationStore,
    reference: &str,
    donation_id: &str,
    amount: i64,
) -> Result<(), StorageError> {
    let r = PaymentReference::new(reference).unwrap();
    let mut tx = s.begin_reconcile_txn();
    if tx.read_payment_ledger(&r)?.is_some() {
        return Ok(());
    }
    let c = tx.read_campaign(&camp())?.expect("campaign seeded");
    let next = c
        .fold_counted_donation("Tx Donor", Decimal::new(amount, 0), MonotonicTimeNs(10))
        .unwrap();
    tx.insert_donation(donation(donation_id, reference, amount))?;
    tx.merge_campaign(next)?;
    tx.merge_payment_ledger(ledger(reference, donation_id, amount))?;
    tx.commit().map(|_| ())
}

#[test]
fn at_tx_db_01_read_after_write_rejected() {
    let s = store_with_campaign();
    let mut tx = s.begin_transaction();
    tx.insert_donation(donation("don_1", "pi_1", 5)).unwrap();
    let res = tx.read_campaign(&camp());
    assert_eq!(res, Err(StorageError::ReadAfterWrite));
}

#[test]
fn at_tx_db_02_changed_campaign_between_read_and_commit_conflicts() {
    let s = store_with_campaign();

    let mut slow = s.begin_transaction();
    let c = slow.read_campaign(&camp()).unwrap().unwrap();

    count_once(&s, "pi_fast", "don_fast", 5).unwrap();

    let next = c
        .fold_counted_donation("Slow", Decimal::new(3, 0), MonotonicTimeNs(11))
        .unwrap();
    slow.merge_campaign(next).unwrap();
    let res = slow.commit();
    assert!(matches!(
        res,
        Err(StorageError::TransactionConflict { table: "campaigns", .. })
    ));

    let stored = s.campaign(&camp()).unwrap().unwrap();
    assert_eq!(stored.total_donated, Decimal::new(5, 0));
    assert_eq!(stored.donors_count, 1);
}

#[test]
fn at_tx_db_03_observed_absence_is_part_of_read_set() {
    let s = store_with_campaign();
    let r = PaymentReference::new("pi_same").unwrap();

    let mut late = s.begin_transaction();
    assert!(late.read_payment_ledger(&r).unwrap().is_none());
    let c = late.read_campaign(&camp()).unwrap().unwrap();

    count_once(&s, "pi_same", "don_first", 5).unwrap();

    late.insert_donation(donation("don_second", "pi_same", 5))
        .unwrap();
    late.merge_campaign(
        c.fold_counted_donation("Late", Decimal::new(5, 0), MonotonicTimeNs(12))
            .unwrap(),
    )
    .unwrap();
    late.merge_payment_ledger(ledger("pi_same", "don_second", 5))
        .unwrap();
    assert!(late.commit().unwrap_err().is_conflict());

    assert_eq!(s.row_counts().unwrap().donations, 1);
    assert_eq!(s.campaign(&camp()).unwrap().unwrap().donors_count, 1);
}

#[test]
fn at_tx_db_04_failed_commit_writes_nothing() {
    let s = store_with_campaign();
    s.arm_commit_conflicts(1).unwrap();
    let res = count_once(&s, "pi_1", "don_1", 5);
    assert!(res.unwrap_err().is_conflict());

    let counts = s.store_row_counts().unwrap();
    assert_eq!(counts.donations, 0);
    assert_eq!(counts.payment_ledger, 0);
    assert_eq!(counts.commits, 0);
    assert_eq!(s.campaign(&camp()).unwrap().unwrap().total_donated, Decimal::ZERO);

    count_once(&s, "pi_1", "don_1", 5).unwrap();
    assert_eq!(s.store_row_counts().unwrap().commits, 1);
}

#[test]
fn at_tx_db_05_blind_campaign_write_rejected() {
    let s = store_with_campaign();
    let c = s.campaign(&camp()).unwrap().unwrap();
    let mut tx = s.begin_transaction();
    let res = tx.merge_campaign(
        c.fold_counted_donation("Blind", Decimal::new(1, 0), MonotonicTimeNs(5))
            .unwrap(),
    );
    assert!(matches!(res, Err(StorageError::UnreadWrite { table: "campaigns", .. })));
}

#[test]
fn at_tx_db_06_concurrent_writers_never_lose_updates() {
    const WRITERS: usize = 8;
    let s = store_with_campaign();
    let barrier = Barrier::new(WRITERS);

    thread::scope(|scope| {
        for i in 0..WRITERS {
            let s = &s;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                let reference = format!("pi_{i}");
                let donation_id = format!("don_{i}");
                loop {
                    match count_once(s, &reference, &donation_id, (i as i64) + 1) {
                        Ok(()) => break,
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => panic!("unexpected storage error: {e}"),
                    }
                }
            });
        }
    });

    let c = s.campaign(&camp()).unwrap().unwrap();
    let expected: i64 = (1..=WRITERS as i64).sum();
    assert_eq!(c.total_donated, Decimal::new(expected, 0));
    assert_eq!(c.donors_count, WRITERS as u64);
    let donations_sum: Decimal = s.donation_rows().unwrap().iter().map(|d| d.amount).sum();
    assert_eq!(donations_sum, c.total_donated);
}
