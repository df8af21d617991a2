#![forbid(unsafe_code)]

use rust_decimal::Decimal;
use tally_contracts::campaign::{CampaignAggregate, CampaignId};
use tally_contracts::donation::{DonationId, DonationRecord};
use tally_contracts::ledger::PaymentReference;
use tally_contracts::money::CurrencyCode;
use tally_contracts::MonotonicTimeNs;
use tally_storage::repo::DonationTablesRepo;
use tally_storage::store::{DonationStore, StorageError};

fn campaign_id(id: &str) -> CampaignId {
    CampaignId::new(id).unwrap()
}

fn gbp() -> CurrencyCode {
    CurrencyCode::new("GBP").unwrap()
}

fn seed_campaign(s: &DonationStore, id: &str) {
    s.insert_campaign_row(
        CampaignAggregate::empty_v1(campaign_id(id), gbp(), None, MonotonicTimeNs(1)).unwrap(),
    )
    .unwrap();
}

fn donation(id: &str, campaign: &str, reference: &str, amount: i64, at: u64) -> DonationRecord {
    DonationRecord::confirmed_v1(
        DonationId::new(id).unwrap(),
        campaign_id(campaign),
        "Dbw Donor".to_string(),
        Decimal::new(amount, 0),
        gbp(),
        PaymentReference::new(reference).unwrap(),
        MonotonicTimeNs(at),
    )
    .unwrap()
}

fn append_donation(s: &DonationStore, row: DonationRecord) -> Result<(), StorageError> {
    let mut tx = s.begin_transaction();
    tx.insert_donation(row)?;
    tx.commit().map(|_| ())
}

#[test]
fn at_don_db_01_campaign_insert_rejects_duplicate_key() {
    let s = DonationStore::new_in_memory();
    seed_campaign(&s, "camp_a");
    let dup = s.insert_campaign_row(
        CampaignAggregate::empty_v1(campaign_id("camp_a"), gbp(), None, MonotonicTimeNs(2))
            .unwrap(),
    );
    assert!(matches!(dup, Err(StorageError::DuplicateKey { table: "campaigns", .. })));
    assert_eq!(s.row_counts().unwrap().campaigns, 1);
}

#[test]
fn at_don_db_02_donation_requires_existing_campaign() {
    let s = DonationStore::new_in_memory();
    let res = append_donation(&s, donation("don_1", "camp_missing", "pi_1", 5, 10));
    assert!(matches!(
        res,
        Err(StorageError::ForeignKeyViolation { table: "donations", .. })
    ));
    assert_eq!(s.row_counts().unwrap().donations, 0);
}

#[test]
fn at_don_db_03_donation_ids_are_append_only() {
    let s = DonationStore::new_in_memory();
    seed_campaign(&s, "camp_a");
    append_donation(&s, donation("don_1", "camp_a", "pi_1", 5, 10)).unwrap();
    let res = append_donation(&s, donation("don_1", "camp_a", "pi_2", 7, 11));
    assert!(matches!(res, Err(StorageError::DuplicateKey { table: "donations", .. })));

    let stored = s
        .donation_row(&DonationId::new("don_1").unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(stored.amount, Decimal::new(5, 0));
    assert_eq!(stored.payment_reference.as_str(), "pi_1");
}

#[test]
fn at_don_db_04_lookup_by_campaign_is_scoped_and_newest_first() {
    let s = DonationStore::new_in_memory();
    seed_campaign(&s, "camp_a");
    seed_campaign(&s, "camp_b");
    append_donation(&s, donation("don_1", "camp_a", "pi_1", 5, 10)).unwrap();
    append_donation(&s, donation("don_2", "camp_b", "pi_2", 6, 11)).unwrap();
    append_donation(&s, donation("don_3", "camp_a", "pi_3", 7, 12)).unwrap();

    let a = s.donation_rows_for_campaign(&campaign_id("camp_a")).unwrap();
    let ids: Vec<&str> = a.iter().map(|d| d.donation_id.as_str()).collect();
    assert_eq!(ids, vec!["don_3", "don_1"]);
    let b = s.donation_rows_for_campaign(&campaign_id("camp_b")).unwrap();
    assert_eq!(b.len(), 1);
    assert!(s
        .donation_rows_for_campaign(&campaign_id("camp_none"))
        .unwrap()
        .is_empty());
}

#[test]
fn at_don_db_05_invalid_campaign_row_rejected_before_write() {
    let s = DonationStore::new_in_memory();
    let mut bad =
        CampaignAggregate::empty_v1(campaign_id("camp_bad"), gbp(), None, MonotonicTimeNs(1))
            .unwrap();
    bad.total_donated = Decimal::new(-1, 0);
    assert!(matches!(
        s.insert_campaign_row(bad),
        Err(StorageError::ContractViolation(_))
    ));
    assert!(s.campaign_row(&campaign_id("camp_bad")).unwrap().is_none());
}
