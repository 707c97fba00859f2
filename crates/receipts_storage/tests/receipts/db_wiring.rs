#![forbid(unsafe_code)]

use receipts_kernel_contracts::message::GroupId;
use receipts_kernel_contracts::receipt::{CustomerName, ReceiptId};
use receipts_kernel_contracts::MonotonicTimeNs;
use receipts_storage::repo::ReceiptRepo;
use receipts_storage::store::{ReceiptStore, StorageError};

fn group() -> GroupId {
    GroupId::new("120363403036388430@g.us").unwrap()
}

fn name(raw: &str) -> CustomerName {
    CustomerName::new(raw).unwrap()
}

fn store_named(s: &mut ReceiptStore, raw: &str, at: u64) -> ReceiptId {
    s.store_receipt_row(
        name(raw),
        format!("/var/receipts/{at}.sealed"),
        group(),
        MonotonicTimeNs(at),
    )
    .unwrap()
}

#[test]
fn at_receipts_db_01_store_generates_unique_unforwarded_rows() {
    let mut s = ReceiptStore::new_in_memory();
    let a = store_named(&mut s, "Maria Silva", 10);
    let b = store_named(&mut s, "Maria Silva", 20);
    assert_ne!(a, b);
    assert_eq!(a.as_str().len(), 32);

    let row = s.receipt_row(&a).unwrap();
    assert_eq!(row.customer_name.as_str(), "Maria Silva");
    assert_eq!(row.source_group, group());
    assert!(!row.forwarded);
    assert_eq!(s.receipts().len(), 2);
}

#[test]
fn at_receipts_db_02_unforwarded_pool_is_oldest_first_and_bounded() {
    let mut s = ReceiptStore::new_in_memory();
    let late = store_named(&mut s, "Late", 300);
    let early = store_named(&mut s, "Early", 100);
    let middle = store_named(&mut s, "Middle", 200);

    let pool: Vec<ReceiptId> = s
        .unforwarded_rows(10)
        .into_iter()
        .map(|r| r.receipt_id.clone())
        .collect();
    assert_eq!(pool, vec![early.clone(), middle.clone(), late]);

    let bounded = s.unforwarded_rows(2);
    assert_eq!(bounded.len(), 2);
    assert_eq!(bounded[0].receipt_id, early);

    s.mark_receipt_forwarded(&early).unwrap();
    assert_eq!(s.unforwarded_rows(1)[0].receipt_id, middle);
    assert_eq!(s.unforwarded_count(), 2);
}

#[test]
fn at_receipts_db_03_mark_forwarded_is_monotonic_and_idempotent() {
    let mut s = ReceiptStore::new_in_memory();
    let id = store_named(&mut s, "Ana", 10);
    assert!(s.mark_receipt_forwarded(&id).unwrap());
    assert!(!s.mark_receipt_forwarded(&id).unwrap());
    assert!(s.receipt_row(&id).unwrap().forwarded);
    assert!(s.unforwarded_rows(100).is_empty());
}

#[test]
fn at_receipts_db_04_unknown_receipt_is_not_found() {
    let mut s = ReceiptStore::new_in_memory();
    let missing = ReceiptId::from_bytes([7u8; 16]);
    assert!(s.receipt_row(&missing).is_none());
    let err = s.mark_receipt_forwarded(&missing).unwrap_err();
    assert!(matches!(err, StorageError::NotFound { table: "receipts", .. }));
}

#[test]
fn at_receipts_db_05_invalid_rows_are_refused() {
    let mut s = ReceiptStore::new_in_memory();
    let err = s
        .store_receipt_row(name("Ana"), "   ".to_string(), group(), MonotonicTimeNs(1))
        .unwrap_err();
    assert!(matches!(err, StorageError::ContractViolation(_)));
    assert!(s.receipts().is_empty());
}
