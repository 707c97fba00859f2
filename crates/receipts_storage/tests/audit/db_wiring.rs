#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use receipts_kernel_contracts::audit::{AuditAction, AuditEventId, AuditEventInput, AuditSeverity};
use receipts_kernel_contracts::message::GroupId;
use receipts_kernel_contracts::query::{QueryRecordInput, QueryStatus};
use receipts_kernel_contracts::receipt::ReceiptId;
use receipts_kernel_contracts::MonotonicTimeNs;
use receipts_storage::repo::{AuditRepo, QueryLogRepo};
use receipts_storage::store::{ReceiptStore, StorageError};

fn audit_input(at: u64, action: AuditAction) -> AuditEventInput {
    AuditEventInput::v1(
        MonotonicTimeNs(at),
        action,
        AuditSeverity::Info,
        BTreeMap::from([("group".to_string(), "g@g.us".to_string())]),
    )
    .unwrap()
}

#[test]
fn at_audit_db_01_rows_are_append_only_with_sequential_ids() {
    let mut s = ReceiptStore::new_in_memory();
    let first = s.append_audit_row(audit_input(10, AuditAction::ImageCached)).unwrap();
    let second = s.append_audit_row(audit_input(11, AuditAction::ReceiptStored)).unwrap();
    assert_eq!(first, AuditEventId(1));
    assert_eq!(second, AuditEventId(2));

    let err = s.attempt_overwrite_audit_event(first).unwrap_err();
    assert!(matches!(
        err,
        StorageError::AppendOnlyViolation {
            table: "audit_events"
        }
    ));
    assert_eq!(s.audit_rows().len(), 2);
}

#[test]
fn at_audit_db_02_rows_filter_by_action() {
    let mut s = ReceiptStore::new_in_memory();
    s.append_audit_row(audit_input(10, AuditAction::QueryNoMatch)).unwrap();
    s.append_audit_row(audit_input(11, AuditAction::ReceiptStored)).unwrap();
    s.append_audit_row(audit_input(12, AuditAction::QueryNoMatch)).unwrap();
    let rows = s.audit_rows_by_action(AuditAction::QueryNoMatch);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.action == AuditAction::QueryNoMatch));
}

#[test]
fn at_audit_db_03_query_log_keeps_match_details() {
    let mut s = ReceiptStore::new_in_memory();
    let matched = ReceiptId::from_bytes([1u8; 16]);
    let group = GroupId::new("g@g.us").unwrap();
    s.append_query_row(
        QueryRecordInput::v1(
            MonotonicTimeNs(5),
            "Maria Silvaa".to_string(),
            group.clone(),
            Some(matched.clone()),
            96,
            QueryStatus::Enqueued,
        )
        .unwrap(),
    )
    .unwrap();
    s.append_query_row(
        QueryRecordInput::v1(
            MonotonicTimeNs(6),
            "Nobody".to_string(),
            group,
            None,
            12,
            QueryStatus::NoMatch,
        )
        .unwrap(),
    )
    .unwrap();
    let rows = s.query_rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].matched_receipt_id, Some(matched));
    assert_eq!(rows[1].status, QueryStatus::NoMatch);
}
