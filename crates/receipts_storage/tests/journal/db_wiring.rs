#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;

use receipts_kernel_contracts::audit::{AuditAction, AuditSeverity};
use receipts_kernel_contracts::message::GroupId;
use receipts_kernel_contracts::query::{QueryRecordInput, QueryStatus};
use receipts_kernel_contracts::receipt::CustomerName;
use receipts_kernel_contracts::MonotonicTimeNs;
use receipts_storage::audit::AuditWriter;
use receipts_storage::store::{ReceiptStore, StorageError};

fn journal_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("receipts_journal_{name}_{}", MonotonicTimeNs::now().0))
        .join("store.jsonl")
}

#[test]
fn at_journal_db_01_mutations_replay_into_fresh_store() {
    let path = journal_path("replay");
    let group = GroupId::new("g@g.us").unwrap();
    let (kept, shipped) = {
        let mut s = ReceiptStore::open_journaled(path.clone()).unwrap();
        assert!(s.is_journaled());
        let kept = s
            .store_receipt(
                CustomerName::new("Maria Silva").unwrap(),
                "/img/a.sealed".to_string(),
                group.clone(),
                MonotonicTimeNs(10),
            )
            .unwrap();
        let shipped = s
            .store_receipt(
                CustomerName::new("Joao").unwrap(),
                "/img/b.sealed".to_string(),
                group.clone(),
                MonotonicTimeNs(20),
            )
            .unwrap();
        s.mark_forwarded(&shipped).unwrap();
        AuditWriter::emit_fields(
            &mut s,
            MonotonicTimeNs(21),
            AuditAction::MatchForwarded,
            AuditSeverity::Info,
            &[("receipt_id", shipped.as_str())],
        )
        .unwrap();
        s.append_query(
            QueryRecordInput::v1(
                MonotonicTimeNs(22),
                "Joao".to_string(),
                group.clone(),
                Some(shipped.clone()),
                100,
                QueryStatus::Enqueued,
            )
            .unwrap(),
        )
        .unwrap();
        (kept, shipped)
    };

    let lines = fs::read_to_string(&path).unwrap();
    assert_eq!(lines.lines().count(), 5);
    assert!(lines.lines().all(|l| l.contains("\"schema_version\":1")));

    let replayed = ReceiptStore::open_journaled(path.clone()).unwrap();
    assert_eq!(replayed.receipts().len(), 2);
    assert!(!replayed.receipt(&kept).unwrap().forwarded);
    assert!(replayed.receipt(&shipped).unwrap().forwarded);
    assert_eq!(replayed.audit_events().len(), 1);
    assert_eq!(replayed.queries().len(), 1);
    assert_eq!(replayed.list_unforwarded(10).len(), 1);

    let _ = fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn at_journal_db_02_unsupported_schema_fails_startup() {
    let path = journal_path("schema");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(
        &path,
        "{\"schema_version\":2,\"kind\":\"receipt_forwarded\",\"receipt_id\":\"x\"}\n",
    )
    .unwrap();
    let err = ReceiptStore::open_journaled(path.clone()).unwrap_err();
    assert!(matches!(err, StorageError::Journal(ref m) if m.contains("schema_version=2")));
    let _ = fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn at_journal_db_03_corrupt_rows_fail_replay() {
    let path = journal_path("corrupt");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(
        &path,
        "{\"schema_version\":1,\"kind\":\"receipt_forwarded\",\"receipt_id\":\"not-hex\"}\n",
    )
    .unwrap();
    assert!(matches!(
        ReceiptStore::open_journaled(path.clone()),
        Err(StorageError::Journal(_))
    ));
    let _ = fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn at_journal_db_04_torn_tail_is_dropped_and_next_append_starts_clean() {
    let path = journal_path("torn");
    let group = GroupId::new("g@g.us").unwrap();
    let first = {
        let mut s = ReceiptStore::open_journaled(path.clone()).unwrap();
        s.store_receipt(
            CustomerName::new("Maria Silva").unwrap(),
            "/img/a.sealed".to_string(),
            group.clone(),
            MonotonicTimeNs(10),
        )
        .unwrap()
    };
    let mut raw = fs::read(&path).unwrap();
    raw.extend_from_slice(b"{\"schema_version\":1,\"kind\":\"rece");
    fs::write(&path, &raw).unwrap();

    let second = {
        let mut s = ReceiptStore::open_journaled(path.clone()).unwrap();
        assert_eq!(s.receipts().len(), 1);
        assert!(s.receipt(&first).is_some());
        s.store_receipt(
            CustomerName::new("Joao").unwrap(),
            "/img/b.sealed".to_string(),
            group,
            MonotonicTimeNs(20),
        )
        .unwrap()
    };

    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), 2);
    assert!(text.ends_with('\n'));
    let replayed = ReceiptStore::open_journaled(path.clone()).unwrap();
    assert_eq!(replayed.receipts().len(), 2);
    assert!(replayed.receipt(&second).is_some());
    let _ = fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn at_journal_db_05_complete_tail_missing_newline_is_kept() {
    let path = journal_path("unterminated");
    {
        let mut s = ReceiptStore::open_journaled(path.clone()).unwrap();
        s.store_receipt(
            CustomerName::new("Ana").unwrap(),
            "/img/a.sealed".to_string(),
            GroupId::new("g@g.us").unwrap(),
            MonotonicTimeNs(10),
        )
        .unwrap();
    }
    let text = fs::read_to_string(&path).unwrap();
    fs::write(&path, text.trim_end_matches('\n')).unwrap();

    let replayed = ReceiptStore::open_journaled(path.clone()).unwrap();
    assert_eq!(replayed.receipts().len(), 1);
    assert!(fs::read_to_string(&path).unwrap().ends_with('\n'));
    let _ = fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn at_journal_db_06_garbage_before_the_last_line_still_fails() {
    let path = journal_path("midfile");
    {
        let mut s = ReceiptStore::open_journaled(path.clone()).unwrap();
        s.store_receipt(
            CustomerName::new("Ana").unwrap(),
            "/img/a.sealed".to_string(),
            GroupId::new("g@g.us").unwrap(),
            MonotonicTimeNs(10),
        )
        .unwrap();
    }
    let good = fs::read_to_string(&path).unwrap();
    fs::write(&path, format!("{{\"schema_version\":1,\"kind\":\"rece\n{good}")).unwrap();

    let err = ReceiptStore::open_journaled(path.clone()).unwrap_err();
    assert!(matches!(err, StorageError::Journal(ref m) if m.contains("at line 1")));
    let _ = fs::remove_dir_all(path.parent().unwrap());
}
