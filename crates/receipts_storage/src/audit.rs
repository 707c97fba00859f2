#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use receipts_kernel_contracts::audit::{
    bounded_metadata_value, AuditAction, AuditEventId, AuditEventInput, AuditSeverity,
};
use receipts_kernel_contracts::MonotonicTimeNs;

use crate::store::{ReceiptStore, StorageError};

/// Append-only writer into the store's audit log. Metadata values are clipped, never rejected.
#[derive(Debug, Default)]
pub struct AuditWriter;

impl AuditWriter {
    pub fn emit(
        store: &mut ReceiptStore,
        input: AuditEventInput,
    ) -> Result<AuditEventId, StorageError> {
        store.append_audit_event(input)
    }

    pub fn emit_fields(
        store: &mut ReceiptStore,
        created_at: MonotonicTimeNs,
        action: AuditAction,
        severity: AuditSeverity,
        fields: &[(&str, &str)],
    ) -> Result<AuditEventId, StorageError> {
        let metadata: BTreeMap<String, String> = fields
            .iter()
            .map(|(k, v)| ((*k).to_string(), bounded_metadata_value(*v)))
            .collect();
        let input = AuditEventInput::v1(created_at, action, severity, metadata)?;
        Self::emit(store, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_audit_writer_01_long_values_are_clipped() {
        let mut store = ReceiptStore::new_in_memory();
        let long = "x".repeat(5_000);
        let id = AuditWriter::emit_fields(
            &mut store,
            MonotonicTimeNs(10),
            AuditAction::ReceiptProcessError,
            AuditSeverity::Error,
            &[("error", long.as_str()), ("group", "g@g.us")],
        )
        .unwrap();
        assert_eq!(id, AuditEventId(1));
        let ev = &store.audit_events()[0];
        assert!(ev.metadata["error"].len() <= 1_024);
        assert_eq!(ev.metadata["group"], "g@g.us");
    }

    #[test]
    fn at_audit_writer_02_invalid_input_is_refused() {
        let mut store = ReceiptStore::new_in_memory();
        let err = AuditWriter::emit_fields(
            &mut store,
            MonotonicTimeNs(0),
            AuditAction::ImageCached,
            AuditSeverity::Info,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::ContractViolation(_)));
        assert!(store.audit_events().is_empty());
    }
}
