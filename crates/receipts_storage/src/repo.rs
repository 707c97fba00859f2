#![forbid(unsafe_code)]

use receipts_kernel_contracts::audit::{AuditAction, AuditEvent, AuditEventId, AuditEventInput};
use receipts_kernel_contracts::message::GroupId;
use receipts_kernel_contracts::query::{QueryId, QueryRecord, QueryRecordInput};
use receipts_kernel_contracts::receipt::{CustomerName, Receipt, ReceiptId};
use receipts_kernel_contracts::MonotonicTimeNs;

use crate::store::{ReceiptStore, StorageError};

/// Typed repository interface for receipt persistence wiring.
pub trait ReceiptRepo {
    fn store_receipt_row(
        &mut self,
        customer_name: CustomerName,
        encrypted_image_path: String,
        source_group: GroupId,
        created_at: MonotonicTimeNs,
    ) -> Result<ReceiptId, StorageError>;
    fn receipt_row(&self, receipt_id: &ReceiptId) -> Option<&Receipt>;
    fn unforwarded_rows(&self, limit: usize) -> Vec<&Receipt>;
    fn mark_receipt_forwarded(&mut self, receipt_id: &ReceiptId) -> Result<bool, StorageError>;
}

/// Typed repository interface for the append-only audit log.
pub trait AuditRepo {
    fn append_audit_row(&mut self, input: AuditEventInput) -> Result<AuditEventId, StorageError>;
    fn audit_rows(&self) -> &[AuditEvent];
    fn audit_rows_by_action(&self, action: AuditAction) -> Vec<&AuditEvent>;
}

pub trait QueryLogRepo {
    fn append_query_row(&mut self, input: QueryRecordInput) -> Result<QueryId, StorageError>;
    fn query_rows(&self) -> &[QueryRecord];
}

impl ReceiptRepo for ReceiptStore {
    fn store_receipt_row(
        &mut self,
        customer_name: CustomerName,
        encrypted_image_path: String,
        source_group: GroupId,
        created_at: MonotonicTimeNs,
    ) -> Result<ReceiptId, StorageError> {
        self.store_receipt(customer_name, encrypted_image_path, source_group, created_at)
    }

    fn receipt_row(&self, receipt_id: &ReceiptId) -> Option<&Receipt> {
        self.receipt(receipt_id)
    }

    fn unforwarded_rows(&self, limit: usize) -> Vec<&Receipt> {
        self.list_unforwarded(limit)
    }

    fn mark_receipt_forwarded(&mut self, receipt_id: &ReceiptId) -> Result<bool, StorageError> {
        self.mark_forwarded(receipt_id)
    }
}

impl AuditRepo for ReceiptStore {
    fn append_audit_row(&mut self, input: AuditEventInput) -> Result<AuditEventId, StorageError> {
        self.append_audit_event(input)
    }

    fn audit_rows(&self) -> &[AuditEvent] {
        self.audit_events()
    }

    fn audit_rows_by_action(&self, action: AuditAction) -> Vec<&AuditEvent> {
        self.audit_events_by_action(action)
    }
}

impl QueryLogRepo for ReceiptStore {
    fn append_query_row(&mut self, input: QueryRecordInput) -> Result<QueryId, StorageError> {
        self.append_query(input)
    }

    fn query_rows(&self) -> &[QueryRecord] {
        self.queries()
    }
}
