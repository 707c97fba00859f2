#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use rand::rngs::OsRng;
use rand::RngCore;

use receipts_kernel_contracts::audit::{
    AuditAction, AuditEvent, AuditEventId, AuditEventInput, AuditSeverity,
};
use receipts_kernel_contracts::message::GroupId;
use receipts_kernel_contracts::query::{QueryId, QueryRecord, QueryRecordInput, QueryStatus};
use receipts_kernel_contracts::receipt::{CustomerName, Receipt, ReceiptId};
use receipts_kernel_contracts::{ContractViolation, MonotonicTimeNs};

use crate::journal::{JournalRecord, StoreJournal};

const RECEIPT_ID_ATTEMPTS: usize = 4;

#[derive(Debug)]
pub enum StorageError {
    NotFound { table: &'static str, key: String },
    DuplicateKey { table: &'static str, key: String },
    AppendOnlyViolation { table: &'static str },
    ContractViolation(ContractViolation),
    Journal(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { table, key } => write!(f, "{table}: no row for key {key}"),
            Self::DuplicateKey { table, key } => write!(f, "{table}: duplicate key {key}"),
            Self::AppendOnlyViolation { table } => write!(f, "{table} is append-only"),
            Self::ContractViolation(v) => write!(f, "contract violation: {v}"),
            Self::Journal(detail) => f.write_str(detail),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

/// Receipts, audit log and query log. Receipts keep insertion order; the index maps ids to
/// positions. Audit and query rows are append-only.
#[derive(Debug)]
pub struct ReceiptStore {
    receipts: Vec<Receipt>,
    receipt_index: BTreeMap<ReceiptId, usize>,
    audit_events: Vec<AuditEvent>,
    next_audit_event_id: u64,
    queries: Vec<QueryRecord>,
    next_query_id: u64,
    journal: Option<StoreJournal>,
}

impl ReceiptStore {
    pub fn new_in_memory() -> Self {
        Self {
            receipts: Vec::new(),
            receipt_index: BTreeMap::new(),
            audit_events: Vec::new(),
            next_audit_event_id: 1,
            queries: Vec::new(),
            next_query_id: 1,
            journal: None,
        }
    }

    /// Replays `path` into a fresh store, then journals every later mutation to it.
    pub fn open_journaled(path: PathBuf) -> Result<Self, StorageError> {
        let journal = StoreJournal::open(path)?;
        let mut store = Self::new_in_memory();
        for (idx, record) in journal.read_all()?.into_iter().enumerate() {
            store.apply(record).map_err(|err| {
                StorageError::Journal(format!("journal replay failed at entry {}: {}", idx + 1, err))
            })?;
        }
        store.journal = Some(journal);
        Ok(store)
    }

    pub fn is_journaled(&self) -> bool {
        self.journal.is_some()
    }

    pub fn store_receipt(
        &mut self,
        customer_name: CustomerName,
        encrypted_image_path: String,
        source_group: GroupId,
        created_at: MonotonicTimeNs,
    ) -> Result<ReceiptId, StorageError> {
        let receipt_id = self.fresh_receipt_id()?;
        let receipt = Receipt::v1(
            receipt_id.clone(),
            customer_name,
            encrypted_image_path,
            source_group,
            created_at,
        )?;
        self.journal_append(JournalRecord::ReceiptStored {
            receipt_id: receipt.receipt_id.as_str().to_string(),
            customer_name: receipt.customer_name.as_str().to_string(),
            encrypted_image_path: receipt.encrypted_image_path.clone(),
            source_group: receipt.source_group.as_str().to_string(),
            created_at_ns: receipt.created_at.0,
        })?;
        self.insert_receipt(receipt)?;
        Ok(receipt_id)
    }

    pub fn receipt(&self, receipt_id: &ReceiptId) -> Option<&Receipt> {
        self.receipt_index
            .get(receipt_id)
            .and_then(|idx| self.receipts.get(*idx))
    }

    pub fn receipts(&self) -> &[Receipt] {
        &self.receipts
    }

    /// Oldest first, ties in insertion order.
    pub fn list_unforwarded(&self, limit: usize) -> Vec<&Receipt> {
        let mut pool: Vec<&Receipt> = self.receipts.iter().filter(|r| !r.forwarded).collect();
        pool.sort_by_key(|r| r.created_at);
        pool.truncate(limit);
        pool
    }

    pub fn unforwarded_count(&self) -> usize {
        self.receipts.iter().filter(|r| !r.forwarded).count()
    }

    /// `Ok(true)` on the false -> true transition, `Ok(false)` when already forwarded.
    pub fn mark_forwarded(&mut self, receipt_id: &ReceiptId) -> Result<bool, StorageError> {
        let idx = *self
            .receipt_index
            .get(receipt_id)
            .ok_or_else(|| StorageError::NotFound {
                table: "receipts",
                key: receipt_id.as_str().to_string(),
            })?;
        if self.receipts[idx].forwarded {
            return Ok(false);
        }
        self.journal_append(JournalRecord::ReceiptForwarded {
            receipt_id: receipt_id.as_str().to_string(),
        })?;
        self.receipts[idx].forwarded = true;
        Ok(true)
    }

    pub fn append_audit_event(
        &mut self,
        input: AuditEventInput,
    ) -> Result<AuditEventId, StorageError> {
        self.journal_append(JournalRecord::AuditAppended {
            created_at_ns: input.created_at.0,
            action: input.action.as_str().to_string(),
            severity: input.severity.as_str().to_string(),
            metadata: input.metadata.clone(),
        })?;
        Ok(self.push_audit_event(input))
    }

    pub fn audit_events(&self) -> &[AuditEvent] {
        &self.audit_events
    }

    pub fn audit_events_by_action(&self, action: AuditAction) -> Vec<&AuditEvent> {
        self.audit_events
            .iter()
            .filter(|e| e.action == action)
            .collect()
    }

    pub fn attempt_overwrite_audit_event(
        &mut self,
        _event_id: AuditEventId,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "audit_events",
        })
    }

    pub fn append_query(&mut self, input: QueryRecordInput) -> Result<QueryId, StorageError> {
        self.journal_append(JournalRecord::QueryLogged {
            created_at_ns: input.created_at.0,
            query_text: input.query_text.clone(),
            query_group: input.query_group.as_str().to_string(),
            matched_receipt_id: input
                .matched_receipt_id
                .as_ref()
                .map(|id| id.as_str().to_string()),
            score: input.score,
            status: input.status.as_str().to_string(),
        })?;
        Ok(self.push_query(input))
    }

    pub fn queries(&self) -> &[QueryRecord] {
        &self.queries
    }

    fn fresh_receipt_id(&self) -> Result<ReceiptId, StorageError> {
        for _ in 0..RECEIPT_ID_ATTEMPTS {
            let mut bytes = [0u8; 16];
            OsRng.fill_bytes(&mut bytes);
            let id = ReceiptId::from_bytes(bytes);
            if !self.receipt_index.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(StorageError::DuplicateKey {
            table: "receipts",
            key: "generated receipt_id".to_string(),
        })
    }

    fn insert_receipt(&mut self, receipt: Receipt) -> Result<(), StorageError> {
        if self.receipt_index.contains_key(&receipt.receipt_id) {
            return Err(StorageError::DuplicateKey {
                table: "receipts",
                key: receipt.receipt_id.as_str().to_string(),
            });
        }
        self.receipt_index
            .insert(receipt.receipt_id.clone(), self.receipts.len());
        self.receipts.push(receipt);
        Ok(())
    }

    fn push_audit_event(&mut self, input: AuditEventInput) -> AuditEventId {
        let event_id = AuditEventId(self.next_audit_event_id);
        self.next_audit_event_id = self.next_audit_event_id.saturating_add(1);
        self.audit_events.push(AuditEvent::from_input(event_id, input));
        event_id
    }

    fn push_query(&mut self, input: QueryRecordInput) -> QueryId {
        let query_id = QueryId(self.next_query_id);
        self.next_query_id = self.next_query_id.saturating_add(1);
        self.queries.push(QueryRecord::from_input(query_id, input));
        query_id
    }

    fn journal_append(&self, record: JournalRecord) -> Result<(), StorageError> {
        match &self.journal {
            Some(journal) => journal.append(&record),
            None => Ok(()),
        }
    }

    fn apply(&mut self, record: JournalRecord) -> Result<(), StorageError> {
        match record {
            JournalRecord::ReceiptStored {
                receipt_id,
                customer_name,
                encrypted_image_path,
                source_group,
                created_at_ns,
            } => {
                let receipt = Receipt::v1(
                    ReceiptId::new(receipt_id)?,
                    CustomerName::new(customer_name)?,
                    encrypted_image_path,
                    GroupId::new(source_group)?,
                    MonotonicTimeNs(created_at_ns),
                )?;
                self.insert_receipt(receipt)
            }
            JournalRecord::ReceiptForwarded { receipt_id } => {
                self.mark_forwarded(&ReceiptId::new(receipt_id)?).map(|_| ())
            }
            JournalRecord::AuditAppended {
                created_at_ns,
                action,
                severity,
                metadata,
            } => {
                let input = AuditEventInput::v1(
                    MonotonicTimeNs(created_at_ns),
                    parse_label("audit_event.action", &action, AuditAction::parse)?,
                    parse_label("audit_event.severity", &severity, AuditSeverity::parse)?,
                    metadata,
                )?;
                self.push_audit_event(input);
                Ok(())
            }
            JournalRecord::QueryLogged {
                created_at_ns,
                query_text,
                query_group,
                matched_receipt_id,
                score,
                status,
            } => {
                let input = QueryRecordInput::v1(
                    MonotonicTimeNs(created_at_ns),
                    query_text,
                    GroupId::new(query_group)?,
                    matched_receipt_id.map(ReceiptId::new).transpose()?,
                    score,
                    parse_label("query_record.status", &status, QueryStatus::parse)?,
                )?;
                self.push_query(input);
                Ok(())
            }
        }
    }
}

fn parse_label<T>(
    field: &'static str,
    raw: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, StorageError> {
    parse(raw).ok_or(StorageError::ContractViolation(
        ContractViolation::InvalidValue {
            field,
            reason: "unknown label",
        },
    ))
}
