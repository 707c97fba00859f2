#![forbid(unsafe_code)]

use crate::message::GroupId;
use crate::receipt::ReceiptId;
use crate::{ContractViolation, MonotonicTimeNs, Validate};

pub const MAX_QUERY_TEXT_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    NoMatch,
    Enqueued,
    Failed,
}

impl QueryStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoMatch => "no_match",
            Self::Enqueued => "enqueued",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "no_match" => Some(Self::NoMatch),
            "enqueued" => Some(Self::Enqueued),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One free-text lookup against the unforwarded pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecordInput {
    pub created_at: MonotonicTimeNs,
    pub query_text: String,
    pub query_group: GroupId,
    pub matched_receipt_id: Option<ReceiptId>,
    pub score: u8,
    pub status: QueryStatus,
}

impl QueryRecordInput {
    pub fn v1(
        created_at: MonotonicTimeNs,
        query_text: String,
        query_group: GroupId,
        matched_receipt_id: Option<ReceiptId>,
        score: u8,
        status: QueryStatus,
    ) -> Result<Self, ContractViolation> {
        let input = Self {
            created_at,
            query_text,
            query_group,
            matched_receipt_id,
            score,
            status,
        };
        input.validate()?;
        Ok(input)
    }
}

impl Validate for QueryRecordInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.query_text.trim().is_empty() || self.query_text.len() > MAX_QUERY_TEXT_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "query_record_input.query_text",
                reason: "must be non-empty and <= 512 bytes",
            });
        }
        if self.score > 100 {
            return Err(ContractViolation::InvalidRange {
                field: "query_record_input.score",
                min: 0.0,
                max: 100.0,
                got: self.score as f64,
            });
        }
        if self.status == QueryStatus::Enqueued && self.matched_receipt_id.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "query_record_input.matched_receipt_id",
                reason: "required when status is enqueued",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    pub query_id: QueryId,
    pub created_at: MonotonicTimeNs,
    pub query_text: String,
    pub query_group: GroupId,
    pub matched_receipt_id: Option<ReceiptId>,
    pub score: u8,
    pub status: QueryStatus,
}

impl QueryRecord {
    pub fn from_input(query_id: QueryId, input: QueryRecordInput) -> Self {
        Self {
            query_id,
            created_at: input.created_at,
            query_text: input.query_text,
            query_group: input.query_group,
            matched_receipt_id: input.matched_receipt_id,
            score: input.score,
            status: input.status,
        }
    }
}
