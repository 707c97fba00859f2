#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const AUDIT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const MAX_AUDIT_METADATA_ENTRIES: usize = 32;
pub const MAX_AUDIT_METADATA_KEY_LEN: usize = 64;
pub const MAX_AUDIT_METADATA_VALUE_LEN: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AuditEventId(pub u64);

impl Validate for AuditEventId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "audit_event_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ImageCached,
    ReceiptStored,
    ReceiptClaimUnresolved,
    ReceiptProcessError,
    MatchEnqueued,
    MatchForwarded,
    QueryNoMatch,
    ForwardFailed,
    ReceiptUnreadable,
    MessageDropped,
}

impl AuditAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ImageCached => "image_cached",
            Self::ReceiptStored => "receipt_stored",
            Self::ReceiptClaimUnresolved => "receipt_claim_unresolved",
            Self::ReceiptProcessError => "receipt_process_error",
            Self::MatchEnqueued => "match_enqueued",
            Self::MatchForwarded => "match_forwarded",
            Self::QueryNoMatch => "query_no_match",
            Self::ForwardFailed => "forward_failed",
            Self::ReceiptUnreadable => "receipt_unreadable",
            Self::MessageDropped => "message_dropped",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::ImageCached,
            Self::ReceiptStored,
            Self::ReceiptClaimUnresolved,
            Self::ReceiptProcessError,
            Self::MatchEnqueued,
            Self::MatchForwarded,
            Self::QueryNoMatch,
            Self::ForwardFailed,
            Self::ReceiptUnreadable,
            Self::MessageDropped,
        ]
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::all()
            .iter()
            .copied()
            .find(|action| action.as_str() == normalized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warn,
    Error,
}

impl AuditSeverity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Clips a metadata value to the contract bound on a char boundary.
pub fn bounded_metadata_value(raw: impl Into<String>) -> String {
    let raw = raw.into();
    if raw.len() <= MAX_AUDIT_METADATA_VALUE_LEN {
        return raw;
    }
    let mut end = MAX_AUDIT_METADATA_VALUE_LEN;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEventInput {
    pub schema_version: SchemaVersion,
    pub created_at: MonotonicTimeNs,
    pub action: AuditAction,
    pub severity: AuditSeverity,
    pub metadata: BTreeMap<String, String>,
}

impl AuditEventInput {
    pub fn v1(
        created_at: MonotonicTimeNs,
        action: AuditAction,
        severity: AuditSeverity,
        metadata: BTreeMap<String, String>,
    ) -> Result<Self, ContractViolation> {
        let input = Self {
            schema_version: AUDIT_CONTRACT_VERSION,
            created_at,
            action,
            severity,
            metadata,
        };
        input.validate()?;
        Ok(input)
    }
}

impl Validate for AuditEventInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != AUDIT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "audit_event_input.schema_version",
                reason: "unsupported schema version",
            });
        }
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "audit_event_input.created_at",
                reason: "must be > 0",
            });
        }
        if self.metadata.len() > MAX_AUDIT_METADATA_ENTRIES {
            return Err(ContractViolation::InvalidValue {
                field: "audit_event_input.metadata",
                reason: "too many entries",
            });
        }
        for (key, value) in &self.metadata {
            if key.trim().is_empty() || key.len() > MAX_AUDIT_METADATA_KEY_LEN {
                return Err(ContractViolation::InvalidValue {
                    field: "audit_event_input.metadata.key",
                    reason: "must be non-empty and <= 64 chars",
                });
            }
            if value.len() > MAX_AUDIT_METADATA_VALUE_LEN {
                return Err(ContractViolation::InvalidValue {
                    field: "audit_event_input.metadata.value",
                    reason: "must be <= 1024 bytes",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub event_id: AuditEventId,
    pub created_at: MonotonicTimeNs,
    pub action: AuditAction,
    pub severity: AuditSeverity,
    pub metadata: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn from_input(event_id: AuditEventId, input: AuditEventInput) -> Self {
        Self {
            event_id,
            created_at: input.created_at,
            action: input.action,
            severity: input.severity,
            metadata: input.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_audit_01_actions_are_roundtrippable() {
        for action in AuditAction::all() {
            assert_eq!(AuditAction::parse(action.as_str()), Some(*action));
        }
        assert_eq!(AuditAction::parse("not_an_action"), None);
    }

    #[test]
    fn at_audit_02_metadata_bounds_enforced() {
        let mut metadata = BTreeMap::new();
        metadata.insert("reason".to_string(), "x".repeat(2_000));
        let out = AuditEventInput::v1(
            MonotonicTimeNs(1),
            AuditAction::ReceiptProcessError,
            AuditSeverity::Error,
            metadata,
        );
        assert!(out.is_err());

        let clipped = bounded_metadata_value("é".repeat(600));
        assert!(clipped.len() <= MAX_AUDIT_METADATA_VALUE_LEN);
        assert!(clipped.chars().all(|c| c == 'é'));
    }
}
