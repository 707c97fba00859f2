#![forbid(unsafe_code)]

use crate::common::validate_token;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const MESSAGE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Chat ids of WhatsApp groups carry this suffix; everything else is out of scope.
pub const GROUP_CHAT_SUFFIX: &str = "@g.us";

pub const MAX_CHAT_ID_LEN: usize = 256;
pub const MAX_MEDIA_REF_LEN: usize = 4_096;
pub const MAX_MESSAGE_TEXT_LEN: usize = 16_384;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into().trim().to_string();
        validate_token("group_id", &id, MAX_CHAT_ID_LEN)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_group_chat(&self) -> bool {
        self.0.ends_with(GROUP_CHAT_SUFFIX)
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SenderId(String);

impl SenderId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into().trim().to_string();
        validate_token("sender_id", &id, MAX_CHAT_ID_LEN)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SenderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle (usually a URL) from which the gateway serves the media bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaRef(String);

impl MediaRef {
    pub fn new(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let raw = raw.into().trim().to_string();
        validate_token("media_ref", &raw, MAX_MEDIA_REF_LEN)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Cache key linking a bare image to a later claim from the same person in the same group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChatKey {
    pub group_id: GroupId,
    pub sender_id: SenderId,
}

impl ChatKey {
    pub fn new(group_id: GroupId, sender_id: SenderId) -> Self {
        Self {
            group_id,
            sender_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedMessage {
    pub schema_version: SchemaVersion,
    pub group_id: GroupId,
    pub sender_id: Option<SenderId>,
    pub text: String,
    pub media_ref: Option<MediaRef>,
    pub received_at: MonotonicTimeNs,
}

impl NormalizedMessage {
    pub fn v1(
        group_id: GroupId,
        sender_id: Option<SenderId>,
        text: String,
        media_ref: Option<MediaRef>,
        received_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let msg = Self {
            schema_version: MESSAGE_CONTRACT_VERSION,
            group_id,
            sender_id,
            text,
            media_ref,
            received_at,
        };
        msg.validate()?;
        Ok(msg)
    }

    pub fn chat_key(&self) -> Option<ChatKey> {
        self.sender_id
            .as_ref()
            .map(|sender| ChatKey::new(self.group_id.clone(), sender.clone()))
    }

    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

impl Validate for NormalizedMessage {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != MESSAGE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "normalized_message.schema_version",
                reason: "unsupported schema version",
            });
        }
        if self.text.len() > MAX_MESSAGE_TEXT_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "normalized_message.text",
                reason: "exceeds max length",
            });
        }
        if self.received_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "normalized_message.received_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_msg_01_group_suffix_marks_scope() {
        assert!(GroupId::new("120363403036388430@g.us").unwrap().is_group_chat());
        assert!(!GroupId::new("5511999999999@s.whatsapp.net")
            .unwrap()
            .is_group_chat());
    }

    #[test]
    fn at_msg_02_ids_are_trimmed_and_non_empty() {
        assert_eq!(SenderId::new("  abc@c.us ").unwrap().as_str(), "abc@c.us");
        assert!(SenderId::new("   ").is_err());
        assert!(MediaRef::new("").is_err());
    }

    #[test]
    fn at_msg_03_chat_key_requires_sender() {
        let group = GroupId::new("g1@g.us").unwrap();
        let no_sender = NormalizedMessage::v1(
            group.clone(),
            None,
            String::new(),
            None,
            MonotonicTimeNs(1),
        )
        .unwrap();
        assert!(no_sender.chat_key().is_none());

        let with_sender = NormalizedMessage::v1(
            group,
            Some(SenderId::new("s1@c.us").unwrap()),
            "hi".to_string(),
            None,
            MonotonicTimeNs(1),
        )
        .unwrap();
        assert_eq!(
            with_sender.chat_key().unwrap().sender_id.as_str(),
            "s1@c.us"
        );
    }

    #[test]
    fn at_msg_04_zero_timestamp_is_rejected() {
        let out = NormalizedMessage::v1(
            GroupId::new("g1@g.us").unwrap(),
            None,
            String::new(),
            None,
            MonotonicTimeNs(0),
        );
        assert!(out.is_err());
    }
}
