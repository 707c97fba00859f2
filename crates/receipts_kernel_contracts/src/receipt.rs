#![forbid(unsafe_code)]

use crate::common::validate_token;
use crate::message::GroupId;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const RECEIPT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const RECEIPT_ID_HEX_LEN: usize = 32;
pub const MAX_CUSTOMER_NAME_LEN: usize = 256;
pub const MAX_IMAGE_PATH_LEN: usize = 1_024;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReceiptId(String);

impl ReceiptId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        if id.len() != RECEIPT_ID_HEX_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "receipt_id",
                reason: "must be 32 hex chars",
            });
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(ContractViolation::InvalidValue {
                field: "receipt_id",
                reason: "must be lowercase hex",
            });
        }
        Ok(Self(id))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut out = String::with_capacity(RECEIPT_ID_HEX_LEN);
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Free-text label attached at store time. Not an identity key; duplicates are allowed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CustomerName(String);

impl CustomerName {
    pub fn new(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let collapsed = raw.into().split_whitespace().collect::<Vec<_>>().join(" ");
        validate_token("customer_name", &collapsed, MAX_CUSTOMER_NAME_LEN)?;
        Ok(Self(collapsed))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CustomerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub schema_version: SchemaVersion,
    pub receipt_id: ReceiptId,
    pub customer_name: CustomerName,
    pub encrypted_image_path: String,
    pub source_group: GroupId,
    pub created_at: MonotonicTimeNs,
    /// Monotonic false -> true.
    pub forwarded: bool,
}

impl Receipt {
    pub fn v1(
        receipt_id: ReceiptId,
        customer_name: CustomerName,
        encrypted_image_path: String,
        source_group: GroupId,
        created_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let receipt = Self {
            schema_version: RECEIPT_CONTRACT_VERSION,
            receipt_id,
            customer_name,
            encrypted_image_path,
            source_group,
            created_at,
            forwarded: false,
        };
        receipt.validate()?;
        Ok(receipt)
    }

    /// Text sent along with the forwarded document.
    pub fn operator_caption(&self) -> String {
        format!(
            "Receipt: {}\nsource_group: {}\nreceipt_id: {}",
            self.customer_name, self.source_group, self.receipt_id
        )
    }
}

impl Validate for Receipt {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != RECEIPT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "receipt.schema_version",
                reason: "unsupported schema version",
            });
        }
        validate_token(
            "receipt.encrypted_image_path",
            &self.encrypted_image_path,
            MAX_IMAGE_PATH_LEN,
        )?;
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "receipt.created_at",
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
    fn at_receipt_01_id_from_bytes_is_valid_hex() {
        let id = ReceiptId::from_bytes([0xab; 16]);
        assert_eq!(id.as_str().len(), RECEIPT_ID_HEX_LEN);
        assert_eq!(ReceiptId::new(id.as_str()).unwrap(), id);
        assert!(ReceiptId::new("ABABABABABABABABABABABABABABABAB").is_err());
        assert!(ReceiptId::new("abc").is_err());
    }

    #[test]
    fn at_receipt_02_customer_name_collapses_whitespace() {
        let name = CustomerName::new("  Maria \t  Silva ").unwrap();
        assert_eq!(name.as_str(), "Maria Silva");
        assert!(CustomerName::new(" \n ").is_err());
    }

    #[test]
    fn at_receipt_03_new_receipt_starts_unforwarded() {
        let receipt = Receipt::v1(
            ReceiptId::from_bytes([1; 16]),
            CustomerName::new("Maria Silva").unwrap(),
            "/images/a.sealed".to_string(),
            GroupId::new("g1@g.us").unwrap(),
            MonotonicTimeNs(5),
        )
        .unwrap();
        assert!(!receipt.forwarded);
        let caption = receipt.operator_caption();
        assert!(caption.contains("Maria Silva"));
        assert!(caption.contains("g1@g.us"));
        assert!(caption.contains(receipt.receipt_id.as_str()));
    }
}
