#![forbid(unsafe_code)]

/// Secrets the runtime may resolve from the local vault when the environment does not set them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReceiptSecretId {
    WebhookSecret,
    MediaApiKey,
    OperatorBotToken,
    ReceiptEncryptionKey,
}

impl ReceiptSecretId {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WebhookSecret => "webhook_secret",
            Self::MediaApiKey => "media_api_key",
            Self::OperatorBotToken => "operator_bot_token",
            Self::ReceiptEncryptionKey => "receipt_encryption_key",
        }
    }

    /// Environment variable that takes precedence over the vault entry.
    pub const fn env_var(self) -> &'static str {
        match self {
            Self::WebhookSecret => "RECEIPTS_WEBHOOK_SECRET",
            Self::MediaApiKey => "RECEIPTS_MEDIA_API_KEY",
            Self::OperatorBotToken => "RECEIPTS_OPERATOR_BOT_TOKEN",
            Self::ReceiptEncryptionKey => "RECEIPTS_ENCRYPTION_KEY",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::WebhookSecret,
            Self::MediaApiKey,
            Self::OperatorBotToken,
            Self::ReceiptEncryptionKey,
        ]
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "webhook_secret" => Some(Self::WebhookSecret),
            "media_api_key" => Some(Self::MediaApiKey),
            "operator_bot_token" => Some(Self::OperatorBotToken),
            "receipt_encryption_key" => Some(Self::ReceiptEncryptionKey),
            _ => None,
        }
    }

    pub fn allowed_key_names() -> Vec<&'static str> {
        Self::all().iter().map(|id| id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::ReceiptSecretId;

    #[test]
    fn receipt_secret_ids_are_roundtrippable() {
        for secret in ReceiptSecretId::all() {
            let parsed = ReceiptSecretId::parse(secret.as_str());
            assert_eq!(parsed, Some(*secret));
        }
    }

    #[test]
    fn env_vars_are_namespaced() {
        for secret in ReceiptSecretId::all() {
            assert!(secret.env_var().starts_with("RECEIPTS_"));
        }
    }
}
