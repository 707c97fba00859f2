#![forbid(unsafe_code)]

use receipts_engines::sealer::{generate_key_b64, is_raw_key_b64};
use receipts_engines::secret_vault::SecretVault;
use receipts_kernel_contracts::secrets::ReceiptSecretId;

pub const VAULT_USAGE: &str =
    "usage: receipts vault <set|has|del|ls|gen-key> [key_id] [--force]";

const ENCRYPTION_PASSPHRASE_MIN_LEN: usize = 16;
const WEBHOOK_SECRET_MIN_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultCommand {
    Set { id: ReceiptSecretId, force: bool },
    Has(ReceiptSecretId),
    Del { id: ReceiptSecretId, force: bool },
    Ls,
    /// Stores a fresh random `receipt_encryption_key`.
    GenKey { force: bool },
}

impl VaultCommand {
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let force = args.iter().any(|a| a == "--force");
        let mut positional = args.iter().map(String::as_str).filter(|a| *a != "--force");
        let subcommand = positional.next().ok_or_else(|| VAULT_USAGE.to_string())?;
        let key_id = positional.next();
        match subcommand {
            "set" => Ok(Self::Set {
                id: require_key_id(key_id)?,
                force,
            }),
            "has" => Ok(Self::Has(require_key_id(key_id)?)),
            "del" => Ok(Self::Del {
                id: require_key_id(key_id)?,
                force,
            }),
            "ls" => Ok(Self::Ls),
            "gen-key" => Ok(Self::GenKey { force }),
            other => Err(format!(
                "unknown vault subcommand: {other}. expected one of: set, has, del, ls, gen-key"
            )),
        }
    }

    /// Secret the command reads from the operator, if any.
    pub fn value_needed(&self) -> Option<ReceiptSecretId> {
        match self {
            Self::Set { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Runs one vault command. Output never contains secret values.
pub fn execute_vault_command(
    vault: &SecretVault,
    command: VaultCommand,
    value: Option<&str>,
) -> Result<String, String> {
    match command {
        VaultCommand::Set { id, force } => {
            let raw = value.ok_or_else(|| "missing secret input value".to_string())?;
            let checked = validate_secret_value(id, raw)?;
            guard_key_rotation(vault, id, force)?;
            vault
                .set(id, checked)
                .map_err(|e| format!("failed to store {}: {e}", id.as_str()))?;
            Ok("OK".to_string())
        }
        VaultCommand::Has(id) => {
            let has = vault
                .contains(id)
                .map_err(|e| format!("failed to check {}: {e}", id.as_str()))?;
            Ok(if has { "YES" } else { "NO" }.to_string())
        }
        VaultCommand::Del { id, force } => {
            guard_key_rotation(vault, id, force)?;
            let removed = vault
                .remove(id)
                .map_err(|e| format!("failed to delete {}: {e}", id.as_str()))?;
            Ok(if removed { "OK" } else { "ABSENT" }.to_string())
        }
        VaultCommand::Ls => {
            let keys = vault
                .list()
                .map_err(|e| format!("failed to list keys: {e}"))?;
            Ok(keys
                .iter()
                .map(|id| format!("{}\t{}", id.as_str(), id.env_var()))
                .collect::<Vec<_>>()
                .join("\n"))
        }
        VaultCommand::GenKey { force } => {
            let id = ReceiptSecretId::ReceiptEncryptionKey;
            guard_key_rotation(vault, id, force)?;
            vault
                .set(id, &generate_key_b64())
                .map_err(|e| format!("failed to store {}: {e}", id.as_str()))?;
            Ok("OK".to_string())
        }
    }
}

/// Per-secret shape checks. Returns the trimmed value.
pub fn validate_secret_value(id: ReceiptSecretId, raw: &str) -> Result<&str, String> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(format!("{} must not be empty", id.as_str()));
    }
    if value.chars().any(char::is_control) {
        return Err(format!("{} must not contain control characters", id.as_str()));
    }
    match id {
        ReceiptSecretId::ReceiptEncryptionKey => {
            if !is_raw_key_b64(value) && value.chars().count() < ENCRYPTION_PASSPHRASE_MIN_LEN {
                return Err(format!(
                    "{} must be base64 of 32 bytes or a passphrase of at least {ENCRYPTION_PASSPHRASE_MIN_LEN} chars",
                    id.as_str()
                ));
            }
        }
        ReceiptSecretId::OperatorBotToken => {
            let well_formed = value.split_once(':').is_some_and(|(bot_id, secret)| {
                !bot_id.is_empty()
                    && bot_id.chars().all(|c| c.is_ascii_digit())
                    && !secret.is_empty()
                    && !secret.contains(char::is_whitespace)
            });
            if !well_formed {
                return Err(format!("{} must look like <bot_id>:<token>", id.as_str()));
            }
        }
        ReceiptSecretId::WebhookSecret => {
            if value.chars().count() < WEBHOOK_SECRET_MIN_LEN {
                return Err(format!(
                    "{} must be at least {WEBHOOK_SECRET_MIN_LEN} chars",
                    id.as_str()
                ));
            }
        }
        ReceiptSecretId::MediaApiKey => {
            if value.contains(char::is_whitespace) {
                return Err(format!("{} must not contain whitespace", id.as_str()));
            }
        }
    }
    Ok(value)
}

/// Replacing or deleting a stored encryption key orphans every sealed image written with it.
fn guard_key_rotation(vault: &SecretVault, id: ReceiptSecretId, force: bool) -> Result<(), String> {
    if id != ReceiptSecretId::ReceiptEncryptionKey || force {
        return Ok(());
    }
    let present = vault
        .contains(id)
        .map_err(|e| format!("failed to check {}: {e}", id.as_str()))?;
    if present {
        return Err(format!(
            "{} already set; sealed images need the old key. pass --force to replace it",
            id.as_str()
        ));
    }
    Ok(())
}

fn parse_secret_id(raw: &str) -> Result<ReceiptSecretId, String> {
    ReceiptSecretId::parse(raw).ok_or_else(|| {
        let allowed = ReceiptSecretId::allowed_key_names().join(", ");
        format!("unknown key id '{raw}'. allowed: {allowed}")
    })
}

fn require_key_id(raw: Option<&str>) -> Result<ReceiptSecretId, String> {
    let raw = raw.ok_or_else(|| {
        let allowed = ReceiptSecretId::allowed_key_names().join(", ");
        format!("missing key id. allowed: {allowed}")
    })?;
    parse_secret_id(raw)
}
