#![forbid(unsafe_code)]

//! Local encrypted store for runtime secrets that are not set in the environment.

use std::collections::BTreeMap;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use receipts_kernel_contracts::secrets::ReceiptSecretId;
use receipts_kernel_contracts::MonotonicTimeNs;

use crate::sealer::{SealError, Sealer};

const VAULT_SCHEMA_VERSION: u8 = 1;
const MASTER_KEY_LEN: usize = 32;
const VAULT_PATH_ENV: &str = "RECEIPTS_SECRET_VAULT_PATH";

#[derive(Debug)]
pub enum VaultError {
    UnknownSecretId(String),
    EmptySecret,
    UnsupportedSchema(u8),
    CorruptMasterKey,
    Io(std::io::Error),
    Json(serde_json::Error),
    Decode(base64::DecodeError),
    Seal(SealError),
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownSecretId(id) => write!(f, "unknown secret id: {id}"),
            Self::EmptySecret => write!(f, "secret value must not be empty"),
            Self::UnsupportedSchema(v) => write!(f, "unsupported vault schema version {v}"),
            Self::CorruptMasterKey => write!(f, "vault master key is corrupt"),
            Self::Io(err) => write!(f, "vault io error: {err}"),
            Self::Json(err) => write!(f, "vault json error: {err}"),
            Self::Decode(err) => write!(f, "vault decode error: {err}"),
            Self::Seal(err) => write!(f, "vault seal error: {err}"),
        }
    }
}

impl std::error::Error for VaultError {}

impl From<std::io::Error> for VaultError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<base64::DecodeError> for VaultError {
    fn from(value: base64::DecodeError) -> Self {
        Self::Decode(value)
    }
}

impl From<SealError> for VaultError {
    fn from(value: SealError) -> Self {
        Self::Seal(value)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VaultFile {
    schema_version: u8,
    secrets: BTreeMap<String, SealedSecret>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedSecret {
    sealed_b64: String,
    updated_at_ns: u64,
}

/// Secrets are sealed with a per-host master key kept next to the vault file (mode 0600).
#[derive(Debug, Clone)]
pub struct SecretVault {
    vault_path: PathBuf,
    master_key_path: PathBuf,
}

impl SecretVault {
    pub fn default_local() -> Self {
        let vault_path = env::var(VAULT_PATH_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_vault_path);
        Self::at(vault_path)
    }

    /// Master key lives beside `vault_path` with a `master.key` extension.
    pub fn at(vault_path: PathBuf) -> Self {
        let master_key_path = vault_path.with_extension("master.key");
        Self {
            vault_path,
            master_key_path,
        }
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }

    pub fn set(&self, id: ReceiptSecretId, value: &str) -> Result<(), VaultError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(VaultError::EmptySecret);
        }
        let sealer = self.master_sealer()?;
        let sealed = sealer.seal(value.as_bytes())?;
        let mut file = self.load()?.unwrap_or_default();
        file.schema_version = VAULT_SCHEMA_VERSION;
        file.secrets.insert(
            id.as_str().to_string(),
            SealedSecret {
                sealed_b64: BASE64.encode(sealed),
                updated_at_ns: MonotonicTimeNs::now().0,
            },
        );
        self.store(&file)
    }

    pub fn get(&self, id: ReceiptSecretId) -> Result<Option<String>, VaultError> {
        let Some(file) = self.load()? else {
            return Ok(None);
        };
        let Some(entry) = file.secrets.get(id.as_str()) else {
            return Ok(None);
        };
        let sealed = BASE64.decode(entry.sealed_b64.as_bytes())?;
        let plaintext = self.master_sealer()?.open(&sealed)?;
        let secret = String::from_utf8(plaintext).map_err(|_| VaultError::Seal(SealError::Decryption))?;
        Ok(Some(secret).filter(|s| !s.trim().is_empty()))
    }

    pub fn contains(&self, id: ReceiptSecretId) -> Result<bool, VaultError> {
        Ok(self.get(id)?.is_some())
    }

    pub fn remove(&self, id: ReceiptSecretId) -> Result<bool, VaultError> {
        let Some(mut file) = self.load()? else {
            return Ok(false);
        };
        if file.secrets.remove(id.as_str()).is_none() {
            return Ok(false);
        }
        self.store(&file)?;
        Ok(true)
    }

    /// Known ids present in the vault, in label order. Foreign keys are ignored.
    pub fn list(&self) -> Result<Vec<ReceiptSecretId>, VaultError> {
        let Some(file) = self.load()? else {
            return Ok(Vec::new());
        };
        let mut ids: Vec<ReceiptSecretId> = file
            .secrets
            .keys()
            .filter_map(|k| ReceiptSecretId::parse(k))
            .collect();
        ids.sort_by_key(|id| id.as_str());
        Ok(ids)
    }

    fn load(&self) -> Result<Option<VaultFile>, VaultError> {
        if !self.vault_path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.vault_path)?;
        if raw.trim().is_empty() {
            return Ok(Some(VaultFile::default()));
        }
        let file: VaultFile = serde_json::from_str(&raw)?;
        if file.schema_version != VAULT_SCHEMA_VERSION {
            return Err(VaultError::UnsupportedSchema(file.schema_version));
        }
        Ok(Some(file))
    }

    fn store(&self, file: &VaultFile) -> Result<(), VaultError> {
        ensure_parent(&self.vault_path)?;
        atomic_write(&self.vault_path, &serde_json::to_vec_pretty(file)?)?;
        Ok(())
    }

    fn master_sealer(&self) -> Result<Sealer, VaultError> {
        let key = self.load_or_create_master_key()?;
        Ok(Sealer::from_key_bytes(&key)?)
    }

    fn load_or_create_master_key(&self) -> Result<[u8; MASTER_KEY_LEN], VaultError> {
        if self.master_key_path.exists() {
            let encoded = fs::read_to_string(&self.master_key_path)?;
            let decoded = BASE64.decode(encoded.trim().as_bytes())?;
            return decoded
                .try_into()
                .map_err(|_| VaultError::CorruptMasterKey);
        }
        ensure_parent(&self.master_key_path)?;
        let mut key = [0u8; MASTER_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        write_restricted(&self.master_key_path, BASE64.encode(key).as_bytes())?;
        Ok(key)
    }
}

/// Environment variable first, then the local vault. Vault failures read as "not set".
pub fn resolve_secret_env_first(id: ReceiptSecretId) -> Option<String> {
    if let Some(value) = env::var(id.env_var())
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        return Some(value);
    }
    SecretVault::default_local().get(id).ok().flatten()
}

fn default_vault_path() -> PathBuf {
    let base = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|_| PathBuf::from("."));
    base.join("receipts").join("secret_vault.json")
}

fn ensure_parent(path: &Path) -> Result<(), VaultError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), VaultError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(tmp, path)?;
    Ok(())
}

fn write_restricted(path: &Path, data: &[u8]) -> Result<(), VaultError> {
    let mut file = OpenOptions::new().create_new(true).write(true).open(path)?;
    file.write_all(data)?;
    file.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
