#![forbid(unsafe_code)]

//! Encryption-at-rest boundary for receipt images.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const SEALED_MAGIC: &[u8; 4] = b"RCS1";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug)]
pub enum SealError {
    InvalidKey,
    Encrypt,
    /// Authentication failed, the buffer is truncated, or a sealed buffer reached a
    /// pass-through sealer.
    Decryption,
}

impl std::fmt::Display for SealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "invalid encryption key"),
            Self::Encrypt => write!(f, "encryption failed"),
            Self::Decryption => write!(f, "decryption failed"),
        }
    }
}

impl std::error::Error for SealError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealMode {
    Aes256Gcm,
    Passthrough,
}

impl SealMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes256_gcm",
            Self::Passthrough => "passthrough",
        }
    }
}

/// `seal`/`open` pair. Without a key both directions are the identity, which callers must
/// surface through [`Sealer::is_confidential`].
#[derive(Clone)]
pub struct Sealer {
    cipher: Option<Aes256Gcm>,
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealer")
            .field("mode", &self.mode())
            .finish()
    }
}

impl Sealer {
    /// A 32-byte key encoded as standard or URL-safe base64 is used as is. Any other non-empty
    /// string is stretched with SHA-256.
    pub fn from_key_material(raw: &str) -> Result<Self, SealError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SealError::InvalidKey);
        }
        let key = decode_raw_key(raw).unwrap_or_else(|| {
            let mut stretched = [0u8; KEY_LEN];
            stretched.copy_from_slice(&Sha256::digest(raw.as_bytes()));
            stretched
        });
        Self::from_key_bytes(&key)
    }

    pub fn from_key_bytes(key: &[u8; KEY_LEN]) -> Result<Self, SealError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SealError::InvalidKey)?;
        Ok(Self {
            cipher: Some(cipher),
        })
    }

    pub fn passthrough() -> Self {
        Self { cipher: None }
    }

    /// Pass-through when `raw` is absent or blank.
    pub fn from_optional_key(raw: Option<&str>) -> Result<Self, SealError> {
        match raw.map(str::trim).filter(|v| !v.is_empty()) {
            Some(key) => Self::from_key_material(key),
            None => Ok(Self::passthrough()),
        }
    }

    pub fn mode(&self) -> SealMode {
        if self.cipher.is_some() {
            SealMode::Aes256Gcm
        } else {
            SealMode::Passthrough
        }
    }

    pub fn is_confidential(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_vec());
        };
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| SealError::Encrypt)?;
        let mut out = Vec::with_capacity(SEALED_MAGIC.len() + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(SEALED_MAGIC);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        let Some(cipher) = &self.cipher else {
            if sealed.starts_with(SEALED_MAGIC) {
                return Err(SealError::Decryption);
            }
            return Ok(sealed.to_vec());
        };
        let body = sealed
            .strip_prefix(SEALED_MAGIC.as_slice())
            .ok_or(SealError::Decryption)?;
        if body.len() < NONCE_LEN + TAG_LEN {
            return Err(SealError::Decryption);
        }
        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Decryption)
    }
}

fn decode_raw_key(raw: &str) -> Option<[u8; KEY_LEN]> {
    let decoded = BASE64
        .decode(raw.as_bytes())
        .or_else(|_| BASE64_URL.decode(raw.as_bytes()))
        .ok()?;
    decoded.try_into().ok()
}

/// True when `raw` is a 32-byte key in base64 rather than a passphrase.
pub fn is_raw_key_b64(raw: &str) -> bool {
    decode_raw_key(raw.trim()).is_some()
}

pub fn generate_key_b64() -> String {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    BASE64.encode(key)
}
