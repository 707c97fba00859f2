#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use rand::RngCore;
use receipts_engines::sealer::{SealMode, Sealer};

use crate::error::CorrelationError;

const SEALED_EXTENSION: &str = "sealed";

/// Directory of sealed receipt images. Plaintext never touches disk.
#[derive(Debug, Clone)]
pub struct SealedImageDir {
    root: PathBuf,
    sealer: Sealer,
}

impl SealedImageDir {
    pub fn new(root: PathBuf, sealer: Sealer) -> Result<Self, CorrelationError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root, sealer })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn seal_mode(&self) -> SealMode {
        self.sealer.mode()
    }

    /// Seals `plaintext` and writes it under a fresh random name.
    pub fn store_image(&self, plaintext: &[u8]) -> Result<PathBuf, CorrelationError> {
        let sealed = self.sealer.seal(plaintext)?;
        let path = self.fresh_path();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &sealed)?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    pub fn open_image(&self, path: &Path) -> Result<Vec<u8>, CorrelationError> {
        let sealed = fs::read(path)?;
        Ok(self.sealer.open(&sealed)?)
    }

    /// Only files under this directory are removed.
    pub fn remove_image(&self, path: &Path) -> Result<(), CorrelationError> {
        if !path.starts_with(&self.root) {
            return Err(CorrelationError::NotFound(path.display().to_string()));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    fn fresh_path(&self) -> PathBuf {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        let name: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        self.root.join(format!("{name}.{SEALED_EXTENSION}"))
    }
}

/// File extension for the operator-facing document name, sniffed from magic bytes.
pub fn guess_extension(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        "jpg"
    } else if bytes.starts_with(b"\x89PNG") {
        "png"
    } else if bytes.starts_with(b"%PDF") {
        "pdf"
    } else if bytes.starts_with(b"GIF8") {
        "gif"
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "webp"
    } else {
        "bin"
    }
}
