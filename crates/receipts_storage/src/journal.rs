#![forbid(unsafe_code)]

//! Append-only JSONL journal behind the in-memory store. One line per mutation, synced before
//! the mutation is acknowledged.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::StorageError;

pub const JOURNAL_SCHEMA_VERSION: u8 = 1;

/// Raw field values; they are re-validated through the contract constructors on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalRecord {
    ReceiptStored {
        receipt_id: String,
        customer_name: String,
        encrypted_image_path: String,
        source_group: String,
        created_at_ns: u64,
    },
    ReceiptForwarded {
        receipt_id: String,
    },
    AuditAppended {
        created_at_ns: u64,
        action: String,
        severity: String,
        metadata: BTreeMap<String, String>,
    },
    QueryLogged {
        created_at_ns: u64,
        query_text: String,
        query_group: String,
        matched_receipt_id: Option<String>,
        score: u8,
        status: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalLine {
    schema_version: u8,
    #[serde(flatten)]
    record: JournalRecord,
}

#[derive(Debug, Clone)]
pub struct StoreJournal {
    path: PathBuf,
}

impl StoreJournal {
    /// Creates the file (and parent directories) when missing.
    pub fn open(path: PathBuf) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                StorageError::Journal(format!(
                    "failed to create store directory '{}': {}",
                    parent.display(),
                    err
                ))
            })?;
        }
        if !path.exists() {
            File::create(&path).map_err(|err| {
                StorageError::Journal(format!(
                    "failed to create store journal '{}': {}",
                    path.display(),
                    err
                ))
            })?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays every complete line. An unparseable final line without a trailing newline is a
    /// torn append: it is dropped and the file is cut back to the last complete line. Any other
    /// bad line fails the replay.
    pub fn read_all(&self) -> Result<Vec<JournalRecord>, StorageError> {
        let bytes = fs::read(&self.path).map_err(|err| {
            StorageError::Journal(format!(
                "failed to open store journal '{}': {}",
                self.path.display(),
                err
            ))
        })?;
        let mut records = Vec::new();
        let mut offset = 0usize;
        let mut lines = bytes.split(|b| *b == b'\n').enumerate().peekable();
        while let Some((line_no, raw)) = lines.next() {
            let line_start = offset;
            offset += raw.len() + 1;
            let unterminated = lines.peek().is_none() && !raw.is_empty();
            let parsed = std::str::from_utf8(raw)
                .map_err(|err| err.to_string())
                .and_then(|line| {
                    if line.trim().is_empty() {
                        Ok(None)
                    } else {
                        serde_json::from_str::<JournalLine>(line)
                            .map(Some)
                            .map_err(|err| err.to_string())
                    }
                });
            let parsed = match parsed {
                Ok(Some(parsed)) => parsed,
                Ok(None) => continue,
                Err(err) if unterminated => {
                    warn!(
                        path = %self.path.display(),
                        line = line_no + 1,
                        error = %err,
                        "dropping torn store journal tail"
                    );
                    self.truncate_to(line_start as u64)?;
                    break;
                }
                Err(err) => {
                    return Err(StorageError::Journal(format!(
                        "failed parsing store journal '{}' at line {}: {}",
                        self.path.display(),
                        line_no + 1,
                        err
                    )));
                }
            };
            if parsed.schema_version != JOURNAL_SCHEMA_VERSION {
                return Err(StorageError::Journal(format!(
                    "unsupported store journal schema_version={} at line {}",
                    parsed.schema_version,
                    line_no + 1
                )));
            }
            if unterminated {
                // Complete record that lost its newline; terminate it so the next append
                // starts on a fresh line.
                self.write_synced(b"\n")?;
            }
            records.push(parsed.record);
        }
        Ok(records)
    }

    pub fn append(&self, record: &JournalRecord) -> Result<(), StorageError> {
        let line = JournalLine {
            schema_version: JOURNAL_SCHEMA_VERSION,
            record: record.clone(),
        };
        let mut buf = serde_json::to_vec(&line)
            .map_err(|err| StorageError::Journal(format!("failed to encode journal entry: {err}")))?;
        buf.push(b'\n');
        self.write_synced(&buf)
    }

    fn write_synced(&self, buf: &[u8]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|err| {
                StorageError::Journal(format!(
                    "failed opening store journal '{}' for append: {}",
                    self.path.display(),
                    err
                ))
            })?;
        file.write_all(buf)
            .and_then(|_| file.sync_data())
            .map_err(|err| {
                StorageError::Journal(format!(
                    "failed writing store journal '{}': {}",
                    self.path.display(),
                    err
                ))
            })
    }

    fn truncate_to(&self, len: u64) -> Result<(), StorageError> {
        OpenOptions::new()
            .write(true)
            .open(&self.path)
            .and_then(|file| file.set_len(len).and_then(|_| file.sync_data()))
            .map_err(|err| {
                StorageError::Journal(format!(
                    "failed truncating store journal '{}': {}",
                    self.path.display(),
                    err
                ))
            })
    }
}
