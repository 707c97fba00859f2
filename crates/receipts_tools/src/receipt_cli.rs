#![forbid(unsafe_code)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use receipts_engines::sealer::Sealer;
use receipts_storage::store::ReceiptStore;

pub const RECEIPT_USAGE: &str = "usage: receipts open <sealed_path> <out_path> | receipts unforwarded [limit]";

/// Decrypts a sealed image into `output`. Refuses to overwrite an existing file.
pub fn open_sealed_image(sealer: &Sealer, input: &Path, output: &Path) -> Result<usize, String> {
    let sealed = fs::read(input)
        .map_err(|e| format!("failed to read '{}': {e}", input.display()))?;
    let plaintext = sealer
        .open(&sealed)
        .map_err(|e| format!("failed to open '{}': {e}", input.display()))?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(output)
        .map_err(|e| format!("failed to create '{}': {e}", output.display()))?;
    file.write_all(&plaintext)
        .map_err(|e| format!("failed to write '{}': {e}", output.display()))?;
    Ok(plaintext.len())
}

/// One tab separated row per unforwarded receipt, oldest first.
pub fn render_unforwarded(store: &ReceiptStore, limit: usize) -> String {
    store
        .list_unforwarded(limit)
        .into_iter()
        .map(|r| {
            format!(
                "{}\t{}\t{}\t{}\t{}",
                r.receipt_id, r.created_at.0, r.source_group, r.customer_name, r.encrypted_image_path
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn parse_limit(raw: Option<&str>) -> Result<usize, String> {
    match raw {
        None => Ok(100),
        Some(v) => v
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|n| (1..=100_000).contains(n))
            .ok_or_else(|| format!("invalid limit '{v}': expected 1..=100000")),
    }
}
