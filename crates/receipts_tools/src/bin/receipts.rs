#![forbid(unsafe_code)]

use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::Path;

use receipts_engines::sealer::Sealer;
use receipts_engines::secret_vault::SecretVault;
use receipts_os::config::RuntimeConfig;
use receipts_storage::store::ReceiptStore;
use receipts_tools::receipt_cli::{open_sealed_image, parse_limit, render_unforwarded, RECEIPT_USAGE};
use receipts_tools::vault_cli::{execute_vault_command, VaultCommand, VAULT_USAGE};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let output = match args.first().map(String::as_str) {
        Some("vault") => run_vault(&args[1..])?,
        Some("open") => {
            let (input, out) = match (args.get(1), args.get(2)) {
                (Some(input), Some(out)) => (input, out),
                _ => return Err(RECEIPT_USAGE.to_string()),
            };
            let config = RuntimeConfig::from_env();
            let sealer = Sealer::from_optional_key(config.encryption_key.as_deref())
                .map_err(|e| format!("invalid encryption key: {e}"))?;
            let written = open_sealed_image(&sealer, Path::new(input), Path::new(out))?;
            format!("wrote {written} bytes to {out}")
        }
        Some("unforwarded") => {
            let limit = parse_limit(args.get(1).map(String::as_str))?;
            let config = RuntimeConfig::from_env();
            let store = ReceiptStore::open_journaled(config.store_path)
                .map_err(|e| format!("failed to load store: {e}"))?;
            render_unforwarded(&store, limit)
        }
        _ => return Err(format!("{VAULT_USAGE}\n{RECEIPT_USAGE}")),
    };
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn run_vault(args: &[String]) -> Result<String, String> {
    let command = VaultCommand::parse(args)?;
    let value = match command.value_needed() {
        Some(id) => Some(read_secret_value(id.as_str())?),
        None => None,
    };
    let vault = SecretVault::default_local();
    execute_vault_command(&vault, command, value.as_deref())
}

fn read_secret_value(key_id: &str) -> Result<String, String> {
    if io::stdin().is_terminal() {
        let prompt = format!("Enter value for {key_id}:");
        let value = rpassword::prompt_password(prompt).map_err(|e| e.to_string())?;
        if value.trim().is_empty() {
            return Err("secret value must not be empty".to_string());
        }
        Ok(value)
    } else {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .map_err(|e| e.to_string())?;
        let trimmed = input.trim().to_string();
        if trimmed.is_empty() {
            return Err("secret value must not be empty".to_string());
        }
        Ok(trimmed)
    }
}
