#![forbid(unsafe_code)]

pub mod receipt_cli;
pub mod vault_cli;
