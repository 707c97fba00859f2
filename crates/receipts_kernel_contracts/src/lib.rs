#![forbid(unsafe_code)]

pub mod audit;
pub mod common;
pub mod message;
pub mod query;
pub mod receipt;
pub mod secrets;

pub use common::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};
