#![forbid(unsafe_code)]

pub mod campaign;
pub mod common;
pub mod donation;
pub mod gateway;
pub mod ledger;
pub mod money;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};
