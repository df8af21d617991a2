#![forbid(unsafe_code)]

pub mod audit;
pub mod display_merge;
pub mod reconcile;
pub mod webhook_ingress;
