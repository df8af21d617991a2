#![forbid(unsafe_code)]

pub mod gateway;
pub mod webhook;
