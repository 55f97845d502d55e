// src/utils/mod.rs
//! Configuration and error types shared by every module

pub mod config;
pub mod errors;

pub use config::{TransportKind, WorkerConfig};
pub use errors::{Result, WorkerError};
