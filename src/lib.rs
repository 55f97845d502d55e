// src/lib.rs
//! Zoo Worker Library
//!
//! A worker-side allocation service: remote callers ask for agent
//! processes, the worker spawns them on a fresh port or socket path, tracks
//! them for its whole lifetime and kills every one of them on shutdown.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **runtime**: process spawning, resource allocation, registry, shutdown
//! - **dispatch**: request data model and the dispatcher shared by transports
//! - **transport**: authenticated single-connection listener
//! - **grpc**: concurrent gRPC service
//! - **observability**: tracing and metrics
//! - **utils**: configuration and errors

// Public module exports
pub mod dispatch;
pub mod grpc;
pub mod observability;
pub mod runtime;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use dispatch::{AllocationRequest, AllocationResult, AuthContext, Dispatcher, ResourceDescriptor};
pub use runtime::{Registry, ShutdownSupervisor};
pub use utils::config::WorkerConfig;
pub use utils::errors::{Result, WorkerError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
