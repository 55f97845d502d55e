// src/dispatch/mod.rs
//! Allocation requests and the dispatcher that serves them
//!
//! - **Messages**: request/result data model and the JSON wire shape
//! - **Dispatcher**: authenticate, reserve, spawn, register
//!
//! # Flow
//!
//! ```text
//! transport ─▶ Dispatcher::handle
//!                 ├─ AuthContext::verify      (no side effects on failure)
//!                 ├─ Registry::reserve        (port / socket path)
//!                 ├─ ProcessManager::spawn    (release on failure)
//!                 └─ Registry::insert         (kill if shutting down)
//! ```

pub mod dispatcher;
pub mod messages;

// Re-export commonly used types
pub use dispatcher::{AuthContext, Dispatcher};
pub use messages::{
    AgentRole, AllocationRequest, AllocationRequestMessage, AllocationResponse, AllocationResult,
    ResourceDescriptor,
};
