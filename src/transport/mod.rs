// src/transport/mod.rs
//! Authenticated single-connection transport
//!
//! - **Listener**: one connection at a time, auth at connect, one response per request
//! - **Frame**: length-prefixed JSON frames
//! - **Client**: the caller's side of the same protocol

pub mod client;
pub mod frame;
pub mod listener;

// Re-export commonly used types
pub use client::ListenerClient;
pub use listener::{ListenerState, SingleConnectionListener};
