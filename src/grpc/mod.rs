// src/grpc/mod.rs
//! gRPC API server
//!
//! - **Proto**: `zoo.worker` message types, client and server stubs
//! - **Server**: concurrent `AgentWorker` service over the shared dispatcher

pub mod proto;
pub mod server;

// Re-export commonly used types
pub use proto::agent_worker_client::AgentWorkerClient;
pub use server::{RpcService, ServiceState, WorkerService};
