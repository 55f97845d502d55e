// src/runtime/mod.rs
//! Agent process runtime
//!
//! This module owns everything that touches OS processes:
//!
//! - **Process Manager**: spawns agent entry points and reaps them
//! - **Allocator**: finds free ports and unique socket paths
//! - **Registry**: process-wide table of live agents and reserved resources
//! - **Supervisor**: drains the registry on shutdown, guards process groups
//!
//! # Architecture
//!
//! ```text
//!   Dispatcher ──reserve──▶ Registry ──▶ Allocator
//!       │                      ▲
//!       └──spawn──▶ Process ───┘ insert
//!                   Manager
//!
//!   signal / stop ──▶ Supervisor ──drain──▶ Registry ──kill+wait──▶ agents
//! ```

pub mod allocator;
pub mod process_manager;
pub mod registry;
pub mod supervisor;

// Re-export commonly used types
pub use allocator::ResourceAllocator;
pub use process_manager::{ProcessManager, SpawnConfig, SpawnedAgent};
pub use registry::{AgentSummary, AllocationId, ChildProcess, Registry, Reservation};
pub use supervisor::{ProcessGroupGuard, ShutdownSupervisor};
