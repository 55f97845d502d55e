// src/runtime/registry.rs
//! Allocation registry
//!
//! Process-wide table of live agent processes plus the resources reserved
//! for them. One `tokio::sync::Mutex` guards all of it:
//!
//! ```text
//! WorkerState
//! ├─ entries:          id -> ChildProcess   (spawned, not yet reaped)
//! ├─ reserved_ports:   ports held by entries or by in-flight spawns
//! ├─ reserved_sockets: socket paths, same rule
//! └─ shutting_down:    set by the first drain, never cleared
//! ```
//!
//! Spawning happens between `reserve` and `insert`, outside the lock.
//! `insert` re-checks `shutting_down` so a drain never misses a child.

use crate::dispatch::messages::{AgentRole, ResourceDescriptor};
use crate::runtime::allocator::ResourceAllocator;
use crate::runtime::process_manager::{kill_and_reap, SpawnedAgent};
use crate::utils::errors::{Result, WorkerError};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Registry key, monotonic per service instance
pub type AllocationId = u64;

/// A live agent owned by the registry
#[derive(Debug)]
pub struct ChildProcess {
    pub id: AllocationId,
    pub pid: u32,
    pub role: AgentRole,
    pub resource: ResourceDescriptor,
    pub started_at: DateTime<Utc>,
    pub(crate) child: Child,
}

/// Read-only view of a registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSummary {
    pub id: AllocationId,
    pub pid: u32,
    pub role: AgentRole,
    pub resource: ResourceDescriptor,
    pub started_at: DateTime<Utc>,
}

impl From<&ChildProcess> for AgentSummary {
    fn from(entry: &ChildProcess) -> Self {
        Self {
            id: entry.id,
            pid: entry.pid,
            role: entry.role,
            resource: entry.resource.clone(),
            started_at: entry.started_at,
        }
    }
}

/// A resource held for a spawn that has not been registered yet.
///
/// Consumed by [`Registry::insert`] or [`Registry::release`]. Dropping it
/// any other way (a cancelled request) gives the resource back.
pub struct Reservation {
    pub role: AgentRole,
    pub resource: ResourceDescriptor,
    state: Option<Arc<Mutex<WorkerState>>>,
}

impl Reservation {
    fn disarm(&mut self) {
        self.state = None;
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("role", &self.role)
            .field("resource", &self.resource)
            .field("armed", &self.state.is_some())
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        let resource = self.resource.clone();

        if let Ok(mut guard) = state.try_lock() {
            guard.release_resource(&resource);
            debug!("Released abandoned reservation {}", resource);
            return;
        }

        // lock is busy; hand the release to the runtime
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    state.lock().await.release_resource(&resource);
                    debug!("Released abandoned reservation {}", resource);
                });
            }
            Err(_) => warn!("Reservation {} dropped outside the runtime, not released", resource),
        }
    }
}

/// State behind the registry lock
#[derive(Debug, Default)]
pub struct WorkerState {
    entries: HashMap<AllocationId, ChildProcess>,
    reserved_ports: HashSet<u16>,
    reserved_sockets: HashSet<String>,
    shutting_down: bool,
    next_id: AllocationId,
}

impl WorkerState {
    fn release_resource(&mut self, resource: &ResourceDescriptor) {
        match resource {
            ResourceDescriptor::Port(port) => {
                self.reserved_ports.remove(port);
            }
            ResourceDescriptor::SocketPath(path) => {
                self.reserved_sockets.remove(path);
            }
        }
    }

    pub(crate) fn begin_shutdown(&mut self) -> bool {
        !std::mem::replace(&mut self.shutting_down, true)
    }

    pub(crate) fn ids(&self) -> Vec<AllocationId> {
        self.entries.keys().copied().collect()
    }

    pub(crate) fn get_mut(&mut self, id: AllocationId) -> Option<&mut ChildProcess> {
        self.entries.get_mut(&id)
    }

    /// Remove an entry whose process has been reaped, free its resource and
    /// delete its socket file
    pub(crate) fn remove_reaped(&mut self, id: AllocationId) -> Option<ChildProcess> {
        let entry = self.entries.remove(&id)?;
        self.release_resource(&entry.resource);
        remove_socket_file(&entry.resource);
        metrics::gauge!("zoo_worker_live_agents").set(self.entries.len() as f64);
        Some(entry)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn remove_socket_file(resource: &ResourceDescriptor) {
    let ResourceDescriptor::SocketPath(path) = resource else {
        return;
    };
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed socket file {}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove socket file {}: {}", path, e),
    }
}

/// Allocation registry, cheap to clone and shared by every transport
#[derive(Debug, Clone)]
pub struct Registry {
    state: Arc<Mutex<WorkerState>>,
    allocator: ResourceAllocator,
}

impl Registry {
    /// Create an empty registry allocating through `allocator`
    pub fn new(allocator: ResourceAllocator) -> Self {
        Self {
            state: Arc::new(Mutex::new(WorkerState::default())),
            allocator,
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().await
    }

    /// Reserve a resource for a spawn of `role`
    pub async fn reserve(&self, role: AgentRole) -> Result<Reservation> {
        let mut state = self.state.lock().await;

        if state.shutting_down {
            return Err(WorkerError::ShuttingDown);
        }

        Self::reap_exited_locked(&mut state);

        let resource = match role {
            AgentRole::NetworkedAgent => {
                let port = self.allocator.allocate_port(&state.reserved_ports)?;
                state.reserved_ports.insert(port);
                ResourceDescriptor::Port(port)
            }
            AgentRole::LocalAgent => {
                let path = self.allocator.allocate_socket_path(&state.reserved_sockets)?;
                state.reserved_sockets.insert(path.clone());
                ResourceDescriptor::SocketPath(path)
            }
        };

        debug!("Reserved {} for {} agent", resource, role.label());
        Ok(Reservation {
            role,
            resource,
            state: Some(Arc::clone(&self.state)),
        })
    }

    /// Give back a reservation whose spawn failed
    pub async fn release(&self, mut reservation: Reservation) {
        let mut state = self.state.lock().await;
        state.release_resource(&reservation.resource);
        reservation.disarm();
        debug!("Released {}", reservation.resource);
    }

    /// Register a spawned agent, consuming the reservation it was spawned on.
    ///
    /// If a drain has started meanwhile the agent is killed and reaped here
    /// instead, and `ShuttingDown` is returned.
    pub async fn insert(&self, mut agent: SpawnedAgent, mut reservation: Reservation) -> Result<AllocationId> {
        let mut state = self.state.lock().await;
        // from here on the resource belongs to the entry or is freed below
        reservation.disarm();

        if state.shutting_down {
            warn!("Worker shutting down, killing fresh agent PID {}", agent.pid);
            state.release_resource(&reservation.resource);
            if let Err(e) = kill_and_reap(&mut agent.child).await {
                warn!("Failed to reap agent PID {}: {}", agent.pid, e);
            }
            remove_socket_file(&agent.resource);
            return Err(WorkerError::ShuttingDown);
        }

        state.next_id += 1;
        let id = state.next_id;

        state.entries.insert(
            id,
            ChildProcess {
                id,
                pid: agent.pid,
                role: agent.role,
                resource: agent.resource,
                started_at: agent.started_at,
                child: agent.child,
            },
        );
        metrics::gauge!("zoo_worker_live_agents").set(state.entries.len() as f64);

        Ok(id)
    }

    /// Drop entries whose process already exited on its own
    pub async fn reap_exited(&self) -> usize {
        let mut state = self.state.lock().await;
        Self::reap_exited_locked(&mut state)
    }

    fn reap_exited_locked(state: &mut WorkerState) -> usize {
        let exited: Vec<AllocationId> = state
            .entries
            .iter_mut()
            .filter_map(|(id, entry)| match entry.child.try_wait() {
                Ok(Some(status)) => {
                    info!("Agent #{} (PID {}) exited on its own with {}", id, entry.pid, status);
                    Some(*id)
                }
                Ok(None) => None,
                Err(e) => {
                    warn!("Failed to poll agent #{} (PID {}): {}", id, entry.pid, e);
                    None
                }
            })
            .collect();

        for id in &exited {
            state.remove_reaped(*id);
        }
        exited.len()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.state.lock().await.shutting_down
    }

    /// Whether `resource` is currently held by an entry or an in-flight spawn
    pub async fn is_reserved(&self, resource: &ResourceDescriptor) -> bool {
        let state = self.state.lock().await;
        match resource {
            ResourceDescriptor::Port(port) => state.reserved_ports.contains(port),
            ResourceDescriptor::SocketPath(path) => state.reserved_sockets.contains(path),
        }
    }

    /// Number of reserved resources of any kind
    pub async fn reserved_count(&self) -> usize {
        let state = self.state.lock().await;
        state.reserved_ports.len() + state.reserved_sockets.len()
    }

    /// Entries ordered by allocation id
    pub async fn snapshot(&self) -> Vec<AgentSummary> {
        let state = self.state.lock().await;
        let mut summaries: Vec<AgentSummary> = state.entries.values().map(AgentSummary::from).collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }
}
