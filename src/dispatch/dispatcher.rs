// src/dispatch/dispatcher.rs
//! Request dispatcher
//!
//! The one place allocation logic lives. Both transports hand every request
//! to [`Dispatcher::handle`]; the dispatcher authenticates it, reserves a
//! resource, spawns the agent and registers it, rolling back the
//! reservation when any step fails.

use crate::dispatch::messages::{AgentRole, AllocationRequest, AllocationResult, ResourceDescriptor};
use crate::runtime::process_manager::ProcessManager;
use crate::runtime::registry::Registry;
use crate::runtime::supervisor::ShutdownSupervisor;
use crate::utils::errors::{Result, WorkerError};
use tracing::{debug, info, warn};

/// Shared secret bound to a worker instance
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    key: Option<String>,
}

impl AuthContext {
    /// An empty key means no authentication
    pub fn new(key: Option<&str>) -> Self {
        Self {
            key: key.filter(|k| !k.is_empty()).map(str::to_string),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    /// Exact byte comparison against the configured key
    pub fn verify(&self, presented: Option<&[u8]>) -> Result<()> {
        match &self.key {
            None => Ok(()),
            Some(key) if presented == Some(key.as_bytes()) => Ok(()),
            Some(_) => Err(WorkerError::AuthFailure),
        }
    }

    /// Key handed to spawned agents
    pub fn agent_key(&self) -> &str {
        self.key.as_deref().unwrap_or("")
    }
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("configured", &self.is_configured())
            .finish()
    }
}

/// Request dispatcher shared by all transports
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Registry,
    spawner: ProcessManager,
    auth: AuthContext,
}

impl Dispatcher {
    pub fn new(registry: Registry, spawner: ProcessManager, auth: AuthContext) -> Self {
        Self {
            registry,
            spawner,
            auth,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// Supervisor draining this dispatcher's registry
    pub fn supervisor(&self) -> ShutdownSupervisor {
        ShutdownSupervisor::new(self.registry.clone())
    }

    /// Handle one allocation request
    pub async fn handle(&self, request: AllocationRequest) -> AllocationResult {
        debug!("Dispatching allocation request for role '{}'", request.role);

        match self.allocate(&request).await {
            Ok(resource) => {
                metrics::counter!(
                    "zoo_worker_allocations_total",
                    "role" => role_label(&request.role),
                    "outcome" => "success"
                )
                .increment(1);
                AllocationResult::Success { resource }
            }
            Err(e) => {
                match &e {
                    WorkerError::AuthFailure => {
                        warn!("Rejected allocation request with a bad auth key");
                        metrics::counter!("zoo_worker_auth_failures_total").increment(1);
                    }
                    WorkerError::BadRequest(reason) => warn!("Rejected allocation request: {}", reason),
                    other => warn!("Allocation for '{}' failed: {}", request.role, other),
                }
                metrics::counter!(
                    "zoo_worker_allocations_total",
                    "role" => role_label(&request.role),
                    "outcome" => e.kind()
                )
                .increment(1);
                AllocationResult::failure(&e)
            }
        }
    }

    async fn allocate(&self, request: &AllocationRequest) -> Result<ResourceDescriptor> {
        // nothing below may run for an unauthenticated caller
        self.auth.verify(request.auth_key.as_deref())?;

        let role: AgentRole = request.role.parse()?;
        // dropping the reservation before insert/release gives the resource back
        let reservation = self.registry.reserve(role).await?;
        let resource = reservation.resource.clone();

        let agent = match self.spawner.spawn(role, resource.clone(), self.auth.agent_key()) {
            Ok(agent) => agent,
            Err(e) => {
                metrics::counter!("zoo_worker_spawn_failures_total", "role" => role.label())
                    .increment(1);
                self.registry.release(reservation).await;
                return Err(e);
            }
        };

        let pid = agent.pid;
        let id = self.registry.insert(agent, reservation).await?;
        info!(
            "Allocated {} agent #{} (PID {}) on {}",
            role.label(),
            id,
            pid,
            resource
        );

        Ok(resource)
    }
}

fn role_label(role: &str) -> &'static str {
    role.parse::<AgentRole>().map(|r| r.label()).unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::allocator::ResourceAllocator;
    use crate::runtime::process_manager::SpawnConfig;
    use crate::utils::config::AllocatorConfig;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn dispatcher(dir: &std::path::Path, program: &str, key: Option<&str>) -> Dispatcher {
        let allocator = ResourceAllocator::new(&AllocatorConfig {
            socket_dir: dir.to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let spawner = ProcessManager::new(SpawnConfig {
            program: program.into(),
            args: vec!["-c".into(), "exec sleep 30".into(), "zoo-agent".into()],
            ..Default::default()
        });
        Dispatcher::new(Registry::new(allocator), spawner, AuthContext::new(key))
    }

    #[test]
    fn test_auth_context() {
        let open = AuthContext::new(Some(""));
        assert!(!open.is_configured());
        assert!(open.verify(None).is_ok());
        assert!(open.verify(Some(b"anything")).is_ok());
        assert_eq!(open.agent_key(), "");

        let closed = AuthContext::new(Some("secret"));
        assert!(closed.verify(Some(b"secret")).is_ok());
        assert!(closed.verify(Some(b"Secret")).is_err());
        assert!(closed.verify(None).is_err());
        assert_eq!(format!("{:?}", closed), "AuthContext { configured: true }");
    }

    #[tokio::test]
    async fn test_networked_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path(), "sh", None);

        let result = dispatcher.handle(AllocationRequest::networked(None)).await;
        let port = result.resource().and_then(ResourceDescriptor::port).unwrap();
        assert!(port > 0);

        let snapshot = dispatcher.registry().snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].resource, ResourceDescriptor::Port(port));
        assert!(ProcessManager::is_running(snapshot[0].pid));

        dispatcher.supervisor().drain_and_kill().await;
    }

    #[tokio::test]
    async fn test_concurrent_ports_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Arc::new(dispatcher(dir.path(), "sh", None));

        let mut handles = vec![];
        for _ in 0..8 {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move {
                dispatcher.handle(AllocationRequest::networked(None)).await
            }));
        }

        let mut ports = HashSet::new();
        for handle in handles {
            let result = handle.await.unwrap();
            ports.insert(result.resource().and_then(ResourceDescriptor::port).unwrap());
        }

        assert_eq!(ports.len(), 8);
        assert_eq!(dispatcher.registry().len().await, 8);
        assert_eq!(dispatcher.supervisor().drain_and_kill().await, 8);
    }

    #[tokio::test]
    async fn test_local_allocations_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path(), "sh", None);

        let first = dispatcher.handle(AllocationRequest::local(None)).await;
        let second = dispatcher.handle(AllocationRequest::local(None)).await;

        let first = first.resource().and_then(|r| r.socket_path().map(str::to_string)).unwrap();
        let second = second.resource().and_then(|r| r.socket_path().map(str::to_string)).unwrap();
        assert_ne!(first, second);

        dispatcher.supervisor().drain_and_kill().await;
    }

    #[tokio::test]
    async fn test_wrong_key_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path(), "sh", Some("secret"));

        for key in [None, Some("wrong")] {
            let result = dispatcher.handle(AllocationRequest::networked(key)).await;
            assert_eq!(
                result,
                AllocationResult::Failure {
                    message: "bad request".into()
                }
            );
        }

        assert!(dispatcher.registry().is_empty().await);
        assert_eq!(dispatcher.registry().reserved_count().await, 0);

        let result = dispatcher.handle(AllocationRequest::networked(Some("secret"))).await;
        assert!(result.is_success());
        dispatcher.supervisor().drain_and_kill().await;
    }

    #[tokio::test]
    async fn test_unknown_role() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path(), "sh", None);

        let result = dispatcher
            .handle(AllocationRequest::new("unknown_role", None))
            .await;
        assert_eq!(
            result,
            AllocationResult::Failure {
                message: "bad request".into()
            }
        );
        assert!(dispatcher.registry().is_empty().await);
        assert_eq!(dispatcher.registry().reserved_count().await, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_port() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path(), "zoo-agent-that-does-not-exist-12345", None);

        let result = dispatcher.handle(AllocationRequest::networked(None)).await;
        assert!(!result.is_success());
        assert!(dispatcher.registry().is_empty().await);
        assert_eq!(dispatcher.registry().reserved_count().await, 0);

        // the allocator is still usable afterwards
        let reservation = dispatcher
            .registry()
            .reserve(AgentRole::NetworkedAgent)
            .await
            .unwrap();
        dispatcher.registry().release(reservation).await;
    }

    #[tokio::test]
    async fn test_cancelled_request_releases_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path(), "sh", None);
        let registry = dispatcher.registry().clone();

        // queue the request behind a held lock
        let held = registry.lock().await;
        let mut request = Box::pin(dispatcher.handle(AllocationRequest::networked(None)));
        assert!(futures::poll!(&mut request).is_pending());

        // a second locker queues behind it, so insert will have to wait
        let blocker = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _state = registry.lock().await;
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            })
        };
        tokio::task::yield_now().await;

        // reserve and spawn go through, then the request parks in insert
        drop(held);
        assert!(futures::poll!(&mut request).is_pending());

        drop(request);
        blocker.await.unwrap();

        for _ in 0..50 {
            if registry.reserved_count().await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty().await);
        assert_eq!(registry.reserved_count().await, 0);
    }

    #[tokio::test]
    async fn test_refuses_after_drain() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path(), "sh", None);
        dispatcher.supervisor().drain_and_kill().await;

        let result = dispatcher.handle(AllocationRequest::local(None)).await;
        assert_eq!(
            result,
            AllocationResult::Failure {
                message: "worker is shutting down".into()
            }
        );
    }
}
