// src/dispatch/messages.rs
//! Allocation data model and its transport-agnostic wire shape
//!
//! Inside the service an outcome is always an [`AllocationResult`]. Only at
//! the edge is it flattened into the `{result, resource?, msg?}` message
//! callers expect.

use crate::utils::errors::WorkerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of agent a caller asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    /// Reachable over a TCP port
    NetworkedAgent,
    /// Reachable over a local socket file
    LocalAgent,
}

impl AgentRole {
    /// Canonical wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::NetworkedAgent => "allocate_networked_agent",
            AgentRole::LocalAgent => "allocate_local_agent",
        }
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            AgentRole::NetworkedAgent => "networked",
            AgentRole::LocalAgent => "local",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocate_networked_agent" | "networked_agent" => Ok(AgentRole::NetworkedAgent),
            "allocate_local_agent" | "local_agent" => Ok(AgentRole::LocalAgent),
            other => Err(WorkerError::BadRequest(format!("unknown role '{}'", other))),
        }
    }
}

/// One allocation request as received from a transport.
///
/// The role stays a raw string until dispatch so that unknown roles reach
/// the dispatcher and are answered there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub role: String,
    pub auth_key: Option<Vec<u8>>,
}

impl AllocationRequest {
    pub fn new(role: impl Into<String>, auth_key: Option<Vec<u8>>) -> Self {
        Self {
            role: role.into(),
            auth_key,
        }
    }

    pub fn networked(auth_key: Option<&str>) -> Self {
        Self::new(
            AgentRole::NetworkedAgent.as_str(),
            auth_key.map(|k| k.as_bytes().to_vec()),
        )
    }

    pub fn local(auth_key: Option<&str>) -> Self {
        Self::new(
            AgentRole::LocalAgent.as_str(),
            auth_key.map(|k| k.as_bytes().to_vec()),
        )
    }
}

/// Resource an allocated agent is reachable on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceDescriptor {
    Port(u16),
    SocketPath(String),
}

impl ResourceDescriptor {
    pub fn port(&self) -> Option<u16> {
        match self {
            ResourceDescriptor::Port(port) => Some(*port),
            ResourceDescriptor::SocketPath(_) => None,
        }
    }

    pub fn socket_path(&self) -> Option<&str> {
        match self {
            ResourceDescriptor::Port(_) => None,
            ResourceDescriptor::SocketPath(path) => Some(path),
        }
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceDescriptor::Port(port) => write!(f, "port {}", port),
            ResourceDescriptor::SocketPath(path) => write!(f, "socket {}", path),
        }
    }
}

/// Outcome of one allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationResult {
    Success { resource: ResourceDescriptor },
    Failure { message: String },
}

impl AllocationResult {
    pub fn failure(err: &WorkerError) -> Self {
        AllocationResult::Failure {
            message: err.client_message(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AllocationResult::Success { .. })
    }

    pub fn resource(&self) -> Option<&ResourceDescriptor> {
        match self {
            AllocationResult::Success { resource } => Some(resource),
            AllocationResult::Failure { .. } => None,
        }
    }
}

/// Request object on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequestMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
}

impl From<AllocationRequestMessage> for AllocationRequest {
    fn from(msg: AllocationRequestMessage) -> Self {
        AllocationRequest::new(msg.role, msg.auth_key.map(String::into_bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultTag {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceMessage {
    Port { port: u16 },
    SocketFile { socket_file: String },
}

/// Response object on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationResponse {
    pub result: ResultTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl AllocationResponse {
    pub fn ok() -> Self {
        Self {
            result: ResultTag::Success,
            resource: None,
            msg: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            result: ResultTag::Error,
            resource: None,
            msg: Some(msg.into()),
        }
    }

    /// Back to the tagged form, for callers of the service
    pub fn into_result(self) -> AllocationResult {
        match (self.result, self.resource) {
            (ResultTag::Success, Some(ResourceMessage::Port { port })) => AllocationResult::Success {
                resource: ResourceDescriptor::Port(port),
            },
            (ResultTag::Success, Some(ResourceMessage::SocketFile { socket_file })) => {
                AllocationResult::Success {
                    resource: ResourceDescriptor::SocketPath(socket_file),
                }
            }
            (ResultTag::Success, None) => AllocationResult::Failure {
                message: "success response without a resource".to_string(),
            },
            (ResultTag::Error, _) => AllocationResult::Failure {
                message: self.msg.unwrap_or_default(),
            },
        }
    }
}

impl From<AllocationResult> for AllocationResponse {
    fn from(result: AllocationResult) -> Self {
        match result {
            AllocationResult::Success { resource } => {
                let resource = match resource {
                    ResourceDescriptor::Port(port) => ResourceMessage::Port { port },
                    ResourceDescriptor::SocketPath(socket_file) => {
                        ResourceMessage::SocketFile { socket_file }
                    }
                };
                Self {
                    result: ResultTag::Success,
                    resource: Some(resource),
                    msg: None,
                }
            }
            AllocationResult::Failure { message } => Self::error(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_parsing() {
        assert_eq!(
            "allocate_networked_agent".parse::<AgentRole>().unwrap(),
            AgentRole::NetworkedAgent
        );
        assert_eq!("local_agent".parse::<AgentRole>().unwrap(), AgentRole::LocalAgent);
        assert!(matches!(
            "unknown_role".parse::<AgentRole>(),
            Err(WorkerError::BadRequest(_))
        ));
    }

    #[test]
    fn test_success_port_wire_shape() {
        let response: AllocationResponse = AllocationResult::Success {
            resource: ResourceDescriptor::Port(40123),
        }
        .into();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"result": "success", "resource": {"port": 40123}})
        );
    }

    #[test]
    fn test_success_socket_wire_shape() {
        let response: AllocationResponse = AllocationResult::Success {
            resource: ResourceDescriptor::SocketPath("/tmp/zoo/agent.sock".into()),
        }
        .into();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"result": "success", "resource": {"socket_file": "/tmp/zoo/agent.sock"}})
        );
    }

    #[test]
    fn test_failure_wire_shape() {
        let response: AllocationResponse = AllocationResult::failure(&WorkerError::AuthFailure).into();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"result": "error", "msg": "bad request"})
        );
    }

    #[test]
    fn test_request_message_without_key() {
        let msg: AllocationRequestMessage =
            serde_json::from_value(json!({"role": "allocate_local_agent"})).unwrap();
        let request: AllocationRequest = msg.into();
        assert_eq!(request, AllocationRequest::local(None));
    }

    #[test]
    fn test_response_back_to_result() {
        let response: AllocationResponse =
            serde_json::from_value(json!({"result": "success", "resource": {"socket_file": "/s"}}))
                .unwrap();
        assert_eq!(
            response.into_result(),
            AllocationResult::Success {
                resource: ResourceDescriptor::SocketPath("/s".into())
            }
        );
    }
}
