// src/transport/client.rs
//! Client side of the single-connection listener

use crate::dispatch::messages::{AllocationRequestMessage, AllocationResponse, ResultTag};
use crate::transport::frame::{self, ConnectionHello, JsonFramed};
use crate::utils::errors::{Result, WorkerError};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::debug;

/// An authenticated connection to a listener
pub struct ListenerClient {
    framed: JsonFramed<TcpStream>,
}

impl ListenerClient {
    /// Connect and authenticate with `auth_key`
    pub async fn connect(addr: SocketAddr, auth_key: Option<&str>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut client = Self {
            framed: frame::framed(stream),
        };

        let hello = ConnectionHello {
            auth_key: auth_key.map(str::to_string),
        };
        frame::send_json(&mut client.framed, &hello).await?;

        let reply = client.read_response().await?;
        match reply.result {
            ResultTag::Success => {
                debug!("Authenticated with listener at {}", addr);
                Ok(client)
            }
            ResultTag::Error => Err(WorkerError::AuthFailure),
        }
    }

    /// Send one allocation request and wait for its response
    pub async fn allocate(&mut self, request: &AllocationRequestMessage) -> Result<AllocationResponse> {
        frame::send_json(&mut self.framed, request).await?;
        self.read_response().await
    }

    /// Send an arbitrary payload as one frame
    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<AllocationResponse> {
        use futures::SinkExt;

        self.framed
            .send(bytes::Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| WorkerError::TransportError(format!("send failed: {}", e)))?;
        self.read_response().await
    }

    async fn read_response(&mut self) -> Result<AllocationResponse> {
        let frame = frame::recv_frame(&mut self.framed)
            .await?
            .ok_or_else(|| WorkerError::TransportError("connection closed by listener".into()))?;
        Ok(serde_json::from_slice(&frame)?)
    }
}
