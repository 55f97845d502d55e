// src/transport/frame.rs
//! Message framing for the single-connection listener
//!
//! Each frame is a 4-byte big-endian length followed by one JSON object.

use crate::utils::errors::{Result, WorkerError};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest frame either side accepts
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// First frame a client sends on a new connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHello {
    #[serde(default)]
    pub auth_key: Option<String>,
}

pub type JsonFramed<S> = Framed<S, LengthDelimitedCodec>;

pub fn framed<S>(stream: S) -> JsonFramed<S>
where
    S: AsyncRead + AsyncWrite,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(stream, codec)
}

/// Serialize `message` and send it as one frame
pub async fn send_json<S, T>(framed: &mut JsonFramed<S>, message: &T) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    framed
        .send(Bytes::from(payload))
        .await
        .map_err(|e| WorkerError::TransportError(format!("send failed: {}", e)))
}

/// Next raw frame, `None` once the peer closed the connection.
///
/// A framing error loses sync with the peer and is not recoverable.
pub async fn recv_frame<S>(framed: &mut JsonFramed<S>) -> Result<Option<BytesMut>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        None => Ok(None),
        Some(Ok(frame)) => Ok(Some(frame)),
        Some(Err(e)) => Err(WorkerError::TransportError(format!("receive failed: {}", e))),
    }
}
