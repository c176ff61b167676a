//! Cluster RPC wire protocol.
//!
//! Peers exchange length-prefixed JSON frames over one TCP connection
//! per direction: a 4-byte big-endian length followed by the serialized
//! message. The schema is version-stable; additions ride on serde's
//! unknown-field tolerance.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_RPC_FRAME_SIZE;
use crate::jid::Jid;
use crate::xmpp::Element;

use super::error::{ClusterError, ClusterResult};

/// A request from a peer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Best-effort delivery on the receiver's local router.
    RouteStanza { target: Jid, stanza: Element },
    /// Presence fan-out to the receiver's locally-bound streams.
    BroadcastPresence { from: Jid, presence: Element },
    /// Atomically detach and return the hibernated queue for a key.
    TransferQueue { queue_key: String },
    /// Close the receiver's stream for a full JID with a stream error.
    DisconnectStream { jid: Jid, condition: String },
}

/// The receiver's answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    Ok,
    /// No locally-bound stream for the target.
    UnknownResource,
    /// No hibernated queue for the requested key.
    NotFound,
    /// The detached queue contents.
    Queue(QueueSnapshot),
    Error(String),
}

/// One queued element on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueElementSnapshot {
    pub stanza: Element,
    pub h: u32,
}

/// A detached stream-management queue in transit between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub elements: Vec<QueueElementSnapshot>,
    pub nonce: Vec<u8>,
    pub in_h: u32,
    pub out_h: u32,
}

/// Write one frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> ClusterResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_RPC_FRAME_SIZE {
        return Err(ClusterError::FrameTooLarge(body.len()));
    }
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean EOF at a frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> ClusterResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = (&len_buf[..]).get_u32() as usize;
    if len > MAX_RPC_FRAME_SIZE {
        return Err(ClusterError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}
