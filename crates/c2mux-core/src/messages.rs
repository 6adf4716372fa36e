// c2mux control message types and payloads.

use crate::codec::{cbor_decode, cbor_encode};
use crate::error::MuxResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric message type code carried by every envelope.
///
/// The set is open: collaborators may route their own codes through the
/// handler table without the core knowing about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgType(pub u32);

impl MsgType {
    pub const REGISTER: MsgType = MsgType(0x01);
    pub const REGISTER_BEACON: MsgType = MsgType(0x02);
    pub const PING: MsgType = MsgType(0x03);

    pub const TUNNEL_OPEN: MsgType = MsgType(0x10);
    pub const TUNNEL_DATA: MsgType = MsgType(0x11);
    pub const TUNNEL_CLOSE: MsgType = MsgType(0x12);

    pub const BEACON_TASKS: MsgType = MsgType(0x20);
    pub const BEACON_TASK_RESULT: MsgType = MsgType(0x21);

    /// Tunnel traffic is routed to the tunnel manager, never to a handler.
    pub fn is_tunnel(self) -> bool {
        matches!(
            self,
            MsgType::TUNNEL_OPEN | MsgType::TUNNEL_DATA | MsgType::TUNNEL_CLOSE
        )
    }

    /// Name of a built-in code, if this is one.
    pub fn builtin_name(self) -> Option<&'static str> {
        match self {
            MsgType::REGISTER => Some("register"),
            MsgType::REGISTER_BEACON => Some("register-beacon"),
            MsgType::PING => Some("ping"),
            MsgType::TUNNEL_OPEN => Some("tunnel-open"),
            MsgType::TUNNEL_DATA => Some("tunnel-data"),
            MsgType::TUNNEL_CLOSE => Some("tunnel-close"),
            MsgType::BEACON_TASKS => Some("beacon-tasks"),
            MsgType::BEACON_TASK_RESULT => Some("beacon-task-result"),
            _ => None,
        }
    }
}

impl From<u32> for MsgType {
    fn from(v: u32) -> Self {
        MsgType(v)
    }
}

impl From<MsgType> for u32 {
    fn from(m: MsgType) -> u32 {
        m.0
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.builtin_name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "0x{:04x}", self.0),
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────

/// The atomic unit exchanged over a connection.
///
/// An empty `id` means no response is expected. On a response, `id` echoes
/// the correlation ID of the request it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub msg_type: MsgType,

    #[serde(default)]
    pub data: Vec<u8>,
}

impl Envelope {
    /// Uncorrelated envelope with raw payload bytes.
    pub fn new(msg_type: MsgType, data: Vec<u8>) -> Self {
        Self {
            id: String::new(),
            msg_type,
            data,
        }
    }

    /// Uncorrelated envelope carrying a CBOR-encoded payload.
    pub fn from_payload<T: Serialize>(msg_type: MsgType, payload: &T) -> MuxResult<Self> {
        Ok(Self::new(msg_type, cbor_encode(payload)?))
    }

    /// Decode the payload as `T`.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> MuxResult<T> {
        cbor_decode(&self.data)
    }

    /// Whether this envelope carries a correlation ID.
    pub fn is_correlated(&self) -> bool {
        !self.id.is_empty()
    }

    /// Build a reply to this envelope, echoing its correlation ID.
    pub fn reply(&self, msg_type: MsgType, data: Vec<u8>) -> Self {
        Self {
            id: self.id.clone(),
            msg_type,
            data,
        }
    }
}

// ── Message payloads ──────────────────────────────────────────────────

/// Agent identity reported during registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterPayload {
    pub name: String,
    pub hostname: String,
    pub username: String,
    pub uid: String,
    pub gid: String,
    pub os: String,
    pub arch: String,
    pub transport: String,
    pub remote_address: String,
    pub pid: i32,
    pub filename: String,
}

/// Registration of a polling agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconRegisterPayload {
    pub beacon_id: String,
    pub interval_secs: u64,
    #[serde(default)]
    pub jitter_secs: u64,
    pub agent: RegisterPayload,
}

/// Keepalive; the reply echoes the nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOpenPayload {
    pub tunnel_id: u64,
    pub session_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDataPayload {
    pub tunnel_id: u64,
    #[serde(default)]
    pub sequence: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelClosePayload {
    pub tunnel_id: u64,
}

/// A unit of work queued for a beacon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MsgType,
    pub data: Vec<u8>,
}

/// The outcome of a task, reported by a beacon on a later poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub data: Vec<u8>,
}

/// A beacon check-in: completed results in, pending tasks out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconTasksPayload {
    pub beacon_id: String,
    #[serde(default)]
    pub results: Vec<TaskResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconTasksResponse {
    pub tasks: Vec<Task>,
}

/// A single result submitted outside of a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconTaskResultPayload {
    pub beacon_id: String,
    pub result: TaskResult,
}
