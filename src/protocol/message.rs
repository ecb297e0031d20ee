use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HyperError, Result};
use crate::task::Bundle;

/// Frame tag byte identifying the logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    Hello = 0x01,
    BundleOut = 0x02,
    BundleIn = 0x03,
    Heartbeat = 0x04,
    Disconnect = 0x05,
    Ack = 0x06,
}

impl TryFrom<u8> for FrameTag {
    type Error = HyperError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameTag::Hello),
            0x02 => Ok(FrameTag::BundleOut),
            0x03 => Ok(FrameTag::BundleIn),
            0x04 => Ok(FrameTag::Heartbeat),
            0x05 => Ok(FrameTag::Disconnect),
            0x06 => Ok(FrameTag::Ack),
            other => Err(HyperError::Protocol(format!("unknown frame tag 0x{other:02x}"))),
        }
    }
}

/// Handshake record sent by a client on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub client_id: Uuid,
    pub client_host: String,
    pub num_tasks: usize,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    Running,
    Finished,
}

/// Momentary notice of a client's active status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHeartbeat {
    pub client_id: Uuid,
    pub client_host: String,
    pub time: DateTime<Utc>,
    pub state: ClientState,
}

/// Bundle receipt confirmation, attributing the task ids to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub client_id: Uuid,
    pub client_host: String,
    pub task_ids: Vec<Uuid>,
}

/// One frame payload on the wire.
#[derive(Debug, Clone)]
pub enum Message {
    Hello(Hello),
    BundleOut(Bundle),
    BundleIn(Bundle),
    Heartbeat(PeerHeartbeat),
    Disconnect,
    Ack(Ack),
}

impl Message {
    pub fn tag(&self) -> FrameTag {
        match self {
            Message::Hello(_) => FrameTag::Hello,
            Message::BundleOut(_) => FrameTag::BundleOut,
            Message::BundleIn(_) => FrameTag::BundleIn,
            Message::Heartbeat(_) => FrameTag::Heartbeat,
            Message::Disconnect => FrameTag::Disconnect,
            Message::Ack(_) => FrameTag::Ack,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Message::Hello(hello) => serde_json::to_vec(hello)?,
            Message::BundleOut(bundle) | Message::BundleIn(bundle) => serde_json::to_vec(bundle)?,
            Message::Heartbeat(heartbeat) => serde_json::to_vec(heartbeat)?,
            Message::Disconnect => Vec::new(),
            Message::Ack(ack) => serde_json::to_vec(ack)?,
        })
    }

    pub fn decode(tag: FrameTag, payload: &[u8]) -> Result<Self> {
        Ok(match tag {
            FrameTag::Hello => Message::Hello(serde_json::from_slice(payload)?),
            FrameTag::BundleOut => Message::BundleOut(serde_json::from_slice(payload)?),
            FrameTag::BundleIn => Message::BundleIn(serde_json::from_slice(payload)?),
            FrameTag::Heartbeat => Message::Heartbeat(serde_json::from_slice(payload)?),
            FrameTag::Disconnect => Message::Disconnect,
            FrameTag::Ack => Message::Ack(serde_json::from_slice(payload)?),
        })
    }
}
