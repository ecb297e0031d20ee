//! Framed queue transport: tagged, length-prefixed, MAC-authenticated
//! frames over a long-lived TCP stream. Three logical channels are
//! multiplexed as frame tags: bundles out, bundles in, and control
//! (heartbeat, disconnect, ack).

pub mod frame;
pub mod message;

pub use frame::FrameCodec;
pub use message::{Ack, ClientState, Hello, Message, PeerHeartbeat};

/// Default wire protocol port.
pub const DEFAULT_PORT: u16 = 50001;
