use bytes::{Buf, BufMut, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{HyperError, Result};
use crate::protocol::message::{FrameTag, Message};

type HmacSha256 = Hmac<Sha256>;

/// Tag byte + 4-byte big-endian payload length.
const HEADER_LEN: usize = 5;
/// HMAC-SHA256 output length.
const MAC_LEN: usize = 32;
/// Upper bound on a single frame payload.
const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Codec for authenticated frames: tag byte, 4-byte big-endian length,
/// MAC over tag + length + payload keyed with the shared secret, payload.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    key: Vec<u8>,
}

impl FrameCodec {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.as_bytes().to_vec(),
        }
    }

    fn compute_mac(&self, tag: u8, length: u32, payload: &[u8]) -> [u8; MAC_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key size");
        mac.update(&[tag]);
        mac.update(&length.to_be_bytes());
        mac.update(payload);
        mac.finalize().into_bytes().into()
    }

    fn verify_mac(&self, tag: u8, length: u32, payload: &[u8], received: &[u8]) -> Result<()> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key size");
        mac.update(&[tag]);
        mac.update(&length.to_be_bytes());
        mac.update(payload);
        mac.verify_slice(received)
            .map_err(|_| HyperError::Auth("frame MAC mismatch".to_string()))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = HyperError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        let payload = message.encode_payload()?;
        if payload.len() > MAX_PAYLOAD {
            return Err(HyperError::Protocol(format!(
                "frame payload too large ({} bytes)",
                payload.len()
            )));
        }
        let tag = message.tag() as u8;
        let length = payload.len() as u32;
        let mac = self.compute_mac(tag, length, &payload);
        dst.reserve(HEADER_LEN + MAC_LEN + payload.len());
        dst.put_u8(tag);
        dst.put_u32(length);
        dst.put_slice(&mac);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = HyperError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let tag_byte = src[0];
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        if length as usize > MAX_PAYLOAD {
            return Err(HyperError::Protocol(format!(
                "frame payload too large ({length} bytes)"
            )));
        }
        let frame_len = HEADER_LEN + MAC_LEN + length as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        let tag = FrameTag::try_from(tag_byte)?;
        src.advance(HEADER_LEN);
        let mac = src.split_to(MAC_LEN);
        let payload = src.split_to(length as usize);
        self.verify_mac(tag_byte, length, &payload, &mac)?;
        Message::decode(tag, &payload).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{Ack, ClientState, PeerHeartbeat};
    use crate::task::Task;
    use std::collections::BTreeMap;

    fn round_trip(codec_key: &str, message: Message) -> Result<Option<Message>> {
        let mut codec = FrameCodec::new(codec_key);
        let mut buffer = BytesMut::new();
        codec.encode(message, &mut buffer)?;
        codec.decode(&mut buffer)
    }

    #[test]
    fn bundle_round_trip() {
        let bundle = vec![Task::new("echo 1", &BTreeMap::new()).unwrap()];
        let decoded = round_trip("secret", Message::BundleOut(bundle.clone()))
            .unwrap()
            .unwrap();
        match decoded {
            Message::BundleOut(back) => assert_eq!(back, bundle),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_round_trip() {
        let heartbeat = PeerHeartbeat {
            client_id: uuid::Uuid::new_v4(),
            client_host: "node-1".to_string(),
            time: chrono::Utc::now(),
            state: ClientState::Running,
        };
        let decoded = round_trip("secret", Message::Heartbeat(heartbeat.clone()))
            .unwrap()
            .unwrap();
        match decoded {
            Message::Heartbeat(back) => {
                assert_eq!(back.client_id, heartbeat.client_id);
                assert_eq!(back.state, ClientState::Running);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut codec = FrameCodec::new("secret");
        let mut buffer = BytesMut::new();
        codec.encode(Message::Disconnect, &mut buffer).unwrap();
        let mut partial = buffer.split_to(buffer.len() - 1);
        // a frame missing its last byte decodes to nothing
        let mut short = partial.clone();
        assert!(codec.decode(&mut short).unwrap().is_none());
        partial.unsplit(buffer);
        assert!(matches!(
            codec.decode(&mut partial).unwrap(),
            Some(Message::Disconnect)
        ));
    }

    #[test]
    fn wrong_key_rejected() {
        let mut sender = FrameCodec::new("secret");
        let mut receiver = FrameCodec::new("other");
        let mut buffer = BytesMut::new();
        sender.encode(Message::Disconnect, &mut buffer).unwrap();
        assert!(matches!(
            receiver.decode(&mut buffer),
            Err(HyperError::Auth(_))
        ));
    }

    #[test]
    fn tampered_payload_rejected() {
        let ack = Ack {
            client_id: uuid::Uuid::new_v4(),
            client_host: "node-1".to_string(),
            task_ids: vec![],
        };
        let mut codec = FrameCodec::new("secret");
        let mut buffer = BytesMut::new();
        codec.encode(Message::Ack(ack), &mut buffer).unwrap();
        let last = buffer.len() - 1;
        buffer[last] ^= 0xff;
        assert!(matches!(codec.decode(&mut buffer), Err(HyperError::Auth(_))));
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut codec = FrameCodec::new("secret");
        let mut buffer = BytesMut::new();
        buffer.put_u8(0x7f);
        buffer.put_u32(0);
        buffer.put_slice(&[0u8; 32]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(HyperError::Protocol(_))
        ));
    }
}
