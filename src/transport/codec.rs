//! Packet Frame Codec
//!
//! Length-prefixed framing for [`Packet`]s over a byte stream:
//! `u32 body-length (LE) | u32 message-id (LE) | body`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{MessageId, Packet};
use super::TransportError;

/// Largest accepted packet body.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

const HEADER_BYTES: usize = 8;

/// Frame codec for the client protocol.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Encoder<Packet> for PacketCodec {
    type Error = TransportError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if packet.body.len() > MAX_BODY_BYTES {
            return Err(TransportError::BodyTooLarge(packet.body.len(), MAX_BODY_BYTES));
        }
        dst.reserve(HEADER_BYTES + packet.body.len());
        dst.put_u32_le(packet.body.len() as u32);
        dst.put_u32_le(packet.id as u32);
        dst.put_slice(&packet.body);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, Self::Error> {
        if src.len() < HEADER_BYTES {
            return Ok(None);
        }

        let mut header = &src[..HEADER_BYTES];
        let body_len = header.get_u32_le() as usize;
        let raw_id = header.get_u32_le();

        if body_len > MAX_BODY_BYTES {
            return Err(TransportError::BodyTooLarge(body_len, MAX_BODY_BYTES));
        }
        if src.len() < HEADER_BYTES + body_len {
            src.reserve(HEADER_BYTES + body_len - src.len());
            return Ok(None);
        }

        let id = MessageId::from_wire(raw_id)?;
        src.advance(HEADER_BYTES);
        let body = src.split_to(body_len).freeze();

        Ok(Some(Packet { id, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message::MarkProcessedReq;

    fn sample_packet() -> Packet {
        Packet::encode(MessageId::MarkProcessed, &MarkProcessedReq { event_id: 12 }).unwrap()
    }

    #[test]
    fn test_roundtrip_single_frame() {
        let mut buf = BytesMut::new();
        PacketCodec.encode(sample_packet(), &mut buf).unwrap();

        let decoded = PacketCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.id, MessageId::MarkProcessed);
        let body: MarkProcessedReq = decoded.decode().unwrap();
        assert_eq!(body.event_id, 12);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut full = BytesMut::new();
        PacketCodec.encode(sample_packet(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(PacketCodec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 3..]);
        assert!(PacketCodec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        PacketCodec.encode(sample_packet(), &mut buf).unwrap();
        PacketCodec.encode(sample_packet(), &mut buf).unwrap();

        assert!(PacketCodec.decode(&mut buf).unwrap().is_some());
        assert!(PacketCodec.decode(&mut buf).unwrap().is_some());
        assert!(PacketCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unknown_message_id_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(2);
        buf.put_u32_le(0x99);
        buf.put_slice(b"{}");
        assert!(matches!(
            PacketCodec.decode(&mut buf),
            Err(TransportError::UnknownMessage(0x99))
        ));
    }

    #[test]
    fn test_oversized_body_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_BODY_BYTES + 1) as u32);
        buf.put_u32_le(MessageId::MarkProcessed as u32);
        assert!(matches!(
            PacketCodec.decode(&mut buf),
            Err(TransportError::BodyTooLarge(_, _))
        ));
    }
}
