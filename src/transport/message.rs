//! Wire Messages
//!
//! Message ids and typed bodies for the client protocol. Bodies are JSON;
//! field order inside report bodies (registration id first, event second) is
//! part of the wire contract with unmodified clients.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::event::{DeviceTags, GestureMeta, HandleEventType, KeyEvent, PointerEvent};
use crate::pipeline::subscriber::KeyOption;
use crate::registry::HandlerType;

use super::{Result, TransportError};

/// Wire message ids.
///
/// Server-to-client reports live in the 0x10 block, client-to-server
/// requests in the 0x20 block. Values are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageId {
    /// Key event delivery to an interceptor or monitor.
    ReportKeyEvent = 0x11,
    /// Pointer event delivery to an interceptor or monitor.
    ReportPointerEvent = 0x12,
    /// Key-combination subscription fired.
    OnSubscribeKey = 0x13,
    /// Status reply to a client request.
    CommandReply = 0x14,

    /// Register an interceptor or monitor.
    AddInputHandler = 0x21,
    /// Remove a previously registered handler.
    RemoveInputHandler = 0x22,
    /// Claim the active touch sequence for a monitor.
    MarkConsumed = 0x23,
    /// Register a key-combination subscription.
    SubscribeKeyEvent = 0x24,
    /// Remove a key-combination subscription.
    UnsubscribeKeyEvent = 0x25,
    /// Acknowledge processing of a dispatched event.
    MarkProcessed = 0x26,
}

impl MessageId {
    /// Decode a wire id.
    pub fn from_wire(raw: u32) -> Result<MessageId> {
        match raw {
            0x11 => Ok(MessageId::ReportKeyEvent),
            0x12 => Ok(MessageId::ReportPointerEvent),
            0x13 => Ok(MessageId::OnSubscribeKey),
            0x14 => Ok(MessageId::CommandReply),
            0x21 => Ok(MessageId::AddInputHandler),
            0x22 => Ok(MessageId::RemoveInputHandler),
            0x23 => Ok(MessageId::MarkConsumed),
            0x24 => Ok(MessageId::SubscribeKeyEvent),
            0x25 => Ok(MessageId::UnsubscribeKeyEvent),
            0x26 => Ok(MessageId::MarkProcessed),
            other => Err(TransportError::UnknownMessage(other)),
        }
    }
}

/// One framed wire packet.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Message id.
    pub id: MessageId,
    /// JSON-encoded body.
    pub body: Bytes,
}

impl Packet {
    /// Encode a typed body into a packet.
    pub fn encode<T: Serialize>(id: MessageId, body: &T) -> Result<Packet> {
        let body = serde_json::to_vec(body)?;
        Ok(Packet {
            id,
            body: Bytes::from(body),
        })
    }

    /// Decode the packet body into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

// ---------------------------------------------------------------------------
// Server -> client bodies
// ---------------------------------------------------------------------------

/// Key event delivered to a registered handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportKeyEvent {
    /// Receiving registration.
    pub handler_id: i32,
    /// The event copy.
    pub event: KeyEvent,
}

/// Pointer event delivered to a registered handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPointerEvent {
    /// Receiving registration.
    pub handler_id: i32,
    /// The event copy.
    pub event: PointerEvent,
}

/// Notification that a key subscription's trigger condition was met.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnSubscribeKey {
    /// Firing subscription.
    pub subscribe_id: i32,
    /// The key event that completed the combination.
    pub event: KeyEvent,
}

/// Status reply to a mutation request.
///
/// `status` is zero on success, a negative error code otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    /// Wire id of the request being answered.
    pub request: u32,
    /// Zero or a negative error code.
    pub status: i32,
}

// ---------------------------------------------------------------------------
// Client -> server bodies
// ---------------------------------------------------------------------------

/// Register an interceptor or monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddInputHandlerReq {
    /// Caller-chosen handler id.
    pub handler_id: i32,
    /// Interceptor or monitor.
    pub handler_type: HandlerType,
    /// Event categories to receive.
    pub event_types: HandleEventType,
    /// Device categories to receive.
    pub device_tags: DeviceTags,
    /// Interceptor ordering priority (lower runs first).
    #[serde(default)]
    pub priority: i32,
    /// Gesture filter for touchpad-gesture monitors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gesture: Option<GestureMeta>,
}

/// Remove a registered handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveInputHandlerReq {
    /// Handler id to remove.
    pub handler_id: i32,
    /// Table the handler lives in.
    pub handler_type: HandlerType,
}

/// Claim the active touch sequence on behalf of a monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkConsumedReq {
    /// The requesting monitor registration.
    pub monitor_id: i32,
    /// Event id of the sequence-opening DOWN the client observed.
    pub event_id: i64,
}

/// Register a key-combination subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeKeyEventReq {
    /// Caller-chosen subscription id, unique per session.
    pub subscribe_id: i32,
    /// Combination to match.
    pub option: KeyOption,
}

/// Remove a key-combination subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeKeyEventReq {
    /// Subscription id to remove.
    pub subscribe_id: i32,
}

/// Acknowledge that a dispatched event has been handled by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkProcessedReq {
    /// Highest event id the client has fully processed.
    pub event_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KeyAction;

    #[test]
    fn test_message_id_roundtrip() {
        for id in [
            MessageId::ReportKeyEvent,
            MessageId::ReportPointerEvent,
            MessageId::OnSubscribeKey,
            MessageId::CommandReply,
            MessageId::AddInputHandler,
            MessageId::RemoveInputHandler,
            MessageId::MarkConsumed,
            MessageId::SubscribeKeyEvent,
            MessageId::UnsubscribeKeyEvent,
            MessageId::MarkProcessed,
        ] {
            assert_eq!(MessageId::from_wire(id as u32).unwrap(), id);
        }
        assert!(MessageId::from_wire(0xDEAD).is_err());
    }

    #[test]
    fn test_report_body_places_id_before_event() {
        let body = ReportKeyEvent {
            handler_id: 3,
            event: KeyEvent::new(9, 30, KeyAction::Down, 1_000),
        };
        let json = serde_json::to_string(&body).unwrap();
        let id_pos = json.find("handler_id").unwrap();
        let event_pos = json.find("\"event\"").unwrap();
        assert!(id_pos < event_pos);
    }

    #[test]
    fn test_packet_encode_decode() {
        let req = MarkConsumedReq {
            monitor_id: 2,
            event_id: 41,
        };
        let packet = Packet::encode(MessageId::MarkConsumed, &req).unwrap();
        let back: MarkConsumedReq = packet.decode().unwrap();
        assert_eq!(back.monitor_id, 2);
        assert_eq!(back.event_id, 41);
    }
}
