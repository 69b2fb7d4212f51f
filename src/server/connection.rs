//! Per-Connection Handling
//!
//! One accepted UNIX-socket connection maps to one [`Session`]. The reader
//! half parses framed client requests and dispatches them to the
//! registration surfaces; the writer half drains the session's outbound
//! queue. When the reader ends the session is removed from the registry,
//! which fires the session-deleted callbacks that purge all state owned by
//! the client.

use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::anr::AnrManager;
use crate::pipeline::{MonitorStage, SubscriberStage};
use crate::registry::{AddHandler, HandlerRegistry};
use crate::transport::message::{
    AddInputHandlerReq, CommandReply, MarkConsumedReq, MarkProcessedReq, MessageId, Packet,
    RemoveInputHandlerReq, SubscribeKeyEventReq, UnsubscribeKeyEventReq,
};
use crate::transport::{PacketCodec, Session, SessionRegistry};

/// Registration surfaces a connection dispatches client requests to.
pub(crate) struct RequestTargets {
    pub sessions: Arc<SessionRegistry>,
    pub registry: Arc<HandlerRegistry>,
    pub subscriber: Arc<SubscriberStage>,
    pub monitor: Arc<MonitorStage>,
    pub anr: Arc<AnrManager>,
}

/// Drive one client connection to completion.
pub(crate) async fn handle_connection(stream: UnixStream, targets: Arc<RequestTargets>) {
    let fd = stream.as_raw_fd();
    let (pid, uid) = match stream.peer_cred() {
        Ok(cred) => (cred.pid().unwrap_or(-1), cred.uid()),
        Err(e) => {
            warn!("Rejecting connection fd={}: peer credentials unavailable: {}", fd, e);
            return;
        }
    };

    let (session, outbound) = Session::channel(fd, pid, uid);
    if let Err(e) = targets.sessions.add_session(Arc::clone(&session)) {
        warn!("Rejecting connection fd={}: {}", fd, e);
        return;
    }
    info!("Client connected: fd={}, pid={}, uid={}", fd, pid, uid);

    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, PacketCodec);

    // Writer task: drains the session queue until every sender is gone.
    let writer = tokio::spawn(async move {
        let mut writer = FramedWrite::new(write_half, PacketCodec);
        let mut outbound = outbound;
        while let Some(packet) = outbound.recv().await {
            if let Err(e) = writer.send(packet).await {
                debug!("Write to fd={} failed: {}", fd, e);
                break;
            }
        }
    });

    while let Some(next) = reader.next().await {
        match next {
            Ok(packet) => handle_request(&session, packet, &targets),
            Err(e) => {
                warn!("Malformed packet from fd={}: {}", fd, e);
                break;
            }
        }
    }

    // Connection closed: purge everything this client owned.
    targets.sessions.remove_session(fd);
    drop(session);
    let _ = writer.await;
    info!("Client disconnected: fd={}", fd);
}

/// Dispatch one client request and reply with its status.
fn handle_request(session: &Arc<Session>, packet: Packet, targets: &RequestTargets) {
    let fd = session.fd();
    let request = packet.id;

    let status = match request {
        MessageId::AddInputHandler => match packet.decode::<AddInputHandlerReq>() {
            Ok(req) => {
                let result = targets.registry.add_handler(AddHandler {
                    id: req.handler_id,
                    handler_type: req.handler_type,
                    session_fd: fd,
                    event_types: req.event_types,
                    device_tags: req.device_tags,
                    priority: req.priority,
                    gesture: req.gesture,
                });
                match result {
                    Ok(()) => 0,
                    Err(e) => {
                        warn!("add_handler from fd={} failed: {}", fd, e);
                        e.status_code()
                    }
                }
            }
            Err(e) => decode_failure(fd, request, e),
        },

        MessageId::RemoveInputHandler => match packet.decode::<RemoveInputHandlerReq>() {
            Ok(req) => {
                targets.registry.remove_handler(req.handler_id, req.handler_type, fd);
                0
            }
            Err(e) => decode_failure(fd, request, e),
        },

        MessageId::MarkConsumed => match packet.decode::<MarkConsumedReq>() {
            Ok(req) => {
                targets.monitor.mark_consumed(req.monitor_id, req.event_id, fd);
                0
            }
            Err(e) => decode_failure(fd, request, e),
        },

        MessageId::SubscribeKeyEvent => match packet.decode::<SubscribeKeyEventReq>() {
            Ok(req) => match targets.subscriber.subscribe(fd, req.subscribe_id, req.option) {
                Ok(()) => 0,
                Err(e) => {
                    warn!("subscribe from fd={} failed: {}", fd, e);
                    e.status_code()
                }
            },
            Err(e) => decode_failure(fd, request, e),
        },

        MessageId::UnsubscribeKeyEvent => match packet.decode::<UnsubscribeKeyEventReq>() {
            Ok(req) => match targets.subscriber.unsubscribe(fd, req.subscribe_id) {
                Ok(()) => 0,
                Err(e) => {
                    warn!("unsubscribe from fd={} failed: {}", fd, e);
                    e.status_code()
                }
            },
            Err(e) => decode_failure(fd, request, e),
        },

        MessageId::MarkProcessed => {
            // High-frequency acknowledgement; no reply.
            if let Ok(req) = packet.decode::<MarkProcessedReq>() {
                targets.anr.mark_processed(fd, req.event_id);
            }
            return;
        }

        // Server-to-client ids arriving from a client are protocol misuse.
        MessageId::ReportKeyEvent
        | MessageId::ReportPointerEvent
        | MessageId::OnSubscribeKey
        | MessageId::CommandReply => {
            warn!("Client fd={} sent server-side message {:?}, ignoring", fd, request);
            return;
        }
    };

    let reply = CommandReply {
        request: request as u32,
        status,
    };
    match Packet::encode(MessageId::CommandReply, &reply) {
        Ok(packet) => {
            session.send_msg(packet);
        }
        Err(e) => warn!("Reply encode failed for fd={}: {}", fd, e),
    }
}

fn decode_failure(fd: i32, request: MessageId, error: crate::transport::TransportError) -> i32 {
    warn!("Bad {:?} request body from fd={}: {}", request, fd, error);
    -1
}
