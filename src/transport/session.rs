//! Client Sessions
//!
//! A [`Session`] is the server-side handle for one connected client: its
//! socket fd (the session identity), peer credentials, and the outbound
//! packet queue drained by the connection's writer task.
//!
//! The [`SessionRegistry`] maps fds to live sessions and notifies registered
//! callbacks when a session is removed, which is what drives bulk cleanup of
//! handler registrations, subscriptions and ANR state elsewhere in the crate.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::message::Packet;
use super::{Result, TransportError};

/// Callback invoked after a session is removed from the registry.
pub type SessionDeletedCallback = Box<dyn Fn(&Arc<Session>) + Send + Sync>;

/// One connected IPC client.
#[derive(Debug)]
pub struct Session {
    /// Socket fd; the session's identity for the lifetime of the connection.
    fd: i32,
    /// Client process id from peer credentials.
    pid: i32,
    /// Client user id from peer credentials.
    uid: u32,
    /// Outbound queue drained by the connection writer task.
    sender: mpsc::UnboundedSender<Packet>,
}

impl Session {
    /// Create a session and the receiver its writer task drains.
    pub fn channel(fd: i32, pid: i32, uid: u32) -> (Arc<Session>, mpsc::UnboundedReceiver<Packet>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Session { fd, pid, uid, sender }), receiver)
    }

    /// Session identity.
    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// Client process id.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Client user id.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Queue a packet for delivery.
    ///
    /// Returns `false` when the connection's writer side is gone. Failures
    /// are logged, never retried; session teardown is driven by the
    /// connection close, not by send results.
    pub fn send_msg(&self, packet: Packet) -> bool {
        match self.sender.send(packet) {
            Ok(()) => true,
            Err(_) => {
                warn!("Send to session fd={} failed: writer closed", self.fd);
                false
            }
        }
    }
}

/// Table of live sessions keyed by fd.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<i32, Arc<Session>>>,
    deleted_callbacks: Mutex<Vec<SessionDeletedCallback>>,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Create a registry bounded at `max_sessions` concurrent clients.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            deleted_callbacks: Mutex::new(Vec::new()),
            max_sessions,
        }
    }

    /// Register a freshly accepted session.
    pub fn add_session(&self, session: Arc<Session>) -> Result<()> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_sessions {
            return Err(TransportError::SessionLimit(self.max_sessions));
        }
        let fd = session.fd();
        if sessions.contains_key(&fd) {
            return Err(TransportError::DuplicateSession(fd));
        }
        debug!("Session added: fd={}, pid={}", fd, session.pid());
        sessions.insert(fd, session);
        Ok(())
    }

    /// Remove a session and fire the deleted callbacks.
    ///
    /// No-op when the fd is not registered (already removed).
    pub fn remove_session(&self, fd: i32) {
        let removed = self.sessions.write().remove(&fd);
        let Some(session) = removed else {
            return;
        };
        debug!("Session removed: fd={}, pid={}", fd, session.pid());
        for callback in self.deleted_callbacks.lock().iter() {
            callback(&session);
        }
    }

    /// Look up a live session by fd.
    pub fn get_session(&self, fd: i32) -> Option<Arc<Session>> {
        self.sessions.read().get(&fd).cloned()
    }

    /// Register a callback fired after each session removal.
    pub fn add_session_deleted_callback(&self, callback: SessionDeletedCallback) {
        self.deleted_callbacks.lock().push(callback);
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.read().len())
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn test_add_get_remove() {
        let registry = SessionRegistry::new(4);
        let (session, _rx) = Session::channel(7, 100, 1000);
        registry.add_session(session).unwrap();

        assert!(registry.get_session(7).is_some());
        registry.remove_session(7);
        assert!(registry.get_session(7).is_none());
    }

    #[test]
    fn test_session_limit() {
        let registry = SessionRegistry::new(1);
        let (first, _rx1) = Session::channel(1, 100, 1000);
        let (second, _rx2) = Session::channel(2, 101, 1000);

        registry.add_session(first).unwrap();
        assert!(matches!(
            registry.add_session(second),
            Err(TransportError::SessionLimit(1))
        ));
    }

    #[test]
    fn test_duplicate_fd_rejected() {
        let registry = SessionRegistry::new(4);
        let (first, _rx1) = Session::channel(3, 100, 1000);
        let (dup, _rx2) = Session::channel(3, 101, 1000);

        registry.add_session(first).unwrap();
        assert!(matches!(
            registry.add_session(dup),
            Err(TransportError::DuplicateSession(3))
        ));
    }

    #[test]
    fn test_deleted_callback_fires_once_per_removal() {
        let registry = SessionRegistry::new(4);
        let fired = Arc::new(AtomicI32::new(0));
        let fired_clone = Arc::clone(&fired);
        registry.add_session_deleted_callback(Box::new(move |session| {
            assert_eq!(session.fd(), 9);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let (session, _rx) = Session::channel(9, 100, 1000);
        registry.add_session(session).unwrap();
        registry.remove_session(9);
        registry.remove_session(9);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_msg_reports_closed_writer() {
        let (session, rx) = Session::channel(5, 100, 1000);
        drop(rx);
        let packet = Packet {
            id: crate::transport::MessageId::CommandReply,
            body: bytes::Bytes::from_static(b"{}"),
        };
        assert!(!session.send_msg(packet));
    }
}
