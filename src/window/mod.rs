//! Target Window Resolution
//!
//! The dispatch stage routes events to the client session owning the target
//! window. [`WindowResolver`] is the seam it depends on; [`WindowManager`] is
//! the in-memory implementation shipped with the service. Display topology
//! and coordinate transformation live upstream — this table only answers
//! "which session fd and pid owns this window".
//!
//! A miss (`None`) means "no route": the caller logs and drops the event for
//! that destination, it never retries.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::event::{KeyEvent, PointerEvent};

/// Resolves events to their destination session.
pub trait WindowResolver: Send + Sync {
    /// Session fd for a key event (focused-window routing).
    fn update_target(&self, event: &KeyEvent) -> Option<i32>;

    /// Session fd for a pointer event (acting-item window routing).
    fn client_fd(&self, event: &PointerEvent) -> Option<i32>;

    /// Owning pid of a window.
    fn window_pid(&self, window_id: i32) -> Option<i32>;
}

/// One window known to the service.
#[derive(Debug, Clone)]
pub struct WindowInfo {
    /// Window id.
    pub id: i32,
    /// Owning client pid.
    pub pid: i32,
    /// Session fd events for this window are sent to.
    pub session_fd: i32,
}

#[derive(Default)]
struct WindowTable {
    windows: HashMap<i32, WindowInfo>,
    focused: Option<i32>,
}

/// In-memory window table with focus tracking.
#[derive(Default)]
pub struct WindowManager {
    table: RwLock<WindowTable>,
}

impl WindowManager {
    /// Create an empty window table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a window. The first registered window gains focus.
    pub fn register_window(&self, info: WindowInfo) {
        let mut table = self.table.write();
        debug!("Window registered: id={}, pid={}, fd={}", info.id, info.pid, info.session_fd);
        let id = info.id;
        table.windows.insert(id, info);
        if table.focused.is_none() {
            table.focused = Some(id);
        }
    }

    /// Remove a window, dropping focus if it was focused.
    pub fn unregister_window(&self, window_id: i32) {
        let mut table = self.table.write();
        table.windows.remove(&window_id);
        if table.focused == Some(window_id) {
            table.focused = None;
        }
    }

    /// Move keyboard focus.
    pub fn set_focus(&self, window_id: i32) {
        let mut table = self.table.write();
        if table.windows.contains_key(&window_id) {
            table.focused = Some(window_id);
        } else {
            warn!("Focus request for unknown window id={}", window_id);
        }
    }

    /// Drop every window delivered through a vanished session.
    pub fn on_session_lost(&self, session_fd: i32) {
        let mut table = self.table.write();
        table.windows.retain(|_, w| w.session_fd != session_fd);
        if let Some(focused) = table.focused {
            if !table.windows.contains_key(&focused) {
                table.focused = None;
            }
        }
    }

    /// Number of known windows.
    pub fn window_count(&self) -> usize {
        self.table.read().windows.len()
    }
}

impl WindowResolver for WindowManager {
    fn update_target(&self, _event: &KeyEvent) -> Option<i32> {
        let table = self.table.read();
        let focused = table.focused?;
        table.windows.get(&focused).map(|w| w.session_fd)
    }

    fn client_fd(&self, event: &PointerEvent) -> Option<i32> {
        let table = self.table.read();
        if let Some(item) = event.acting_item() {
            if let Some(window) = table.windows.get(&item.window_id) {
                return Some(window.session_fd);
            }
        }
        // No acting item resolved: fall back to the focused window.
        let focused = table.focused?;
        table.windows.get(&focused).map(|w| w.session_fd)
    }

    fn window_pid(&self, window_id: i32) -> Option<i32> {
        self.table.read().windows.get(&window_id).map(|w| w.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DeviceSource, KeyAction, PointerAction, PointerItem};

    fn manager_with_windows() -> WindowManager {
        let manager = WindowManager::new();
        manager.register_window(WindowInfo { id: 10, pid: 100, session_fd: 3 });
        manager.register_window(WindowInfo { id: 11, pid: 101, session_fd: 4 });
        manager
    }

    #[test]
    fn test_key_routing_follows_focus() {
        let manager = manager_with_windows();
        let event = KeyEvent::new(1, 30, KeyAction::Down, 100);

        assert_eq!(manager.update_target(&event), Some(3));
        manager.set_focus(11);
        assert_eq!(manager.update_target(&event), Some(4));
    }

    #[test]
    fn test_pointer_routing_uses_acting_item() {
        let manager = manager_with_windows();
        let mut event = PointerEvent::new(2, DeviceSource::Touchscreen, PointerAction::Down, 100);
        event.pointer_id = 1;
        event.pointers = vec![PointerItem {
            pointer_id: 1,
            window_id: 11,
            x: 5.0,
            y: 5.0,
            pressed: true,
        }];

        assert_eq!(manager.client_fd(&event), Some(4));
        assert_eq!(manager.window_pid(11), Some(101));
    }

    #[test]
    fn test_unknown_window_is_a_miss() {
        let manager = WindowManager::new();
        let event = KeyEvent::new(1, 30, KeyAction::Down, 100);
        assert_eq!(manager.update_target(&event), None);
        assert_eq!(manager.window_pid(42), None);
    }

    #[test]
    fn test_session_loss_drops_windows_and_focus() {
        let manager = manager_with_windows();
        manager.on_session_lost(3);
        assert_eq!(manager.window_count(), 1);

        let event = KeyEvent::new(1, 30, KeyAction::Down, 100);
        assert_eq!(manager.update_target(&event), None);
    }
}
