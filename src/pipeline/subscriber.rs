//! Subscriber Stage
//!
//! Key-combination subscriptions: a client registers a set of pre-keys, a
//! final key, a direction (down/up) and an optional hold duration, and is
//! notified once when the combination's trigger condition is met.
//!
//! Each subscription is an explicit state machine over `Idle`, `Armed`
//! (duration timer running, cloned key event held) and `Notified`. Timer
//! callbacks hold a weak reference to the stage state and act only if the
//! subscription is still armed with the exact timer id they were created
//! with — the event thread may have disarmed or replaced the timer in the
//! meantime.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::{KeyAction, KeyEvent, MAX_PRE_KEYS};
use crate::transport::message::{MessageId, OnSubscribeKey, Packet};
use crate::transport::SessionRegistry;

use super::{PipelineStage, StageResult};

/// Result type for subscription mutations.
pub type Result<T> = std::result::Result<T, SubscriberError>;

/// Subscription mutation errors, relayed to clients as negative status codes.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubscriberError {
    /// Malformed key option
    #[error("Invalid key option: {0}")]
    InvalidOption(String),

    /// Unknown subscription id for this session
    #[error("No subscription {0} for this session")]
    NotFound(i32),
}

impl SubscriberError {
    /// Wire status code for command replies.
    pub fn status_code(&self) -> i32 {
        match self {
            SubscriberError::InvalidOption(_) => -5,
            SubscriberError::NotFound(_) => -6,
        }
    }
}

/// A key combination to match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyOption {
    /// Keys that must already be held, at most [`MAX_PRE_KEYS`].
    pub pre_keys: Vec<i32>,
    /// The key that completes the combination.
    pub final_key: i32,
    /// `true`: trigger on final key down; `false`: trigger on release.
    pub final_key_down: bool,
    /// Hold duration in milliseconds; zero or negative fires immediately.
    pub duration_ms: i32,
}

#[derive(Debug)]
enum SubState {
    Idle,
    Armed { timer_id: u64, pending: Box<KeyEvent> },
    Notified,
}

#[derive(Debug)]
struct Subscription {
    subscribe_id: i32,
    session_fd: i32,
    option: KeyOption,
    state: SubState,
}

#[derive(Default)]
struct SubscriberInner {
    subscriptions: Vec<Subscription>,
    next_timer_id: u64,
}

/// Key-combination matcher over all live subscriptions.
pub struct SubscriberStage {
    inner: Arc<Mutex<SubscriberInner>>,
    sessions: Arc<SessionRegistry>,
}

impl SubscriberStage {
    /// Create the stage with no subscriptions.
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SubscriberInner::default())),
            sessions,
        }
    }

    /// Register a subscription; replaces an existing one with the same id
    /// from the same session (disarming its timer).
    pub fn subscribe(&self, session_fd: i32, subscribe_id: i32, option: KeyOption) -> Result<()> {
        if option.pre_keys.len() > MAX_PRE_KEYS {
            return Err(SubscriberError::InvalidOption(format!(
                "{} pre-keys (max {})",
                option.pre_keys.len(),
                MAX_PRE_KEYS
            )));
        }
        if option.pre_keys.contains(&option.final_key) {
            return Err(SubscriberError::InvalidOption(
                "final key listed as pre-key".into(),
            ));
        }

        let mut canonical = option;
        canonical.pre_keys.sort_unstable();
        canonical.pre_keys.dedup();

        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.session_fd == session_fd && s.subscribe_id == subscribe_id)
        {
            debug!(
                "Subscription {} (fd={}) replaced, timer disarmed",
                subscribe_id, session_fd
            );
            existing.option = canonical;
            existing.state = SubState::Idle;
            return Ok(());
        }

        debug!(
            "Subscription added: id={}, fd={}, final_key={}, down={}, duration={}ms",
            subscribe_id,
            session_fd,
            canonical.final_key,
            canonical.final_key_down,
            canonical.duration_ms
        );
        inner.subscriptions.push(Subscription {
            subscribe_id,
            session_fd,
            option: canonical,
            state: SubState::Idle,
        });
        Ok(())
    }

    /// Remove a subscription, disarming its timer.
    pub fn unsubscribe(&self, session_fd: i32, subscribe_id: i32) -> Result<()> {
        let mut inner = self.inner.lock();
        let before = inner.subscriptions.len();
        inner
            .subscriptions
            .retain(|s| !(s.session_fd == session_fd && s.subscribe_id == subscribe_id));
        if inner.subscriptions.len() == before {
            return Err(SubscriberError::NotFound(subscribe_id));
        }
        debug!("Subscription removed: id={}, fd={}", subscribe_id, session_fd);
        Ok(())
    }

    /// Drop every subscription owned by a vanished session.
    ///
    /// In-flight timers for these subscriptions become stale no-ops.
    pub fn on_session_lost(&self, session_fd: i32) {
        let mut inner = self.inner.lock();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.session_fd != session_fd);
        let purged = before - inner.subscriptions.len();
        if purged > 0 {
            debug!("Purged {} subscriptions for session fd={}", purged, session_fd);
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    /// Duration-timer fire path.
    ///
    /// Acts only when the subscription still exists, is still `Armed`, and
    /// carries this exact `timer_id`; anything else is a stale no-op.
    pub fn on_timer(&self, session_fd: i32, subscribe_id: i32, timer_id: u64) {
        fire_timer(&self.inner, &self.sessions, session_fd, subscribe_id, timer_id);
    }

    fn handle_down(&self, event: &KeyEvent) -> bool {
        let held = event.pressed_keys_except_acting();
        let mut fired: Vec<(i32, i32)> = Vec::new();
        let mut armed: Vec<(i32, i32, u64, i32)> = Vec::new();

        {
            let mut inner = self.inner.lock();
            let SubscriberInner { subscriptions, next_timer_id } = &mut *inner;
            for sub in subscriptions.iter_mut() {
                let matches = sub.option.final_key_down
                    && sub.option.final_key == event.key_code
                    && sub.option.pre_keys == held;

                if matches {
                    if sub.option.duration_ms <= 0 {
                        sub.state = SubState::Notified;
                        fired.push((sub.session_fd, sub.subscribe_id));
                    } else {
                        *next_timer_id += 1;
                        let timer_id = *next_timer_id;
                        sub.state = SubState::Armed {
                            timer_id,
                            pending: Box::new(event.clone()),
                        };
                        armed.push((
                            sub.session_fd,
                            sub.subscribe_id,
                            timer_id,
                            sub.option.duration_ms,
                        ));
                    }
                } else if matches!(sub.state, SubState::Armed { .. }) {
                    debug!(
                        "Subscription {} (fd={}) disarmed: combination broken by key {}",
                        sub.subscribe_id, sub.session_fd, event.key_code
                    );
                    sub.state = SubState::Idle;
                }
            }
        }

        for (fd, id) in &fired {
            self.notify(*fd, *id, event);
        }
        for (fd, id, timer_id, duration_ms) in &armed {
            debug!(
                "Subscription {} (fd={}) armed for {}ms (timer {})",
                id, fd, duration_ms, timer_id
            );
            self.spawn_timer(*fd, *id, *timer_id, *duration_ms);
        }

        !fired.is_empty() || !armed.is_empty()
    }

    fn handle_up(&self, event: &KeyEvent) -> bool {
        let held = event.pressed_keys_except_acting();
        let mut fired: Vec<(i32, i32)> = Vec::new();

        {
            let mut inner = self.inner.lock();
            for sub in inner.subscriptions.iter_mut() {
                // Releasing any key of an armed combination aborts the hold.
                if matches!(sub.state, SubState::Armed { .. })
                    && (sub.option.final_key == event.key_code
                        || sub.option.pre_keys.contains(&event.key_code))
                {
                    debug!(
                        "Subscription {} (fd={}) disarmed: key {} released before duration",
                        sub.subscribe_id, sub.session_fd, event.key_code
                    );
                    sub.state = SubState::Idle;
                }

                let matches = !sub.option.final_key_down
                    && sub.option.final_key == event.key_code
                    && sub.option.pre_keys == held;
                if !matches {
                    continue;
                }

                // A positive duration means: fire only when the key is
                // released before the duration elapses.
                let fire = sub.option.duration_ms <= 0
                    || event.held_duration_us() < (sub.option.duration_ms as i64) * 1_000;
                if fire {
                    sub.state = SubState::Notified;
                    fired.push((sub.session_fd, sub.subscribe_id));
                }
            }
        }

        for (fd, id) in &fired {
            self.notify(*fd, *id, event);
        }
        !fired.is_empty()
    }

    fn handle_cancel(&self) {
        let mut inner = self.inner.lock();
        for sub in inner.subscriptions.iter_mut() {
            if matches!(sub.state, SubState::Armed { .. }) {
                debug!(
                    "Subscription {} (fd={}) disarmed by key cancel",
                    sub.subscribe_id, sub.session_fd
                );
                sub.state = SubState::Idle;
            }
        }
    }

    fn notify(&self, session_fd: i32, subscribe_id: i32, event: &KeyEvent) {
        notify_session(&self.sessions, session_fd, subscribe_id, event);
    }

    fn spawn_timer(&self, session_fd: i32, subscribe_id: i32, timer_id: u64, duration_ms: i32) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime (synchronous tests): the timer is driven manually
            // through `on_timer`.
            return;
        };
        let inner: Weak<Mutex<SubscriberInner>> = Arc::downgrade(&self.inner);
        let sessions = Arc::clone(&self.sessions);
        handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(duration_ms.max(0) as u64)).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            fire_timer(&inner, &sessions, session_fd, subscribe_id, timer_id);
        });
    }
}

fn fire_timer(
    inner: &Mutex<SubscriberInner>,
    sessions: &SessionRegistry,
    session_fd: i32,
    subscribe_id: i32,
    timer_id: u64,
) {
    let pending = {
        let mut inner = inner.lock();
        let Some(sub) = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.session_fd == session_fd && s.subscribe_id == subscribe_id)
        else {
            debug!(
                "Timer {} fired for removed subscription {} (fd={})",
                timer_id, subscribe_id, session_fd
            );
            return;
        };
        match &sub.state {
            SubState::Armed { timer_id: armed_id, pending } if *armed_id == timer_id => {
                let event = pending.clone();
                sub.state = SubState::Notified;
                event
            }
            _ => {
                debug!(
                    "Timer {} fired for subscription {} (fd={}) no longer armed with it",
                    timer_id, subscribe_id, session_fd
                );
                return;
            }
        }
    };
    notify_session(sessions, session_fd, subscribe_id, &pending);
}

fn notify_session(sessions: &SessionRegistry, session_fd: i32, subscribe_id: i32, event: &KeyEvent) {
    let Some(session) = sessions.get_session(session_fd) else {
        debug!(
            "Subscription {} notify skipped: session fd={} gone",
            subscribe_id, session_fd
        );
        return;
    };
    let body = OnSubscribeKey {
        subscribe_id,
        event: event.clone(),
    };
    match Packet::encode(MessageId::OnSubscribeKey, &body) {
        Ok(packet) => {
            if !session.send_msg(packet) {
                warn!(
                    "Subscription {} notify failed: session fd={} writer closed",
                    subscribe_id, session_fd
                );
            } else {
                debug!("Subscription {} notified (fd={})", subscribe_id, session_fd);
            }
        }
        Err(e) => warn!("Subscription {} notify encode failed: {}", subscribe_id, e),
    }
}

impl PipelineStage for SubscriberStage {
    fn name(&self) -> &'static str {
        "subscriber"
    }

    fn handle_key(&self, event: &mut KeyEvent) -> StageResult {
        let handled = match event.action {
            KeyAction::Down => self.handle_down(event),
            KeyAction::Up => self.handle_up(event),
            KeyAction::Cancel => {
                self.handle_cancel();
                false
            }
        };
        if handled {
            StageResult::Consumed
        } else {
            StageResult::Forward
        }
    }
}
