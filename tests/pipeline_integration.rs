//! End-to-end pipeline scenarios
//!
//! Drives the assembled chain the way the event pump does, with real
//! registration tables, window routing and ANR tracking, and client
//! sessions observed through their outbound queues.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use inputhub_server::anr::{AnrController, AnrManager};
use inputhub_server::event::{
    DeviceSource, EventFlags, HandleEventType, InputEvent, KeyAction, KeyEvent, PointerAction,
    PointerEvent, PointerItem,
};
use inputhub_server::event::DeviceTags;
use inputhub_server::pipeline::dispatch::DISPATCH_HANDLER_ID;
use inputhub_server::pipeline::{
    DispatchStage, EventInjector, EventPipeline, InterceptorStage, MonitorStage, NormalizeStage,
    PipelineStage, SubscriberStage,
};
use inputhub_server::pipeline::subscriber::KeyOption;
use inputhub_server::registry::{AddHandler, HandlerRegistry, HandlerType};
use inputhub_server::transport::message::{
    MessageId, OnSubscribeKey, Packet, ReportKeyEvent, ReportPointerEvent,
};
use inputhub_server::transport::{Session, SessionRegistry};
use inputhub_server::window::{WindowInfo, WindowManager, WindowResolver};

/// Assembled chain with handles on everything a scenario needs.
struct Harness {
    sessions: Arc<SessionRegistry>,
    registry: Arc<HandlerRegistry>,
    windows: Arc<WindowManager>,
    anr: Arc<AnrManager>,
    subscriber: Arc<SubscriberStage>,
    monitor: Arc<MonitorStage>,
    pipeline: EventPipeline,
    injected: UnboundedReceiver<InputEvent>,
}

impl Harness {
    fn new(anr_timeout_ms: u64) -> Self {
        let sessions = Arc::new(SessionRegistry::new(16));
        let registry = HandlerRegistry::new(Arc::clone(&sessions));
        let windows = Arc::new(WindowManager::new());
        let anr = AnrManager::new(anr_timeout_ms);
        let (injector, injected) = EventInjector::channel();

        let subscriber = Arc::new(SubscriberStage::new(Arc::clone(&sessions)));
        let monitor = Arc::new(MonitorStage::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&anr) as Arc<dyn AnrController>,
            injector.clone(),
        ));
        let stages: Vec<Arc<dyn PipelineStage>> = vec![
            Arc::new(NormalizeStage::new()),
            Arc::new(InterceptorStage::new(
                Arc::clone(&registry),
                Arc::clone(&sessions),
            )),
            Arc::clone(&subscriber) as Arc<dyn PipelineStage>,
            Arc::clone(&monitor) as Arc<dyn PipelineStage>,
            Arc::new(DispatchStage::new(
                Arc::clone(&windows) as Arc<dyn WindowResolver>,
                Arc::clone(&sessions),
                Arc::clone(&anr) as Arc<dyn AnrController>,
            )),
        ];
        let pipeline = EventPipeline::new(stages);

        Harness {
            sessions,
            registry,
            windows,
            anr,
            subscriber,
            monitor,
            pipeline,
            injected,
        }
    }

    /// Connect a fake client session.
    fn connect(&self, fd: i32, pid: i32) -> UnboundedReceiver<Packet> {
        let (session, rx) = Session::channel(fd, pid, 1000);
        self.sessions.add_session(session).unwrap();
        rx
    }

    /// Connect the "app": a session owning one window.
    fn connect_app(&self, fd: i32, pid: i32, window_id: i32) -> UnboundedReceiver<Packet> {
        let rx = self.connect(fd, pid);
        self.windows.register_window(WindowInfo {
            id: window_id,
            pid,
            session_fd: fd,
        });
        rx
    }

    fn register(&self, id: i32, handler_type: HandlerType, fd: i32, event_types: HandleEventType) {
        self.registry
            .add_handler(AddHandler {
                id,
                handler_type,
                session_fd: fd,
                event_types,
                device_tags: DeviceTags::ALL,
                priority: 0,
                gesture: None,
            })
            .unwrap();
    }

    fn run(&self, event: InputEvent) -> bool {
        let mut event = event;
        self.pipeline.handle_event(&mut event)
    }

    /// Drain synthesized events back through the chain, as the pump would.
    fn pump_injected(&mut self) {
        while let Ok(mut event) = self.injected.try_recv() {
            self.pipeline.handle_event(&mut event);
        }
    }
}

fn key_down(id: i64, code: i32, time_us: i64) -> InputEvent {
    InputEvent::Key(KeyEvent::new(id, code, KeyAction::Down, time_us))
}

fn touch(id: i64, action: PointerAction, window_id: i32, pressed: bool) -> InputEvent {
    let mut ev = PointerEvent::new(id, DeviceSource::Touchscreen, action, id * 1_000);
    ev.pointer_id = 1;
    ev.pointers = vec![PointerItem {
        pointer_id: 1,
        window_id,
        x: 10.0,
        y: 20.0,
        pressed,
    }];
    InputEvent::Pointer(ev)
}

fn recv_pointer(rx: &mut UnboundedReceiver<Packet>) -> ReportPointerEvent {
    let packet = rx.try_recv().expect("expected a pointer report");
    assert_eq!(packet.id, MessageId::ReportPointerEvent);
    packet.decode().unwrap()
}

// Scenario A: an interceptor takes a key event; neither the monitor nor the
// app window ever sees it.
#[test]
fn interceptor_takes_key_event_before_monitor_and_app() {
    let harness = Harness::new(5000);
    let mut app_rx = harness.connect_app(1, 100, 10);
    let mut interceptor_rx = harness.connect(2, 200);
    let mut monitor_rx = harness.connect(3, 300);
    harness.register(1, HandlerType::Interceptor, 2, HandleEventType::ALL);
    harness.register(2, HandlerType::Monitor, 3, HandleEventType::ALL);

    assert!(harness.run(key_down(1, 30, 1_000)));

    let packet = interceptor_rx.try_recv().unwrap();
    assert_eq!(packet.id, MessageId::ReportKeyEvent);
    let report: ReportKeyEvent = packet.decode().unwrap();
    assert_eq!(report.handler_id, 1);
    assert_eq!(report.event.key_code, 30);

    assert!(monitor_rx.try_recv().is_err());
    assert!(app_rx.try_recv().is_err());
}

// Scenario B: a pointer monitor observes a full touch sequence while the
// app still receives it.
#[test]
fn monitor_observes_without_consuming() {
    let harness = Harness::new(5000);
    let mut app_rx = harness.connect_app(1, 100, 10);
    let mut monitor_rx = harness.connect(2, 200);
    harness.register(5, HandlerType::Monitor, 2, HandleEventType::POINTER);

    harness.run(touch(1, PointerAction::Down, 10, true));
    harness.run(touch(2, PointerAction::Up, 10, false));

    // Monitor copy: DOWN then UP.
    assert_eq!(recv_pointer(&mut monitor_rx).event.action, PointerAction::Down);
    assert_eq!(recv_pointer(&mut monitor_rx).event.action, PointerAction::Up);

    // App delivery: DOWN then UP, as normal dispatch.
    let down = recv_pointer(&mut app_rx);
    assert_eq!(down.handler_id, DISPATCH_HANDLER_ID);
    assert_eq!(down.event.action, PointerAction::Down);
    assert_eq!(recv_pointer(&mut app_rx).event.action, PointerAction::Up);
}

// Scenario C: mark_consumed between DOWN and UP. The monitor keeps
// observing; the app gets a flagged CANCEL instead of the UP.
#[test]
fn mark_consumed_steals_sequence_from_app() {
    let mut harness = Harness::new(5000);
    let mut app_rx = harness.connect_app(1, 100, 10);
    let mut monitor_rx = harness.connect(2, 200);
    harness.register(5, HandlerType::Monitor, 2, HandleEventType::POINTER);

    harness.run(touch(7, PointerAction::Down, 10, true));
    assert_eq!(recv_pointer(&mut app_rx).event.action, PointerAction::Down);

    harness.monitor.mark_consumed(5, 7, 2);
    harness.pump_injected();

    // App got the synthesized CANCEL, carrying both bypass flags.
    let cancel = recv_pointer(&mut app_rx);
    assert_eq!(cancel.event.action, PointerAction::Cancel);
    assert!(cancel.event.flags.contains(EventFlags::NO_INTERCEPT));
    assert!(cancel.event.flags.contains(EventFlags::NO_MONITOR));

    harness.run(touch(8, PointerAction::Up, 10, false));

    // Monitor still sees the whole sequence.
    assert_eq!(recv_pointer(&mut monitor_rx).event.action, PointerAction::Down);
    assert_eq!(recv_pointer(&mut monitor_rx).event.action, PointerAction::Up);
    // The app does not see the UP.
    assert!(app_rx.try_recv().is_err());
}

// A second mark_consumed for the same sequence must not synthesize a
// second CANCEL.
#[test]
fn mark_consumed_idempotent_across_pipeline() {
    let mut harness = Harness::new(5000);
    let mut app_rx = harness.connect_app(1, 100, 10);
    let _monitor_rx = harness.connect(2, 200);
    harness.register(5, HandlerType::Monitor, 2, HandleEventType::POINTER);

    harness.run(touch(7, PointerAction::Down, 10, true));
    recv_pointer(&mut app_rx);

    harness.monitor.mark_consumed(5, 7, 2);
    harness.pump_injected();
    recv_pointer(&mut app_rx);

    harness.monitor.mark_consumed(5, 7, 2);
    harness.pump_injected();
    assert!(app_rx.try_recv().is_err());
}

// ANR backpressure: once the session is blocked, dispatch neither sends
// nor arms new timers until the client acknowledges.
#[test]
fn anr_blocks_dispatch_until_acknowledged() {
    let harness = Harness::new(1);
    let mut app_rx = harness.connect_app(1, 100, 10);

    harness.run(key_down(1, 30, 1_000));
    assert!(app_rx.try_recv().is_ok());

    // Let the 1ms timeout elapse without an acknowledgement.
    std::thread::sleep(Duration::from_millis(10));
    harness.run(key_down(2, 31, 2_000));
    assert!(app_rx.try_recv().is_err());

    // Acknowledge: dispatch resumes.
    harness.anr.mark_processed(1, 2);
    harness.run(key_down(3, 32, 3_000));
    let report: ReportKeyEvent = app_rx.try_recv().unwrap().decode().unwrap();
    assert_eq!(report.event.key_code, 32);
}

// Session teardown purges registrations mid-stream.
#[test]
fn session_loss_stops_deliveries() {
    let harness = Harness::new(5000);
    let mut app_rx = harness.connect_app(1, 100, 10);
    let _monitor_rx = harness.connect(2, 200);
    harness.register(5, HandlerType::Monitor, 2, HandleEventType::POINTER);

    harness.sessions.remove_session(2);
    assert_eq!(harness.registry.handler_count(HandlerType::Monitor), 0);

    // Events still reach the app.
    harness.run(touch(1, PointerAction::Down, 10, true));
    assert!(app_rx.try_recv().is_ok());
}

// Key combination with a hold duration: the notification comes from the
// timer, exactly once, not from the down handler.
#[tokio::test(start_paused = true)]
async fn subscription_fires_on_duration_timer() {
    let harness = Harness::new(5000);
    let mut app_rx = harness.connect_app(1, 100, 10);
    let mut sub_rx = harness.connect(2, 200);
    harness
        .subscriber
        .subscribe(
            2,
            9,
            KeyOption {
                pre_keys: vec![],
                final_key: 30,
                final_key_down: true,
                duration_ms: 300,
            },
        )
        .unwrap();

    harness.run(key_down(1, 30, 1_000));
    // Armed: nothing yet, and the key event was consumed before dispatch.
    assert!(sub_rx.try_recv().is_err());
    assert!(app_rx.try_recv().is_err());

    tokio::time::sleep(Duration::from_millis(350)).await;

    let packet = sub_rx.try_recv().unwrap();
    assert_eq!(packet.id, MessageId::OnSubscribeKey);
    let body: OnSubscribeKey = packet.decode().unwrap();
    assert_eq!(body.subscribe_id, 9);
    assert!(sub_rx.try_recv().is_err());
}

// The same subscription aborts when another key breaks the combination
// before the timer fires.
#[tokio::test(start_paused = true)]
async fn subscription_aborts_on_mismatch() {
    let harness = Harness::new(5000);
    let _app_rx = harness.connect_app(1, 100, 10);
    let mut sub_rx = harness.connect(2, 200);
    harness
        .subscriber
        .subscribe(
            2,
            9,
            KeyOption {
                pre_keys: vec![],
                final_key: 30,
                final_key_down: true,
                duration_ms: 300,
            },
        )
        .unwrap();

    harness.run(key_down(1, 30, 1_000));
    harness.run(key_down(2, 31, 2_000));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(sub_rx.try_recv().is_err());
}

// Interceptors with pointer masks stop touch events from reaching
// monitors and dispatch, same first-refusal policy as keys.
#[test]
fn pointer_interception_stops_propagation() {
    let harness = Harness::new(5000);
    let mut app_rx = harness.connect_app(1, 100, 10);
    let mut interceptor_rx = harness.connect(2, 200);
    let mut monitor_rx = harness.connect(3, 300);
    harness.register(1, HandlerType::Interceptor, 2, HandleEventType::POINTER);
    harness.register(2, HandlerType::Monitor, 3, HandleEventType::POINTER);

    harness.run(touch(1, PointerAction::Down, 10, true));

    assert!(interceptor_rx.try_recv().is_ok());
    assert!(monitor_rx.try_recv().is_err());
    assert!(app_rx.try_recv().is_err());
}
