use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Barrier, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use edgewatch::{
    AppConfig, AppError, ChannelSnapshot, Direction, EdgeDetect, GpioBackend, GpioManager,
    MockGpioBackend, MockOp, NumberingMode, PollerState, Pull,
};

fn manager(mode: NumberingMode) -> (Arc<GpioManager<MockGpioBackend>>, MockGpioBackend) {
    let config = AppConfig::from_json(
        r#"{ "board_revision": "rev3", "retry": { "attempts": 5, "backoff_ms": 0 } }"#,
    )
    .expect("config");
    let backend = MockGpioBackend::default();
    let manager = GpioManager::new(Arc::new(config), Arc::new(backend.clone())).expect("manager");
    if mode != NumberingMode::Unset {
        manager.set_numbering(mode).unwrap();
    }
    (Arc::new(manager), backend)
}

/// Toggles `gpio` low then high until `done` holds or two seconds pass.
fn pulse_until(backend: &MockGpioBackend, gpio: u32, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        backend.set_level(gpio, 0);
        backend.set_level(gpio, 1);
        thread::sleep(Duration::from_millis(10));
        if done() {
            return true;
        }
    }
    false
}

fn wait_for_poller(manager: &GpioManager<MockGpioBackend>, state: PollerState) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if manager.poller_state() == state {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn watch_before_numbering_touches_nothing() {
    let (m, backend) = manager(NumberingMode::Unset);

    let err = m.watch(11, EdgeDetect::Rising, None, |_, _| {}).unwrap_err();
    assert!(matches!(err, AppError::NumberingNotSet));
    assert!(backend.journal().is_empty());
    assert!(m.channels().is_empty());
}

#[test]
fn watch_requires_input_setup() {
    let (m, backend) = manager(NumberingMode::Board);

    let err = m.watch(11, EdgeDetect::Rising, None, |_, _| {}).unwrap_err();
    assert!(matches!(err, AppError::NotConfigured(11)));

    m.setup(11, Direction::Out, Pull::Off).unwrap();
    let err = m.add_event_detect(11, EdgeDetect::Rising, None).unwrap_err();
    assert!(matches!(err, AppError::NotConfigured(11)));
    assert_eq!(backend.direction(17), Some(Direction::Out));
}

#[test]
fn board_pin_11_watch_conflict_and_rewatch() {
    let (m, backend) = manager(NumberingMode::Board);
    m.setup(11, Direction::In, Pull::Off).unwrap();

    m.watch(11, EdgeDetect::Rising, None, |_, _| {}).unwrap();
    assert!(m.callback_exists(17));
    assert_eq!(backend.edge(17), EdgeDetect::Rising);
    assert!(backend.journal().contains(&MockOp::Edge(17, EdgeDetect::Rising)));
    assert_eq!(m.poller_state(), PollerState::Running);

    let err = m.watch(11, EdgeDetect::Rising, None, |_, _| {}).unwrap_err();
    assert!(matches!(err, AppError::DuplicateCallback(17)));
    assert!(err.is_conflict());

    m.stop_watching(11).unwrap();
    assert!(!m.callback_exists(17));
    assert!(m.channel_state(11).unwrap().is_none());
    assert_eq!(backend.edge(17), EdgeDetect::None);
    assert_eq!(backend.journal().last(), Some(&MockOp::Unexport(17)));
    assert_eq!(backend.open_streams(), 0);

    m.watch(11, EdgeDetect::Falling, None, |_, _| {}).unwrap();
    assert_eq!(backend.edge(17), EdgeDetect::Falling);
    assert!(m.callback_exists(17));
}

#[test]
fn stop_watching_untracked_pin_is_noop() {
    let (m, backend) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();
    backend.clear_journal();

    m.stop_watching(4).unwrap();
    assert!(backend.journal().is_empty());
}

#[test]
fn wait_times_out_and_releases_pin() {
    let (m, backend) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();

    let start = Instant::now();
    let value = m
        .wait_for_edge(4, EdgeDetect::Both, None, Some(Duration::from_millis(100)))
        .unwrap();
    assert_eq!(value, None);
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(m.channels().is_empty());
    assert_eq!(backend.open_streams(), 0);
    assert_eq!(backend.edge(4), EdgeDetect::None);
}

#[test]
fn zero_timeout_polls_once() {
    let (m, _) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();

    let value = m
        .wait_for_edge(4, EdgeDetect::Rising, None, Some(Duration::ZERO))
        .unwrap();
    assert_eq!(value, None);
    assert!(m.channels().is_empty());
}

#[test]
fn wait_returns_level_after_edge() {
    let (m, backend) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let pulser = {
        let stop = Arc::clone(&stop);
        let backend = backend.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                backend.set_level(4, 0);
                backend.set_level(4, 1);
                thread::sleep(Duration::from_millis(10));
            }
        })
    };

    let value = m
        .wait_for_edge(4, EdgeDetect::Rising, None, Some(Duration::from_secs(2)))
        .unwrap();
    stop.store(true, Ordering::Relaxed);
    pulser.join().unwrap();

    assert_eq!(value, Some(1));
    assert!(m.channels().is_empty());
}

#[test]
fn wait_during_watch_conflicts_without_kernel_io() {
    let (m, backend) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();
    m.watch(4, EdgeDetect::Rising, None, |_, _| {}).unwrap();
    backend.clear_journal();

    let err = m
        .wait_for_edge(4, EdgeDetect::Falling, None, Some(Duration::from_millis(10)))
        .unwrap_err();
    assert!(matches!(err, AppError::ConflictingEdgeDetection(4)));
    assert!(backend.journal().is_empty());
    assert!(m.callback_exists(4));
}

#[test]
fn release_during_wait_returns_none() {
    let (m, _) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();

    let waiter = {
        let m = Arc::clone(&m);
        thread::spawn(move || m.wait_for_edge(4, EdgeDetect::Both, None, None))
    };

    let deadline = Instant::now() + Duration::from_secs(1);
    while m.channel_state(4).unwrap().is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    m.cleanup(Some(4)).unwrap();

    assert_eq!(waiter.join().unwrap().unwrap(), None);
    assert!(m.channels().is_empty());
}

#[test]
fn callback_receives_channel_and_value() {
    let (m, backend) = manager(NumberingMode::Board);
    m.setup(11, Direction::In, Pull::Off).unwrap();

    let (tx, rx) = mpsc::channel();
    m.watch(11, EdgeDetect::Rising, None, move |channel, value| {
        let _ = tx.send((channel, value));
    })
    .unwrap();

    let mut got = None;
    assert!(pulse_until(&backend, 17, || {
        got = rx.try_recv().ok();
        got.is_some()
    }));
    assert_eq!(got, Some((11, 1)));
}

#[test]
fn panicking_callback_does_not_stop_poller() {
    let (m, backend) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();
    m.setup(5, Direction::In, Pull::Off).unwrap();

    m.watch(4, EdgeDetect::Rising, None, |_, _| panic!("boom")).unwrap();
    let (tx, rx) = mpsc::channel();
    m.watch(5, EdgeDetect::Rising, None, move |channel, _| {
        let _ = tx.send(channel);
    })
    .unwrap();

    for _ in 0..5 {
        backend.set_level(4, 0);
        backend.set_level(4, 1);
        thread::sleep(Duration::from_millis(10));
    }
    assert!(pulse_until(&backend, 5, || rx.try_recv().is_ok()));
    assert_eq!(m.poller_state(), PollerState::Running);
}

#[test]
fn direction_retry_exhaustion_rolls_back_export() {
    let (m, backend) = manager(NumberingMode::Bcm);
    backend.fail_direction_writes(4, 10);

    let err = m.setup(4, Direction::In, Pull::Off).unwrap_err();
    assert!(matches!(err, AppError::Gpio(_)));

    let journal = backend.journal();
    let direction_writes = journal
        .iter()
        .filter(|op| matches!(op, MockOp::Direction(4, _)))
        .count();
    assert_eq!(direction_writes, 5);
    assert_eq!(journal.first(), Some(&MockOp::Export(4)));
    assert_eq!(journal.last(), Some(&MockOp::Unexport(4)));
    assert_eq!(m.direction(4).unwrap(), None);
}

#[test]
fn transient_edge_failures_are_retried() {
    let (m, backend) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();
    backend.fail_edge_writes(4, 2);

    m.add_event_detect(4, EdgeDetect::Both, None).unwrap();
    assert_eq!(backend.edge(4), EdgeDetect::Both);
    let edge_writes = backend
        .journal()
        .iter()
        .filter(|op| matches!(op, MockOp::Edge(4, EdgeDetect::Both)))
        .count();
    assert_eq!(edge_writes, 3);
}

#[test]
fn event_detected_is_cleared_on_read() {
    let (m, backend) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();
    m.add_event_detect(4, EdgeDetect::Rising, None).unwrap();
    assert!(!m.callback_exists(4));

    assert!(pulse_until(&backend, 4, || m.event_detected(4).unwrap()));
    thread::sleep(Duration::from_millis(50));
    let _ = m.event_detected(4).unwrap();
    assert!(!m.event_detected(4).unwrap());
}

#[test]
fn detect_then_callback_with_new_edge_reconfigures() {
    let (m, backend) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();
    m.add_event_detect(4, EdgeDetect::Rising, None).unwrap();

    m.watch(4, EdgeDetect::Falling, None, |_, _| {}).unwrap();
    assert_eq!(backend.edge(4), EdgeDetect::Falling);
    assert!(m.callback_exists(4));
    assert_eq!(m.channels().len(), 1);
    assert_eq!(backend.open_streams(), 1);
}

#[test]
fn same_edge_with_other_debounce_conflicts() {
    let (m, _) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();
    m.add_event_detect(4, EdgeDetect::Rising, Some(Duration::from_millis(100)))
        .unwrap();

    let err = m
        .add_event_detect(4, EdgeDetect::Rising, Some(Duration::from_millis(200)))
        .unwrap_err();
    assert!(matches!(err, AppError::ConflictingEdgeDetection(4)));

    let snapshot = m.channel_state(4).unwrap().unwrap();
    assert_eq!(snapshot.debounce_ms, Some(100));
}

#[test]
fn invalid_edge_and_debounce_are_rejected() {
    let (m, backend) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();
    backend.clear_journal();

    let err = m.add_event_detect(4, EdgeDetect::None, None).unwrap_err();
    assert!(matches!(err, AppError::InvalidValue(_)));
    let err = m
        .add_event_detect(4, EdgeDetect::Rising, Some(Duration::ZERO))
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidValue(_)));
    assert!(backend.journal().is_empty());
}

#[test]
fn output_setup_is_refused_while_watching() {
    let (m, _) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();
    m.add_event_detect(4, EdgeDetect::Rising, None).unwrap();

    let err = m.setup(4, Direction::Out, Pull::Off).unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
    let err = m.setup(5, Direction::Out, Pull::Up).unwrap_err();
    assert!(matches!(err, AppError::InvalidValue(_)));
}

#[test]
fn poller_stops_after_last_release() {
    let (m, _) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();
    assert_eq!(m.poller_state(), PollerState::Stopped);

    m.watch(4, EdgeDetect::Both, None, |_, _| {}).unwrap();
    assert_eq!(m.poller_state(), PollerState::Running);

    m.stop_watching(4).unwrap();
    assert!(wait_for_poller(&m, PollerState::Stopped));

    m.watch(4, EdgeDetect::Both, None, |_, _| {}).unwrap();
    assert_eq!(m.poller_state(), PollerState::Running);
}

#[test]
fn cleanup_releases_everything() {
    let (m, backend) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();
    m.setup(22, Direction::Out, Pull::Off).unwrap();
    m.watch(4, EdgeDetect::Rising, None, |_, _| {}).unwrap();

    m.cleanup(None).unwrap();
    assert!(m.channels().is_empty());
    assert_eq!(backend.open_streams(), 0);
    assert_eq!(m.poller_state(), PollerState::Stopped);
    assert!(backend.journal().contains(&MockOp::Unexport(22)));
    assert_eq!(m.direction(22).unwrap(), None);
    assert_eq!(m.reset_all(), 0);
}

#[test]
fn watched_events_reach_history_and_subscribers() {
    let (m, backend) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();
    let mut rx = m.subscribe_events();
    m.watch_events(4, EdgeDetect::Rising, None).unwrap();

    assert!(pulse_until(&backend, 4, || m.get_last_event(4).unwrap().is_some()));
    let event = m.get_last_event(4).unwrap().unwrap();
    assert_eq!(event.channel, 4);
    assert_eq!(event.gpio, 4);
    assert_eq!(event.value, 1);
    assert_eq!(event.edge, EdgeDetect::Rising);

    let published = rx.try_recv().unwrap();
    assert_eq!(published.channel, 4);
    assert_eq!(m.get_events(4, Some(1)).unwrap().len(), 1);
}

#[test]
fn racing_subscribers_export_once() {
    for _ in 0..20 {
        let (m, backend) = manager(NumberingMode::Bcm);
        m.setup(4, Direction::In, Pull::Off).unwrap();
        backend.unexport(4).unwrap();
        backend.clear_journal();

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let m = Arc::clone(&m);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    if i % 2 == 0 {
                        m.add_event_detect(4, EdgeDetect::Rising, None)
                    } else {
                        m.wait_for_edge(4, EdgeDetect::Rising, None, Some(Duration::from_millis(5)))
                            .map(|_| ())
                    }
                })
            })
            .collect();
        for handle in handles {
            if let Err(e) = handle.join().unwrap() {
                assert!(e.is_conflict(), "unexpected error: {e}");
            }
        }

        let mut exported = false;
        for op in backend.journal() {
            match op {
                MockOp::Export(4) => {
                    assert!(!exported, "gpio 4 exported twice");
                    exported = true;
                }
                MockOp::Unexport(4) => exported = false,
                _ => {}
            }
        }

        m.cleanup(None).unwrap();
        assert!(m.channels().is_empty());
        assert_eq!(backend.open_streams(), 0);
    }
}

type Observed = (Vec<ChannelSnapshot>, usize, bool, Option<ChannelSnapshot>);

fn observe(m: &GpioManager<MockGpioBackend>, backend: &MockGpioBackend) -> Observed {
    (
        m.channels(),
        backend.open_streams(),
        backend.is_exported(22),
        m.channel_state(5).unwrap(),
    )
}

#[test]
fn acquire_then_release_restores_prior_state() {
    type Prepare = fn(&GpioManager<MockGpioBackend>);
    let starts: [(&str, Prepare); 3] = [
        ("empty registry", |_| {}),
        ("other pin set up", |m| {
            m.setup(22, Direction::Out, Pull::Off).unwrap();
        }),
        ("other pin watched", |m| {
            m.setup(5, Direction::In, Pull::Off).unwrap();
            m.add_event_detect(5, EdgeDetect::Both, Some(Duration::from_millis(50)))
                .unwrap();
        }),
    ];

    for (name, prepare) in starts {
        let (m, backend) = manager(NumberingMode::Bcm);
        m.setup(4, Direction::In, Pull::Off).unwrap();
        prepare(&m);
        let before = observe(&m, &backend);

        m.add_event_detect(4, EdgeDetect::Rising, None).unwrap();
        assert_eq!(m.channels().len(), before.0.len() + 1, "{name}");
        m.stop_watching(4).unwrap();
        assert_eq!(observe(&m, &backend), before, "detect, {name}");

        m.watch(4, EdgeDetect::Both, Some(Duration::from_millis(10)), |_, _| {})
            .unwrap();
        m.stop_watching(4).unwrap();
        assert_eq!(observe(&m, &backend), before, "callback, {name}");

        m.wait_for_edge(4, EdgeDetect::Falling, None, Some(Duration::ZERO))
            .unwrap();
        assert_eq!(observe(&m, &backend), before, "wait, {name}");
    }
}

#[test]
fn failed_reregistration_detaches_until_next_watch() {
    let (m, backend) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();
    m.add_event_detect(4, EdgeDetect::Rising, None).unwrap();

    backend.fail_readiness_adds(1);
    let err = m.watch(4, EdgeDetect::Falling, None, |_, _| {}).unwrap_err();
    assert!(matches!(err, AppError::Gpio(_)));
    let snapshot = m.channel_state(4).unwrap().unwrap();
    assert_eq!(snapshot.attachment, "detached");
    assert_eq!(snapshot.edge, EdgeDetect::Falling);

    let (tx, rx) = mpsc::channel();
    m.watch(4, EdgeDetect::Falling, None, move |channel, value| {
        let _ = tx.send((channel, value));
    })
    .unwrap();
    assert_eq!(m.channel_state(4).unwrap().unwrap().attachment, "interrupt");

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut got = None;
    while got.is_none() && Instant::now() < deadline {
        backend.set_level(4, 1);
        backend.set_level(4, 0);
        got = rx.recv_timeout(Duration::from_millis(10)).ok();
    }
    assert_eq!(got, Some((4, 0)));
}

#[test]
fn poller_gives_up_on_failing_waits_and_restarts() {
    let (m, backend) = manager(NumberingMode::Bcm);
    m.setup(4, Direction::In, Pull::Off).unwrap();
    m.setup(5, Direction::In, Pull::Off).unwrap();
    m.watch(4, EdgeDetect::Rising, None, |_, _| {}).unwrap();
    assert_eq!(m.poller_state(), PollerState::Running);

    backend.fail_readiness_waits(u32::MAX);
    backend.set_level(4, 0);
    backend.set_level(4, 1);
    assert!(wait_for_poller(&m, PollerState::Stopped));

    backend.fail_readiness_waits(0);
    let (tx, rx) = mpsc::channel();
    m.watch(5, EdgeDetect::Rising, None, move |channel, _| {
        let _ = tx.send(channel);
    })
    .unwrap();
    assert_eq!(m.poller_state(), PollerState::Running);
    assert!(pulse_until(&backend, 5, || rx.try_recv().is_ok()));
}
