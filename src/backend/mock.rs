use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};

use super::{GpioBackend, ReadinessSet, ValueStream};
use crate::config::{Direction, EdgeDetect};

/// A kernel write observed by the mock, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Export(u32),
    Unexport(u32),
    Direction(u32, Direction),
    Edge(u32, EdgeDetect),
}

/// In-memory stand-in for the sysfs GPIO tree. Clones share state, so a
/// test can keep a handle and drive pin levels while the manager owns
/// another.
#[derive(Clone, Default)]
pub struct MockGpioBackend {
    bus: Arc<MockBus>,
}

#[derive(Default)]
struct MockBus {
    pins: Mutex<FxHashMap<u32, MockPin>>,
    journal: Mutex<Vec<MockOp>>,
    sets: Mutex<Vec<Weak<MockReadinessShared>>>,
    open_streams: AtomicUsize,
    // readiness-set calls that fail with EIO, shared by every set
    add_failures: AtomicU32,
    wait_failures: AtomicU32,
}

#[derive(Default)]
struct MockPin {
    exported: bool,
    direction: Option<Direction>,
    edge: EdgeDetect,
    level: u8,
    // attribute writes that fail with ENOENT, as right after a real export
    direction_failures: u32,
    edge_failures: u32,
}

impl MockGpioBackend {
    pub fn journal(&self) -> Vec<MockOp> {
        self.bus.journal.lock().clone()
    }

    pub fn clear_journal(&self) {
        self.bus.journal.lock().clear();
    }

    pub fn open_streams(&self) -> usize {
        self.bus.open_streams.load(Ordering::SeqCst)
    }

    pub fn edge(&self, gpio: u32) -> EdgeDetect {
        self.bus
            .pins
            .lock()
            .get(&gpio)
            .map(|p| p.edge)
            .unwrap_or_default()
    }

    pub fn direction(&self, gpio: u32) -> Option<Direction> {
        self.bus.pins.lock().get(&gpio).and_then(|p| p.direction)
    }

    pub fn fail_direction_writes(&self, gpio: u32, count: u32) {
        self.bus.pins.lock().entry(gpio).or_default().direction_failures = count;
    }

    pub fn fail_edge_writes(&self, gpio: u32, count: u32) {
        self.bus.pins.lock().entry(gpio).or_default().edge_failures = count;
    }

    pub fn fail_readiness_adds(&self, count: u32) {
        self.bus.add_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_readiness_waits(&self, count: u32) {
        self.bus.wait_failures.store(count, Ordering::SeqCst);
    }

    /// Drives the input level, notifying readiness sets when the transition
    /// matches the configured edge.
    pub fn set_level(&self, gpio: u32, level: u8) {
        let notify = {
            let mut pins = self.bus.pins.lock();
            let pin = pins.entry(gpio).or_default();
            let old = pin.level;
            pin.level = level;
            pin.exported && pin.edge.matches(old, level)
        };
        if notify {
            self.bus.notify(gpio);
        }
    }

    fn record(&self, op: MockOp) {
        self.bus.journal.lock().push(op);
    }
}

impl MockBus {
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn notify(&self, gpio: u32) {
        let mut sets = self.sets.lock();
        sets.retain(|set| set.strong_count() > 0);
        for set in sets.iter().filter_map(Weak::upgrade) {
            set.push_ready(gpio);
        }
    }
}

impl GpioBackend for MockGpioBackend {
    type Stream = MockValueStream;
    type Readiness = MockReadinessSet;

    fn is_exported(&self, gpio: u32) -> bool {
        self.bus
            .pins
            .lock()
            .get(&gpio)
            .is_some_and(|p| p.exported)
    }

    fn export(&self, gpio: u32) -> io::Result<()> {
        self.record(MockOp::Export(gpio));
        let mut pins = self.bus.pins.lock();
        let pin = pins.entry(gpio).or_default();
        if pin.exported {
            return Err(Errno::EBUSY.into());
        }
        pin.exported = true;
        pin.direction = Some(Direction::In);
        pin.edge = EdgeDetect::None;
        Ok(())
    }

    fn unexport(&self, gpio: u32) -> io::Result<()> {
        self.record(MockOp::Unexport(gpio));
        let mut pins = self.bus.pins.lock();
        match pins.get_mut(&gpio) {
            Some(pin) if pin.exported => {
                pin.exported = false;
                pin.direction = None;
                pin.edge = EdgeDetect::None;
                Ok(())
            }
            _ => Err(Errno::EINVAL.into()),
        }
    }

    fn write_direction(&self, gpio: u32, direction: Direction) -> io::Result<()> {
        self.record(MockOp::Direction(gpio, direction));
        let mut pins = self.bus.pins.lock();
        let pin = pins.entry(gpio).or_default();
        if !pin.exported {
            return Err(Errno::ENOENT.into());
        }
        if pin.direction_failures > 0 {
            pin.direction_failures -= 1;
            return Err(Errno::ENOENT.into());
        }
        pin.direction = Some(direction);
        Ok(())
    }

    fn write_edge(&self, gpio: u32, edge: EdgeDetect) -> io::Result<()> {
        self.record(MockOp::Edge(gpio, edge));
        let mut pins = self.bus.pins.lock();
        let pin = pins.entry(gpio).or_default();
        if !pin.exported {
            return Err(Errno::ENOENT.into());
        }
        if pin.edge_failures > 0 {
            pin.edge_failures -= 1;
            return Err(Errno::ENOENT.into());
        }
        pin.edge = edge;
        Ok(())
    }

    fn open_value(&self, gpio: u32) -> io::Result<MockValueStream> {
        if !self.is_exported(gpio) {
            return Err(Errno::ENOENT.into());
        }
        self.bus.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(MockValueStream {
            gpio,
            bus: Arc::clone(&self.bus),
        })
    }

    fn readiness_set(&self) -> io::Result<MockReadinessSet> {
        let shared = Arc::new(MockReadinessShared::default());
        self.bus.sets.lock().push(Arc::downgrade(&shared));
        Ok(MockReadinessSet {
            shared,
            bus: Arc::clone(&self.bus),
        })
    }
}

pub struct MockValueStream {
    gpio: u32,
    bus: Arc<MockBus>,
}

impl ValueStream for MockValueStream {
    fn read_value(&mut self) -> io::Result<u8> {
        match self.bus.pins.lock().get(&self.gpio) {
            Some(pin) if pin.exported => Ok(pin.level),
            _ => Err(Errno::ENOENT.into()),
        }
    }
}

impl Drop for MockValueStream {
    fn drop(&mut self) {
        self.bus.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockReadinessSet {
    shared: Arc<MockReadinessShared>,
    bus: Arc<MockBus>,
}

#[derive(Default)]
struct MockReadinessShared {
    state: Mutex<MockReadinessState>,
    cond: Condvar,
}

#[derive(Default)]
struct MockReadinessState {
    members: FxHashSet<u32>,
    ready: VecDeque<u32>,
    woken: bool,
}

impl MockReadinessShared {
    fn push_ready(&self, gpio: u32) {
        let mut state = self.state.lock();
        if state.members.contains(&gpio) && !state.ready.contains(&gpio) {
            state.ready.push_back(gpio);
            self.cond.notify_all();
        }
    }
}

impl ReadinessSet for MockReadinessSet {
    type Stream = MockValueStream;

    fn add(&self, gpio: u32, _stream: &MockValueStream) -> io::Result<()> {
        if MockBus::take_failure(&self.bus.add_failures) {
            return Err(Errno::EIO.into());
        }
        let mut state = self.shared.state.lock();
        if !state.members.insert(gpio) {
            return Err(Errno::EEXIST.into());
        }
        drop(state);
        // a freshly registered value file reports its level once
        self.shared.push_ready(gpio);
        Ok(())
    }

    fn remove(&self, gpio: u32, _stream: &MockValueStream) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        state.members.remove(&gpio);
        state.ready.retain(|g| *g != gpio);
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<Vec<u32>> {
        if MockBus::take_failure(&self.bus.wait_failures) {
            return Err(Errno::EIO.into());
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            if !state.ready.is_empty() || state.woken {
                state.woken = false;
                return Ok(state.ready.drain(..).collect());
            }
            match deadline {
                None => self.shared.cond.wait(&mut state),
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                        return Ok(state.ready.drain(..).collect());
                    }
                }
            }
        }
    }

    fn wake(&self) -> io::Result<()> {
        self.shared.state.lock().woken = true;
        self.shared.cond.notify_all();
        Ok(())
    }
}
