use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::backend::{GpioBackend, ReadinessSet, ValueStream};
use crate::config::{Direction, EdgeDetect};
use crate::debounce::Debouncer;
use crate::error::AppError;
use crate::kernel::Kernel;

/// Invoked on the poller thread with `(channel, value)`. Must return
/// quickly: a slow callback delays delivery for every other pin.
pub type EdgeCallback = Arc<dyn Fn(u32, u8) + Send + Sync>;

#[derive(Clone)]
pub struct CallbackEntry {
    pub channel: u32,
    pub handler: EdgeCallback,
}

impl CallbackEntry {
    pub fn new<F>(channel: u32, handler: F) -> Self
    where
        F: Fn(u32, u8) + Send + Sync + 'static,
    {
        Self {
            channel,
            handler: Arc::new(handler),
        }
    }
}

/// Which readiness set a new or reused record joins.
pub enum Subscription<R> {
    Interrupt { callback: Option<CallbackEntry> },
    Blocking(Arc<R>),
}

enum Attachment<R> {
    Detached,
    Interrupt,
    Blocking(Arc<R>),
}

impl<R> Attachment<R> {
    fn name(&self) -> &'static str {
        match self {
            Attachment::Detached => "detached",
            Attachment::Interrupt => "interrupt",
            Attachment::Blocking(_) => "blocking",
        }
    }
}

pub struct ChannelState<B: GpioBackend> {
    gpio: u32,
    channel: u32,
    exported: bool,
    stream: B::Stream,
    edge: EdgeDetect,
    debounce: Debouncer,
    attachment: Attachment<B::Readiness>,
    callback: Option<CallbackEntry>,
    event_occurred: bool,
}

impl<B: GpioBackend> ChannelState<B> {
    fn new(
        gpio: u32,
        channel: u32,
        exported: bool,
        stream: B::Stream,
        edge: EdgeDetect,
        debounce: Option<Duration>,
    ) -> Self {
        Self {
            gpio,
            channel,
            exported,
            stream,
            edge,
            debounce: Debouncer::new(debounce),
            attachment: Attachment::Detached,
            callback: None,
            event_occurred: false,
        }
    }

    fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            gpio: self.gpio,
            channel: self.channel,
            exported: self.exported,
            edge: self.edge,
            debounce_ms: self.debounce.window().map(|d| d.as_millis() as u64),
            attachment: self.attachment.name(),
            callback: self.callback.is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub gpio: u32,
    pub channel: u32,
    /// Whether creating this record performed the kernel export.
    pub exported: bool,
    pub edge: EdgeDetect,
    pub debounce_ms: Option<u64>,
    pub attachment: &'static str,
    pub callback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    pub was_new: bool,
}

/// An accepted interrupt, ready to hand to the callback outside the lock.
pub struct Dispatch {
    pub gpio: u32,
    pub value: u8,
    pub callback: Option<CallbackEntry>,
}

impl Dispatch {
    pub fn invoke(&self) {
        if let Some(cb) = &self.callback {
            (cb.handler)(cb.channel, self.value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingPoll {
    Accepted(u8),
    Rejected,
    /// The record was released or handed elsewhere while waiting.
    Gone,
}

struct RegistryInner<B: GpioBackend> {
    channels: FxHashMap<u32, ChannelState<B>>,
    // gpios with a lifecycle transition doing kernel I/O outside the lock
    busy: FxHashSet<u32>,
    interrupt_set: Option<Arc<B::Readiness>>,
}

/// Process-wide edge-detection state keyed by GPIO number, including the
/// callback slot of each pin. Every lookup-then-mutate runs under one lock.
pub struct ChannelRegistry<B: GpioBackend> {
    kernel: Arc<Kernel<B>>,
    inner: Mutex<RegistryInner<B>>,
    idle: Condvar,
}

impl<B: GpioBackend> ChannelRegistry<B> {
    pub fn new(kernel: Arc<Kernel<B>>) -> Self {
        Self {
            kernel,
            inner: Mutex::new(RegistryInner {
                channels: FxHashMap::default(),
                busy: FxHashSet::default(),
                interrupt_set: None,
            }),
            idle: Condvar::new(),
        }
    }

    pub fn kernel(&self) -> &Kernel<B> {
        &self.kernel
    }

    /// Locks the registry once no transition is in flight for `gpio`.
    fn lock_idle(&self, gpio: u32) -> MutexGuard<'_, RegistryInner<B>> {
        let mut inner = self.inner.lock();
        while inner.busy.contains(&gpio) {
            self.idle.wait(&mut inner);
        }
        inner
    }

    fn finish_busy(&self, inner: &mut RegistryInner<B>, gpio: u32) {
        inner.busy.remove(&gpio);
        self.idle.notify_all();
    }

    fn check_conflict(
        state: &ChannelState<B>,
        subscription: &Subscription<B::Readiness>,
        edge: EdgeDetect,
        debounce: Option<Duration>,
    ) -> Result<(), AppError> {
        let gpio = state.gpio;
        match (&state.attachment, subscription) {
            (Attachment::Blocking(_), _) => {
                return Err(AppError::ConflictingEdgeDetection(gpio));
            }
            (Attachment::Interrupt, Subscription::Blocking(_)) => {
                return Err(AppError::ConflictingEdgeDetection(gpio));
            }
            (Attachment::Interrupt, Subscription::Interrupt { callback }) => {
                if state.callback.is_some() {
                    return Err(if callback.is_some() {
                        AppError::DuplicateCallback(gpio)
                    } else {
                        AppError::ConflictingEdgeDetection(gpio)
                    });
                }
            }
            (Attachment::Detached, _) => {}
        }
        if state.edge == edge && state.debounce.window() != debounce {
            return Err(AppError::ConflictingEdgeDetection(gpio));
        }
        Ok(())
    }

    /// Finds or creates the edge-detection record for `gpio` and attaches
    /// it to the readiness set named by `subscription`.
    pub fn acquire(
        &self,
        gpio: u32,
        channel: u32,
        edge: EdgeDetect,
        debounce: Option<Duration>,
        subscription: Subscription<B::Readiness>,
    ) -> Result<Acquired, AppError> {
        if edge == EdgeDetect::None {
            return Err(AppError::InvalidValue(
                "edge must be rising, falling or both".into(),
            ));
        }

        let mut inner = self.lock_idle(gpio);

        let existing_edge = match inner.channels.get(&gpio) {
            Some(state) => {
                Self::check_conflict(state, &subscription, edge, debounce)?;
                Some(state.edge)
            }
            None => None,
        };

        let was_new = match existing_edge {
            Some(current) => {
                if current != edge {
                    inner.busy.insert(gpio);
                    let result =
                        MutexGuard::unlocked(&mut inner, || self.kernel.set_edge(gpio, edge));
                    self.finish_busy(&mut inner, gpio);
                    result?;

                    let RegistryInner {
                        channels,
                        interrupt_set,
                        ..
                    } = &mut *inner;
                    if let Some(state) = channels.get_mut(&gpio) {
                        debug!("gpio {gpio} edge {current} -> {edge}");
                        state.edge = edge;
                        state.debounce.reconfigure(debounce);
                        // the re-armed filter consumes the registration notification
                        if matches!(state.attachment, Attachment::Interrupt)
                            && let Some(set) = interrupt_set.as_ref()
                        {
                            let registered = set
                                .remove(gpio, &state.stream)
                                .and_then(|()| set.add(gpio, &state.stream));
                            if let Err(e) = registered {
                                // membership is unknown now, a later watch re-adds it
                                let _ = set.remove(gpio, &state.stream);
                                state.attachment = Attachment::Detached;
                                return Err(AppError::Gpio(format!(
                                    "re-register gpio {gpio}: {e}"
                                )));
                            }
                        }
                    }
                }
                false
            }
            None => {
                inner.busy.insert(gpio);
                let created = MutexGuard::unlocked(&mut inner, || self.create(gpio, edge));
                self.finish_busy(&mut inner, gpio);
                let (stream, exported) = created?;

                inner.channels.insert(
                    gpio,
                    ChannelState::new(gpio, channel, exported, stream, edge, debounce),
                );
                debug!("gpio {gpio} tracked for {edge} edges");
                true
            }
        };

        if let Err(e) = self.attach(&mut inner, gpio, subscription) {
            if was_new {
                self.release_locked(inner, gpio);
            }
            return Err(e);
        }
        Ok(Acquired { was_new })
    }

    fn create(&self, gpio: u32, edge: EdgeDetect) -> Result<(B::Stream, bool), AppError> {
        let exported = self.kernel.export(gpio)?;
        let configured = self
            .kernel
            .set_direction(gpio, Direction::In)
            .and_then(|()| self.kernel.open_value_stream(gpio))
            .and_then(|stream| self.kernel.set_edge(gpio, edge).map(|()| stream));

        match configured {
            Ok(stream) => Ok((stream, exported)),
            Err(e) => {
                if exported {
                    self.kernel.unexport(gpio);
                }
                Err(e)
            }
        }
    }

    fn attach(
        &self,
        inner: &mut RegistryInner<B>,
        gpio: u32,
        subscription: Subscription<B::Readiness>,
    ) -> Result<(), AppError> {
        if inner.interrupt_set.is_none() && matches!(subscription, Subscription::Interrupt { .. }) {
            inner.interrupt_set = Some(Arc::new(self.kernel.readiness_set()?));
        }

        let RegistryInner {
            channels,
            interrupt_set,
            ..
        } = inner;
        let state = channels
            .get_mut(&gpio)
            .ok_or_else(|| AppError::Gpio(format!("gpio {gpio} released during setup")))?;
        let add_err = |e: std::io::Error| AppError::Gpio(format!("watch gpio {gpio}: {e}"));

        match subscription {
            Subscription::Interrupt { callback } => {
                if !matches!(state.attachment, Attachment::Interrupt) {
                    if let Some(set) = interrupt_set {
                        set.add(gpio, &state.stream).map_err(add_err)?;
                    }
                    state.attachment = Attachment::Interrupt;
                }
                if callback.is_some() {
                    state.callback = callback;
                }
            }
            Subscription::Blocking(set) => {
                set.add(gpio, &state.stream).map_err(add_err)?;
                state.attachment = Attachment::Blocking(set);
            }
        }
        Ok(())
    }

    fn detach(interrupt_set: Option<&Arc<B::Readiness>>, state: &mut ChannelState<B>) {
        let set = match &state.attachment {
            Attachment::Detached => return,
            Attachment::Interrupt => match interrupt_set {
                Some(set) => Arc::clone(set),
                None => return,
            },
            Attachment::Blocking(set) => Arc::clone(set),
        };
        if let Err(e) = set.remove(state.gpio, &state.stream) {
            warn!("detach gpio {} failed: {e}", state.gpio);
        }
        if let Err(e) = set.wake() {
            warn!("wake readiness set for gpio {} failed: {e}", state.gpio);
        }
        state.attachment = Attachment::Detached;
    }

    /// Detaches, disables edges, closes the stream and unexports. No-op for
    /// an untracked pin. Returns whether a record was removed.
    pub fn release(&self, gpio: u32) -> bool {
        let inner = self.lock_idle(gpio);
        self.release_locked(inner, gpio)
    }

    fn release_locked(&self, mut inner: MutexGuard<'_, RegistryInner<B>>, gpio: u32) -> bool {
        let Some(mut state) = inner.channels.remove(&gpio) else {
            return false;
        };
        Self::detach(inner.interrupt_set.as_ref(), &mut state);

        inner.busy.insert(gpio);
        MutexGuard::unlocked(&mut inner, || self.teardown(state));
        self.finish_busy(&mut inner, gpio);
        true
    }

    fn teardown(&self, state: ChannelState<B>) {
        let gpio = state.gpio;
        if let Err(e) = self.kernel.set_edge(gpio, EdgeDetect::None) {
            warn!("{e}");
        }
        drop(state);
        self.kernel.unexport(gpio);
        debug!("gpio {gpio} released");
    }

    /// Releases every tracked pin, returning how many were released.
    pub fn reset_all(&self) -> usize {
        let gpios: Vec<u32> = self.inner.lock().channels.keys().copied().collect();
        gpios.into_iter().filter(|gpio| self.release(*gpio)).count()
    }

    pub fn interrupt_set(&self) -> Option<Arc<B::Readiness>> {
        self.inner.lock().interrupt_set.clone()
    }

    pub fn interrupt_count(&self) -> usize {
        self.inner
            .lock()
            .channels
            .values()
            .filter(|s| matches!(s.attachment, Attachment::Interrupt))
            .count()
    }

    /// Re-reads a pin reported ready by the poller. Returns nothing when the
    /// pin is no longer watched or the debounce filter rejects it.
    pub fn dispatch_interrupt(&self, gpio: u32, observed_at: Instant) -> Option<Dispatch> {
        let mut inner = self.inner.lock();
        let state = inner.channels.get_mut(&gpio)?;
        if !matches!(state.attachment, Attachment::Interrupt) {
            return None;
        }
        let value = match state.stream.read_value() {
            Ok(v) => v,
            Err(e) => {
                warn!("read gpio {gpio} value failed: {e}");
                return None;
            }
        };
        if !state.debounce.accept(observed_at) {
            return None;
        }
        state.event_occurred = true;
        Some(Dispatch {
            gpio,
            value,
            callback: state.callback.clone(),
        })
    }

    pub fn poll_blocking(
        &self,
        gpio: u32,
        set: &Arc<B::Readiness>,
        observed_at: Instant,
    ) -> Result<BlockingPoll, AppError> {
        let mut inner = self.inner.lock();
        let Some(state) = inner.channels.get_mut(&gpio) else {
            return Ok(BlockingPoll::Gone);
        };
        if !matches!(&state.attachment, Attachment::Blocking(own) if Arc::ptr_eq(own, set)) {
            return Ok(BlockingPoll::Gone);
        }
        let value = state
            .stream
            .read_value()
            .map_err(|e| AppError::Gpio(format!("read gpio {gpio} value: {e}")))?;
        Ok(if state.debounce.accept(observed_at) {
            BlockingPoll::Accepted(value)
        } else {
            BlockingPoll::Rejected
        })
    }

    /// Undoes a blocking subscription: detaches from `set`, and releases the
    /// pin entirely when the wait created it.
    pub fn finish_blocking(&self, gpio: u32, set: &Arc<B::Readiness>, was_new: bool) {
        let mut inner = self.lock_idle(gpio);
        let ours = inner.channels.get(&gpio).is_some_and(|s| {
            matches!(&s.attachment, Attachment::Blocking(own) if Arc::ptr_eq(own, set))
        });
        if !ours {
            return;
        }
        if was_new {
            self.release_locked(inner, gpio);
        } else if let Some(state) = inner.channels.get_mut(&gpio) {
            Self::detach(None, state);
        }
    }

    /// Returns and clears the event flag set by the poller.
    pub fn take_event(&self, gpio: u32) -> bool {
        self.inner
            .lock()
            .channels
            .get_mut(&gpio)
            .is_some_and(|s| std::mem::take(&mut s.event_occurred))
    }

    pub fn callback_exists(&self, gpio: u32) -> bool {
        self.inner
            .lock()
            .channels
            .get(&gpio)
            .is_some_and(|s| s.callback.is_some())
    }

    pub fn is_interrupt_attached(&self, gpio: u32) -> bool {
        self.inner
            .lock()
            .channels
            .get(&gpio)
            .is_some_and(|s| matches!(s.attachment, Attachment::Interrupt))
    }

    pub fn is_blocking_attached(&self, gpio: u32, set: &Arc<B::Readiness>) -> bool {
        self.inner.lock().channels.get(&gpio).is_some_and(|s| {
            matches!(&s.attachment, Attachment::Blocking(own) if Arc::ptr_eq(own, set))
        })
    }

    pub fn contains(&self, gpio: u32) -> bool {
        self.inner.lock().channels.contains_key(&gpio)
    }

    pub fn snapshot(&self, gpio: u32) -> Option<ChannelSnapshot> {
        self.inner.lock().channels.get(&gpio).map(ChannelState::snapshot)
    }

    pub fn snapshots(&self) -> Vec<ChannelSnapshot> {
        let mut all: Vec<_> = self
            .inner
            .lock()
            .channels
            .values()
            .map(ChannelState::snapshot)
            .collect();
        all.sort_by_key(|s| s.gpio);
        all
    }
}
