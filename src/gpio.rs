use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::backend::GpioBackend;
use crate::config::{AppConfig, Direction, EdgeDetect, Pull};
use crate::error::AppError;
use crate::kernel::Kernel;
use crate::pins::{BoardRevision, NumberingMode, PinResolver};
use crate::poller::{InterruptPoller, PollerState};
use crate::registry::{CallbackEntry, ChannelRegistry, ChannelSnapshot, Subscription};
use crate::retry::{Clock, SystemClock};
use crate::wait;

/// Fans accepted edges out to websocket subscribers and keeps a bounded
/// per-channel history.
pub struct EventCallbackHandler {
    event_tx: broadcast::Sender<EdgeEvent>,
    event_history: RwLock<FxHashMap<u32, VecDeque<EdgeEvent>>>,
    event_history_capacity: usize,
}

impl EventCallbackHandler {
    pub fn new(event_tx: broadcast::Sender<EdgeEvent>, event_history_capacity: usize) -> Self {
        Self {
            event_tx,
            event_history: RwLock::new(FxHashMap::default()),
            event_history_capacity,
        }
    }

    pub fn dispatch(&self, event: EdgeEvent) {
        {
            let mut history = self.event_history.write();
            let history = history.entry(event.channel).or_default();
            while history.len() >= self.event_history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // no receivers is fine
        let _ = self.event_tx.send(event);
    }

    fn forget(&self, channel: u32) {
        self.event_history.write().remove(&channel);
    }
}

pub type EventHandler = Arc<EventCallbackHandler>;

#[derive(Debug, Clone, Serialize)]
pub struct EdgeEvent {
    pub channel: u32,
    pub gpio: u32,
    pub edge: EdgeDetect,
    pub value: u8,
    pub timestamp_ms: u64,
}

/// Entry points of the edge-detection subsystem: numbering, pin setup,
/// callback watches, blocking waits and teardown.
pub struct GpioManager<B: GpioBackend> {
    config: Arc<AppConfig>,
    kernel: Arc<Kernel<B>>,
    resolver: RwLock<PinResolver>,
    directions: RwLock<FxHashMap<u32, Direction>>,
    registry: Arc<ChannelRegistry<B>>,
    poller: InterruptPoller<B>,
    event_handler: EventHandler,
}

impl<B: GpioBackend> GpioManager<B> {
    pub fn new(config: Arc<AppConfig>, backend: Arc<B>) -> Result<Self, AppError> {
        Self::with_clock(config, backend, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: Arc<AppConfig>,
        backend: Arc<B>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        let revision = config.board_revision.unwrap_or_else(BoardRevision::detect);
        let mut resolver = PinResolver::new(revision);
        if config.numbering != NumberingMode::Unset {
            resolver.set_mode(config.numbering)?;
        }

        let kernel = Arc::new(Kernel::new(backend, config.retry, clock));
        let registry = Arc::new(ChannelRegistry::new(Arc::clone(&kernel)));
        let poller = InterruptPoller::new(Arc::clone(&registry));

        let (event_tx, _) = broadcast::channel(config.broadcast_capacity);
        let event_handler = Arc::new(EventCallbackHandler::new(
            event_tx,
            config.event_history_capacity,
        ));

        Ok(Self {
            config,
            kernel,
            resolver: RwLock::new(resolver),
            directions: RwLock::new(FxHashMap::default()),
            registry,
            poller,
            event_handler,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn numbering(&self) -> NumberingMode {
        self.resolver.read().mode()
    }

    pub fn board_revision(&self) -> BoardRevision {
        self.resolver.read().revision()
    }

    pub fn set_numbering(&self, mode: NumberingMode) -> Result<(), AppError> {
        let mut resolver = self.resolver.write();
        let current = resolver.mode();
        if current != NumberingMode::Unset && current != mode {
            return Err(AppError::InvalidState(format!(
                "numbering mode already set to {current:?}"
            )));
        }
        resolver.set_mode(mode)
    }

    pub fn resolve(&self, channel: u32) -> Result<u32, AppError> {
        self.resolver.read().resolve(channel)
    }

    pub fn direction(&self, channel: u32) -> Result<Option<Direction>, AppError> {
        let gpio = self.resolve(channel)?;
        Ok(self.directions.read().get(&gpio).copied())
    }

    pub fn setup(&self, channel: u32, direction: Direction, pull: Pull) -> Result<(), AppError> {
        let gpio = self.resolve(channel)?;

        if direction == Direction::Out {
            if pull != Pull::Off {
                return Err(AppError::InvalidValue(
                    "pull up/down is only valid on inputs".into(),
                ));
            }
            if self.registry.contains(gpio) {
                return Err(AppError::InvalidState(format!(
                    "edge detection active on channel {channel}, stop watching first"
                )));
            }
        }

        self.kernel.configure(gpio, direction)?;
        if pull != Pull::Off {
            warn!("sysfs cannot set pull {pull:?} on gpio {gpio}, configure it externally");
        }
        self.directions.write().insert(gpio, direction);
        info!("channel {channel} (gpio {gpio}) set up as {direction}");
        Ok(())
    }

    fn require_input(&self, channel: u32) -> Result<u32, AppError> {
        let gpio = self.resolve(channel)?;
        match self.directions.read().get(&gpio) {
            Some(Direction::In) => Ok(gpio),
            _ => Err(AppError::NotConfigured(channel)),
        }
    }

    fn validate_edge(edge: EdgeDetect) -> Result<(), AppError> {
        if edge == EdgeDetect::None {
            return Err(AppError::InvalidValue(
                "edge must be rising, falling or both".into(),
            ));
        }
        Ok(())
    }

    fn validate_debounce(debounce: Option<Duration>) -> Result<(), AppError> {
        if debounce.is_some_and(|d| d.is_zero()) {
            return Err(AppError::InvalidValue(
                "debounce window must be positive".into(),
            ));
        }
        Ok(())
    }

    fn subscribe(
        &self,
        channel: u32,
        edge: EdgeDetect,
        debounce: Option<Duration>,
        callback: Option<CallbackEntry>,
    ) -> Result<(), AppError> {
        let gpio = self.require_input(channel)?;
        Self::validate_edge(edge)?;
        Self::validate_debounce(debounce)?;

        let acquired = self.registry.acquire(
            gpio,
            channel,
            edge,
            debounce,
            Subscription::Interrupt { callback },
        )?;
        if let Err(e) = self.poller.ensure_running() {
            if acquired.was_new {
                self.registry.release(gpio);
            }
            return Err(e);
        }
        debug!("channel {channel} (gpio {gpio}) watching {edge} edges");
        Ok(())
    }

    /// Registers `callback` for debounced edges on an input channel. It
    /// runs on the poller thread with `(channel, value)`.
    pub fn watch<F>(
        &self,
        channel: u32,
        edge: EdgeDetect,
        debounce: Option<Duration>,
        callback: F,
    ) -> Result<(), AppError>
    where
        F: Fn(u32, u8) + Send + Sync + 'static,
    {
        self.subscribe(
            channel,
            edge,
            debounce,
            Some(CallbackEntry::new(channel, callback)),
        )
    }

    /// Watches `channel` and publishes every accepted edge to the event
    /// stream and history.
    pub fn watch_events(
        &self,
        channel: u32,
        edge: EdgeDetect,
        debounce: Option<Duration>,
    ) -> Result<(), AppError> {
        let gpio = self.resolve(channel)?;
        let handler = Arc::clone(&self.event_handler);
        self.watch(channel, edge, debounce, move |channel, value| {
            handler.dispatch(EdgeEvent {
                channel,
                gpio,
                edge: if value == 1 {
                    EdgeDetect::Rising
                } else {
                    EdgeDetect::Falling
                },
                value,
                timestamp_ms: epoch_millis(),
            });
        })
    }

    /// Enables edge detection without a callback; poll it with
    /// [`GpioManager::event_detected`].
    pub fn add_event_detect(
        &self,
        channel: u32,
        edge: EdgeDetect,
        debounce: Option<Duration>,
    ) -> Result<(), AppError> {
        self.subscribe(channel, edge, debounce, None)
    }

    /// Whether an edge was accepted since the last call.
    pub fn event_detected(&self, channel: u32) -> Result<bool, AppError> {
        let gpio = self.resolve(channel)?;
        Ok(self.registry.take_event(gpio))
    }

    pub fn stop_watching(&self, channel: u32) -> Result<(), AppError> {
        let gpio = self.require_input(channel)?;
        if self.registry.release(gpio) {
            debug!("channel {channel} (gpio {gpio}) no longer watched");
        }
        Ok(())
    }

    pub fn wait_for_edge(
        &self,
        channel: u32,
        edge: EdgeDetect,
        debounce: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<Option<u8>, AppError> {
        let gpio = self.require_input(channel)?;
        Self::validate_edge(edge)?;
        Self::validate_debounce(debounce)?;
        wait::wait_for_edge(&self.registry, gpio, channel, edge, debounce, timeout)
    }

    pub fn callback_exists(&self, gpio: u32) -> bool {
        self.registry.callback_exists(gpio)
    }

    pub fn channel_state(&self, channel: u32) -> Result<Option<ChannelSnapshot>, AppError> {
        let gpio = self.resolve(channel)?;
        Ok(self.registry.snapshot(gpio))
    }

    pub fn channels(&self) -> Vec<ChannelSnapshot> {
        self.registry.snapshots()
    }

    pub fn poller_state(&self) -> PollerState {
        self.poller.state()
    }

    /// Releases all edge-detection state. Returns how many pins were
    /// released.
    pub fn reset_all(&self) -> usize {
        self.poller.stop();
        self.registry.reset_all()
    }

    /// Releases edge detection and the setup of one channel, or of every
    /// channel when `None`.
    pub fn cleanup(&self, channel: Option<u32>) -> Result<(), AppError> {
        let found = match channel {
            Some(channel) => {
                let gpio = self.resolve(channel)?;
                let released = self.registry.release(gpio);
                self.event_handler.forget(channel);
                let was_setup = self.directions.write().remove(&gpio).is_some();
                if was_setup {
                    self.unexport_if_exported(gpio);
                }
                released || was_setup
            }
            None => self.cleanup_all() > 0,
        };
        if !found {
            warn!("no channels have been set up, nothing to clean up");
        }
        Ok(())
    }

    fn cleanup_all(&self) -> usize {
        let released = self.reset_all();
        let gpios: Vec<u32> = self.directions.write().drain().map(|(gpio, _)| gpio).collect();
        for gpio in &gpios {
            self.unexport_if_exported(*gpio);
        }
        released + gpios.len()
    }

    fn unexport_if_exported(&self, gpio: u32) {
        if self.kernel.backend().is_exported(gpio) {
            self.kernel.unexport(gpio);
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EdgeEvent> {
        self.event_handler.event_tx.subscribe()
    }

    pub fn get_events(&self, channel: u32, limit: Option<usize>) -> Result<Vec<EdgeEvent>, AppError> {
        self.resolve(channel)?;
        let history = self.event_handler.event_history.read();

        Ok(history
            .get(&channel)
            .map(|d| {
                let events: Vec<EdgeEvent> = if let Some(lim) = limit {
                    d.iter().rev().take(lim).cloned().collect()
                } else {
                    d.iter().rev().cloned().collect()
                };
                events.into_iter().rev().collect()
            })
            .unwrap_or_default())
    }

    pub fn get_last_event(&self, channel: u32) -> Result<Option<EdgeEvent>, AppError> {
        self.resolve(channel)?;
        let history = self.event_handler.event_history.read();

        Ok(history.get(&channel).and_then(|d| d.back().cloned()))
    }
}

impl<B: GpioBackend> Drop for GpioManager<B> {
    fn drop(&mut self) {
        let released = self.cleanup_all();
        if released > 0 {
            debug!("released {released} pins on shutdown");
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
