use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::backend::{GpioBackend, ReadinessSet};
use crate::error::AppError;
use crate::registry::ChannelRegistry;

const WAIT_RETRY_DELAY: Duration = Duration::from_millis(50);
const MAX_WAIT_FAILURES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PollerState {
    Stopped,
    Running,
}

struct Supervisor {
    state: PollerState,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Background thread multiplexing every callback-watched pin over the
/// registry's shared readiness set. Started on the first subscription and
/// stopped once no pin is attached.
pub struct InterruptPoller<B: GpioBackend> {
    registry: Arc<ChannelRegistry<B>>,
    supervisor: Arc<Mutex<Supervisor>>,
}

impl<B: GpioBackend> InterruptPoller<B> {
    pub fn new(registry: Arc<ChannelRegistry<B>>) -> Self {
        Self {
            registry,
            supervisor: Arc::new(Mutex::new(Supervisor {
                state: PollerState::Stopped,
                cancel: Arc::new(AtomicBool::new(false)),
                handle: None,
            })),
        }
    }

    pub fn state(&self) -> PollerState {
        self.supervisor.lock().state
    }

    pub fn ensure_running(&self) -> Result<(), AppError> {
        let mut sup = self.supervisor.lock();
        if sup.state == PollerState::Running {
            return Ok(());
        }
        if let Some(old) = sup.handle.take() {
            // already past its last supervisor check
            let _ = old.join();
        }
        let Some(set) = self.registry.interrupt_set() else {
            return Ok(());
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let registry = Arc::clone(&self.registry);
        let supervisor = Arc::clone(&self.supervisor);
        let cancel_flag = Arc::clone(&cancel);
        let handle = thread::Builder::new()
            .name("gpio-edge-poller".into())
            .spawn(move || poll_loop(registry, supervisor, set, cancel_flag))
            .map_err(|e| AppError::Gpio(format!("spawn poller thread: {e}")))?;

        sup.state = PollerState::Running;
        sup.cancel = cancel;
        sup.handle = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        let handle = {
            let mut sup = self.supervisor.lock();
            sup.cancel.store(true, Ordering::Release);
            sup.state = PollerState::Stopped;
            sup.handle.take()
        };
        if let Some(set) = self.registry.interrupt_set()
            && let Err(e) = set.wake()
        {
            warn!("wake poller failed: {e}");
        }
        if let Some(handle) = handle {
            // a callback stopping its own poller cannot join itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl<B: GpioBackend> Drop for InterruptPoller<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop<B: GpioBackend>(
    registry: Arc<ChannelRegistry<B>>,
    supervisor: Arc<Mutex<Supervisor>>,
    set: Arc<B::Readiness>,
    cancel: Arc<AtomicBool>,
) {
    debug!("edge poller started");
    let mut failures = 0;
    loop {
        if cancel.load(Ordering::Acquire) {
            break;
        }

        let ready = match set.wait(None) {
            Ok(ready) => {
                failures = 0;
                ready
            }
            Err(e) => {
                failures += 1;
                warn!("edge poller wait failed ({failures}/{MAX_WAIT_FAILURES}): {e}");
                if failures >= MAX_WAIT_FAILURES {
                    // the next subscription starts a fresh poller
                    supervisor.lock().state = PollerState::Stopped;
                    error!("edge poller giving up after {failures} failed waits");
                    break;
                }
                thread::sleep(WAIT_RETRY_DELAY);
                continue;
            }
        };

        let observed_at = registry.kernel().clock().now();
        for gpio in ready {
            let Some(dispatch) = registry.dispatch_interrupt(gpio, observed_at) else {
                continue;
            };
            if catch_unwind(AssertUnwindSafe(|| dispatch.invoke())).is_err() {
                warn!("callback for gpio {} panicked", dispatch.gpio);
            }
        }

        let mut sup = supervisor.lock();
        if cancel.load(Ordering::Acquire) {
            break;
        }
        if registry.interrupt_count() == 0 {
            sup.state = PollerState::Stopped;
            break;
        }
    }
    debug!("edge poller stopped");
}
