use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::backend::{GpioBackend, ReadinessSet};
use crate::config::EdgeDetect;
use crate::error::AppError;
use crate::registry::{BlockingPoll, ChannelRegistry, Subscription};

/// Undoes the blocking subscription on every way out of the wait,
/// unwinding included.
struct WaitGuard<'a, B: GpioBackend> {
    registry: &'a ChannelRegistry<B>,
    gpio: u32,
    set: Arc<B::Readiness>,
    was_new: bool,
}

impl<B: GpioBackend> Drop for WaitGuard<'_, B> {
    fn drop(&mut self) {
        self.registry
            .finish_blocking(self.gpio, &self.set, self.was_new);
    }
}

/// Blocks until the first debounced edge on `gpio` and returns the value
/// read after it. `None` as timeout waits forever, a zero timeout polls
/// once. Returns `Ok(None)` on timeout or when the pin is released by
/// another caller mid-wait.
pub fn wait_for_edge<B: GpioBackend>(
    registry: &ChannelRegistry<B>,
    gpio: u32,
    channel: u32,
    edge: EdgeDetect,
    debounce: Option<Duration>,
    timeout: Option<Duration>,
) -> Result<Option<u8>, AppError> {
    if registry.is_interrupt_attached(gpio) {
        return Err(AppError::ConflictingEdgeDetection(gpio));
    }

    let set = Arc::new(registry.kernel().readiness_set()?);
    let acquired = registry.acquire(
        gpio,
        channel,
        edge,
        debounce,
        Subscription::Blocking(Arc::clone(&set)),
    )?;
    let _guard = WaitGuard {
        registry,
        gpio,
        set: Arc::clone(&set),
        was_new: acquired.was_new,
    };

    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let ready = set
            .wait(remaining)
            .map_err(|e| AppError::Gpio(format!("wait for edge on gpio {gpio}: {e}")))?;
        let observed_at = registry.kernel().clock().now();

        if ready.contains(&gpio) {
            match registry.poll_blocking(gpio, &set, observed_at)? {
                BlockingPoll::Accepted(value) => return Ok(Some(value)),
                BlockingPoll::Rejected => {}
                BlockingPoll::Gone => return Ok(None),
            }
        } else if !registry.is_blocking_attached(gpio, &set) {
            debug!("gpio {gpio} released while waiting");
            return Ok(None);
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(None);
        }
    }
}
