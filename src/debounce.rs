use std::time::{Duration, Instant};

/// Per-pin bounce guard. Raw notifications inside the window after an
/// accepted one collapse into it.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Option<Duration>,
    last_accepted_at: Option<Instant>,
    first_event_pending: bool,
}

impl Debouncer {
    pub fn new(window: Option<Duration>) -> Self {
        Self {
            window,
            last_accepted_at: None,
            first_event_pending: true,
        }
    }

    pub fn window(&self) -> Option<Duration> {
        self.window
    }

    pub fn last_accepted_at(&self) -> Option<Instant> {
        self.last_accepted_at
    }

    pub fn first_event_pending(&self) -> bool {
        self.first_event_pending
    }

    /// Swaps in a new window and forgets prior timing. The next notification
    /// reports the level at re-registration, not a transition.
    pub fn reconfigure(&mut self, window: Option<Duration>) {
        self.window = window;
        self.last_accepted_at = None;
        self.first_event_pending = true;
    }

    pub fn accept(&mut self, observed_at: Instant) -> bool {
        if self.first_event_pending {
            self.first_event_pending = false;
            // the registration notification opens the first window
            self.last_accepted_at = Some(observed_at);
            return false;
        }

        let accepted = match (self.window, self.last_accepted_at) {
            (None, _) | (_, None) => true,
            (Some(window), Some(last)) => match observed_at.checked_duration_since(last) {
                // clock moved backward
                None => true,
                Some(elapsed) => elapsed >= window,
            },
        };
        if accepted {
            self.last_accepted_at = Some(observed_at);
        }
        accepted
    }
}
