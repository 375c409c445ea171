use std::time::{Duration, Instant};

/// One-shot deadline timer.
///
/// Armed and checked with an explicit `now` so that all timer evaluation
/// happens inside dispatch calls rather than on a background thread.
#[derive(Clone, Debug)]
pub struct Timer {
    interval: Duration,
    deadline: Option<Instant>,
}

impl Timer {
    /// Creates an unarmed timer. A zero interval makes the timer inert:
    /// arming it is a no-op.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Starts the countdown from `now`.
    pub fn arm(&mut self, now: Instant) {
        if self.interval.is_zero() {
            self.deadline = None;
        } else {
            self.deadline = Some(now + self.interval);
        }
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Whether the deadline has passed. An unarmed timer never rings.
    pub fn ringing(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if now >= deadline)
    }
}
