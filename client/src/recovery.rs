use std::collections::VecDeque;
use std::time::{Duration, Instant};

use feedwatch_shared::{ReconnectLimit, Timer, WatchlistConfig};

use crate::handle::StreamHandle;

/// What the controller decided after a channel loss or failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReconnectDecision {
    /// Another attempt is scheduled after the given delay.
    Schedule(Duration),
    /// The attempt limit is exhausted (or reconnection is disabled); every
    /// recovering stream must be closed.
    GiveUp,
}

/// Replay queue built when the channel drops: item streams in original
/// submission order. Login and directory are replayed by the session
/// manager before the job is drained.
pub(crate) struct RecoveryJob {
    pub replay: VecDeque<StreamHandle>,
}

/// Drives reconnection backoff and carries the replay job across the
/// channel outage.
///
/// Delay starts at the configured minimum, doubles per failed attempt and
/// is clamped to the configured maximum. All timing is evaluated inside
/// dispatch; nothing here runs on its own.
pub(crate) struct RecoveryController {
    limit: ReconnectLimit,
    min_delay: Duration,
    max_delay: Duration,
    attempts: u32,
    next_delay: Duration,
    timer: Timer,
    job: Option<RecoveryJob>,
}

impl RecoveryController {
    pub fn new(config: &WatchlistConfig) -> Self {
        Self {
            limit: config.reconnect_attempt_limit,
            min_delay: config.reconnect_min_delay,
            max_delay: config.reconnect_max_delay,
            attempts: 0,
            next_delay: config.reconnect_min_delay,
            timer: Timer::new(config.reconnect_min_delay),
            job: None,
        }
    }

    pub fn has_job(&self) -> bool {
        self.job.is_some()
    }

    pub fn take_job(&mut self) -> Option<RecoveryJob> {
        self.job.take()
    }

    /// Channel lost while up: stores the replay queue and schedules the
    /// first reconnection attempt.
    pub fn begin(&mut self, replay: VecDeque<StreamHandle>, now: Instant) -> ReconnectDecision {
        self.attempts = 0;
        self.next_delay = self.min_delay;
        if !self.limit.allows(0) {
            self.job = None;
            return ReconnectDecision::GiveUp;
        }
        self.job = Some(RecoveryJob { replay });
        self.schedule(now)
    }

    /// A connection attempt failed; backs off further or gives up.
    pub fn connection_failed(&mut self, now: Instant) -> ReconnectDecision {
        if !self.limit.allows(self.attempts) {
            self.job = None;
            self.timer.disarm();
            return ReconnectDecision::GiveUp;
        }
        self.next_delay = (self.next_delay * 2).min(self.max_delay);
        self.schedule(now)
    }

    fn schedule(&mut self, now: Instant) -> ReconnectDecision {
        self.timer.set_interval(self.next_delay);
        self.timer.arm(now);
        ReconnectDecision::Schedule(self.next_delay)
    }

    /// Whether the backoff delay has elapsed and a connect should be
    /// attempted now. Consumes the deadline and counts the attempt.
    pub fn ready_to_connect(&mut self, now: Instant) -> bool {
        if self.timer.ringing(now) {
            self.timer.disarm();
            self.attempts += 1;
            true
        } else {
            false
        }
    }

    /// The channel came up; backoff state rewinds. The job stays until the
    /// replay actually runs.
    pub fn connected(&mut self) {
        self.attempts = 0;
        self.next_delay = self.min_delay;
        self.timer.disarm();
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod recovery_controller_tests {
    use super::*;

    fn controller(limit: ReconnectLimit) -> RecoveryController {
        RecoveryController::new(&WatchlistConfig {
            reconnect_attempt_limit: limit,
            reconnect_min_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_millis(350),
            ..WatchlistConfig::default()
        })
    }

    #[test]
    fn disabled_reconnection_gives_up_immediately() {
        let mut controller = controller(ReconnectLimit::Limit(0));
        let now = Instant::now();

        let decision = controller.begin(VecDeque::new(), now);

        assert_eq!(decision, ReconnectDecision::GiveUp);
        assert!(!controller.has_job());
    }

    #[test]
    fn delay_doubles_and_clamps() {
        let mut controller = controller(ReconnectLimit::Unlimited);
        let now = Instant::now();

        assert_eq!(
            controller.begin(VecDeque::new(), now),
            ReconnectDecision::Schedule(Duration::from_millis(100))
        );
        assert_eq!(
            controller.connection_failed(now),
            ReconnectDecision::Schedule(Duration::from_millis(200))
        );
        assert_eq!(
            controller.connection_failed(now),
            ReconnectDecision::Schedule(Duration::from_millis(350))
        );
        assert_eq!(
            controller.connection_failed(now),
            ReconnectDecision::Schedule(Duration::from_millis(350))
        );
    }

    #[test]
    fn attempt_limit_is_enforced() {
        let mut controller = controller(ReconnectLimit::Limit(2));
        let now = Instant::now();

        controller.begin(VecDeque::new(), now);
        assert!(controller.ready_to_connect(now + Duration::from_millis(100)));
        assert_eq!(
            controller.connection_failed(now),
            ReconnectDecision::Schedule(Duration::from_millis(200))
        );
        assert!(controller.ready_to_connect(now + Duration::from_millis(300)));

        // two attempts made; the next failure exhausts the limit
        assert_eq!(controller.connection_failed(now), ReconnectDecision::GiveUp);
        assert!(!controller.has_job());
    }

    #[test]
    fn backoff_rewinds_on_success() {
        let mut controller = controller(ReconnectLimit::Unlimited);
        let now = Instant::now();

        controller.begin(VecDeque::new(), now);
        controller.connection_failed(now);
        controller.connected();

        assert_eq!(controller.attempts(), 0);
        assert!(controller.has_job());
        assert_eq!(
            controller.connection_failed(now),
            ReconnectDecision::Schedule(Duration::from_millis(200))
        );
    }

    #[test]
    fn not_ready_before_the_delay_elapses() {
        let mut controller = controller(ReconnectLimit::Unlimited);
        let now = Instant::now();

        controller.begin(VecDeque::new(), now);

        assert!(!controller.ready_to_connect(now + Duration::from_millis(50)));
        assert!(controller.ready_to_connect(now + Duration::from_millis(100)));
        // the deadline was consumed
        assert!(!controller.ready_to_connect(now + Duration::from_millis(200)));
    }
}
