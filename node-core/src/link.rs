//! Per-link connection bookkeeping shared by the network and broker managers.

use core::{fmt, time::Duration};

use crate::clock::{NodeInstant, interval_elapsed};

/// Identifies which link a telemetry event or error refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkId {
    Network,
    Broker,
}

impl LinkId {
    /// Short label used in logs and status lines.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            LinkId::Network => "wifi",
            LinkId::Broker => "mqtt",
        }
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Observable state of a link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkStatus {
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, LinkStatus::Connected)
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkStatus::Disconnected => "DOWN",
            LinkStatus::Connecting => "CONNECTING",
            LinkStatus::Connected => "OK",
        })
    }
}

/// Rate-limited connection attempt tracker for one link.
///
/// Created once at startup and reset in place; `consecutive_failures` only
/// moves on a completed attempt, never on a skipped one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConnectionAttemptState<I> {
    status: LinkStatus,
    last_attempt: Option<I>,
    retry_interval: Duration,
    consecutive_failures: u32,
}

impl<I: NodeInstant> ConnectionAttemptState<I> {
    #[must_use]
    pub const fn new(retry_interval: Duration) -> Self {
        Self {
            status: LinkStatus::Disconnected,
            last_attempt: None,
            retry_interval,
            consecutive_failures: 0,
        }
    }

    #[must_use]
    pub const fn status(&self) -> LinkStatus {
        self.status
    }

    #[must_use]
    pub const fn last_attempt(&self) -> Option<I> {
        self.last_attempt
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns `true` when the rate limiter allows a new attempt at `now`.
    #[must_use]
    pub fn attempt_due(&self, now: I) -> bool {
        interval_elapsed(self.last_attempt, now, self.retry_interval)
    }

    /// Earliest instant at which another attempt is allowed.
    #[must_use]
    pub fn next_attempt_at(&self) -> Option<I> {
        self.last_attempt.map(|last| last + self.retry_interval)
    }

    /// Stamps the attempt time and enters `Connecting`.
    pub fn begin_attempt(&mut self, now: I) {
        self.last_attempt = Some(now);
        self.status = LinkStatus::Connecting;
    }

    /// Completes an attempt successfully.
    pub fn record_success(&mut self) {
        self.status = LinkStatus::Connected;
        self.consecutive_failures = 0;
    }

    /// Completes an attempt unsuccessfully, returning the new failure count.
    pub fn record_failure(&mut self) -> u32 {
        self.status = LinkStatus::Disconnected;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    /// Marks an established link as lost without touching the counters.
    pub fn mark_dropped(&mut self) {
        self.status = LinkStatus::Disconnected;
    }

    /// Clears the failure counter after an escalation.
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ops::Add;

    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct MockInstant(u64);

    impl Add<Duration> for MockInstant {
        type Output = Self;

        fn add(self, rhs: Duration) -> Self::Output {
            Self(self.0 + rhs.as_millis() as u64)
        }
    }

    impl NodeInstant for MockInstant {
        fn saturating_duration_since(&self, earlier: Self) -> Duration {
            Duration::from_millis(self.0.saturating_sub(earlier.0))
        }

        fn as_millis(&self) -> u64 {
            self.0
        }
    }

    fn state() -> ConnectionAttemptState<MockInstant> {
        ConnectionAttemptState::new(Duration::from_secs(5))
    }

    #[test]
    fn first_attempt_is_due_immediately() {
        let state = state();
        assert_eq!(state.status(), LinkStatus::Disconnected);
        assert!(state.attempt_due(MockInstant(0)));
        assert_eq!(state.next_attempt_at(), None);
    }

    #[test]
    fn attempts_are_rate_limited_from_the_attempt_start() {
        let mut state = state();
        state.begin_attempt(MockInstant(1_000));
        assert_eq!(state.status(), LinkStatus::Connecting);
        state.record_failure();

        assert!(!state.attempt_due(MockInstant(5_999)));
        assert!(state.attempt_due(MockInstant(6_000)));
        assert_eq!(state.next_attempt_at(), Some(MockInstant(6_000)));
    }

    #[test]
    fn failures_accumulate_until_success() {
        let mut state = state();
        for expected in 1..=3 {
            state.begin_attempt(MockInstant(u64::from(expected) * 5_000));
            assert_eq!(state.record_failure(), expected);
        }

        state.begin_attempt(MockInstant(20_000));
        state.record_success();
        assert_eq!(state.status(), LinkStatus::Connected);
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[test]
    fn drop_keeps_counters_and_timestamp() {
        let mut state = state();
        state.begin_attempt(MockInstant(100));
        state.record_failure();
        state.begin_attempt(MockInstant(5_100));
        state.record_success();
        state.mark_dropped();

        assert_eq!(state.status(), LinkStatus::Disconnected);
        assert_eq!(state.last_attempt(), Some(MockInstant(5_100)));
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[test]
    fn link_labels_match_status_line() {
        assert_eq!(LinkId::Network.label(), "wifi");
        assert_eq!(LinkId::Broker.label(), "mqtt");
    }
}
