//! Monotonic time abstractions shared by firmware and host targets.
//!
//! The core never reads a global clock. Firmware wraps `embassy_time`, while the
//! emulator and tests drive a virtual clock whose `sleep` simply advances time.

use core::{fmt::Debug, ops::Add, time::Duration};

/// Monotonic instant used by every state machine in the core.
pub trait NodeInstant: Copy + Ord + Debug + Add<Duration, Output = Self> {
    /// Returns the saturating duration from `earlier` to `self`.
    fn saturating_duration_since(&self, earlier: Self) -> Duration;

    /// Milliseconds since the clock's origin, used for log rendering.
    fn as_millis(&self) -> u64;
}

/// Source of monotonic time plus a cooperative delay primitive.
pub trait Clock {
    type Instant: NodeInstant;

    /// Returns the current instant.
    fn now(&self) -> Self::Instant;

    /// Suspends the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Returns `true` once `interval` has elapsed since `since`, or when there is no `since`.
#[must_use]
pub fn interval_elapsed<I: NodeInstant>(since: Option<I>, now: I, interval: Duration) -> bool {
    match since {
        Some(previous) => now.saturating_duration_since(previous) >= interval,
        None => true,
    }
}
