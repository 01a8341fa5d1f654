//! Watchdog-backed liveness supervision and liveness-aware bounded waits.
//!
//! The supervisor is the only component that feeds the hardware watchdog. The
//! loop refreshes it at the top of every tick, and the two blocking connects
//! refresh it from inside their wait loops via [`wait_until`] and
//! [`race_with_liveness`], so a slow connect never starves the watchdog while a
//! genuine hang still does.

use core::{future::Future, pin::pin, time::Duration};

use embassy_futures::select::{Either, select};

use crate::clock::{Clock, NodeInstant};

/// External deadman switch that restarts the node when not fed in time.
pub trait Watchdog {
    /// Restarts the watchdog countdown.
    fn feed(&mut self);
}

/// Watchdog stand-in for targets without one.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn feed(&mut self) {}
}

/// Owns the liveness token and forwards refreshes to the watchdog.
pub struct LivenessSupervisor<W, I> {
    watchdog: W,
    deadline: Duration,
    last_refresh: Option<I>,
    refresh_count: u32,
    longest_gap: Duration,
}

impl<W, I> LivenessSupervisor<W, I>
where
    W: Watchdog,
    I: NodeInstant,
{
    #[must_use]
    pub const fn new(watchdog: W, deadline: Duration) -> Self {
        Self {
            watchdog,
            deadline,
            last_refresh: None,
            refresh_count: 0,
            longest_gap: Duration::ZERO,
        }
    }

    /// Records a refresh at `now` and feeds the watchdog.
    pub fn refresh(&mut self, now: I) {
        if let Some(previous) = self.last_refresh {
            let gap = now.saturating_duration_since(previous);
            if gap > self.longest_gap {
                self.longest_gap = gap;
            }
        }
        self.last_refresh = Some(now);
        self.refresh_count = self.refresh_count.wrapping_add(1);
        self.watchdog.feed();
    }

    #[must_use]
    pub const fn last_refresh(&self) -> Option<I> {
        self.last_refresh
    }

    #[must_use]
    pub const fn refresh_count(&self) -> u32 {
        self.refresh_count
    }

    /// Largest interval observed between two consecutive refreshes.
    #[must_use]
    pub const fn longest_gap(&self) -> Duration {
        self.longest_gap
    }

    #[must_use]
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    #[must_use]
    pub const fn watchdog(&self) -> &W {
        &self.watchdog
    }
}

/// Polls `ready` every `poll` until it reports `true` or `timeout` elapses.
///
/// Liveness is refreshed before every check, and the final check happens at
/// the deadline so a link that comes up on the last poll still counts.
pub async fn wait_until<C, W, F>(
    clock: &C,
    liveness: &mut LivenessSupervisor<W, C::Instant>,
    timeout: Duration,
    poll: Duration,
    mut ready: F,
) -> bool
where
    C: Clock,
    W: Watchdog,
    F: FnMut() -> bool,
{
    let started = clock.now();
    loop {
        let now = clock.now();
        liveness.refresh(now);
        if ready() {
            return true;
        }

        let elapsed = now.saturating_duration_since(started);
        if elapsed >= timeout {
            return false;
        }
        clock.sleep(poll.min(timeout - elapsed)).await;
    }
}

/// Drives `future` to completion for at most `timeout`, refreshing liveness every `poll`.
///
/// Returns `None` when the deadline passes first; the future is dropped.
pub async fn race_with_liveness<C, W, F>(
    clock: &C,
    liveness: &mut LivenessSupervisor<W, C::Instant>,
    timeout: Duration,
    poll: Duration,
    future: F,
) -> Option<F::Output>
where
    C: Clock,
    W: Watchdog,
    F: Future,
{
    let started = clock.now();
    let mut future = pin!(future);
    loop {
        let now = clock.now();
        liveness.refresh(now);

        let elapsed = now.saturating_duration_since(started);
        if elapsed >= timeout {
            return None;
        }

        let step = poll.min(timeout - elapsed);
        if let Either::First(output) = select(future.as_mut(), clock.sleep(step)).await {
            return Some(output);
        }
    }
}
