#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! `node-core` clock backed by `embassy-time`.

use core::ops::Add;
use core::time::Duration;

use embassy_time::{Duration as EmbassyDuration, Instant};
use node_core::clock::NodeInstant;

/// Monotonic instant wrapper so the core can stay independent of embassy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirmwareInstant(Instant);

impl FirmwareInstant {
    #[cfg(target_os = "none")]
    pub fn now() -> Self {
        Self(Instant::now())
    }
}

impl From<Instant> for FirmwareInstant {
    fn from(value: Instant) -> Self {
        Self(value)
    }
}

impl Add<Duration> for FirmwareInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + to_embassy(rhs))
    }
}

impl NodeInstant for FirmwareInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_duration_since(earlier.0).as_micros())
    }

    fn as_millis(&self) -> u64 {
        self.0.as_millis()
    }
}

/// Converts a core duration, saturating at embassy's microsecond range.
pub fn to_embassy(duration: Duration) -> EmbassyDuration {
    let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    EmbassyDuration::from_micros(micros)
}

/// Clock driving the node from the embassy time driver.
#[cfg(target_os = "none")]
#[derive(Clone, Copy, Debug, Default)]
pub struct EmbassyClock;

#[cfg(target_os = "none")]
impl node_core::clock::Clock for EmbassyClock {
    type Instant = FirmwareInstant;

    fn now(&self) -> FirmwareInstant {
        FirmwareInstant::now()
    }

    async fn sleep(&self, duration: Duration) {
        embassy_time::Timer::after(to_embassy(duration)).await;
    }
}
