//! Periodic status summary.
//!
//! The node builds a [`StatusSnapshot`] every status interval and the platform
//! prints it through [`StatusFormatter`], keeping the line identical across
//! firmware and the emulator.

use core::fmt;
use core::time::Duration;

use crate::clock::{NodeInstant, interval_elapsed};
use crate::link::LinkStatus;

/// Source of the free-memory reading shown in the status line.
pub trait ResourceGauge {
    /// Free heap in bytes, if the platform can tell.
    fn free_memory(&self) -> Option<u32>;
}

/// Gauge for platforms without a heap to report.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoResourceGauge;

impl ResourceGauge for NoResourceGauge {
    fn free_memory(&self) -> Option<u32> {
        None
    }
}

/// Point-in-time view of the node's connectivity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub network: LinkStatus,
    pub signal_dbm: Option<i8>,
    pub session: LinkStatus,
    pub free_memory: Option<u32>,
    pub network_failures: u32,
    pub broker_failures: u32,
    pub escalations: u32,
    pub pending: Option<u32>,
    pub delivered: u32,
    pub uptime: Duration,
}

impl StatusSnapshot {
    /// Snapshot of a node that has not connected anything yet.
    #[must_use]
    pub const fn offline() -> Self {
        Self {
            network: LinkStatus::Disconnected,
            signal_dbm: None,
            session: LinkStatus::Disconnected,
            free_memory: None,
            network_failures: 0,
            broker_failures: 0,
            escalations: 0,
            pending: None,
            delivered: 0,
            uptime: Duration::ZERO,
        }
    }
}

/// Renders a [`StatusSnapshot`] as a single human-readable line.
#[derive(Clone, Copy, Debug)]
pub struct StatusFormatter<'a> {
    snapshot: &'a StatusSnapshot,
}

impl<'a> StatusFormatter<'a> {
    #[must_use]
    pub const fn new(snapshot: &'a StatusSnapshot) -> Self {
        Self { snapshot }
    }

    /// Writes e.g. `[STAT] wifi=OK rssi=-61dBm mqtt=OK heap=81234 pending=none ...`.
    pub fn write_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        let snapshot = self.snapshot;
        write!(writer, "[STAT] wifi={} rssi=", snapshot.network)?;
        match snapshot.signal_dbm {
            Some(dbm) => write!(writer, "{dbm}dBm")?,
            None => writer.write_str("n/a")?,
        }

        write!(writer, " mqtt={} heap=", snapshot.session)?;
        match snapshot.free_memory {
            Some(bytes) => write!(writer, "{bytes}")?,
            None => writer.write_str("n/a")?,
        }

        writer.write_str(" pending=")?;
        match snapshot.pending {
            Some(value) => write!(writer, "{value}")?,
            None => writer.write_str("none")?,
        }

        write!(
            writer,
            " sent={} failures=wifi:{}/mqtt:{} escalations={} up=",
            snapshot.delivered,
            snapshot.network_failures,
            snapshot.broker_failures,
            snapshot.escalations
        )?;
        write_uptime(writer, snapshot.uptime)
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        StatusFormatter::new(self).write_line(f)
    }
}

fn write_uptime<W: fmt::Write>(writer: &mut W, uptime: Duration) -> fmt::Result {
    let seconds = uptime.as_secs();
    let tenths = uptime.subsec_millis() / 100;
    if seconds >= 3_600 {
        write!(
            writer,
            "{}h{:02}m{:02}s",
            seconds / 3_600,
            (seconds % 3_600) / 60,
            seconds % 60
        )
    } else {
        write!(writer, "{seconds}.{tenths}s")
    }
}

/// Gates status emission to a fixed cadence.
///
/// The first poll arms the cadence; the first report is due one interval later.
#[derive(Clone, Copy, Debug)]
pub struct StatusCadence<I> {
    interval: Duration,
    last: Option<I>,
}

impl<I: NodeInstant> StatusCadence<I> {
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns `true` when a report is due at `now`, restarting the interval.
    pub fn poll(&mut self, now: I) -> bool {
        match self.last {
            None => {
                self.last = Some(now);
                false
            }
            Some(_) if interval_elapsed(self.last, now, self.interval) => {
                self.last = Some(now);
                true
            }
            Some(_) => false,
        }
    }
}
