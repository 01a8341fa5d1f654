#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Entry point for the BLE occupancy counter.
//!
//! The counter runs on its own schedule and reports through
//! [`occupancy_on_new_sample`], which only stores the count. The node task
//! notices new counts after each tick through [`ArrivalLog`] and logs them
//! from there.

use node_core::publish::{PendingSample, PublishOutcome, SampleMailbox};

/// Latest occupancy count awaiting publication.
pub static SAMPLES: SampleMailbox = SampleMailbox::new();

/// Hands a fresh count to the node. Never blocks and never logs.
///
/// Exported unmangled so the counter can be linked in from C.
#[unsafe(no_mangle)]
pub extern "C" fn occupancy_on_new_sample(count: u32) {
    SAMPLES.post(count);
}

/// A count the tick loop saw for the first time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Arrival {
    pub count: u32,
    /// Count that was still undelivered when this one replaced it.
    pub superseded: Option<u32>,
}

/// Remembers which sample the tick loop last saw.
#[derive(Default)]
pub struct ArrivalLog {
    seen: Option<u32>,
    undelivered: Option<PendingSample>,
}

impl ArrivalLog {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            seen: None,
            undelivered: None,
        }
    }

    /// Checks the mailbox after a tick that ended with `outcome`.
    pub fn observe(&mut self, mailbox: &SampleMailbox, outcome: &PublishOutcome) -> Option<Arrival> {
        let pending = mailbox.pending();
        let delivered = match outcome {
            PublishOutcome::Delivered(sample) => Some(*sample),
            _ => None,
        };
        let latest = pending.or(delivered)?;

        let fresh = self.seen != Some(latest.generation);
        let superseded = self
            .undelivered
            .filter(|previous| {
                fresh && delivered.is_none_or(|sample| sample.generation != previous.generation)
            })
            .map(|previous| previous.value);

        self.seen = Some(latest.generation);
        self.undelivered = pending;
        fresh.then_some(Arrival {
            count: latest.value,
            superseded,
        })
    }
}

#[cfg(target_os = "none")]
pub fn log_arrival(arrival: Arrival, online: bool) {
    match arrival.superseded {
        Some(previous) => defmt::info!(
            "sample: count={} replaces undelivered {} online={}",
            arrival.count,
            previous,
            online
        ),
        None => defmt::info!("sample: count={} online={}", arrival.count, online),
    }
}

#[cfg(not(target_os = "none"))]
pub fn log_arrival(arrival: Arrival, online: bool) {
    let count = arrival.count;
    match arrival.superseded {
        Some(previous) => {
            println!("sample: count={count} replaces undelivered {previous} online={online}");
        }
        None => println!("sample: count={count} online={online}"),
    }
}
