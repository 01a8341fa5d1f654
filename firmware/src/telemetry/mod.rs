//! Telemetry log mirroring.
//!
//! The node records into its fixed-capacity ring; after every tick the
//! firmware forwards the records it has not printed yet to defmt (target) or
//! stdout (host). Records overwritten before they were mirrored are counted
//! and reported instead of silently skipped.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use core::fmt;

use node_core::clock::NodeInstant;
use node_core::status::StatusSnapshot;
use node_core::telemetry::{EventId, TelemetryRecorder};

/// Cursor over a [`TelemetryRecorder`] that prints each record once.
#[derive(Debug, Default)]
pub struct TelemetryMirror {
    cursor: EventId,
}

impl TelemetryMirror {
    pub const fn new() -> Self {
        Self { cursor: 0 }
    }

    /// Emits every record added since the previous call. Returns how many were emitted.
    pub fn drain<I, const CAPACITY: usize>(
        &mut self,
        recorder: &TelemetryRecorder<I, CAPACITY>,
    ) -> usize
    where
        I: NodeInstant,
    {
        let mut emitted = 0;
        for record in recorder.since(self.cursor) {
            if emitted == 0 && record.id != self.cursor {
                emit_overrun(record.id.wrapping_sub(self.cursor));
            }
            emit_record(record);
            emitted += 1;
        }
        self.cursor = recorder.next_event_id();
        emitted
    }
}

/// Prints the periodic status line.
pub fn emit_status(snapshot: &StatusSnapshot) {
    emit_line(snapshot);
}

fn emit_record<R: fmt::Display>(record: &R) {
    emit_line(&format_args!("telemetry:node {record}"));
}

fn emit_overrun(missed: u32) {
    emit_line(&format_args!(
        "telemetry:node {missed} records overwritten before mirroring"
    ));
}

#[cfg(target_os = "none")]
fn emit_line<D: fmt::Display>(line: &D) {
    defmt::info!("{}", defmt::Display2Format(line));
}

#[cfg(not(target_os = "none"))]
fn emit_line<D: fmt::Display>(line: &D) {
    println!("{line}");
}
