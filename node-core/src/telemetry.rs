//! Telemetry event catalog and fixed-capacity recorder.
//!
//! Link managers, the publication pipeline, and the node loop record what they
//! did into a `heapless` history ring. Event kinds serialize to compact numeric
//! codes, and records render to one-line log text so firmware (defmt/stdout)
//! and the emulator transcript print the same thing.

use core::{fmt, time::Duration};

use heapless::{HistoryBuf, OldestOrdered};

use crate::clock::NodeInstant;
use crate::link::LinkId;

/// Identifier assigned to every recorded event.
pub type EventId = u32;

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

/// Discriminated telemetry events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TelemetryEventKind {
    LinkAttempt(LinkId),
    LinkUp(LinkId),
    LinkFailed(LinkId),
    LinkDropped(LinkId),
    LinkForcedReset(LinkId),
    Escalation,
    SampleDelivered,
    PublishFailed,
    StatusReport,
    BootstrapComplete,
}

impl fmt::Display for TelemetryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEventKind::LinkAttempt(link) => write!(f, "{link}-attempt"),
            TelemetryEventKind::LinkUp(link) => write!(f, "{link}-up"),
            TelemetryEventKind::LinkFailed(link) => write!(f, "{link}-failed"),
            TelemetryEventKind::LinkDropped(link) => write!(f, "{link}-dropped"),
            TelemetryEventKind::LinkForcedReset(link) => write!(f, "{link}-forced-reset"),
            TelemetryEventKind::Escalation => f.write_str("escalation"),
            TelemetryEventKind::SampleDelivered => f.write_str("sample-delivered"),
            TelemetryEventKind::PublishFailed => f.write_str("publish-failed"),
            TelemetryEventKind::StatusReport => f.write_str("status"),
            TelemetryEventKind::BootstrapComplete => f.write_str("bootstrap-complete"),
        }
    }
}

/// Payloads carried alongside telemetry events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TelemetryPayload {
    None,
    Link(LinkTelemetry),
    Publish(PublishTelemetry),
    Escalation(EscalationTelemetry),
}

/// Connection attempt details.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinkTelemetry {
    pub consecutive_failures: u32,
    pub error_code: Option<i32>,
    pub attempt_duration: Option<Duration>,
}

impl LinkTelemetry {
    #[must_use]
    pub const fn new(consecutive_failures: u32) -> Self {
        Self {
            consecutive_failures,
            error_code: None,
            attempt_duration: None,
        }
    }

    #[must_use]
    pub const fn with_error_code(mut self, code: i32) -> Self {
        self.error_code = Some(code);
        self
    }

    #[must_use]
    pub const fn with_duration(mut self, duration: Duration) -> Self {
        self.attempt_duration = Some(duration);
        self
    }
}

/// Sample publication details.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PublishTelemetry {
    pub value: u32,
    pub generation: u32,
}

/// Broker-to-network escalation details.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EscalationTelemetry {
    pub broker_failures: u32,
    pub threshold: u32,
}

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TelemetryRecord<I> {
    pub id: EventId,
    pub timestamp: I,
    pub event: TelemetryEventKind,
    pub details: TelemetryPayload,
}

impl<I: NodeInstant> fmt::Display for TelemetryRecord<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t={}ms {}", self.timestamp.as_millis(), self.event)?;
        match self.details {
            TelemetryPayload::None => Ok(()),
            TelemetryPayload::Link(link) => {
                write!(f, " failures={}", link.consecutive_failures)?;
                if let Some(code) = link.error_code {
                    write!(f, " rc={code}")?;
                }
                if let Some(duration) = link.attempt_duration {
                    write!(f, " took={}ms", duration.as_millis())?;
                }
                Ok(())
            }
            TelemetryPayload::Publish(publish) => {
                write!(f, " value={} gen={}", publish.value, publish.generation)
            }
            TelemetryPayload::Escalation(escalation) => write!(
                f,
                " broker-failures={}/{}",
                escalation.broker_failures, escalation.threshold
            ),
        }
    }
}

/// Telemetry ring buffer type alias.
pub type TelemetryRing<I, const CAPACITY: usize = TELEMETRY_RING_CAPACITY> =
    HistoryBuf<TelemetryRecord<I>, CAPACITY>;

/// Records telemetry events into a fixed-size ring buffer.
pub struct TelemetryRecorder<I, const CAPACITY: usize = TELEMETRY_RING_CAPACITY> {
    ring: TelemetryRing<I, CAPACITY>,
    next_event_id: EventId,
}

impl<I, const CAPACITY: usize> TelemetryRecorder<I, CAPACITY>
where
    I: NodeInstant,
{
    /// Creates a new telemetry recorder with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_event_id: 0,
        }
    }

    /// Returns an iterator over the recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, TelemetryRecord<I>> {
        self.ring.oldest_ordered()
    }

    /// Returns records with an id at or after `cursor`, oldest first.
    ///
    /// Callers mirroring telemetry keep [`Self::next_event_id`] as their cursor.
    pub fn since(&self, cursor: EventId) -> impl Iterator<Item = &TelemetryRecord<I>> {
        self.ring
            .oldest_ordered()
            .filter(move |record| record.id.wrapping_sub(cursor) < u32::MAX / 2)
    }

    /// Returns the most recent telemetry record, if available.
    pub fn latest(&self) -> Option<&TelemetryRecord<I>> {
        self.ring.recent()
    }

    /// Id the next recorded event will receive.
    #[must_use]
    pub const fn next_event_id(&self) -> EventId {
        self.next_event_id
    }

    /// Returns the number of records currently stored.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` when no telemetry records are stored.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Records an arbitrary telemetry event with the supplied payload.
    pub fn record(
        &mut self,
        event: TelemetryEventKind,
        payload: TelemetryPayload,
        timestamp: I,
    ) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);

        self.ring.write(TelemetryRecord {
            id,
            timestamp,
            event,
            details: payload,
        });

        id
    }

    /// Records the start of a connection attempt.
    pub fn record_link_attempt(
        &mut self,
        link: LinkId,
        consecutive_failures: u32,
        timestamp: I,
    ) -> EventId {
        self.record(
            TelemetryEventKind::LinkAttempt(link),
            TelemetryPayload::Link(LinkTelemetry::new(consecutive_failures)),
            timestamp,
        )
    }

    /// Records a successful connection, with the time the attempt took.
    pub fn record_link_up(&mut self, link: LinkId, started_at: I, timestamp: I) -> EventId {
        let details =
            LinkTelemetry::new(0).with_duration(timestamp.saturating_duration_since(started_at));
        self.record(
            TelemetryEventKind::LinkUp(link),
            TelemetryPayload::Link(details),
            timestamp,
        )
    }

    /// Records a failed connection attempt.
    pub fn record_link_failed(
        &mut self,
        link: LinkId,
        consecutive_failures: u32,
        error_code: Option<i32>,
        started_at: I,
        timestamp: I,
    ) -> EventId {
        let mut details = LinkTelemetry::new(consecutive_failures)
            .with_duration(timestamp.saturating_duration_since(started_at));
        if let Some(code) = error_code {
            details = details.with_error_code(code);
        }
        self.record(
            TelemetryEventKind::LinkFailed(link),
            TelemetryPayload::Link(details),
            timestamp,
        )
    }

    /// Records an established link observed as lost.
    pub fn record_link_dropped(
        &mut self,
        link: LinkId,
        error_code: Option<i32>,
        timestamp: I,
    ) -> EventId {
        let mut details = LinkTelemetry::new(0);
        if let Some(code) = error_code {
            details = details.with_error_code(code);
        }
        self.record(
            TelemetryEventKind::LinkDropped(link),
            TelemetryPayload::Link(details),
            timestamp,
        )
    }

    /// Records a forced teardown of a link.
    pub fn record_forced_reset(&mut self, link: LinkId, timestamp: I) -> EventId {
        self.record(
            TelemetryEventKind::LinkForcedReset(link),
            TelemetryPayload::None,
            timestamp,
        )
    }

    /// Records broker trouble escalating to a network reset.
    pub fn record_escalation(
        &mut self,
        broker_failures: u32,
        threshold: u32,
        timestamp: I,
    ) -> EventId {
        self.record(
            TelemetryEventKind::Escalation,
            TelemetryPayload::Escalation(EscalationTelemetry {
                broker_failures,
                threshold,
            }),
            timestamp,
        )
    }

    /// Records the outcome of a publish attempt.
    pub fn record_publish(
        &mut self,
        delivered: bool,
        value: u32,
        generation: u32,
        timestamp: I,
    ) -> EventId {
        let event = if delivered {
            TelemetryEventKind::SampleDelivered
        } else {
            TelemetryEventKind::PublishFailed
        };
        self.record(
            event,
            TelemetryPayload::Publish(PublishTelemetry { value, generation }),
            timestamp,
        )
    }
}

impl<I, const CAPACITY: usize> Default for TelemetryRecorder<I, CAPACITY>
where
    I: NodeInstant,
{
    fn default() -> Self {
        Self::new()
    }
}
