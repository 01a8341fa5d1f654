//! Latest-sample mailbox and the at-most-retry publication pipeline.
//!
//! The sample source posts counts from whatever context it runs in; the loop
//! reads the newest value and acknowledges it only after the broker accepted
//! it. Newer posts overwrite older undelivered ones, so at most one value is
//! ever outstanding.

use core::fmt;

use heapless::String;
use portable_atomic::{AtomicU32, AtomicU64, Ordering};

use crate::broker::BrokerClient;
use crate::clock::Clock;
use crate::config::{NodeIdentity, TOPIC_CAPACITY};
use crate::liveness::Watchdog;
use crate::node::TickContext;

/// Snapshot of an undelivered sample.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PendingSample {
    pub value: u32,
    pub generation: u32,
}

/// Lock-free single-slot mailbox between the sample source and the loop.
///
/// The slot packs `(generation << 32) | value`; generation 0 means nothing was
/// ever posted. A sample is pending while its generation differs from the last
/// acknowledged one.
pub struct SampleMailbox {
    slot: AtomicU64,
    acknowledged: AtomicU32,
}

impl SampleMailbox {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: AtomicU64::new(0),
            acknowledged: AtomicU32::new(0),
        }
    }

    /// Stores `value` as the latest sample, superseding any undelivered one.
    ///
    /// Safe to call from interrupt or callback context; never blocks.
    pub fn post(&self, value: u32) -> u32 {
        let mut current = self.slot.load(Ordering::Acquire);
        loop {
            let generation = next_generation(unpack(current).0);
            match self.slot.compare_exchange_weak(
                current,
                pack(generation, value),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return generation,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns the newest sample if it has not been delivered yet.
    #[must_use]
    pub fn pending(&self) -> Option<PendingSample> {
        let (generation, value) = unpack(self.slot.load(Ordering::Acquire));
        if generation == 0 || generation == self.acknowledged.load(Ordering::Acquire) {
            None
        } else {
            Some(PendingSample { value, generation })
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending().is_some()
    }

    /// Marks `sample` delivered. A sample posted after it stays pending.
    pub fn acknowledge(&self, sample: PendingSample) {
        self.acknowledged
            .store(sample.generation, Ordering::Release);
    }
}

impl Default for SampleMailbox {
    fn default() -> Self {
        Self::new()
    }
}

fn pack(generation: u32, value: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(value)
}

#[allow(clippy::cast_possible_truncation)]
const fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

const fn next_generation(generation: u32) -> u32 {
    match generation.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Topic does not fit the fixed topic buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TopicError {
    pub required: usize,
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "topic needs {} bytes, buffer holds {TOPIC_CAPACITY}",
            self.required
        )
    }
}

/// Builds `<namespace>/<location>/count`.
///
/// # Errors
///
/// Returns [`TopicError`] when the topic exceeds [`TOPIC_CAPACITY`].
pub fn count_topic(identity: &NodeIdentity) -> Result<String<TOPIC_CAPACITY>, TopicError> {
    let error = TopicError {
        required: identity.topic_len(),
    };
    let mut topic = String::new();
    for part in [identity.namespace, "/", identity.location, "/count"] {
        topic.push_str(part).map_err(|_| error)?;
    }
    Ok(topic)
}

/// Result of one pass through the pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Nothing was pending.
    Idle,
    /// A sample is pending but there is no session to publish on.
    NoSession,
    Delivered(PendingSample),
    /// The broker rejected the publish; the sample stays pending.
    Failed(PendingSample),
}

/// Publishes the pending sample at most once per tick.
pub struct PublicationPipeline {
    topic: String<TOPIC_CAPACITY>,
    delivered: u32,
    failed: u32,
}

impl PublicationPipeline {
    /// Creates a pipeline publishing under `identity`'s count topic.
    ///
    /// # Errors
    ///
    /// Returns [`TopicError`] when the topic does not fit.
    pub fn new(identity: &NodeIdentity) -> Result<Self, TopicError> {
        Ok(Self {
            topic: count_topic(identity)?,
            delivered: 0,
            failed: 0,
        })
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub const fn delivered(&self) -> u32 {
        self.delivered
    }

    #[must_use]
    pub const fn failed(&self) -> u32 {
        self.failed
    }

    /// Publishes the pending sample if there is one and a session exists.
    pub async fn publish_if_pending<B, C, W>(
        &mut self,
        mailbox: &SampleMailbox,
        client: &mut B,
        has_session: bool,
        ctx: &mut TickContext<'_, C, W>,
    ) -> PublishOutcome
    where
        B: BrokerClient,
        C: Clock,
        W: Watchdog,
    {
        let Some(sample) = mailbox.pending() else {
            return PublishOutcome::Idle;
        };
        if !has_session {
            return PublishOutcome::NoSession;
        }

        let mut digits = [0u8; 10];
        let payload = encode_decimal(sample.value, &mut digits);
        let accepted = client.publish(&self.topic, payload).await;
        ctx.telemetry.record_publish(
            accepted,
            sample.value,
            sample.generation,
            ctx.clock.now(),
        );

        if accepted {
            mailbox.acknowledge(sample);
            self.delivered = self.delivered.wrapping_add(1);
            PublishOutcome::Delivered(sample)
        } else {
            self.failed = self.failed.wrapping_add(1);
            PublishOutcome::Failed(sample)
        }
    }
}

/// Writes `value` as ASCII decimal into the tail of `buf`.
#[allow(clippy::cast_possible_truncation)]
fn encode_decimal(mut value: u32, buf: &mut [u8; 10]) -> &[u8] {
    let mut start = buf.len();
    loop {
        start -= 1;
        buf[start] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &buf[start..]
}
