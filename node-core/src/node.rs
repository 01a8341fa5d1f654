//! The cooperative control loop.
//!
//! [`Node`] owns every manager and threads an explicit [`TickContext`] through
//! them, so there is no hidden global state: the clock, the liveness
//! supervisor, and the telemetry ring are borrowed for exactly one tick.

use core::fmt;

use crate::broker::{BrokerClient, BrokerSessionManager};
use crate::clock::{Clock, NodeInstant};
use crate::config::{ConfigError, NodeConfig};
use crate::liveness::{LivenessSupervisor, Watchdog};
use crate::network::{Credentials, NetworkLinkManager, Transport};
use crate::publish::{PublicationPipeline, PublishOutcome, SampleMailbox, TopicError};
use crate::status::{ResourceGauge, StatusCadence, StatusSnapshot};
use crate::telemetry::{TelemetryEventKind, TelemetryPayload, TelemetryRecorder};

/// Per-tick borrows handed to the managers.
pub struct TickContext<'a, C: Clock, W> {
    pub clock: &'a C,
    pub liveness: &'a mut LivenessSupervisor<W, C::Instant>,
    pub telemetry: &'a mut TelemetryRecorder<C::Instant>,
}

/// Platform pieces the node is assembled from.
pub struct NodeParts<'m, C, T, B, W, G> {
    pub clock: C,
    pub transport: T,
    pub client: B,
    pub watchdog: W,
    pub gauge: G,
    pub mailbox: &'m SampleMailbox,
    pub credentials: Credentials,
}

/// Reasons a node cannot be assembled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeError {
    Config(ConfigError),
    Topic(TopicError),
}

impl From<ConfigError> for NodeError {
    fn from(value: ConfigError) -> Self {
        NodeError::Config(value)
    }
}

impl From<TopicError> for NodeError {
    fn from(value: TopicError) -> Self {
        NodeError::Topic(value)
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Config(err) => write!(f, "invalid config: {err}"),
            NodeError::Topic(err) => write!(f, "invalid topic: {err}"),
        }
    }
}

/// What one pass through the loop did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TickReport {
    pub network_up: bool,
    pub session_up: bool,
    pub publish: PublishOutcome,
    pub status: Option<StatusSnapshot>,
}

/// The node: network link, broker session, publication, liveness, and status.
pub struct Node<'m, C, T, B, W, G>
where
    C: Clock,
    T: Transport,
{
    clock: C,
    config: NodeConfig,
    network: NetworkLinkManager<T, C::Instant>,
    session: BrokerSessionManager<B, C::Instant>,
    pipeline: PublicationPipeline,
    liveness: LivenessSupervisor<W, C::Instant>,
    telemetry: TelemetryRecorder<C::Instant>,
    cadence: StatusCadence<C::Instant>,
    gauge: G,
    mailbox: &'m SampleMailbox,
    booted_at: C::Instant,
}

impl<'m, C, T, B, W, G> Node<'m, C, T, B, W, G>
where
    C: Clock,
    T: Transport,
    B: BrokerClient,
    W: Watchdog,
    G: ResourceGauge,
{
    /// Validates `config` and assembles the node.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError`] when the configuration is inconsistent.
    pub fn new(
        config: NodeConfig,
        parts: NodeParts<'m, C, T, B, W, G>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let pipeline = PublicationPipeline::new(&config.identity)?;
        let booted_at = parts.clock.now();

        Ok(Self {
            network: NetworkLinkManager::new(
                parts.transport,
                parts.credentials,
                config.escalation.network,
            ),
            session: BrokerSessionManager::new(
                parts.client,
                config.identity.client_id,
                &config.escalation,
            ),
            pipeline,
            liveness: LivenessSupervisor::new(parts.watchdog, config.liveness_deadline),
            telemetry: TelemetryRecorder::new(),
            cadence: StatusCadence::new(config.status_interval),
            gauge: parts.gauge,
            mailbox: parts.mailbox,
            clock: parts.clock,
            config,
            booted_at,
        })
    }

    /// Blocks until the network and then the session are up.
    ///
    /// Sample production should start only after this returns.
    pub async fn bootstrap(&mut self) {
        loop {
            self.liveness.refresh(self.clock.now());
            let mut ctx = TickContext {
                clock: &self.clock,
                liveness: &mut self.liveness,
                telemetry: &mut self.telemetry,
            };

            if self.network.ensure_connected(&mut ctx).await
                && self.session.ensure_session(&mut self.network, &mut ctx).await
            {
                break;
            }
            self.clock.sleep(self.config.bootstrap_retry).await;
        }

        let now = self.clock.now();
        self.telemetry.record(
            TelemetryEventKind::BootstrapComplete,
            TelemetryPayload::None,
            now,
        );
    }

    /// Runs one pass of the loop.
    pub async fn tick(&mut self) -> TickReport {
        self.liveness.refresh(self.clock.now());
        let mut ctx = TickContext {
            clock: &self.clock,
            liveness: &mut self.liveness,
            telemetry: &mut self.telemetry,
        };

        let network_up = self.network.ensure_connected(&mut ctx).await;
        let session_up = self
            .session
            .ensure_session(&mut self.network, &mut ctx)
            .await;
        self.session.service_session(&mut ctx).await;

        let has_session = self.session.has_session();
        let publish = self
            .pipeline
            .publish_if_pending(self.mailbox, self.session.client_mut(), has_session, &mut ctx)
            .await;

        let status = self.poll_status();

        TickReport {
            network_up,
            session_up,
            publish,
            status,
        }
    }

    /// Bootstraps, then ticks forever at the configured cadence.
    ///
    /// `observe` sees the node after every tick, which is where platforms
    /// mirror telemetry and print status lines.
    pub async fn run<F>(&mut self, mut observe: F) -> !
    where
        F: FnMut(&Self, &TickReport),
    {
        self.bootstrap().await;
        loop {
            let report = self.tick().await;
            observe(self, &report);
            self.clock.sleep(self.config.tick_interval).await;
        }
    }

    fn poll_status(&mut self) -> Option<StatusSnapshot> {
        let now = self.clock.now();
        if !self.cadence.poll(now) {
            return None;
        }

        self.telemetry
            .record(TelemetryEventKind::StatusReport, TelemetryPayload::None, now);
        Some(self.snapshot())
    }

    /// Current status, independent of the reporting cadence.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            network: self.network.status(),
            signal_dbm: self.network.signal_strength(),
            session: self.session.status(),
            free_memory: self.gauge.free_memory(),
            network_failures: self.network.state().consecutive_failures(),
            broker_failures: self.session.state().consecutive_failures(),
            escalations: self.session.escalations(),
            pending: self.mailbox.pending().map(|sample| sample.value),
            delivered: self.pipeline.delivered(),
            uptime: self.clock.now().saturating_duration_since(self.booted_at),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub const fn clock(&self) -> &C {
        &self.clock
    }

    #[must_use]
    pub const fn network(&self) -> &NetworkLinkManager<T, C::Instant> {
        &self.network
    }

    #[must_use]
    pub const fn session(&self) -> &BrokerSessionManager<B, C::Instant> {
        &self.session
    }

    #[must_use]
    pub const fn pipeline(&self) -> &PublicationPipeline {
        &self.pipeline
    }

    #[must_use]
    pub const fn liveness(&self) -> &LivenessSupervisor<W, C::Instant> {
        &self.liveness
    }

    #[must_use]
    pub const fn telemetry(&self) -> &TelemetryRecorder<C::Instant> {
        &self.telemetry
    }

    #[must_use]
    pub const fn mailbox(&self) -> &'m SampleMailbox {
        self.mailbox
    }

    /// Mutable access to the transport, for platform hooks and fault injection.
    pub fn transport_mut(&mut self) -> &mut T {
        self.network.transport_mut()
    }

    /// Mutable access to the broker client, for platform hooks and fault injection.
    pub fn client_mut(&mut self) -> &mut B {
        self.session.client_mut()
    }
}
