//! Network (WiFi) link management.
//!
//! [`NetworkLinkManager`] owns the transport and its attempt bookkeeping. It is
//! polled once per tick: an established link returns immediately, a down link
//! is retried at most once per retry interval, and each retry is bounded by
//! the connect timeout with liveness refreshed while waiting.

use core::fmt;

use crate::clock::{Clock, NodeInstant};
use crate::config::LinkPolicy;
use crate::link::{ConnectionAttemptState, LinkId, LinkStatus};
use crate::liveness::{Watchdog, race_with_liveness, wait_until};
use crate::node::TickContext;

/// Station credentials for the network link.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: &'static str,
    pub password: &'static str,
}

impl Credentials {
    #[must_use]
    pub const fn new(ssid: &'static str, password: &'static str) -> Self {
        Self { ssid, password }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Physical network transport.
pub trait Transport {
    type Error: fmt::Debug;

    /// Returns `true` while the link can carry traffic.
    fn is_connected(&self) -> bool;

    /// Issues a connect request; completion is observed through [`Self::is_connected`].
    async fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), Self::Error>;

    /// Tears the link down. `force` also drops any cached association.
    ///
    /// Callers abandon a disconnect that outlives the connect timeout.
    async fn disconnect(&mut self, force: bool);

    /// Received signal strength in dBm, when the transport reports it.
    fn signal_strength(&self) -> Option<i8> {
        None
    }
}

/// Keeps the network link up with rate-limited, bounded reconnects.
pub struct NetworkLinkManager<T: Transport, I> {
    transport: T,
    credentials: Credentials,
    policy: LinkPolicy,
    state: ConnectionAttemptState<I>,
    last_error: Option<T::Error>,
}

impl<T, I> NetworkLinkManager<T, I>
where
    T: Transport,
    I: NodeInstant,
{
    #[must_use]
    pub const fn new(transport: T, credentials: Credentials, policy: LinkPolicy) -> Self {
        Self {
            transport,
            credentials,
            policy,
            state: ConnectionAttemptState::new(policy.retry_interval),
            last_error: None,
        }
    }

    #[must_use]
    pub const fn status(&self) -> LinkStatus {
        self.state.status()
    }

    #[must_use]
    pub const fn state(&self) -> &ConnectionAttemptState<I> {
        &self.state
    }

    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Error reported by the most recent rejected connect request.
    #[must_use]
    pub const fn last_error(&self) -> Option<&T::Error> {
        self.last_error.as_ref()
    }

    /// Signal strength of the current link, only while connected.
    #[must_use]
    pub fn signal_strength(&self) -> Option<i8> {
        if self.state.status().is_connected() {
            self.transport.signal_strength()
        } else {
            None
        }
    }

    /// Returns `true` when the link is usable, attempting a reconnect when allowed.
    pub async fn ensure_connected<C, W>(&mut self, ctx: &mut TickContext<'_, C, W>) -> bool
    where
        C: Clock<Instant = I>,
        W: Watchdog,
    {
        let now = ctx.clock.now();
        let transport_up = self.transport.is_connected();

        match self.state.status() {
            LinkStatus::Connected if transport_up => return true,
            LinkStatus::Connected => {
                self.state.mark_dropped();
                ctx.telemetry.record_link_dropped(LinkId::Network, None, now);
            }
            // The transport re-associated on its own, or finished after the last timeout.
            _ if transport_up => {
                self.state.record_success();
                ctx.telemetry.record_link_up(LinkId::Network, now, now);
                return true;
            }
            _ => {}
        }

        if !self.state.attempt_due(now) {
            return false;
        }

        self.attempt(ctx).await
    }

    /// Drops the link regardless of its state. The retry rate limit still applies afterwards.
    pub async fn force_reset<C, W>(&mut self, ctx: &mut TickContext<'_, C, W>)
    where
        C: Clock<Instant = I>,
        W: Watchdog,
    {
        self.release(ctx).await;
        self.state.mark_dropped();
        ctx.telemetry
            .record_forced_reset(LinkId::Network, ctx.clock.now());
    }

    /// Forced disconnect bounded by the connect timeout. Returns `false` when it was abandoned.
    async fn release<C, W>(&mut self, ctx: &mut TickContext<'_, C, W>) -> bool
    where
        C: Clock<Instant = I>,
        W: Watchdog,
    {
        race_with_liveness(
            ctx.clock,
            ctx.liveness,
            self.policy.connect_timeout,
            self.policy.poll_interval,
            self.transport.disconnect(true),
        )
        .await
        .is_some()
    }

    async fn attempt<C, W>(&mut self, ctx: &mut TickContext<'_, C, W>) -> bool
    where
        C: Clock<Instant = I>,
        W: Watchdog,
    {
        let started = ctx.clock.now();
        self.state.begin_attempt(started);
        ctx.telemetry.record_link_attempt(
            LinkId::Network,
            self.state.consecutive_failures(),
            started,
        );

        // Start from a clean slate so a half-open association cannot wedge the attempt.
        if !self.release(ctx).await {
            let finished = ctx.clock.now();
            let failures = self.state.record_failure();
            ctx.telemetry
                .record_link_failed(LinkId::Network, failures, None, started, finished);
            return false;
        }
        if !self.policy.settle_delay.is_zero() {
            ctx.clock.sleep(self.policy.settle_delay).await;
        }

        let timeout = self.policy.connect_timeout;
        let poll = self.policy.poll_interval;
        let issued_at = ctx.clock.now();
        let request = race_with_liveness(
            ctx.clock,
            ctx.liveness,
            timeout,
            poll,
            self.transport.begin_connect(&self.credentials),
        )
        .await;

        let connected = match request {
            Some(Ok(())) => {
                let spent = ctx.clock.now().saturating_duration_since(issued_at);
                let transport = &self.transport;
                wait_until(
                    ctx.clock,
                    ctx.liveness,
                    timeout.saturating_sub(spent),
                    poll,
                    || transport.is_connected(),
                )
                .await
            }
            Some(Err(error)) => {
                self.last_error = Some(error);
                false
            }
            None => false,
        };

        let finished = ctx.clock.now();
        if connected {
            self.state.record_success();
            self.last_error = None;
            ctx.telemetry
                .record_link_up(LinkId::Network, started, finished);
        } else {
            let failures = self.state.record_failure();
            ctx.telemetry
                .record_link_failed(LinkId::Network, failures, None, started, finished);
        }

        connected
    }
}
