//! Broker session management and escalation.
//!
//! [`BrokerSessionManager`] keeps the publish/subscribe session alive on top
//! of the network link. Session attempts are rate limited and bounded like
//! network attempts. When the session keeps failing while the network claims
//! to be healthy, the manager escalates: after `broker_failure_threshold`
//! consecutive failures it forces the network link down so the next tick
//! rebuilds both layers from scratch.

use core::fmt;

use crate::clock::{Clock, NodeInstant};
use crate::config::{EscalationPolicy, LinkPolicy};
use crate::link::{ConnectionAttemptState, LinkId, LinkStatus};
use crate::liveness::{Watchdog, race_with_liveness};
use crate::network::{NetworkLinkManager, Transport};
use crate::node::TickContext;

/// Publish/subscribe broker client.
pub trait BrokerClient {
    /// Returns `true` while the session is established.
    fn is_session_active(&self) -> bool;

    /// Opens a session under `client_id`, returning `true` on success.
    async fn connect(&mut self, client_id: &str) -> bool;

    /// Drains keepalive and control traffic. Must not block.
    async fn service(&mut self);

    /// Sends one message, returning `true` when the client accepted it.
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> bool;

    /// Raw state code of the client, see [`SessionErrorCode`].
    fn last_error_code(&self) -> i32;
}

/// Client state codes shared with the common embedded MQTT clients.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionErrorCode {
    ConnectionTimeout,
    ConnectionLost,
    ConnectFailed,
    Disconnected,
    Connected,
    BadProtocol,
    BadClientId,
    Unavailable,
    BadCredentials,
    Unauthorized,
    Other(i32),
}

impl SessionErrorCode {
    /// Encodes the state into its wire-compatible integer.
    #[must_use]
    pub const fn to_raw(self) -> i32 {
        match self {
            SessionErrorCode::ConnectionTimeout => -4,
            SessionErrorCode::ConnectionLost => -3,
            SessionErrorCode::ConnectFailed => -2,
            SessionErrorCode::Disconnected => -1,
            SessionErrorCode::Connected => 0,
            SessionErrorCode::BadProtocol => 1,
            SessionErrorCode::BadClientId => 2,
            SessionErrorCode::Unavailable => 3,
            SessionErrorCode::BadCredentials => 4,
            SessionErrorCode::Unauthorized => 5,
            SessionErrorCode::Other(code) => code,
        }
    }

    /// Maps a CONNACK return code onto the session state it produces.
    #[must_use]
    pub fn from_connack(return_code: u8) -> Self {
        match return_code {
            0 => SessionErrorCode::Connected,
            1 => SessionErrorCode::BadProtocol,
            2 => SessionErrorCode::BadClientId,
            3 => SessionErrorCode::Unavailable,
            4 => SessionErrorCode::BadCredentials,
            5 => SessionErrorCode::Unauthorized,
            other => SessionErrorCode::Other(i32::from(other)),
        }
    }
}

impl fmt::Display for SessionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionErrorCode::ConnectionTimeout => f.write_str("connection-timeout"),
            SessionErrorCode::ConnectionLost => f.write_str("connection-lost"),
            SessionErrorCode::ConnectFailed => f.write_str("connect-failed"),
            SessionErrorCode::Disconnected => f.write_str("disconnected"),
            SessionErrorCode::Connected => f.write_str("connected"),
            SessionErrorCode::BadProtocol => f.write_str("bad-protocol"),
            SessionErrorCode::BadClientId => f.write_str("bad-client-id"),
            SessionErrorCode::Unavailable => f.write_str("unavailable"),
            SessionErrorCode::BadCredentials => f.write_str("bad-credentials"),
            SessionErrorCode::Unauthorized => f.write_str("unauthorized"),
            SessionErrorCode::Other(code) => write!(f, "state({code})"),
        }
    }
}

/// Keeps the broker session up and escalates chronic failures to the network layer.
pub struct BrokerSessionManager<B, I> {
    client: B,
    client_id: &'static str,
    policy: LinkPolicy,
    failure_threshold: u32,
    state: ConnectionAttemptState<I>,
    escalations: u32,
}

impl<B, I> BrokerSessionManager<B, I>
where
    B: BrokerClient,
    I: NodeInstant,
{
    #[must_use]
    pub const fn new(client: B, client_id: &'static str, escalation: &EscalationPolicy) -> Self {
        Self {
            client,
            client_id,
            policy: escalation.broker,
            failure_threshold: escalation.broker_failure_threshold,
            state: ConnectionAttemptState::new(escalation.broker.retry_interval),
            escalations: 0,
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

    /// Number of times chronic failures forced a network reset.
    #[must_use]
    pub const fn escalations(&self) -> u32 {
        self.escalations
    }

    #[must_use]
    pub const fn client(&self) -> &B {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut B {
        &mut self.client
    }

    /// Returns `true` when a session is established and the client agrees.
    #[must_use]
    pub fn has_session(&self) -> bool {
        self.state.status().is_connected() && self.client.is_session_active()
    }

    /// Returns `true` when a session is usable, attempting to open one when allowed.
    pub async fn ensure_session<T, C, W>(
        &mut self,
        network: &mut NetworkLinkManager<T, I>,
        ctx: &mut TickContext<'_, C, W>,
    ) -> bool
    where
        T: Transport,
        C: Clock<Instant = I>,
        W: Watchdog,
    {
        let now = ctx.clock.now();
        if !network.status().is_connected() {
            // A client that still claims a session cannot be carrying traffic.
            if self.state.status().is_connected() {
                self.observe_drop(ctx, now);
            }
            return false;
        }

        let active = self.client.is_session_active();
        match self.state.status() {
            LinkStatus::Connected if active => return true,
            LinkStatus::Connected => self.observe_drop(ctx, now),
            _ if active => {
                self.state.record_success();
                ctx.telemetry.record_link_up(LinkId::Broker, now, now);
                return true;
            }
            _ => {}
        }

        if !self.state.attempt_due(now) {
            return false;
        }

        self.attempt(network, ctx).await
    }

    /// Services an established session and notices asynchronous disconnects.
    pub async fn service_session<C, W>(&mut self, ctx: &mut TickContext<'_, C, W>)
    where
        C: Clock<Instant = I>,
        W: Watchdog,
    {
        if !self.state.status().is_connected() {
            return;
        }

        if self.client.is_session_active() {
            self.client.service().await;
        }
        if !self.client.is_session_active() {
            let now = ctx.clock.now();
            self.observe_drop(ctx, now);
        }
    }

    fn observe_drop<C, W>(&mut self, ctx: &mut TickContext<'_, C, W>, now: I)
    where
        C: Clock<Instant = I>,
        W: Watchdog,
    {
        self.state.mark_dropped();
        ctx.telemetry
            .record_link_dropped(LinkId::Broker, Some(self.client.last_error_code()), now);
    }

    async fn attempt<T, C, W>(
        &mut self,
        network: &mut NetworkLinkManager<T, I>,
        ctx: &mut TickContext<'_, C, W>,
    ) -> bool
    where
        T: Transport,
        C: Clock<Instant = I>,
        W: Watchdog,
    {
        let started = ctx.clock.now();
        self.state.begin_attempt(started);
        ctx.telemetry.record_link_attempt(
            LinkId::Broker,
            self.state.consecutive_failures(),
            started,
        );

        let outcome = race_with_liveness(
            ctx.clock,
            ctx.liveness,
            self.policy.connect_timeout,
            self.policy.poll_interval,
            self.client.connect(self.client_id),
        )
        .await;

        let finished = ctx.clock.now();
        if outcome == Some(true) {
            self.state.record_success();
            ctx.telemetry
                .record_link_up(LinkId::Broker, started, finished);
            return true;
        }

        let code = match outcome {
            None => SessionErrorCode::ConnectionTimeout.to_raw(),
            Some(_) => self.client.last_error_code(),
        };
        let failures = self.state.record_failure();
        ctx.telemetry
            .record_link_failed(LinkId::Broker, failures, Some(code), started, finished);

        if failures >= self.failure_threshold {
            ctx.telemetry
                .record_escalation(failures, self.failure_threshold, finished);
            network.force_reset(ctx).await;
            self.state.reset_failures();
            self.escalations = self.escalations.saturating_add(1);
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connack_codes_map_to_refusals() {
        assert_eq!(SessionErrorCode::from_connack(0), SessionErrorCode::Connected);
        assert_eq!(
            SessionErrorCode::from_connack(5),
            SessionErrorCode::Unauthorized
        );
        assert_eq!(SessionErrorCode::from_connack(9).to_raw(), 9);
    }
}
