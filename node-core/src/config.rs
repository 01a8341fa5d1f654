//! Immutable runtime configuration for the node.
//!
//! Defaults reproduce the deployed node's constants. Everything is `const`
//! constructible so firmware can keep its configuration in flash.

use core::{fmt, time::Duration};

use crate::link::LinkId;

/// Capacity of the publish topic buffer, in bytes.
pub const TOPIC_CAPACITY: usize = 64;

/// Delay between network connection attempts.
pub const NETWORK_RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound on a single network connection attempt.
pub const NETWORK_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Interval at which a pending network connection is polled.
pub const NETWORK_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Pause after forcing the transport down before reconnecting.
pub const NETWORK_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Delay between broker session attempts.
pub const BROKER_RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound on a single broker session attempt.
pub const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Liveness refresh cadence while a session connect is in flight.
pub const BROKER_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Consecutive broker failures that force the network link down.
pub const BROKER_FAILURE_THRESHOLD: u32 = 5;

/// Watchdog deadline; a missed refresh for this long restarts the node.
pub const LIVENESS_DEADLINE: Duration = Duration::from_secs(60);
/// Pause at the end of every loop iteration.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);
/// Cadence of the status summary line.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(30);
/// Pause between bootstrap rounds while waiting for connectivity.
pub const BOOTSTRAP_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Retry and timeout policy for one link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinkPolicy {
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
}

impl LinkPolicy {
    /// Policy applied to the network (WiFi) link.
    #[must_use]
    pub const fn network() -> Self {
        Self {
            retry_interval: NETWORK_RETRY_INTERVAL,
            connect_timeout: NETWORK_CONNECT_TIMEOUT,
            poll_interval: NETWORK_POLL_INTERVAL,
            settle_delay: NETWORK_SETTLE_DELAY,
        }
    }

    /// Policy applied to the broker session.
    #[must_use]
    pub const fn broker() -> Self {
        Self {
            retry_interval: BROKER_RETRY_INTERVAL,
            connect_timeout: BROKER_CONNECT_TIMEOUT,
            poll_interval: BROKER_POLL_INTERVAL,
            settle_delay: Duration::ZERO,
        }
    }
}

/// Per-link policies plus the threshold that escalates broker trouble to a network reset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub network: LinkPolicy,
    pub broker: LinkPolicy,
    pub broker_failure_threshold: u32,
}

impl EscalationPolicy {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            network: LinkPolicy::network(),
            broker: LinkPolicy::broker(),
            broker_failure_threshold: BROKER_FAILURE_THRESHOLD,
        }
    }
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Names the node presents to the broker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    pub client_id: &'static str,
    pub namespace: &'static str,
    pub location: &'static str,
}

impl NodeIdentity {
    #[must_use]
    pub const fn new(
        client_id: &'static str,
        namespace: &'static str,
        location: &'static str,
    ) -> Self {
        Self {
            client_id,
            namespace,
            location,
        }
    }

    /// Length of `<namespace>/<location>/count` in bytes.
    #[must_use]
    pub const fn topic_len(&self) -> usize {
        self.namespace.len() + 1 + self.location.len() + "/count".len()
    }
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self::new("Atwater-ESP32", "middlines", "Atwater")
    }
}

/// Broker address and session timing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: &'static str,
    pub port: u16,
    pub keepalive: Duration,
    pub socket_timeout: Duration,
}

impl BrokerEndpoint {
    /// Plain MQTT port.
    pub const DEFAULT_PORT: u16 = 1883;

    #[must_use]
    pub const fn new(host: &'static str, port: u16) -> Self {
        Self {
            host,
            port,
            keepalive: Duration::from_secs(60),
            socket_timeout: BROKER_CONNECT_TIMEOUT,
        }
    }
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self::new("mqtt.middlines.com", Self::DEFAULT_PORT)
    }
}

/// Complete node configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    pub identity: NodeIdentity,
    pub endpoint: BrokerEndpoint,
    pub escalation: EscalationPolicy,
    pub liveness_deadline: Duration,
    pub tick_interval: Duration,
    pub status_interval: Duration,
    pub bootstrap_retry: Duration,
}

impl NodeConfig {
    /// Builds a configuration with default timing for the supplied identity and endpoint.
    #[must_use]
    pub const fn new(identity: NodeIdentity, endpoint: BrokerEndpoint) -> Self {
        Self {
            identity,
            endpoint,
            escalation: EscalationPolicy::new(),
            liveness_deadline: LIVENESS_DEADLINE,
            tick_interval: TICK_INTERVAL,
            status_interval: STATUS_INTERVAL,
            bootstrap_retry: BOOTSTRAP_RETRY_INTERVAL,
        }
    }

    /// Checks the cross-field constraints the runtime relies on.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.escalation.broker_failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if self.liveness_deadline <= self.tick_interval {
            return Err(ConfigError::DeadlineNotAboveTick);
        }
        if self.liveness_deadline <= self.bootstrap_retry {
            return Err(ConfigError::DeadlineNotAboveTick);
        }

        for (link, policy) in [
            (LinkId::Network, &self.escalation.network),
            (LinkId::Broker, &self.escalation.broker),
        ] {
            if policy.retry_interval.is_zero() {
                return Err(ConfigError::ZeroRetryInterval(link));
            }
            if policy.poll_interval.is_zero() {
                return Err(ConfigError::ZeroPollInterval(link));
            }
            if policy.poll_interval >= self.liveness_deadline
                || policy.settle_delay >= self.liveness_deadline
            {
                return Err(ConfigError::WaitExceedsDeadline(link));
            }
        }

        if self.identity.topic_len() > TOPIC_CAPACITY {
            return Err(ConfigError::TopicTooLong);
        }

        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new(NodeIdentity::default(), BrokerEndpoint::default())
    }
}

/// Configuration constraint violations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    ZeroFailureThreshold,
    DeadlineNotAboveTick,
    ZeroRetryInterval(LinkId),
    ZeroPollInterval(LinkId),
    WaitExceedsDeadline(LinkId),
    TopicTooLong,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroFailureThreshold => {
                f.write_str("broker failure threshold must be at least 1")
            }
            ConfigError::DeadlineNotAboveTick => {
                f.write_str("liveness deadline must exceed the tick and bootstrap pauses")
            }
            ConfigError::ZeroRetryInterval(link) => write!(f, "{link} retry interval is zero"),
            ConfigError::ZeroPollInterval(link) => write!(f, "{link} poll interval is zero"),
            ConfigError::WaitExceedsDeadline(link) => {
                write!(f, "{link} wait step exceeds the liveness deadline")
            }
            ConfigError::TopicTooLong => write!(f, "topic exceeds {TOPIC_CAPACITY} bytes"),
        }
    }
}
