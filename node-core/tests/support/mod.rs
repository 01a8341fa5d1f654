#![allow(dead_code)]

use core::cell::Cell;
use core::future::Future;
use core::ops::Add;
use core::time::Duration;
use std::collections::VecDeque;

use node_core::broker::{BrokerClient, SessionErrorCode};
use node_core::clock::{Clock, NodeInstant};
use node_core::config::NodeConfig;
use node_core::liveness::Watchdog;
use node_core::network::{Credentials, Transport};
use node_core::node::{Node, NodeParts, TickReport};
use node_core::publish::SampleMailbox;
use node_core::status::ResourceGauge;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MockInstant(pub u64);

impl Add<Duration> for MockInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs.as_millis() as u64)
    }
}

impl NodeInstant for MockInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    fn as_millis(&self) -> u64 {
        self.0
    }
}

/// Clock whose sleeps advance virtual time and yield once.
#[derive(Default)]
pub struct VirtualClock {
    now_ms: Cell<u64>,
}

impl VirtualClock {
    pub fn advance(&self, duration: Duration) {
        self.now_ms.set(self.now_ms.get() + duration.as_millis() as u64);
    }
}

impl Clock for VirtualClock {
    type Instant = MockInstant;

    fn now(&self) -> MockInstant {
        MockInstant(self.now_ms.get())
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        embassy_futures::yield_now().await;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectScript {
    Succeed,
    SucceedAfterPolls(u32),
    Never,
    Reject,
}

/// Transport that follows a per-attempt script.
pub struct ScriptedTransport {
    connected: Cell<bool>,
    countdown: Cell<Option<u32>>,
    pub script: VecDeque<ConnectScript>,
    pub fallback: ConnectScript,
    pub begin_calls: u32,
    pub disconnect_calls: u32,
    pub hang_disconnect: bool,
    pub rssi: Option<i8>,
}

impl ScriptedTransport {
    pub fn new(fallback: ConnectScript) -> Self {
        Self {
            connected: Cell::new(false),
            countdown: Cell::new(None),
            script: VecDeque::new(),
            fallback,
            begin_calls: 0,
            disconnect_calls: 0,
            hang_disconnect: false,
            rssi: Some(-58),
        }
    }

    pub fn with_script(fallback: ConnectScript, script: &[ConnectScript]) -> Self {
        let mut transport = Self::new(fallback);
        transport.script.extend(script.iter().copied());
        transport
    }

    /// Simulates the access point going away.
    pub fn drop_link(&mut self) {
        self.connected.set(false);
        self.countdown.set(None);
    }

    pub fn link_up(&self) -> bool {
        self.connected.get()
    }
}

impl Transport for ScriptedTransport {
    type Error = ();

    fn is_connected(&self) -> bool {
        if let Some(remaining) = self.countdown.get() {
            if remaining == 0 {
                self.connected.set(true);
                self.countdown.set(None);
            } else {
                self.countdown.set(Some(remaining - 1));
            }
        }
        self.connected.get()
    }

    async fn begin_connect(&mut self, _credentials: &Credentials) -> Result<(), ()> {
        self.begin_calls += 1;
        match self.script.pop_front().unwrap_or(self.fallback) {
            ConnectScript::Succeed => {
                self.connected.set(true);
                Ok(())
            }
            ConnectScript::SucceedAfterPolls(polls) => {
                self.countdown.set(Some(polls));
                Ok(())
            }
            ConnectScript::Never => Ok(()),
            ConnectScript::Reject => Err(()),
        }
    }

    async fn disconnect(&mut self, _force: bool) {
        self.disconnect_calls += 1;
        self.drop_link();
        if self.hang_disconnect {
            core::future::pending::<()>().await;
        }
    }

    fn signal_strength(&self) -> Option<i8> {
        if self.connected.get() { self.rssi } else { None }
    }
}

/// Broker client with scripted connect and publish results.
pub struct ScriptedBroker {
    pub active: bool,
    pub connect_script: VecDeque<bool>,
    pub connect_fallback: bool,
    pub hang_connect: bool,
    pub connect_calls: u32,
    pub publish_script: VecDeque<bool>,
    pub publish_fallback: bool,
    pub published: Vec<(String, String)>,
    pub publish_calls: u32,
    pub service_calls: u32,
    pub drop_on_service: bool,
    pub state: SessionErrorCode,
}

impl ScriptedBroker {
    pub fn new(connect_fallback: bool) -> Self {
        Self {
            active: false,
            connect_script: VecDeque::new(),
            connect_fallback,
            hang_connect: false,
            connect_calls: 0,
            publish_script: VecDeque::new(),
            publish_fallback: true,
            published: Vec::new(),
            publish_calls: 0,
            service_calls: 0,
            drop_on_service: false,
            state: SessionErrorCode::Disconnected,
        }
    }
}

impl BrokerClient for ScriptedBroker {
    fn is_session_active(&self) -> bool {
        self.active
    }

    async fn connect(&mut self, _client_id: &str) -> bool {
        self.connect_calls += 1;
        if self.hang_connect {
            return core::future::pending::<bool>().await;
        }

        let accepted = self
            .connect_script
            .pop_front()
            .unwrap_or(self.connect_fallback);
        self.active = accepted;
        self.state = if accepted {
            SessionErrorCode::Connected
        } else {
            SessionErrorCode::Unavailable
        };
        accepted
    }

    async fn service(&mut self) {
        self.service_calls += 1;
        if self.drop_on_service {
            self.drop_on_service = false;
            self.active = false;
            self.state = SessionErrorCode::ConnectionLost;
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        self.publish_calls += 1;
        let accepted = self
            .publish_script
            .pop_front()
            .unwrap_or(self.publish_fallback);
        if accepted {
            self.published.push((
                topic.to_string(),
                String::from_utf8_lossy(payload).into_owned(),
            ));
        }
        accepted
    }

    fn last_error_code(&self) -> i32 {
        self.state.to_raw()
    }
}

#[derive(Default)]
pub struct CountingWatchdog {
    pub feeds: u32,
}

impl Watchdog for CountingWatchdog {
    fn feed(&mut self) {
        self.feeds += 1;
    }
}

pub struct FixedGauge(pub Option<u32>);

impl ResourceGauge for FixedGauge {
    fn free_memory(&self) -> Option<u32> {
        self.0
    }
}

pub type TestNode<'m> =
    Node<'m, VirtualClock, ScriptedTransport, ScriptedBroker, CountingWatchdog, FixedGauge>;

pub fn build_node(
    mailbox: &SampleMailbox,
    transport: ScriptedTransport,
    broker: ScriptedBroker,
) -> TestNode<'_> {
    build_node_with(NodeConfig::default(), mailbox, transport, broker)
}

pub fn build_node_with(
    config: NodeConfig,
    mailbox: &SampleMailbox,
    transport: ScriptedTransport,
    broker: ScriptedBroker,
) -> TestNode<'_> {
    Node::new(
        config,
        NodeParts {
            clock: VirtualClock::default(),
            transport,
            client: broker,
            watchdog: CountingWatchdog::default(),
            gauge: FixedGauge(Some(100_000)),
            mailbox,
            credentials: Credentials::new("test-ssid", "test-password"),
        },
    )
    .expect("default config is valid")
}

pub fn block_on<F: Future>(future: F) -> F::Output {
    embassy_futures::block_on(future)
}

/// Runs one tick followed by the loop's inter-tick pause.
pub fn step(node: &mut TestNode<'_>) -> TickReport {
    let report = block_on(node.tick());
    let pause = node.config().tick_interval;
    node.clock().advance(pause);
    report
}

/// Steps until at least `duration` of virtual time has passed.
pub fn run_for(node: &mut TestNode<'_>, duration: Duration) -> Vec<TickReport> {
    let until = node.clock().now() + duration;
    let mut reports = Vec::new();
    while node.clock().now() < until {
        reports.push(step(node));
    }
    reports
}
