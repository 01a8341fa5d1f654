use std::cell::Cell;
use std::fs::{self, OpenOptions};
use std::future::poll_fn;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::rc::Rc;
use std::task::Poll;
use std::time::Duration;

use embassy_futures::block_on;
use embassy_futures::select::{Either, select};
use node_core::broker::{BrokerClient, SessionErrorCode};
use node_core::clock::{Clock, NodeInstant};
use node_core::config::{BrokerEndpoint, NodeConfig, NodeIdentity};
use node_core::liveness::NoopWatchdog;
use node_core::network::{Credentials, Transport};
use node_core::node::{Node, NodeParts, TickReport};
use node_core::publish::{PublishOutcome, SampleMailbox};
use node_core::status::ResourceGauge;
use node_core::telemetry::EventId;

/// Virtual time between occupancy samples once the node is running.
const SAMPLE_PERIOD: Duration = Duration::from_secs(7);

/// Upper bound on virtual time per run, so a node that never bootstraps still ends.
const VIRTUAL_TIME_LIMIT: Duration = Duration::from_secs(3_600);

const SIMULATED_HEAP: u32 = 81_920;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Profile {
    Healthy,
    FlakyWifi,
    FlakyBroker,
    StaleLink,
    PublishGlitch,
}

impl Profile {
    pub const ALL: [Profile; 5] = [
        Profile::Healthy,
        Profile::FlakyWifi,
        Profile::FlakyBroker,
        Profile::StaleLink,
        Profile::PublishGlitch,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Profile::Healthy => "healthy",
            Profile::FlakyWifi => "flaky-wifi",
            Profile::FlakyBroker => "flaky-broker",
            Profile::StaleLink => "stale-link",
            Profile::PublishGlitch => "publish-glitch",
        }
    }

    pub fn log_path(self) -> String {
        format!("transcripts/{}.log", self.tag())
    }

    pub fn header(self) -> &'static str {
        match self {
            Profile::Healthy => "Occupancy node emulator: healthy network and broker",
            Profile::FlakyWifi => "Occupancy node emulator: rejected associations and a dropped link",
            Profile::FlakyBroker => "Occupancy node emulator: broker refusals and a lost session",
            Profile::StaleLink => {
                "Occupancy node emulator: broker unreachable until the link is reset"
            }
            Profile::PublishGlitch => "Occupancy node emulator: transient publish failures",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, String> {
        Profile::ALL
            .into_iter()
            .find(|profile| tag.eq_ignore_ascii_case(profile.tag()))
            .ok_or_else(|| {
                let known = Profile::ALL.map(Profile::tag).join(", ");
                format!("Unknown profile `{tag}` (expected one of {known})")
            })
    }

    fn scenario(self) -> Scenario {
        let base = Scenario {
            wifi_rejections: 0,
            association_polls: 4,
            wifi_drop_at: None,
            broker_refusals: 0,
            refuse_until_reassociated: false,
            session_drop_at: None,
            publish_failures: 0,
        };

        match self {
            Profile::Healthy => base,
            Profile::FlakyWifi => Scenario {
                wifi_rejections: 3,
                wifi_drop_at: Some(Duration::from_secs(90)),
                ..base
            },
            Profile::FlakyBroker => Scenario {
                broker_refusals: 3,
                session_drop_at: Some(Duration::from_secs(75)),
                ..base
            },
            Profile::StaleLink => Scenario {
                refuse_until_reassociated: true,
                ..base
            },
            Profile::PublishGlitch => Scenario {
                publish_failures: 2,
                ..base
            },
        }
    }
}

/// Fault knobs for one simulated run.
#[derive(Clone, Copy, Debug)]
struct Scenario {
    wifi_rejections: u32,
    association_polls: u32,
    wifi_drop_at: Option<Duration>,
    broker_refusals: u32,
    /// The broker refuses every session until the network has associated twice.
    refuse_until_reassociated: bool,
    session_drop_at: Option<Duration>,
    publish_failures: u32,
}

/// State shared by the simulated clock, access point, and broker.
#[derive(Debug, Default)]
struct World {
    now_ms: Cell<u64>,
    link_up: Cell<bool>,
    associations: Cell<u32>,
}

impl World {
    fn elapsed(&self) -> Duration {
        Duration::from_millis(self.now_ms.get())
    }

    /// Returns `true` once when `at` has passed, clearing the trigger.
    fn fire(&self, trigger: &Cell<Option<Duration>>) -> bool {
        match trigger.get() {
            Some(at) if self.elapsed() >= at => {
                trigger.set(None);
                true
            }
            _ => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SimInstant(u64);

impl std::ops::Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(u64::try_from(rhs.as_millis()).unwrap_or(u64::MAX)))
    }
}

impl NodeInstant for SimInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    fn as_millis(&self) -> u64 {
        self.0
    }
}

/// Sleeping advances virtual time and yields once so other futures get polled.
pub struct SimClock {
    world: Rc<World>,
}

impl Clock for SimClock {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(self.world.now_ms.get())
    }

    async fn sleep(&self, duration: Duration) {
        let step = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.world
            .now_ms
            .set(self.world.now_ms.get().saturating_add(step));
        embassy_futures::yield_now().await;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SimWifiError {
    AuthRejected,
}

pub struct SimTransport {
    world: Rc<World>,
    scenario: Scenario,
    attempts: u32,
    countdown: Cell<Option<u32>>,
    drop_at: Cell<Option<Duration>>,
}

impl SimTransport {
    fn new(world: Rc<World>, scenario: Scenario) -> Self {
        Self {
            world,
            scenario,
            attempts: 0,
            countdown: Cell::new(None),
            drop_at: Cell::new(scenario.wifi_drop_at),
        }
    }
}

impl Transport for SimTransport {
    type Error = SimWifiError;

    fn is_connected(&self) -> bool {
        if self.world.link_up.get() && self.world.fire(&self.drop_at) {
            self.world.link_up.set(false);
        }

        match self.countdown.get() {
            Some(0) => {
                self.countdown.set(None);
                self.world.link_up.set(true);
                self.world.associations.set(self.world.associations.get() + 1);
            }
            Some(remaining) => self.countdown.set(Some(remaining - 1)),
            None => {}
        }
        self.world.link_up.get()
    }

    async fn begin_connect(&mut self, _credentials: &Credentials) -> Result<(), SimWifiError> {
        self.attempts += 1;
        if self.attempts <= self.scenario.wifi_rejections {
            return Err(SimWifiError::AuthRejected);
        }
        self.countdown.set(Some(self.scenario.association_polls));
        Ok(())
    }

    async fn disconnect(&mut self, _force: bool) {
        self.world.link_up.set(false);
        self.countdown.set(None);
    }

    fn signal_strength(&self) -> Option<i8> {
        self.world.link_up.get().then_some(-61)
    }
}

pub struct SimBroker {
    world: Rc<World>,
    scenario: Scenario,
    state: SessionErrorCode,
    /// Association the session was opened over; a new association kills it.
    association: u32,
    connects: u32,
    publishes: u32,
    drop_at: Cell<Option<Duration>>,
}

impl SimBroker {
    fn new(world: Rc<World>, scenario: Scenario) -> Self {
        Self {
            world,
            scenario,
            state: SessionErrorCode::Disconnected,
            association: 0,
            connects: 0,
            publishes: 0,
            drop_at: Cell::new(scenario.session_drop_at),
        }
    }
}

impl SimBroker {
    fn current_state(&self) -> SessionErrorCode {
        let link_intact =
            self.world.link_up.get() && self.world.associations.get() == self.association;
        match self.state {
            SessionErrorCode::Connected if !link_intact => SessionErrorCode::ConnectionLost,
            state => state,
        }
    }
}

impl BrokerClient for SimBroker {
    fn is_session_active(&self) -> bool {
        self.current_state() == SessionErrorCode::Connected
    }

    async fn connect(&mut self, _client_id: &str) -> bool {
        self.connects += 1;
        self.state = if !self.world.link_up.get() {
            SessionErrorCode::ConnectFailed
        } else if self.connects <= self.scenario.broker_refusals
            || (self.scenario.refuse_until_reassociated && self.world.associations.get() < 2)
        {
            SessionErrorCode::Unavailable
        } else {
            SessionErrorCode::Connected
        };
        self.association = self.world.associations.get();
        self.is_session_active()
    }

    async fn service(&mut self) {
        if !self.is_session_active() {
            return;
        }
        if self.world.fire(&self.drop_at) {
            self.state = SessionErrorCode::ConnectionLost;
        }
    }

    async fn publish(&mut self, _topic: &str, _payload: &[u8]) -> bool {
        if !self.is_session_active() {
            return false;
        }
        self.publishes += 1;
        self.publishes > self.scenario.publish_failures
    }

    fn last_error_code(&self) -> i32 {
        self.current_state().to_raw()
    }
}

struct SimGauge;

impl ResourceGauge for SimGauge {
    fn free_memory(&self) -> Option<u32> {
        Some(SIMULATED_HEAP)
    }
}

type SimNode<'m> = Node<'m, SimClock, SimTransport, SimBroker, NoopWatchdog, SimGauge>;

/// Deterministic occupancy counts, one per [`SAMPLE_PERIOD`].
#[derive(Debug, Default)]
struct SampleFeed {
    produced: u32,
    last_at: Option<SimInstant>,
}

impl SampleFeed {
    fn due(&mut self, now: SimInstant) -> Option<u32> {
        if self
            .last_at
            .is_some_and(|at| now.saturating_duration_since(at) < SAMPLE_PERIOD)
        {
            return None;
        }
        self.last_at = Some(now);
        self.produced += 1;
        Some((self.produced * 7 + 3) % 40)
    }
}

/// Totals from one emulator run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u32,
    pub virtual_time: Duration,
    pub samples: u32,
    pub delivered: u32,
    pub failed_publishes: u32,
    pub escalations: u32,
    pub longest_liveness_gap: Duration,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ticks={} virtual={}ms samples={} delivered={} failed={} escalations={} longest-gap={}ms",
            self.ticks,
            self.virtual_time.as_millis(),
            self.samples,
            self.delivered,
            self.failed_publishes,
            self.escalations,
            self.longest_liveness_gap.as_millis()
        )
    }
}

pub fn emulator_config() -> NodeConfig {
    NodeConfig::new(
        NodeIdentity::new("Atwater-EMU", "middlines", "Atwater"),
        BrokerEndpoint::new("broker.emulator.local", BrokerEndpoint::DEFAULT_PORT),
    )
}

/// Runs `profile` for `ticks` loop passes after bootstrap, logging into `transcript`.
pub fn run_profile<W: Write>(
    profile: Profile,
    ticks: u32,
    transcript: &mut TranscriptLogger<W>,
) -> io::Result<RunSummary> {
    let world = Rc::new(World::default());
    let scenario = profile.scenario();
    let mailbox = SampleMailbox::new();

    let mut node: SimNode<'_> = Node::new(
        emulator_config(),
        NodeParts {
            clock: SimClock {
                world: Rc::clone(&world),
            },
            transport: SimTransport::new(Rc::clone(&world), scenario),
            client: SimBroker::new(Rc::clone(&world), scenario),
            watchdog: NoopWatchdog,
            gauge: SimGauge,
            mailbox: &mailbox,
            credentials: Credentials::new("emulator-ap", "emulator-pass"),
        },
    )
    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;

    transcript.write_header(profile)?;

    let observed = Cell::new(0u32);
    let halted = Cell::new(false);
    let mut failure: Option<io::Error> = None;
    let mut feed = SampleFeed::default();
    let mut cursor: EventId = 0;

    let run = node.run(|node, report| {
        observed.set(observed.get() + 1);
        if failure.is_some() {
            return;
        }
        if let Err(err) = record_tick(transcript, &mut cursor, &mut feed, node, report) {
            failure = Some(err);
            halted.set(true);
        }
    });
    let stop = poll_fn(|_| {
        if observed.get() >= ticks || halted.get() || world.elapsed() >= VIRTUAL_TIME_LIMIT {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    });
    match block_on(select(run, stop)) {
        Either::First(never) => match never {},
        Either::Second(()) => {}
    }

    if let Some(err) = failure {
        return Err(err);
    }

    let summary = RunSummary {
        ticks: observed.get(),
        virtual_time: world.elapsed(),
        samples: feed.produced,
        delivered: node.pipeline().delivered(),
        failed_publishes: node.pipeline().failed(),
        escalations: node.session().escalations(),
        longest_liveness_gap: node.liveness().longest_gap(),
    };
    transcript.append_line(world.elapsed(), TranscriptRole::Emulator, &summary.to_string())?;
    transcript.flush()?;
    Ok(summary)
}

fn record_tick<W: Write>(
    transcript: &mut TranscriptLogger<W>,
    cursor: &mut EventId,
    feed: &mut SampleFeed,
    node: &SimNode<'_>,
    report: &TickReport,
) -> io::Result<()> {
    let now = node.clock().now();
    let elapsed = Duration::from_millis(now.as_millis());

    for record in node.telemetry().since(*cursor) {
        if record.id != *cursor {
            let missed = record.id.wrapping_sub(*cursor);
            transcript.append_line(
                elapsed,
                TranscriptRole::Node,
                &format!("{missed} records overwritten before mirroring"),
            )?;
        }
        transcript.append_line(elapsed, TranscriptRole::Node, &record.to_string())?;
        *cursor = record.id.wrapping_add(1);
    }
    *cursor = node.telemetry().next_event_id();

    if let PublishOutcome::Failed(_) = report.publish {
        transcript.append_line(elapsed, TranscriptRole::Node, "publish will be retried")?;
    }

    if let Some(status) = &report.status {
        transcript.append_line(elapsed, TranscriptRole::Status, &status.to_string())?;
    }

    if let Some(count) = feed.due(now) {
        let generation = node.mailbox().post(count);
        transcript.append_line(
            elapsed,
            TranscriptRole::Sensor,
            &format!("count={count} gen={generation}"),
        )?;
    }
    Ok(())
}

pub struct TranscriptLogger<W: Write> {
    writer: W,
}

impl TranscriptLogger<BufWriter<fs::File>> {
    pub fn create(profile: Profile) -> io::Result<Self> {
        let path = profile.log_path();
        let path = Path::new(&path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> TranscriptLogger<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_header(&mut self, profile: Profile) -> io::Result<()> {
        writeln!(self.writer, "# {}", profile.header())?;
        writeln!(
            self.writer,
            "# Timestamps are milliseconds of virtual time since boot"
        )?;
        writeln!(self.writer)
    }

    fn append_line(&mut self, elapsed: Duration, role: TranscriptRole, line: &str) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

enum TranscriptRole {
    Node,
    Status,
    Sensor,
    Emulator,
}

impl TranscriptRole {
    fn prefix(&self) -> &'static str {
        match self {
            TranscriptRole::Node => "NODE<",
            TranscriptRole::Status => "STAT<",
            TranscriptRole::Sensor => "SENS>",
            TranscriptRole::Emulator => "EMU  ",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(profile: Profile, ticks: u32) -> (RunSummary, String) {
        let mut transcript = TranscriptLogger::new(Vec::new());
        let summary = run_profile(profile, ticks, &mut transcript).expect("in-memory run");
        let text = String::from_utf8(transcript.into_inner()).expect("utf-8 transcript");
        (summary, text)
    }

    #[test]
    fn profile_tags_parse_case_insensitively() {
        assert_eq!(Profile::from_tag("Flaky-WiFi"), Ok(Profile::FlakyWifi));
        assert!(Profile::from_tag("nope").unwrap_err().contains("stale-link"));
        assert_eq!(Profile::StaleLink.log_path(), "transcripts/stale-link.log");
    }

    #[test]
    fn healthy_run_delivers_every_sample() {
        let (summary, text) = run(Profile::Healthy, 1_200);

        assert_eq!(summary.ticks, 1_200);
        assert!(summary.samples >= 8);
        // The last sample may still be waiting for the next tick.
        assert!(summary.delivered + 1 >= summary.samples);
        assert_eq!(summary.escalations, 0);
        assert!(text.starts_with("# Occupancy node emulator: healthy"));
        assert!(text.contains("bootstrap-complete"));
        assert!(text.contains("STAT< [STAT] wifi=OK rssi=-61dBm mqtt=OK heap=81920"));
    }

    #[test]
    fn stale_link_escalates_to_a_network_reset() {
        let (summary, text) = run(Profile::StaleLink, 200);

        assert_eq!(summary.escalations, 1);
        assert!(text.contains("escalation broker-failures=5/5"));
        assert!(text.contains("wifi-forced-reset"));
        assert!(summary.delivered >= 1);
    }

    #[test]
    fn publish_glitch_retries_until_delivered() {
        let (summary, text) = run(Profile::PublishGlitch, 400);

        assert_eq!(summary.failed_publishes, 2);
        assert!(summary.delivered >= 1);
        assert!(text.contains("publish will be retried"));
    }

    #[test]
    fn flaky_wifi_recovers_after_the_link_drops() {
        let (summary, text) = run(Profile::FlakyWifi, 2_400);

        assert!(text.contains("wifi-dropped"));
        assert!(text.contains("mqtt-dropped"));
        // Samples produced during the outage may be superseded.
        assert!(summary.delivered + 2 >= summary.samples);
        assert!(summary.longest_liveness_gap < Duration::from_secs(1));
    }
}
