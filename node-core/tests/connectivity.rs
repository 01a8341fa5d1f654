mod support;

use core::time::Duration;

use node_core::clock::{Clock, NodeInstant};
use node_core::config::{BROKER_RETRY_INTERVAL, NETWORK_RETRY_INTERVAL, NodeConfig};
use node_core::link::{LinkId, LinkStatus};
use node_core::network::Credentials;
use node_core::node::{Node, NodeError, NodeParts};
use node_core::publish::{PublishOutcome, SampleMailbox};
use node_core::telemetry::{TelemetryEventKind, TelemetryPayload};

use support::{
    ConnectScript, CountingWatchdog, FixedGauge, ScriptedBroker, ScriptedTransport, TestNode,
    VirtualClock, build_node, step,
};

fn run_until(
    node: &mut TestNode<'_>,
    max_ticks: usize,
    mut done: impl FnMut(&TestNode<'_>) -> bool,
) -> usize {
    for ticks in 0..max_ticks {
        if done(node) {
            return ticks;
        }
        step(node);
    }
    panic!("condition not reached within {max_ticks} ticks");
}

#[test]
fn first_attempts_succeed_and_sample_is_delivered() {
    let mailbox = SampleMailbox::new();
    let mut node = build_node(
        &mailbox,
        ScriptedTransport::new(ConnectScript::Succeed),
        ScriptedBroker::new(true),
    );

    let report = step(&mut node);
    assert!(report.network_up);
    assert!(report.session_up);

    mailbox.post(17);
    step(&mut node);

    assert!(!mailbox.is_pending(), "sample should clear within one tick");
    assert_eq!(node.network().state().consecutive_failures(), 0);
    assert_eq!(node.session().state().consecutive_failures(), 0);
    assert_eq!(
        node.session().client().published,
        vec![("middlines/Atwater/count".to_string(), "17".to_string())]
    );
}

#[test]
fn network_failures_count_up_then_reset_and_respect_rate_limit() {
    let mailbox = SampleMailbox::new();
    let transport = ScriptedTransport::with_script(
        ConnectScript::Succeed,
        &[ConnectScript::Reject; 4],
    );
    let mut node = build_node(&mailbox, transport, ScriptedBroker::new(true));

    let mut failures = Vec::new();
    let mut attempt_times = Vec::new();
    let mut seen_calls = 0;
    run_until(&mut node, 2_000, |node| {
        let calls = node.network().transport().begin_calls;
        if calls != seen_calls {
            seen_calls = calls;
            failures.push(node.network().state().consecutive_failures());
            if let Some(at) = node.network().state().last_attempt() {
                attempt_times.push(at.as_millis());
            }
        }
        node.network().status() == LinkStatus::Connected
    });

    assert_eq!(failures, vec![1, 2, 3, 4, 0]);
    assert_eq!(attempt_times.len(), 5);
    for pair in attempt_times.windows(2) {
        assert!(
            pair[1] - pair[0] >= NETWORK_RETRY_INTERVAL.as_millis() as u64,
            "attempts at {} and {} violate the retry interval",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn chronic_broker_failures_force_network_reset() {
    let mailbox = SampleMailbox::new();
    let transport =
        ScriptedTransport::with_script(ConnectScript::Reject, &[ConnectScript::Succeed]);
    let mut node = build_node(&mailbox, transport, ScriptedBroker::new(false));

    run_until(&mut node, 2_000, |node| node.session().escalations() == 1);

    let threshold = node.config().escalation.broker_failure_threshold;
    assert_eq!(node.session().client().connect_calls, threshold);
    assert_eq!(node.network().status(), LinkStatus::Disconnected);
    assert_eq!(node.session().state().consecutive_failures(), 0);
    assert!(!node.network().transport().link_up());

    let kinds: Vec<_> = node.telemetry().oldest_first().map(|r| r.event).collect();
    let escalation = kinds
        .iter()
        .position(|kind| *kind == TelemetryEventKind::Escalation)
        .expect("escalation recorded");
    assert_eq!(
        kinds.get(escalation + 1),
        Some(&TelemetryEventKind::LinkForcedReset(LinkId::Network))
    );

    // The network stays down for a while; the broker must not be retried meanwhile.
    for _ in 0..600 {
        let report = step(&mut node);
        assert!(!report.session_up);
    }
    assert_eq!(node.session().client().connect_calls, threshold);
    assert!(node.network().state().consecutive_failures() > 0);

    node.transport_mut().fallback = ConnectScript::Succeed;
    node.client_mut().connect_fallback = true;
    run_until(&mut node, 2_000, |node| node.session().has_session());

    assert_eq!(node.session().client().connect_calls, threshold + 1);
    let kinds: Vec<_> = node.telemetry().oldest_first().map(|r| r.event).collect();
    let broker_attempt = kinds
        .iter()
        .rposition(|kind| *kind == TelemetryEventKind::LinkAttempt(LinkId::Broker))
        .expect("broker attempt recorded");
    let network_up = kinds
        .iter()
        .rposition(|kind| *kind == TelemetryEventKind::LinkUp(LinkId::Network))
        .expect("network reconnect recorded");
    assert!(
        network_up < broker_attempt,
        "broker retried before the network came back"
    );
}

#[test]
fn broker_failures_below_threshold_do_not_escalate() {
    let mailbox = SampleMailbox::new();
    let mut broker = ScriptedBroker::new(true);
    broker.connect_script.extend([false; 4]);
    let mut node = build_node(
        &mailbox,
        ScriptedTransport::new(ConnectScript::Succeed),
        broker,
    );

    run_until(&mut node, 2_000, |node| node.session().has_session());

    assert_eq!(node.session().escalations(), 0);
    assert_eq!(node.network().transport().begin_calls, 1);
    assert_eq!(node.session().state().consecutive_failures(), 0);
}

#[test]
fn broker_retries_are_spaced_by_retry_interval_while_network_is_up() {
    let mailbox = SampleMailbox::new();
    let mut broker = ScriptedBroker::new(true);
    broker.connect_script.extend([false; 4]);
    let mut node = build_node(
        &mailbox,
        ScriptedTransport::new(ConnectScript::Succeed),
        broker,
    );

    let mut attempt_times = Vec::new();
    let mut seen_calls = 0;
    run_until(&mut node, 2_000, |node| {
        let calls = node.session().client().connect_calls;
        if calls != seen_calls {
            seen_calls = calls;
            if let Some(at) = node.session().state().last_attempt() {
                attempt_times.push(at.as_millis());
            }
        }
        node.session().has_session()
    });

    assert_eq!(attempt_times.len(), 5);
    assert_eq!(node.network().transport().begin_calls, 1);
    for pair in attempt_times.windows(2) {
        assert!(
            pair[1] - pair[0] >= BROKER_RETRY_INTERVAL.as_millis() as u64,
            "broker attempts at {} and {} violate the retry interval",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn hung_broker_connect_times_out_without_starving_liveness() {
    let mailbox = SampleMailbox::new();
    let mut broker = ScriptedBroker::new(true);
    broker.hang_connect = true;
    let mut node = build_node(
        &mailbox,
        ScriptedTransport::new(ConnectScript::Succeed),
        broker,
    );

    let report = step(&mut node);
    assert!(report.network_up);
    assert!(!report.session_up);

    let record = node
        .telemetry()
        .oldest_first()
        .find(|record| record.event == TelemetryEventKind::LinkFailed(LinkId::Broker))
        .expect("broker failure recorded");
    let TelemetryPayload::Link(link) = record.details else {
        panic!("unexpected payload {:?}", record.details);
    };
    assert_eq!(link.error_code, Some(-4));
    assert_eq!(link.attempt_duration, Some(Duration::from_secs(10)));

    let liveness = node.liveness();
    assert!(liveness.longest_gap() <= Duration::from_millis(250));
    assert!(liveness.watchdog().feeds >= 40);
    assert!(liveness.longest_gap() < liveness.deadline());
}

#[test]
fn silent_network_connect_is_bounded_by_timeout() {
    let mailbox = SampleMailbox::new();
    let mut node = build_node(
        &mailbox,
        ScriptedTransport::new(ConnectScript::Never),
        ScriptedBroker::new(true),
    );

    let report = step(&mut node);
    assert!(!report.network_up);
    assert_eq!(node.network().state().consecutive_failures(), 1);

    let elapsed = node.clock().now().as_millis();
    let policy = node.config().escalation.network;
    let bound = (policy.settle_delay + policy.connect_timeout + node.config().tick_interval)
        .as_millis() as u64;
    assert!(elapsed <= bound, "attempt took {elapsed} ms");
    assert!(node.liveness().longest_gap() < node.config().liveness_deadline);
    assert_eq!(node.session().client().connect_calls, 0);
}

#[test]
fn slow_association_within_timeout_counts_as_success() {
    let mailbox = SampleMailbox::new();
    let mut node = build_node(
        &mailbox,
        ScriptedTransport::new(ConnectScript::SucceedAfterPolls(8)),
        ScriptedBroker::new(true),
    );

    let report = step(&mut node);
    assert!(report.network_up);
    assert!(report.session_up);
    assert_eq!(node.network().state().consecutive_failures(), 0);
}

#[test]
fn dropped_network_is_noticed_and_retried() {
    let mailbox = SampleMailbox::new();
    let mut node = build_node(
        &mailbox,
        ScriptedTransport::new(ConnectScript::Succeed),
        ScriptedBroker::new(true),
    );
    step(&mut node);

    node.clock().advance(NETWORK_RETRY_INTERVAL);
    node.transport_mut().drop_link();
    let report = step(&mut node);

    assert!(report.network_up, "retry is due, so the same tick reconnects");
    assert_eq!(node.network().transport().begin_calls, 2);
    assert!(
        node.telemetry()
            .oldest_first()
            .any(|record| record.event == TelemetryEventKind::LinkDropped(LinkId::Network))
    );
}

#[test]
fn session_is_not_used_while_the_network_is_down() {
    let mailbox = SampleMailbox::new();
    let mut node = build_node(
        &mailbox,
        ScriptedTransport::new(ConnectScript::Succeed),
        ScriptedBroker::new(true),
    );
    let report = step(&mut node);
    assert!(report.session_up);

    // The client keeps claiming a session after the link goes away.
    node.transport_mut().fallback = ConnectScript::Reject;
    node.clock().advance(NETWORK_RETRY_INTERVAL);
    node.transport_mut().drop_link();
    mailbox.post(99);
    let report = step(&mut node);

    assert!(!report.network_up);
    assert!(!report.session_up);
    assert_eq!(report.publish, PublishOutcome::NoSession);
    assert_eq!(node.session().client().publish_calls, 0);
    assert!(node.session().client().published.is_empty());
    assert!(mailbox.is_pending());
    assert_eq!(node.session().status(), LinkStatus::Disconnected);
    assert!(
        node.telemetry()
            .oldest_first()
            .any(|record| record.event == TelemetryEventKind::LinkDropped(LinkId::Broker))
    );
}

#[test]
fn hung_disconnect_is_abandoned_without_starving_liveness() {
    let mailbox = SampleMailbox::new();
    let mut transport = ScriptedTransport::new(ConnectScript::Succeed);
    transport.hang_disconnect = true;
    let mut node = build_node(&mailbox, transport, ScriptedBroker::new(true));

    let report = step(&mut node);
    assert!(!report.network_up);
    assert_eq!(node.network().transport().disconnect_calls, 1);
    assert_eq!(
        node.network().transport().begin_calls,
        0,
        "connect must not be issued over an unfinished disconnect"
    );
    assert_eq!(node.network().state().consecutive_failures(), 1);

    let policy = node.config().escalation.network;
    let elapsed = node.clock().now().as_millis();
    let bound = (policy.connect_timeout + node.config().tick_interval).as_millis() as u64;
    assert!(elapsed <= bound, "abandoned disconnect took {elapsed} ms");
    let liveness = node.liveness();
    assert!(liveness.longest_gap() <= policy.poll_interval);
    assert!(liveness.watchdog().feeds >= 40);

    node.transport_mut().hang_disconnect = false;
    run_until(&mut node, 2_000, |node| node.network().status() == LinkStatus::Connected);
    assert_eq!(node.network().transport().begin_calls, 1);
    assert_eq!(node.network().state().consecutive_failures(), 0);
}

#[test]
fn hung_disconnect_does_not_stall_escalation() {
    let mailbox = SampleMailbox::new();
    let mut node = build_node(
        &mailbox,
        ScriptedTransport::new(ConnectScript::Succeed),
        ScriptedBroker::new(false),
    );
    step(&mut node);
    node.transport_mut().hang_disconnect = true;

    run_until(&mut node, 2_000, |node| node.session().escalations() == 1);

    assert_eq!(node.network().status(), LinkStatus::Disconnected);
    assert!(
        node.telemetry()
            .oldest_first()
            .any(|record| record.event == TelemetryEventKind::LinkForcedReset(LinkId::Network))
    );
    assert!(node.liveness().longest_gap() <= node.config().escalation.network.poll_interval);
}

#[test]
fn dropped_session_is_noticed_during_service() {
    let mailbox = SampleMailbox::new();
    let mut node = build_node(
        &mailbox,
        ScriptedTransport::new(ConnectScript::Succeed),
        ScriptedBroker::new(true),
    );
    step(&mut node);

    node.client_mut().drop_on_service = true;
    step(&mut node);
    assert_eq!(node.session().status(), LinkStatus::Disconnected);

    let dropped = node.telemetry().latest().expect("drop recorded");
    assert_eq!(
        dropped.event,
        TelemetryEventKind::LinkDropped(LinkId::Broker)
    );
    assert_eq!(
        dropped.details,
        TelemetryPayload::Link(
            node_core::telemetry::LinkTelemetry::new(0).with_error_code(-3)
        )
    );

    run_until(&mut node, 200, |node| node.session().has_session());
    assert_eq!(node.session().client().connect_calls, 2);
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let mailbox = SampleMailbox::new();
    let mut config = NodeConfig::default();
    config.escalation.broker_failure_threshold = 0;

    let result = Node::new(
        config,
        NodeParts {
            clock: VirtualClock::default(),
            transport: ScriptedTransport::new(ConnectScript::Succeed),
            client: ScriptedBroker::new(true),
            watchdog: CountingWatchdog::default(),
            gauge: FixedGauge(None),
            mailbox: &mailbox,
            credentials: Credentials::new("ssid", "password"),
        },
    );

    assert!(matches!(
        result,
        Err(NodeError::Config(
            node_core::config::ConfigError::ZeroFailureThreshold
        ))
    ));
}
