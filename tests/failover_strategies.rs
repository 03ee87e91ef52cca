//! Failover selection scenarios across strategies

use std::collections::HashSet;
use std::time::Duration;

use sip_event_core::presence::{FailoverManager, FailoverStrategy, PresenceServerEndpoint};

fn servers() -> Vec<PresenceServerEndpoint> {
    vec![
        PresenceServerEndpoint::new("s1", 9000, 0),
        PresenceServerEndpoint::new("s2", 9000, 1),
        PresenceServerEndpoint::new("s3", 9000, 2),
    ]
}

#[test]
fn test_failure_moves_round_robin_to_next_server() {
    let manager = FailoverManager::new(
        servers(),
        FailoverStrategy::RoundRobin,
        Duration::from_secs(10),
    );

    let first = manager.get_next_server().unwrap();
    assert_eq!(first.host, "s1");
    manager.report_failure(&first, "connection refused");

    let second = manager.get_next_server().unwrap();
    assert_eq!(second.host, "s2");

    // Three consecutive failures drop s1 from the healthy set
    manager.report_failure(&first, "timeout");
    manager.report_failure(&first, "timeout");
    assert_eq!(manager.healthy_count(), 2);

    manager.report_success(&first);
    assert_eq!(manager.healthy_count(), 3);
}

#[test]
fn test_round_robin_visits_each_healthy_server_once() {
    for n in [1usize, 2, 5] {
        let endpoints: Vec<_> = (0..n)
            .map(|i| PresenceServerEndpoint::new(format!("srv{i}"), 9000, i as i32))
            .collect();
        let manager = FailoverManager::new(
            endpoints,
            FailoverStrategy::RoundRobin,
            Duration::from_secs(10),
        );

        let mut seen = HashSet::new();
        for _ in 0..n {
            let server = manager.get_next_server().unwrap();
            manager.report_success(&server);
            assert!(seen.insert(server.host.clone()), "server visited twice in one round");
        }
        assert_eq!(seen.len(), n);
    }
}

#[test]
fn test_selection_never_returns_empty_with_servers_configured() {
    for strategy in [
        FailoverStrategy::RoundRobin,
        FailoverStrategy::Priority,
        FailoverStrategy::Random,
    ] {
        let manager = FailoverManager::new(servers(), strategy, Duration::from_secs(100));
        // Push every server into cooldown
        for server in servers() {
            manager.report_failure(&server, "down");
            manager.report_failure(&server, "down");
        }
        assert!(!manager.any_server_available());
        for _ in 0..10 {
            assert!(
                manager.get_next_server().is_some(),
                "selection must not starve under {strategy:?}"
            );
        }
    }
}

#[test]
fn test_priority_follows_configured_order_under_failures() {
    let manager = FailoverManager::new(
        servers(),
        FailoverStrategy::Priority,
        Duration::from_secs(100),
    );
    assert_eq!(manager.get_next_server().unwrap().host, "s1");

    manager.report_failure(&servers()[0], "down");
    assert_eq!(manager.get_next_server().unwrap().host, "s2");

    manager.report_failure(&servers()[1], "down");
    assert_eq!(manager.get_next_server().unwrap().host, "s3");
}
