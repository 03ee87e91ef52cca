//! Presence server failover
//!
//! Tracks per-server health and picks the next endpoint to try according to
//! the configured strategy. Failures put a server into a progressive
//! cooldown; three consecutive failures mark it unhealthy. Selection never
//! starves: with every server cooling down, the one whose cooldown expires
//! first is returned anyway.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Deserialize;
use tracing::{info, warn};

/// A configured presence feed endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PresenceServerEndpoint {
    pub host: String,
    pub port: u16,
    /// Lower wins under the priority strategy
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: i32,
}

fn default_weight() -> i32 {
    1
}

impl PresenceServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16, priority: i32) -> Self {
        Self {
            host: host.into(),
            port,
            priority,
            weight: 1,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStrategy {
    RoundRobin,
    Priority,
    Random,
}

impl Default for FailoverStrategy {
    fn default() -> Self {
        FailoverStrategy::RoundRobin
    }
}

/// Health snapshot for one server
#[derive(Debug, Clone)]
pub struct ServerHealth {
    pub endpoint: PresenceServerEndpoint,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_attempt: Option<Instant>,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub cooldown_until: Option<Instant>,
}

impl ServerHealth {
    fn new(endpoint: PresenceServerEndpoint) -> Self {
        Self {
            endpoint,
            is_healthy: true,
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
            last_attempt: None,
            last_success: None,
            last_failure: None,
            cooldown_until: None,
        }
    }

    fn in_cooldown(&self) -> bool {
        match self.cooldown_until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }
}

const UNHEALTHY_AFTER_FAILURES: u32 = 3;
const MAX_COOLDOWN_MULTIPLIER: u32 = 5;

struct FailoverInner {
    servers: Vec<ServerHealth>,
    round_robin_cursor: usize,
}

/// Server health book-keeping plus selection; everything under one mutex
pub struct FailoverManager {
    strategy: FailoverStrategy,
    cooldown: Duration,
    inner: Mutex<FailoverInner>,
}

impl FailoverManager {
    pub fn new(
        endpoints: Vec<PresenceServerEndpoint>,
        strategy: FailoverStrategy,
        cooldown: Duration,
    ) -> Self {
        info!(servers = endpoints.len(), ?strategy, "failover manager initialized");
        Self {
            strategy,
            cooldown,
            inner: Mutex::new(FailoverInner {
                servers: endpoints.into_iter().map(ServerHealth::new).collect(),
                round_robin_cursor: 0,
            }),
        }
    }

    /// Next endpoint to try. Returns None only when no servers are
    /// configured at all.
    pub fn get_next_server(&self) -> Option<PresenceServerEndpoint> {
        let mut inner = self.inner.lock().unwrap();
        if inner.servers.is_empty() {
            return None;
        }

        let selected = match self.strategy {
            FailoverStrategy::RoundRobin => select_round_robin(&mut inner),
            FailoverStrategy::Priority => select_priority(&inner),
            FailoverStrategy::Random => select_random(&inner),
        };

        let index = selected.unwrap_or_else(|| {
            // Everything is cooling down: take the earliest to recover
            let index = earliest_cooldown(&inner.servers);
            warn!(
                server = %inner.servers[index].endpoint.address(),
                "all presence servers in cooldown, forcing selection"
            );
            index
        });

        let server = &mut inner.servers[index];
        server.last_attempt = Some(Instant::now());
        info!(
            server = %server.endpoint.address(),
            failures = server.consecutive_failures,
            "presence server selected"
        );
        Some(server.endpoint.clone())
    }

    pub fn report_success(&self, endpoint: &PresenceServerEndpoint) {
        let mut inner = self.inner.lock().unwrap();
        let Some(server) = find_server(&mut inner.servers, endpoint) else {
            return;
        };
        server.is_healthy = true;
        server.consecutive_failures = 0;
        server.total_successes += 1;
        server.last_success = Some(Instant::now());
        server.cooldown_until = None;
        info!(server = %endpoint.address(), "presence server healthy");
    }

    pub fn report_failure(&self, endpoint: &PresenceServerEndpoint, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(server) = find_server(&mut inner.servers, endpoint) else {
            return;
        };
        server.consecutive_failures += 1;
        server.total_failures += 1;
        server.last_failure = Some(Instant::now());

        let multiplier = server.consecutive_failures.min(MAX_COOLDOWN_MULTIPLIER);
        let cooldown = self.cooldown * multiplier;
        server.cooldown_until = Some(Instant::now() + cooldown);

        if server.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
            server.is_healthy = false;
        }

        warn!(
            server = %endpoint.address(),
            failures = server.consecutive_failures,
            reason,
            cooldown_secs = cooldown.as_secs(),
            "presence server failure"
        );
    }

    pub fn healthy_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .servers
            .iter()
            .filter(|s| s.is_healthy)
            .count()
    }

    pub fn any_server_available(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .servers
            .iter()
            .any(|s| !s.in_cooldown())
    }

    pub fn all_health(&self) -> Vec<ServerHealth> {
        self.inner.lock().unwrap().servers.clone()
    }

    pub fn reset_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for server in &mut inner.servers {
            server.is_healthy = true;
            server.consecutive_failures = 0;
            server.cooldown_until = None;
        }
    }
}

fn find_server<'a>(
    servers: &'a mut [ServerHealth],
    endpoint: &PresenceServerEndpoint,
) -> Option<&'a mut ServerHealth> {
    servers
        .iter_mut()
        .find(|s| s.endpoint.host == endpoint.host && s.endpoint.port == endpoint.port)
}

/// From the cursor, first healthy server not in cooldown; else first not in
/// cooldown. Advances the cursor past the chosen index.
fn select_round_robin(inner: &mut FailoverInner) -> Option<usize> {
    let n = inner.servers.len();
    for pass in [true, false] {
        for offset in 0..n {
            let index = (inner.round_robin_cursor + offset) % n;
            let server = &inner.servers[index];
            if server.in_cooldown() {
                continue;
            }
            if pass && !server.is_healthy {
                continue;
            }
            inner.round_robin_cursor = (index + 1) % n;
            return Some(index);
        }
    }
    None
}

/// Lowest endpoint priority among servers not in cooldown; ties keep
/// insertion order
fn select_priority(inner: &FailoverInner) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (index, server) in inner.servers.iter().enumerate() {
        if server.in_cooldown() {
            continue;
        }
        match best {
            Some(b) if inner.servers[b].endpoint.priority <= server.endpoint.priority => {}
            _ => best = Some(index),
        }
    }
    best
}

/// Uniform pick among healthy and not cooling down; else among not cooling
/// down
fn select_random(inner: &FailoverInner) -> Option<usize> {
    let mut available: Vec<usize> = inner
        .servers
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.in_cooldown() && s.is_healthy)
        .map(|(i, _)| i)
        .collect();
    if available.is_empty() {
        available = inner
            .servers
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.in_cooldown())
            .map(|(i, _)| i)
            .collect();
    }
    if available.is_empty() {
        return None;
    }
    let pick = rand::thread_rng().gen_range(0..available.len());
    Some(available[pick])
}

fn earliest_cooldown(servers: &[ServerHealth]) -> usize {
    let mut best = 0;
    for (index, server) in servers.iter().enumerate() {
        let this = server.cooldown_until;
        let that = servers[best].cooldown_until;
        match (this, that) {
            (Some(a), Some(b)) if a < b => best = index,
            (None, Some(_)) => best = index,
            _ => {}
        }
    }
    best
}
