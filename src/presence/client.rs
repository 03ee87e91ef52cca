//! Presence feed TCP client
//!
//! Owns one connection at a time. A single reader task asks the failover
//! manager for an endpoint, connects with a deadline, then reads in 1 s
//! slices so heartbeat loss is noticed even on a silent socket. Every exit
//! from the read loop reports the failure, backs off (doubling up to the
//! configured maximum) and tries the next endpoint.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PresenceConfig;
use crate::events::CallStateEvent;
use crate::presence::failover::{FailoverManager, PresenceServerEndpoint};
use crate::presence::parser::PresenceFrameParser;

/// Connection lifecycle as exposed to the admin surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

#[derive(Debug, Default)]
pub struct ClientStats {
    pub events_received: AtomicU64,
    pub events_delivered: AtomicU64,
    pub bytes_received: AtomicU64,
    pub connect_attempts: AtomicU64,
    pub connect_successes: AtomicU64,
    pub disconnect_count: AtomicU64,
    pub failover_count: AtomicU64,
    pub heartbeat_timeouts: AtomicU64,
    pub parse_errors: AtomicU64,
}

/// Called for every parsed call state event
pub type EventCallback = Arc<dyn Fn(CallStateEvent) + Send + Sync>;
/// Called on every connection state transition
pub type StateCallback = Arc<dyn Fn(ConnectionState, &str) + Send + Sync>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_SLICE: Duration = Duration::from_secs(1);

pub struct PresenceTcpClient {
    config: PresenceConfig,
    failover: Arc<FailoverManager>,
    state: Arc<AtomicU8>,
    connected_server: Arc<Mutex<Option<PresenceServerEndpoint>>>,
    stats: Arc<ClientStats>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceTcpClient {
    pub fn new(config: PresenceConfig, failover: Arc<FailoverManager>) -> Self {
        Self {
            config,
            failover,
            state: Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8)),
            connected_server: Arc::new(Mutex::new(None)),
            stats: Arc::new(ClientStats::default()),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawn the reader task. Idempotent.
    pub fn start(&self, on_event: EventCallback, on_state: StateCallback) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }

        let reader = ReaderTask {
            config: self.config.clone(),
            failover: self.failover.clone(),
            state: self.state.clone(),
            connected_server: self.connected_server.clone(),
            stats: self.stats.clone(),
            shutdown: self.shutdown.clone(),
            on_event,
            on_state,
        };
        *task = Some(tokio::spawn(reader.run()));
        info!("presence tcp client started");
    }

    /// Stop the reader task and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("presence tcp client stopped");
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn connected_server(&self) -> String {
        match self.connected_server.lock().unwrap().as_ref() {
            Some(endpoint) => endpoint.address(),
            None => "(none)".to_string(),
        }
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }
}

struct ReaderTask {
    config: PresenceConfig,
    failover: Arc<FailoverManager>,
    state: Arc<AtomicU8>,
    connected_server: Arc<Mutex<Option<PresenceServerEndpoint>>>,
    stats: Arc<ClientStats>,
    shutdown: CancellationToken,
    on_event: EventCallback,
    on_state: StateCallback,
}

impl ReaderTask {
    async fn run(self) {
        let mut parser = PresenceFrameParser::new();
        let mut backoff = self.config.reconnect_interval();

        while !self.shutdown.is_cancelled() {
            let Some(endpoint) = self.failover.get_next_server() else {
                warn!("no presence servers configured, waiting");
                self.backoff_wait(&mut backoff).await;
                continue;
            };

            let stream = match self.connect(&endpoint).await {
                Ok(stream) => stream,
                Err(reason) => {
                    self.failover.report_failure(&endpoint, &reason);
                    self.stats.failover_count.fetch_add(1, Ordering::Relaxed);
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    self.backoff_wait(&mut backoff).await;
                    continue;
                }
            };

            self.failover.report_success(&endpoint);
            backoff = self.config.reconnect_interval();
            parser.reset();
            *self.connected_server.lock().unwrap() = Some(endpoint.clone());
            self.set_state(ConnectionState::Connected, &endpoint.address());

            self.read_loop(stream, &mut parser).await;

            self.stats.disconnect_count.fetch_add(1, Ordering::Relaxed);
            *self.connected_server.lock().unwrap() = None;
            self.set_state(ConnectionState::Disconnected, "");
            self.failover.report_failure(&endpoint, "disconnected");
            self.stats.failover_count.fetch_add(1, Ordering::Relaxed);

            if !self.shutdown.is_cancelled() {
                self.backoff_wait(&mut backoff).await;
            }
        }

        self.set_state(ConnectionState::Disconnected, "stopped");
    }

    async fn connect(&self, endpoint: &PresenceServerEndpoint) -> Result<TcpStream, String> {
        self.set_state(ConnectionState::Connecting, &endpoint.address());
        self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        let stream = tokio::select! {
            _ = self.shutdown.cancelled() => return Err("shutting down".to_string()),
            result = tokio::time::timeout(CONNECT_TIMEOUT, connect) => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(e.to_string()),
                Err(_) => return Err("connect timeout".to_string()),
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        let keepalive = socket2::SockRef::from(&stream).set_keepalive(true);
        if let Err(e) = keepalive {
            debug!(error = %e, "set_keepalive failed");
        }

        self.stats.connect_successes.fetch_add(1, Ordering::Relaxed);
        Ok(stream)
    }

    async fn read_loop(&self, mut stream: TcpStream, parser: &mut PresenceFrameParser) {
        let mut buf = vec![0u8; self.config.recv_buffer_size.max(1024)];
        let mut last_heartbeat = Instant::now();
        let heartbeat_timeout = self.config.heartbeat_timeout();

        loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                read = tokio::time::timeout(READ_SLICE, stream.read(&mut buf)) => read,
            };

            let n = match read {
                // Poll slice elapsed with no data: check feed liveness
                Err(_) => {
                    if last_heartbeat.elapsed() > heartbeat_timeout {
                        warn!(
                            silent_ms = last_heartbeat.elapsed().as_millis() as u64,
                            "presence heartbeat timeout, closing connection"
                        );
                        self.stats.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    continue;
                }
                Ok(Ok(0)) => {
                    debug!("presence feed closed by peer");
                    return;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!(error = %e, "presence read error");
                    return;
                }
            };

            self.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            let result = parser.feed(&buf[..n]);
            if result.error.is_some() {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            }

            // Any complete frame counts as feed liveness
            if result.saw_heartbeat || !result.events.is_empty() {
                last_heartbeat = Instant::now();
            }

            for event in result.events {
                self.stats.events_received.fetch_add(1, Ordering::Relaxed);
                (self.on_event)(event);
                self.stats.events_delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn backoff_wait(&self, backoff: &mut Duration) {
        self.set_state(
            ConnectionState::Reconnecting,
            &format!("backoff={}s", backoff.as_secs()),
        );
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(*backoff) => {}
        }
        *backoff = (*backoff * 2).min(self.config.reconnect_max_interval());
    }

    fn set_state(&self, state: ConnectionState, detail: &str) {
        self.state.store(state as u8, Ordering::Release);
        (self.on_state)(state, detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::failover::FailoverStrategy;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWriteExt;

    fn test_config(port: u16) -> PresenceConfig {
        PresenceConfig {
            servers: vec![PresenceServerEndpoint::new("127.0.0.1", port, 0)],
            reconnect_interval_sec: 1,
            heartbeat_interval_sec: 60,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connects_and_delivers_events() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(
                    b"<CallStateEvent><CallId>c1</CallId><CalleeUri>sip:200@t.com</CalleeUri>\
                      <State>ringing</State></CallStateEvent>",
                )
                .await
                .unwrap();
            // Hold the connection open briefly
            tokio::time::sleep(Duration::from_millis(300)).await;
        });

        let config = test_config(port);
        let failover = Arc::new(FailoverManager::new(
            config.servers.clone(),
            FailoverStrategy::RoundRobin,
            config.server_cooldown(),
        ));
        let client = PresenceTcpClient::new(config, failover);

        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_cb = delivered.clone();
        client.start(
            Arc::new(move |event| {
                assert_eq!(event.presence_call_id, "c1");
                delivered_cb.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_, _| {}),
        );

        // Wait for delivery
        for _ in 0..50 {
            if delivered.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(client.is_connected());
        assert_ne!(client.connected_server(), "(none)");

        client.stop().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_reports_failure_when_nothing_listens() {
        // Reserve a port and close it so the connect is refused
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = test_config(port);
        let failover = Arc::new(FailoverManager::new(
            config.servers.clone(),
            FailoverStrategy::RoundRobin,
            Duration::from_secs(60),
        ));
        let client = PresenceTcpClient::new(config, failover.clone());
        client.start(Arc::new(|_| {}), Arc::new(|_, _| {}));

        for _ in 0..50 {
            if client.stats().connect_attempts.load(Ordering::Relaxed) > 0
                && !failover.any_server_available()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(client.stats().connect_attempts.load(Ordering::Relaxed) >= 1);
        assert!(!client.is_connected());

        client.stop().await;
    }
}
