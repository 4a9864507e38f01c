//! MQTT Broker Core
//!
//! Owns the shared stores, runs the listeners and spawns one task per
//! connection. A periodic sweep purges persistent sessions whose client
//! stayed away longer than the retention period.

mod connection;
mod router;
mod tls;

pub use connection::{Connection, ConnectionError};
pub use router::MessageRouter;
pub use tls::{load_tls_config, TlsError};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::config::{Config, ServerTlsConfig};
use crate::delivery::DeliveryConfig;
use crate::hooks::{DefaultHooks, Hooks};
use crate::metrics::Metrics;
use crate::persistence::{PersistenceManager, PersistenceOp, StoredSession};
use crate::protocol::{Publish, QoS};
use crate::retained::{RetainedMessage, RetainedStore};
use crate::rule::{MessageContext, RuleEngine};
use crate::session::SessionStore;
use crate::topic::{Subscription, SubscriptionStore, TopicLimits};
use crate::transport::{configure_stream, Transport, WsStream};

/// Client id used as the origin of messages published by the server
const SERVER_CLIENT_ID: &str = "$edgehub";

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// TLS bind address (optional)
    pub tls_bind_addr: Option<SocketAddr>,
    /// WebSocket bind address (optional)
    pub ws_bind_addr: Option<SocketAddr>,
    /// WebSocket over TLS bind address (optional)
    pub wss_bind_addr: Option<SocketAddr>,
    /// WebSocket upgrade path
    pub ws_path: String,
    pub tls: Option<ServerTlsConfig>,
    pub max_connections: usize,
    pub max_packet_size: usize,
    pub max_payload_size: usize,
    pub max_client_id_length: usize,
    pub topic_limits: TopicLimits,
    /// Time allowed between accept and CONNECT
    pub connect_timeout: Duration,
    pub max_rule_hops: usize,
    /// Keep alive applied when a client sends 0 (0 = disabled)
    pub default_keep_alive: u16,
    pub max_keep_alive: u16,
    /// How long a disconnected persistent session is kept
    pub session_retention: Duration,
    pub session_sweep_interval: Duration,
    pub delivery: DeliveryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl BrokerConfig {
    pub fn from_config(config: &Config) -> Self {
        let server = &config.server;
        let limits = &config.limits;
        Self {
            bind_addr: server.bind,
            tls_bind_addr: server.tls_bind,
            ws_bind_addr: server.ws_bind,
            wss_bind_addr: server.wss_bind,
            ws_path: server.ws_path.clone(),
            tls: server.tls.clone(),
            max_connections: limits.max_connections,
            max_packet_size: limits.max_packet_size,
            max_payload_size: limits.max_payload_size,
            max_client_id_length: limits.max_client_id_length,
            topic_limits: TopicLimits {
                max_length: limits.max_topic_length,
                max_levels: limits.max_topic_levels,
                system_prefixes: limits.system_topic_prefixes.clone(),
            },
            connect_timeout: limits.connect_timeout,
            max_rule_hops: limits.max_rule_hops,
            default_keep_alive: config.session.default_keep_alive,
            max_keep_alive: config.session.max_keep_alive,
            session_retention: config.session.retention,
            session_sweep_interval: config.session.sweep_interval,
            delivery: config.delivery.clone(),
        }
    }
}

/// State shared by the listeners and every connection task
pub(crate) struct Shared {
    pub config: BrokerConfig,
    pub sessions: Arc<SessionStore>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub retained: Arc<RetainedStore>,
    pub router: MessageRouter,
    pub hooks: Arc<dyn Hooks>,
    pub metrics: Option<Arc<Metrics>>,
    pub persistence: Option<Arc<PersistenceManager>>,
    /// Open network connections, including ones still in CONNECT
    pub connections: Arc<AtomicUsize>,
}

impl Shared {
    /// Write the current state of a persistent session
    pub fn persist_session(&self, client_id: &str) {
        let Some(ref persistence) = self.persistence else {
            return;
        };
        if let Some(session) = self.sessions.get(client_id) {
            let s = session.read();
            if !s.clean_session {
                persistence.write(PersistenceOp::SetSession {
                    client_id: client_id.to_string(),
                    session: StoredSession::from_session(&s),
                });
            }
        }
    }
}

/// Decrements the connection count when a connection task ends
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The MQTT Broker
pub struct Broker {
    config: BrokerConfig,
    sessions: Arc<SessionStore>,
    subscriptions: Arc<SubscriptionStore>,
    retained: Arc<RetainedStore>,
    rules: Arc<RuleEngine>,
    hooks: Arc<dyn Hooks>,
    metrics: Option<Arc<Metrics>>,
    persistence: Option<Arc<PersistenceManager>>,
    connections: Arc<AtomicUsize>,
    shutdown: broadcast::Sender<()>,
    shared: OnceLock<Arc<Shared>>,
}

impl Broker {
    /// Create a broker whose hooks allow everything
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            sessions: Arc::new(SessionStore::new(config.delivery.clone())),
            subscriptions: Arc::new(SubscriptionStore::new()),
            retained: Arc::new(RetainedStore::new()),
            rules: Arc::new(RuleEngine::default()),
            hooks,
            metrics: None,
            persistence: None,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown,
            shared: OnceLock::new(),
            config,
        }
    }

    pub fn with_rules(mut self, rules: RuleEngine) -> Self {
        self.rules = Arc::new(rules);
        self.shared = OnceLock::new();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self.shared = OnceLock::new();
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<PersistenceManager>) -> Self {
        self.persistence = Some(persistence);
        self.shared = OnceLock::new();
        self
    }

    fn shared(&self) -> Arc<Shared> {
        self.shared
            .get_or_init(|| {
                let router = MessageRouter::new(
                    self.sessions.clone(),
                    self.subscriptions.clone(),
                    self.retained.clone(),
                    self.rules.clone(),
                    self.config.max_rule_hops,
                )
                .with_persistence(self.persistence.clone())
                .with_metrics(self.metrics.clone());

                Arc::new(Shared {
                    config: self.config.clone(),
                    sessions: self.sessions.clone(),
                    subscriptions: self.subscriptions.clone(),
                    retained: self.retained.clone(),
                    router,
                    hooks: self.hooks.clone(),
                    metrics: self.metrics.clone(),
                    persistence: self.persistence.clone(),
                    connections: self.connections.clone(),
                })
            })
            .clone()
    }

    /// Run the broker until `shutdown` is called
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let shared = self.shared();
        self.restore().await?;

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", self.config.bind_addr);

        let secure_addr = self.config.tls_bind_addr.or(self.config.wss_bind_addr);
        let acceptor = match (&self.config.tls, secure_addr) {
            (Some(tls), Some(_)) => Some(load_tls_config(tls).map_err(std::io::Error::other)?),
            (None, Some(addr)) => {
                return Err(std::io::Error::other(format!(
                    "listener {} requires server.tls",
                    addr
                )));
            }
            _ => None,
        };

        if let (Some(addr), Some(acceptor)) = (self.config.tls_bind_addr, acceptor.clone()) {
            let listener = TcpListener::bind(addr).await?;
            info!("MQTT/TLS listening on {}", addr);
            tokio::spawn(accept_loop(
                listener,
                shared.clone(),
                self.shutdown.clone(),
                Listener::Tls(acceptor),
            ));
        }

        if let Some(addr) = self.config.ws_bind_addr {
            let listener = TcpListener::bind(addr).await?;
            info!("MQTT/WebSocket listening on {} (path: {})", addr, self.config.ws_path);
            tokio::spawn(accept_loop(
                listener,
                shared.clone(),
                self.shutdown.clone(),
                Listener::Ws,
            ));
        }

        if let (Some(addr), Some(acceptor)) = (self.config.wss_bind_addr, acceptor) {
            let listener = TcpListener::bind(addr).await?;
            info!("MQTT/WebSocket+TLS listening on {} (path: {})", addr, self.config.ws_path);
            tokio::spawn(accept_loop(
                listener,
                shared.clone(),
                self.shutdown.clone(),
                Listener::Wss(acceptor),
            ));
        }

        tokio::spawn(sweep_loop(shared.clone(), self.shutdown.subscribe()));

        accept_loop(listener, shared, self.shutdown.clone(), Listener::Tcp).await;
        Ok(())
    }

    /// Load persisted retained messages and sessions
    async fn restore(&self) -> Result<(), std::io::Error> {
        let Some(ref persistence) = self.persistence else {
            return Ok(());
        };

        let loaded = persistence.load_all().await.map_err(std::io::Error::other)?;

        let retained = loaded.retained.len();
        for (_, stored) in loaded.retained {
            self.retained.insert(RetainedMessage::from(stored));
        }

        let mut sessions = 0;
        for (client_id, stored) in loaded.sessions {
            if stored.is_expired(self.config.session_retention) {
                debug!("Dropping expired session {}", client_id);
                persistence.write(PersistenceOp::DeleteSession { client_id });
                continue;
            }
            sessions += 1;
            let session = stored.into_session(self.config.delivery.clone());
            for (filter, qos) in &session.subscriptions {
                self.subscriptions.subscribe(
                    filter,
                    Subscription {
                        client_id: session.client_id.clone(),
                        qos: *qos,
                    },
                );
            }
            self.sessions.restore(session);
        }

        info!(
            "Restored {} retained messages and {} sessions",
            retained, sessions
        );
        Ok(())
    }

    /// Stop the listeners and connections and flush persistent state
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());

        if let Some(ref persistence) = self.persistence {
            self.sessions.for_each(|session| {
                if !session.clean_session {
                    persistence.write(PersistenceOp::SetSession {
                        client_id: session.client_id.to_string(),
                        session: StoredSession::from_session(session),
                    });
                }
            });
            if let Err(e) = persistence.shutdown().await {
                error!("Failed to shut down persistence: {}", e);
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Publish a message from the server
    ///
    /// The message is routed like a client publish, rules included.
    pub fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> usize {
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id: None,
            payload,
        };
        let origin = MessageContext {
            client_id: SERVER_CLIENT_ID.into(),
            client_ip: None,
            topic: publish.topic.clone(),
            qos,
        };
        self.shared().router.publish(&publish, &origin)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[derive(Clone)]
enum Listener {
    Tcp,
    Tls(TlsAcceptor),
    Ws,
    Wss(TlsAcceptor),
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
    kind: Listener,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = configure_stream(&stream) {
                        debug!("Failed to configure socket for {}: {}", addr, e);
                    }
                    let guard = ConnectionGuard::new(&shared.connections);
                    let shared = shared.clone();
                    let kind = kind.clone();
                    let shutdown_rx = shutdown.subscribe();
                    tokio::spawn(async move {
                        let _guard = guard;
                        handshake(stream, addr, shared, kind, shutdown_rx).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("Accept loop on {:?} stopped", listener.local_addr().ok());
}

/// Run the transport handshake, then the MQTT connection
async fn handshake(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    kind: Listener,
    shutdown_rx: broadcast::Receiver<()>,
) {
    let timeout = shared.config.connect_timeout;
    let ws_path = shared.config.ws_path.clone();

    match kind {
        Listener::Tcp => serve(stream, addr, shared, shutdown_rx).await,
        Listener::Tls(acceptor) => {
            match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => serve(tls, addr, shared, shutdown_rx).await,
                Ok(Err(e)) => debug!("TLS handshake failed for {}: {}", addr, e),
                Err(_) => debug!("TLS handshake timeout for {}", addr),
            }
        }
        Listener::Ws => {
            let upgrade = WsStream::accept_with_path(stream, &ws_path);
            match tokio::time::timeout(timeout, upgrade).await {
                Ok(Ok(ws)) => serve(ws, addr, shared, shutdown_rx).await,
                Ok(Err(e)) => debug!("WebSocket handshake failed for {}: {}", addr, e),
                Err(_) => debug!("WebSocket handshake timeout for {}", addr),
            }
        }
        Listener::Wss(acceptor) => {
            let upgrade = async {
                let tls = acceptor.accept(stream).await?;
                Ok::<_, std::io::Error>(WsStream::accept_with_path(tls, &ws_path).await?)
            };
            match tokio::time::timeout(timeout, upgrade).await {
                Ok(Ok(wss)) => serve(wss, addr, shared, shutdown_rx).await,
                Ok(Err(e)) => debug!("WebSocket+TLS handshake failed for {}: {}", addr, e),
                Err(_) => debug!("WebSocket+TLS handshake timeout for {}", addr),
            }
        }
    }
}

async fn serve<T: Transport>(
    stream: T,
    addr: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut conn = Connection::new(stream, addr, shared);
    tokio::select! {
        result = conn.run() => {
            if let Err(e) = result {
                debug!("Connection {} closed: {}", addr, e);
            }
        }
        _ = shutdown_rx.recv() => {
            debug!("Connection {} shutting down", addr);
        }
    }
}

async fn sweep_loop(shared: Arc<Shared>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(shared.config.session_sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => sweep(&shared),
            _ = shutdown_rx.recv() => break,
        }
    }
}

fn sweep(shared: &Shared) {
    let purged = shared
        .sessions
        .purge_expired(shared.config.session_retention);

    for client_id in &purged {
        info!("Session {} expired", client_id);
        shared.subscriptions.unsubscribe_all(client_id);
        if let Some(ref persistence) = shared.persistence {
            persistence.write(PersistenceOp::DeleteSession {
                client_id: client_id.to_string(),
            });
        }
    }

    if let Some(ref metrics) = shared.metrics {
        metrics.sessions_expired_total.inc_by(purged.len() as u64);
        metrics.sessions_current.set(shared.sessions.len() as i64);
        metrics
            .subscriptions_current
            .set(shared.subscriptions.count() as i64);
        metrics
            .retained_messages_current
            .set(shared.retained.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_mapping() {
        let mut config = Config::default();
        config.limits.max_topic_levels = 4;
        config.limits.system_topic_prefixes = vec!["$share".to_string()];
        config.session.retention = Duration::from_secs(5);

        let broker = BrokerConfig::from_config(&config);
        assert_eq!(broker.topic_limits.max_levels, 4);
        assert_eq!(broker.topic_limits.system_prefixes, vec!["$share".to_string()]);
        assert_eq!(broker.session_retention, Duration::from_secs(5));
        assert_eq!(broker.bind_addr, SocketAddr::from(([0, 0, 0, 0], 1883)));
    }

    #[test]
    fn test_server_publish_sets_retained() {
        let broker = Broker::default();
        broker.publish("status", Bytes::from_static(b"up"), QoS::AtMostOnce, true);
        assert_eq!(broker.retained_count(), 1);
        broker.publish("status", Bytes::new(), QoS::AtMostOnce, true);
        assert_eq!(broker.retained_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_purges_expired_sessions() {
        let config = BrokerConfig {
            session_retention: Duration::ZERO,
            ..Default::default()
        };
        let broker = Broker::new(config);
        let shared = broker.shared();

        shared.sessions.get_or_create("gone", false);
        shared.subscriptions.subscribe(
            "a/#",
            Subscription {
                client_id: "gone".into(),
                qos: QoS::AtLeastOnce,
            },
        );

        sweep(&shared);
        assert_eq!(broker.session_count(), 0);
        assert!(shared.subscriptions.matches("a/b").is_empty());
    }

    #[tokio::test]
    async fn test_restore_drops_sessions_expired_while_down() {
        use crate::persistence::{FjallBackend, StorageBackend, StoredSubscription};
        use std::time::{SystemTime, UNIX_EPOCH};

        let temp_dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FjallBackend::open(temp_dir.path()).unwrap());

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let stored = |client_id: &str, disconnected_at_ms: u64| StoredSession {
            client_id: client_id.to_string(),
            subscriptions: vec![StoredSubscription {
                filter: format!("{}/#", client_id),
                qos: 1,
            }],
            messages: Vec::new(),
            disconnected_at_ms: Some(disconnected_at_ms),
        };
        backend
            .set_session("stale", &stored("stale", now_ms - 2 * 3_600_000))
            .await
            .unwrap();
        backend
            .set_session("recent", &stored("recent", now_ms - 60_000))
            .await
            .unwrap();

        let persistence = Arc::new(PersistenceManager::new(
            backend.clone(),
            Duration::from_secs(3600),
            100,
        ));
        let config = BrokerConfig {
            session_retention: Duration::from_secs(3600),
            ..Default::default()
        };
        let broker = Broker::new(config).with_persistence(persistence.clone());
        broker.restore().await.unwrap();

        assert_eq!(broker.session_count(), 1);
        let shared = broker.shared();
        assert!(shared.sessions.get("stale").is_none());
        assert!(shared.subscriptions.matches("stale/x").is_empty());
        assert_eq!(shared.subscriptions.matches("recent/x").len(), 1);

        persistence.shutdown().await.unwrap();
        let remaining: Vec<String> = backend
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|(client_id, _)| client_id)
            .collect();
        assert_eq!(remaining, vec!["recent".to_string()]);
    }
}
