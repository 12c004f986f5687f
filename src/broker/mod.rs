//! MQTT Broker Core
//!
//! The main broker implementation that handles client connections,
//! message routing, and coordinates all components: sessions, retained
//! messages, persistence, DoS protection, clustering, and metrics.

mod connection;
mod sys_topics;
mod tls;
mod writer;

pub use connection::Connection;
pub use sys_topics::spawn_sys_topics_task;
pub use tls::{load_tls_config, TlsError};
pub use writer::SharedWriter;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::cluster::{ClusterInboundCallback, ClusterManager};
use crate::config::{ClusterConfig, ProxyProtocolConfig};
use crate::consensus::{ConsensusHandle, SubscriptionCommand};
use crate::flapping::FlappingDetector;
use crate::hooks::{DefaultHooks, Hooks};
use crate::metrics::Metrics;
use crate::persistence::{PersistenceManager, PersistenceOp, StoredRetainedMessage};
use crate::protocol::{Properties, ProtocolVersion, Publish, QoS};
use crate::proxy::{read_proxy_header, ProxyInfo};
use crate::session::SessionStore;
use crate::topic::SubscriptionStore;
use crate::transport::WsStream;

/// TLS listener configuration
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
    pub ca_cert_path: Option<String>,
    pub require_client_cert: bool,
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Plain TCP bind address
    pub bind_addr: SocketAddr,
    /// TLS bind address (optional)
    pub tls_bind_addr: Option<SocketAddr>,
    /// TLS configuration (required if `tls_bind_addr` is set)
    pub tls_config: Option<TlsConfig>,
    /// WebSocket bind address (optional)
    pub ws_bind_addr: Option<SocketAddr>,
    /// WebSocket path (default: "/mqtt")
    pub ws_path: String,
    /// Maximum connections
    pub max_connections: usize,
    /// Maximum packet size
    pub max_packet_size: usize,
    /// Default keep alive (if client specifies 0)
    pub default_keep_alive: u16,
    /// Maximum keep alive
    pub max_keep_alive: u16,
    /// Session expiry check interval
    pub session_expiry_check_interval: Duration,
    /// Receive maximum (flow control)
    pub receive_maximum: u16,
    /// Maximum QoS
    pub max_qos: QoS,
    /// Retain available
    pub retain_available: bool,
    /// Wildcard subscription available
    pub wildcard_subscription_available: bool,
    /// Subscription identifiers available
    pub subscription_identifiers_available: bool,
    /// Shared subscriptions available
    pub shared_subscriptions_available: bool,
    /// Maximum topic alias
    pub max_topic_alias: u16,
    /// Number of worker tasks
    pub num_workers: usize,
    /// Whether to publish $SYS topics
    pub sys_topics_enabled: bool,
    /// Interval (seconds) between $SYS topic publishes
    pub sys_topics_interval: u64,
    /// Maximum in-flight QoS 1/2 messages per session
    pub max_inflight: u16,
    /// Maximum queued messages for an offline session
    pub max_queued_messages: usize,
    /// Maximum awaiting-release (QoS 2) messages per session
    pub max_awaiting_rel: usize,
    /// Retry interval for unacknowledged QoS 1/2 messages
    pub retry_interval: Duration,
    /// Outbound channel capacity per connection
    pub outbound_channel_capacity: usize,
    /// Maximum number of levels in a topic name or filter
    pub max_topic_levels: usize,
    /// PROXY protocol handling for the plain TCP listener
    pub proxy_protocol: ProxyProtocolConfig,
    /// PROXY protocol handling for the TLS listener
    pub tls_proxy_protocol: ProxyProtocolConfig,
    /// PROXY protocol handling for the WebSocket listener
    pub ws_proxy_protocol: ProxyProtocolConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".parse().unwrap(),
            tls_bind_addr: None,
            tls_config: None,
            ws_bind_addr: None,
            ws_path: "/mqtt".to_string(),
            max_connections: 100_000,
            max_packet_size: 1024 * 1024, // 1 MB
            default_keep_alive: 60,
            max_keep_alive: 65535,
            session_expiry_check_interval: Duration::from_secs(60),
            receive_maximum: 65535,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            shared_subscriptions_available: true,
            max_topic_alias: 65535,
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            sys_topics_enabled: true,
            sys_topics_interval: 10,
            max_inflight: 65535,
            max_queued_messages: usize::MAX,
            max_awaiting_rel: usize::MAX,
            retry_interval: Duration::from_secs(10),
            outbound_channel_capacity: 1_000_000,
            max_topic_levels: 128,
            proxy_protocol: ProxyProtocolConfig::default(),
            tls_proxy_protocol: ProxyProtocolConfig::default(),
            ws_proxy_protocol: ProxyProtocolConfig::default(),
        }
    }
}

/// Retained message
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub properties: Properties,
    pub timestamp: Instant,
}

/// Broker events
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Client connected
    ClientConnected {
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
    },
    /// Client disconnected
    ClientDisconnected { client_id: Arc<str> },
    /// Message published, from any locally-connected client
    MessagePublished {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// A client added a subscription to a filter
    SubscriptionAdded { filter: String, client_id: Arc<str> },
    /// A client removed a subscription to a filter
    SubscriptionRemoved { filter: String, client_id: Arc<str> },
}

/// Ties the gossip-based peer forwarding transport to the Raft-replicated
/// subscription digest that decides where a local publish needs to be
/// forwarded. Produced by `Broker::create_cluster_manager`, consumed by
/// `Broker::set_cluster_manager`.
pub struct ClusterBinding {
    gossip: ClusterManager,
    consensus: ConsensusHandle,
    node_id: String,
}

impl ClusterBinding {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// The MQTT Broker
#[derive(Clone)]
pub struct Broker {
    /// Configuration
    config: BrokerConfig,
    /// Session store
    sessions: Arc<SessionStore>,
    /// Subscription store
    subscriptions: Arc<SubscriptionStore>,
    /// Retained messages
    retained: Arc<DashMap<String, RetainedMessage>>,
    /// Active connections (client_id -> direct-write handle)
    connections: Arc<DashMap<Arc<str>, Arc<SharedWriter>>>,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
    /// Event channel
    events: broadcast::Sender<BrokerEvent>,
    /// Hooks for auth/ACL and events
    hooks: Arc<dyn Hooks>,
    /// Durable storage, if enabled
    persistence: Option<Arc<PersistenceManager>>,
    /// Per-IP connection-rate and ban tracking, if enabled
    flapping: Option<Arc<FlappingDetector>>,
    /// Prometheus metrics, if enabled
    metrics: Option<Arc<Metrics>>,
    /// Clustering, if enabled
    cluster: Option<Arc<ClusterBinding>>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(1024);

        Self {
            config,
            sessions: Arc::new(SessionStore::new()),
            subscriptions: Arc::new(SubscriptionStore::new()),
            retained: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            shutdown,
            events,
            hooks,
            persistence: None,
            flapping: None,
            metrics: None,
            cluster: None,
        }
    }

    /// Access the retained message store directly, e.g. to restore
    /// persisted messages at startup.
    pub fn retained(&self) -> &Arc<DashMap<String, RetainedMessage>> {
        &self.retained
    }

    /// Rebuild sessions (and their subscriptions) from persisted storage at
    /// startup. Each restored session is disconnected until its client
    /// reconnects, so its subscriptions need re-registering in the shared
    /// `SubscriptionStore` directly rather than through the SUBSCRIBE path.
    pub fn restore_sessions(&self, stored: Vec<crate::persistence::StoredSession>) {
        let limits = crate::session::SessionLimits {
            max_pending_messages: self.config.max_queued_messages,
            max_inflight: self.config.max_inflight,
            max_awaiting_rel: self.config.max_awaiting_rel,
        };

        for stored in stored {
            let session = stored.into_session(limits);
            let client_id = session.client_id.clone();

            for (filter, sub) in &session.subscriptions {
                self.subscriptions.subscribe(
                    filter,
                    crate::topic::Subscription {
                        client_id: client_id.clone(),
                        qos: sub.options.qos,
                        no_local: sub.options.no_local,
                        retain_as_published: sub.options.retain_as_published,
                        subscription_id: sub.subscription_id,
                        share_group: None,
                    },
                );
            }

            self.sessions.restore(session);
        }
    }

    /// Enable durable storage
    pub fn set_persistence(&mut self, persistence: Arc<PersistenceManager>) {
        self.persistence = Some(persistence);
    }

    /// Enable per-IP connection-rate limiting and ban tracking
    pub fn set_flapping_detector(&mut self, detector: FlappingDetector) {
        self.flapping = Some(Arc::new(detector));
    }

    /// Enable Prometheus metrics
    pub fn set_metrics(&mut self, metrics: Arc<Metrics>) {
        self.metrics = Some(metrics);
    }

    /// Start gossip membership, peer forwarding, and the Raft-replicated
    /// subscription digest for the given cluster configuration. Pass the
    /// result to `set_cluster_manager` before `run`.
    pub async fn create_cluster_manager(
        &self,
        cluster_config: ClusterConfig,
    ) -> Result<ClusterBinding, Box<dyn std::error::Error + Send + Sync>> {
        let node_id = cluster_config.get_node_id();

        let consensus = ConsensusHandle::start(
            &node_id,
            cluster_config.consensus_addr,
            cluster_config.get_consensus_advertise_addr(),
            &cluster_config.seeds,
        )
        .await?;

        let subscriptions = self.subscriptions.clone();
        let connections = self.connections.clone();
        let sessions = self.sessions.clone();
        let local_node_id = node_id.clone();

        // Deliver a cluster-origin publish straight to local subscribers.
        // This bypasses the digest-forward step entirely, which is what
        // keeps a remote-origin message from bouncing back out to the
        // cluster it just arrived from.
        let inbound_callback: ClusterInboundCallback = Arc::new(
            move |topic: String, payload: Bytes, qos: QoS, retain: bool, origin_node: String| {
                if origin_node == local_node_id {
                    return;
                }
                deliver_local(&subscriptions, &connections, &sessions, &topic, payload, qos, retain);
            },
        );

        let gossip = ClusterManager::new(cluster_config, inbound_callback).await?;
        gossip.start().await?;

        Ok(ClusterBinding {
            gossip,
            consensus,
            node_id,
        })
    }

    /// Install a cluster binding created by `create_cluster_manager`
    pub fn set_cluster_manager(&mut self, cluster: ClusterBinding) {
        self.cluster = Some(Arc::new(cluster));
    }

    /// Run the broker
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", self.config.bind_addr);

        if let (Some(tls_addr), Some(tls_config)) =
            (self.config.tls_bind_addr, self.config.tls_config.as_ref())
        {
            let acceptor = tls::load_tls_config(tls_config)
                .map_err(|e| std::io::Error::other(format!("TLS config error: {}", e)))?;
            let tls_listener = TcpListener::bind(tls_addr).await?;
            info!("MQTT/TLS listening on {}", tls_addr);
            self.spawn_tls_accept_loop(tls_listener, acceptor);
        }

        if let Some(ws_addr) = self.config.ws_bind_addr {
            let ws_listener = TcpListener::bind(ws_addr).await?;
            info!(
                "MQTT/WebSocket listening on {} (path: {})",
                ws_addr, self.config.ws_path
            );
            self.spawn_ws_accept_loop(ws_listener);
        }

        if self.cluster.is_some() {
            self.spawn_cluster_event_bridge();
        }

        if self.config.sys_topics_enabled {
            let broker = Arc::new(self.clone());
            sys_topics::spawn_sys_topics_task(
                broker,
                self.metrics.clone(),
                self.config.sys_topics_interval,
                Instant::now(),
                self.shutdown.subscribe(),
            );
        }

        // Spawn session expiry cleanup task
        let sessions = self.sessions.clone();
        let interval = self.config.session_expiry_check_interval;
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;

                    _ = ticker.tick() => {
                        sessions.cleanup_expired();
                    }
                    result = shutdown_rx.recv() => {
                        match result {
                            Ok(()) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });

        debug!("Starting TCP accept loop");
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("New TCP connection from {}", addr);
                    self.handle_connection(stream, addr);
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                }
            }
        }
    }

    fn spawn_tls_accept_loop(&self, listener: TcpListener, acceptor: tokio_rustls::TlsAcceptor) {
        let sessions = self.sessions.clone();
        let subscriptions = self.subscriptions.clone();
        let retained = self.retained.clone();
        let connections = self.connections.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let hooks = self.hooks.clone();
        let metrics = self.metrics.clone();
        let persistence = self.persistence.clone();
        let flapping = self.flapping.clone();
        let shutdown = self.shutdown.clone();
        let proxy_config = self.config.tls_proxy_protocol.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, addr)) => {
                        if let Some(detector) = &flapping {
                            if let Err(reason) = detector.check_connection(addr.ip()) {
                                debug!("Rejecting TLS connection from {}: {:?}", addr, reason);
                                continue;
                            }
                            detector.record_connection(addr.ip());
                        }

                        let sessions = sessions.clone();
                        let subscriptions = subscriptions.clone();
                        let retained = retained.clone();
                        let connections = connections.clone();
                        let config = config.clone();
                        let events = events.clone();
                        let hooks = hooks.clone();
                        let metrics = metrics.clone();
                        let persistence = persistence.clone();
                        let flapping = flapping.clone();
                        let acceptor = acceptor.clone();
                        let proxy_config = proxy_config.clone();
                        let mut shutdown_rx = shutdown.subscribe();

                        tokio::spawn(async move {
                            let proxy_info = match read_proxy_header(&mut stream, &proxy_config).await {
                                Ok(info) => info,
                                Err(e) => {
                                    debug!("PROXY header error from {}: {}", addr, e);
                                    return;
                                }
                            };

                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(s) => s,
                                Err(e) => {
                                    debug!("TLS handshake failed for {}: {}", addr, e);
                                    return;
                                }
                            };

                            run_connection(
                                tls_stream,
                                addr,
                                proxy_info,
                                sessions,
                                subscriptions,
                                retained,
                                connections,
                                config,
                                events,
                                hooks,
                                metrics,
                                persistence,
                                &mut shutdown_rx,
                            )
                            .await;

                            if let Some(detector) = &flapping {
                                detector.record_disconnection(addr.ip());
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept TLS connection: {}", e),
                }
            }
        });
    }

    fn spawn_ws_accept_loop(&self, listener: TcpListener) {
        let sessions = self.sessions.clone();
        let subscriptions = self.subscriptions.clone();
        let retained = self.retained.clone();
        let connections = self.connections.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let hooks = self.hooks.clone();
        let metrics = self.metrics.clone();
        let persistence = self.persistence.clone();
        let flapping = self.flapping.clone();
        let shutdown = self.shutdown.clone();
        let proxy_config = self.config.ws_proxy_protocol.clone();
        let ws_path = self.config.ws_path.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, addr)) => {
                        if let Some(detector) = &flapping {
                            if let Err(reason) = detector.check_connection(addr.ip()) {
                                debug!("Rejecting WebSocket connection from {}: {:?}", addr, reason);
                                continue;
                            }
                            detector.record_connection(addr.ip());
                        }

                        debug!("New WebSocket connection from {}", addr);
                        let sessions = sessions.clone();
                        let subscriptions = subscriptions.clone();
                        let retained = retained.clone();
                        let connections = connections.clone();
                        let config = config.clone();
                        let events = events.clone();
                        let hooks = hooks.clone();
                        let metrics = metrics.clone();
                        let persistence = persistence.clone();
                        let flapping = flapping.clone();
                        let proxy_config = proxy_config.clone();
                        let ws_path = ws_path.clone();
                        let mut shutdown_rx = shutdown.subscribe();

                        tokio::spawn(async move {
                            let proxy_info = match read_proxy_header(&mut stream, &proxy_config).await {
                                Ok(info) => info,
                                Err(e) => {
                                    debug!("PROXY header error from {}: {}", addr, e);
                                    return;
                                }
                            };

                            match WsStream::accept_with_path(stream, &ws_path).await {
                                Ok(ws_stream) => {
                                    debug!("WebSocket handshake complete for {}", addr);
                                    run_connection(
                                        ws_stream,
                                        addr,
                                        proxy_info,
                                        sessions,
                                        subscriptions,
                                        retained,
                                        connections,
                                        config,
                                        events,
                                        hooks,
                                        metrics,
                                        persistence,
                                        &mut shutdown_rx,
                                    )
                                    .await;
                                }
                                Err(e) => {
                                    debug!("WebSocket handshake failed for {}: {}", addr, e);
                                }
                            }

                            if let Some(detector) = &flapping {
                                detector.record_disconnection(addr.ip());
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept WebSocket connection: {}", e),
                }
            }
        });
    }

    /// Handle a new plain-TCP connection
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if let Some(detector) = &self.flapping {
            if let Err(reason) = detector.check_connection(addr.ip()) {
                debug!("Rejecting TCP connection from {}: {:?}", addr, reason);
                return;
            }
            detector.record_connection(addr.ip());
        }

        let sessions = self.sessions.clone();
        let subscriptions = self.subscriptions.clone();
        let retained = self.retained.clone();
        let connections = self.connections.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let hooks = self.hooks.clone();
        let metrics = self.metrics.clone();
        let persistence = self.persistence.clone();
        let flapping = self.flapping.clone();
        let proxy_config = self.config.proxy_protocol.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut stream = stream;
            let proxy_info = match read_proxy_header(&mut stream, &proxy_config).await {
                Ok(info) => info,
                Err(e) => {
                    debug!("PROXY header error from {}: {}", addr, e);
                    return;
                }
            };

            run_connection(
                stream,
                addr,
                proxy_info,
                sessions,
                subscriptions,
                retained,
                connections,
                config,
                events,
                hooks,
                metrics,
                persistence,
                &mut shutdown_rx,
            )
            .await;

            if let Some(detector) = &flapping {
                detector.record_disconnection(addr.ip());
            }
        });
    }

    /// Consume subscription and publish events to drive cluster behavior:
    /// propose subscription changes through the consensus log, and forward
    /// locally-originated publishes to whichever nodes the digest names.
    fn spawn_cluster_event_bridge(&self) {
        let Some(cluster) = self.cluster.clone() else {
            return;
        };
        let mut events_rx = self.events.subscribe();

        tokio::spawn(async move {
            loop {
                match events_rx.recv().await {
                    Ok(BrokerEvent::SubscriptionAdded { filter, .. }) => {
                        cluster
                            .consensus
                            .propose(SubscriptionCommand::Subscribe {
                                filter,
                                node_id: cluster.node_id.clone(),
                            })
                            .await;
                    }
                    Ok(BrokerEvent::SubscriptionRemoved { filter, .. }) => {
                        cluster
                            .consensus
                            .propose(SubscriptionCommand::Unsubscribe {
                                filter,
                                node_id: cluster.node_id.clone(),
                            })
                            .await;
                    }
                    Ok(BrokerEvent::MessagePublished {
                        topic,
                        payload,
                        qos,
                        retain,
                    }) => {
                        let targets = cluster.consensus.digest().targets_for(&topic, &cluster.node_id);
                        if !targets.is_empty() {
                            cluster
                                .gossip
                                .forward_publish(&targets, &topic, payload, qos, retain)
                                .await;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Shutdown the broker
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get retained message count
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Publish a message from the server (e.g. $SYS topics, bridged
    /// publishes from admin tooling). Routes to local subscribers and
    /// updates the retained-message store; it does not itself consult the
    /// cluster digest since it isn't on the per-connection publish path
    /// that the cluster event bridge watches.
    pub fn publish(&self, topic: String, payload: Bytes, qos: QoS, retain: bool) {
        if retain {
            if payload.is_empty() {
                self.retained.remove(&topic);
                if let Some(p) = &self.persistence {
                    p.write(PersistenceOp::DeleteRetained { topic: topic.clone() });
                }
            } else {
                let msg = RetainedMessage {
                    topic: Arc::from(topic.as_str()),
                    payload: payload.clone(),
                    qos,
                    properties: Properties::default(),
                    timestamp: Instant::now(),
                };
                if let Some(p) = &self.persistence {
                    p.write(PersistenceOp::SetRetained {
                        topic: topic.clone(),
                        message: StoredRetainedMessage::from(&msg),
                    });
                }
                self.retained.insert(topic.clone(), msg);
            }
        }

        deliver_local(
            &self.subscriptions,
            &self.connections,
            &self.sessions,
            &topic,
            payload,
            qos,
            retain,
        );
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection<S>(
    stream: S,
    addr: SocketAddr,
    proxy_info: Option<ProxyInfo>,
    sessions: Arc<SessionStore>,
    subscriptions: Arc<SubscriptionStore>,
    retained: Arc<DashMap<String, RetainedMessage>>,
    connections: Arc<DashMap<Arc<str>, Arc<SharedWriter>>>,
    config: BrokerConfig,
    events: broadcast::Sender<BrokerEvent>,
    hooks: Arc<dyn Hooks>,
    metrics: Option<Arc<Metrics>>,
    persistence: Option<Arc<PersistenceManager>>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut conn = Connection::new(
        stream,
        addr,
        proxy_info,
        sessions,
        subscriptions,
        retained,
        connections,
        config,
        events,
        hooks,
        metrics,
        persistence,
    );

    {
        let conn_fut = conn.run();
        tokio::pin!(conn_fut);

        loop {
            tokio::select! {
                biased;

                result = &mut conn_fut => {
                    if let Err(e) = result {
                        debug!("Connection error from {}: {}", addr, e);
                    }
                    break;
                }
                result = shutdown_rx.recv() => {
                    match result {
                        Ok(()) => {
                            debug!("Connection {} shutting down", addr);
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Connection {} shutdown (channel closed)", addr);
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }
    }

    conn.return_buffers();
}

/// Deliver a message to local subscribers only: used both for cluster-origin
/// publishes (which must never be forwarded back out to the cluster) and as
/// the routing half of `Broker::publish`.
fn deliver_local(
    subscriptions: &Arc<SubscriptionStore>,
    connections: &Arc<DashMap<Arc<str>, Arc<SharedWriter>>>,
    sessions: &Arc<SessionStore>,
    topic: &str,
    payload: Bytes,
    qos: QoS,
    retain: bool,
) {
    let publish = Publish {
        dup: false,
        qos,
        retain,
        topic: Arc::from(topic),
        packet_id: None,
        payload,
        properties: Properties::default(),
    };

    let matches = subscriptions.matches(topic);

    let mut client_subs: std::collections::HashMap<Arc<str>, (QoS, bool)> =
        std::collections::HashMap::new();
    for sub in matches {
        let entry = client_subs
            .entry(sub.client_id.clone())
            .or_insert((QoS::AtMostOnce, false));
        if sub.qos > entry.0 {
            entry.0 = sub.qos;
        }
        if sub.retain_as_published {
            entry.1 = true;
        }
    }

    for (client_id, (sub_qos, retain_as_published)) in client_subs {
        let effective_qos = qos.min(sub_qos);
        let effective_retain = retain_as_published && retain;

        if let Some(writer) = connections.get(&client_id) {
            let mut publish = publish.clone();
            let _ = writer.send_publish(&mut publish, effective_qos, effective_retain);
        } else if let Some(session) = sessions.get(client_id.as_ref()) {
            let mut s = session.write();
            if !s.clean_start {
                let mut publish = publish.clone();
                publish.qos = effective_qos;
                publish.retain = effective_retain;
                s.queue_message(publish);
            }
        }
    }
}
