//! Cluster Peer
//!
//! Represents a connection to another node in the cluster.
//! Implements RemotePeer for unified message forwarding.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::QoS;
use crate::remote::{RemoteError, RemotePeer, RemotePeerStatus};

use super::protocol::{frame_message, read_frame_length, ClusterMessage, CLUSTER_PROTOCOL_VERSION};

/// A publish queued for delivery once a disconnected peer comes back.
struct QueuedPublish {
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
}

/// Bounded, drop-oldest queue of publishes that couldn't be forwarded
/// because the peer was unreachable. Drained as soon as the peer
/// reconnects, so a flapping link doesn't lose everything in flight.
struct HandoffQueue {
    items: Mutex<VecDeque<QueuedPublish>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl HandoffQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, topic: String, payload: Bytes, qos: QoS, retain: bool) {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        items.push_back(QueuedPublish {
            topic,
            payload,
            qos,
            retain,
        });
    }

    fn drain(&self) -> Vec<QueuedPublish> {
        let mut items = self.items.lock();
        items.drain(..).collect()
    }

    fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Commands sent to the peer connection task
#[derive(Debug)]
pub enum ClusterCommand {
    /// Forward a publish message
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        origin_node: String,
    },
    /// Shutdown the connection
    Shutdown,
}

/// Callback for messages received from a cluster peer
pub type ClusterInboundCallback = Arc<dyn Fn(String, Bytes, QoS, bool, String) + Send + Sync>;

/// A connection to another cluster node
pub struct ClusterPeer {
    /// Remote node ID
    node_id: String,
    /// Remote peer address for TCP connection
    peer_addr: SocketAddr,
    /// Current connection status
    status: Arc<RwLock<RemotePeerStatus>>,
    /// Command channel for sending operations to the connection task
    command_tx: Option<mpsc::Sender<ClusterCommand>>,
    /// Publishes queued while this peer was unreachable
    handoff: Arc<HandoffQueue>,
    /// Our local node ID (for origin tracking)
    local_node_id: String,
}

impl ClusterPeer {
    /// Create a new cluster peer
    pub fn new(
        node_id: String,
        peer_addr: SocketAddr,
        local_node_id: String,
        handoff_queue_size: usize,
    ) -> Self {
        Self {
            node_id,
            peer_addr,
            status: Arc::new(RwLock::new(RemotePeerStatus::Disconnected)),
            command_tx: None,
            handoff: Arc::new(HandoffQueue::new(handoff_queue_size)),
            local_node_id,
        }
    }

    /// Get the remote node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Number of messages dropped from the handoff queue because the peer
    /// stayed unreachable past the queue's capacity.
    pub fn dropped_handoff_count(&self) -> u64 {
        self.handoff.dropped_count()
    }

    /// Spawn the connection task and return the peer ready to use
    pub fn spawn(mut self, inbound_callback: ClusterInboundCallback) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1000);
        self.command_tx = Some(tx);

        let node_id = self.node_id.clone();
        let local_node_id = self.local_node_id.clone();
        let peer_addr = self.peer_addr;
        let status = self.status.clone();
        let handoff = self.handoff.clone();

        tokio::spawn(async move {
            Self::connection_loop(
                node_id,
                local_node_id,
                peer_addr,
                status,
                rx,
                inbound_callback,
                handoff,
            )
            .await;
        });

        Arc::new(self)
    }

    /// Run the connection loop with reconnection
    async fn connection_loop(
        node_id: String,
        local_node_id: String,
        peer_addr: SocketAddr,
        status: Arc<RwLock<RemotePeerStatus>>,
        mut command_rx: mpsc::Receiver<ClusterCommand>,
        inbound_callback: ClusterInboundCallback,
        handoff: Arc<HandoffQueue>,
    ) {
        let mut retry_interval = Duration::from_secs(1);
        let max_retry = Duration::from_secs(30);

        loop {
            *status.write() = RemotePeerStatus::Connecting;
            debug!("ClusterPeer '{}': Connecting to {}", node_id, peer_addr);

            match Self::connect_and_run(
                &node_id,
                &local_node_id,
                peer_addr,
                &status,
                &mut command_rx,
                &inbound_callback,
                &handoff,
            )
            .await
            {
                Ok(()) => {
                    info!("ClusterPeer '{}': Disconnected gracefully", node_id);
                    *status.write() = RemotePeerStatus::Disconnected;
                    return; // Clean shutdown
                }
                Err(e) => {
                    error!("ClusterPeer '{}': Connection failed: {}", node_id, e);
                    *status.write() = RemotePeerStatus::Backoff;

                    debug!(
                        "ClusterPeer '{}': Reconnecting in {:?}",
                        node_id, retry_interval
                    );

                    tokio::time::sleep(retry_interval).await;
                    retry_interval = std::cmp::min(retry_interval * 2, max_retry);
                }
            }

            // Check for shutdown command
            match command_rx.try_recv() {
                Ok(ClusterCommand::Shutdown) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    info!("ClusterPeer '{}': Shutdown requested", node_id);
                    *status.write() = RemotePeerStatus::Disconnected;
                    return;
                }
                _ => {}
            }
        }
    }

    /// Connect to the peer and run the message loop
    async fn connect_and_run(
        node_id: &str,
        local_node_id: &str,
        peer_addr: SocketAddr,
        status: &Arc<RwLock<RemotePeerStatus>>,
        command_rx: &mut mpsc::Receiver<ClusterCommand>,
        inbound_callback: &ClusterInboundCallback,
        handoff: &Arc<HandoffQueue>,
    ) -> Result<(), RemoteError> {
        // Connect with timeout
        let stream = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(peer_addr))
            .await
            .map_err(|_| RemoteError::Timeout)?
            .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;

        debug!("ClusterPeer '{}': TCP connected", node_id);

        let (mut read_half, mut write_half) = stream.into_split();

        // Send Hello
        let hello = ClusterMessage::Hello {
            node_id: local_node_id.to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        let frame = frame_message(&hello)
            .map_err(|e| RemoteError::Other(format!("Encode error: {}", e)))?;
        write_half
            .write_all(&frame)
            .await
            .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;

        debug!("ClusterPeer '{}': Hello sent", node_id);

        // Wait for HelloAck
        let mut read_buf = vec![0u8; 65536];
        let n = tokio::time::timeout(Duration::from_secs(10), read_half.read(&mut read_buf))
            .await
            .map_err(|_| RemoteError::Timeout)?
            .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;

        if n == 0 {
            return Err(RemoteError::ConnectionLost("Connection closed".to_string()));
        }

        // Parse length and message
        let len = read_frame_length(&read_buf[..n])
            .ok_or_else(|| RemoteError::Other("Invalid frame".to_string()))?;
        if n < 4 + len as usize {
            return Err(RemoteError::Other("Incomplete frame".to_string()));
        }

        let msg = ClusterMessage::decode(&read_buf[4..4 + len as usize])
            .map_err(|e| RemoteError::Other(format!("Decode error: {}", e)))?;

        match msg {
            ClusterMessage::HelloAck {
                node_id: peer_id,
                version,
            } => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(RemoteError::Rejected(format!(
                        "Protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )));
                }
                info!("ClusterPeer '{}': Connected (peer_id={})", node_id, peer_id);
            }
            _ => {
                return Err(RemoteError::Other("Expected HelloAck".to_string()));
            }
        }

        *status.write() = RemotePeerStatus::Connected;

        // Flush anything that piled up while this peer was unreachable
        let queued = handoff.drain();
        if !queued.is_empty() {
            debug!(
                "ClusterPeer '{}': draining {} handed-off publishes",
                node_id,
                queued.len()
            );
        }
        for item in queued {
            let msg = ClusterMessage::Publish {
                topic: item.topic,
                payload: item.payload.to_vec(),
                qos: item.qos as u8,
                retain: item.retain,
                origin_node: local_node_id.to_string(),
            };
            let frame = frame_message(&msg)
                .map_err(|e| RemoteError::Other(format!("Encode error: {}", e)))?;
            write_half
                .write_all(&frame)
                .await
                .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;
        }

        // Message loop
        let ping_interval = Duration::from_secs(15);
        let mut ping_timer = tokio::time::interval(ping_interval);
        ping_timer.reset();

        let mut buf_offset = 0usize;

        loop {
            tokio::select! {
                // Handle commands from the cluster manager
                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        ClusterCommand::Publish { topic, payload, qos, retain, origin_node } => {
                            debug!("ClusterPeer '{}': sending publish '{}' over TCP", node_id, topic);
                            let msg = ClusterMessage::Publish {
                                topic: topic.clone(),
                                payload: payload.to_vec(),
                                qos: qos as u8,
                                retain,
                                origin_node,
                            };
                            if let Ok(frame) = frame_message(&msg) {
                                if let Err(e) = write_half.write_all(&frame).await {
                                    error!("ClusterPeer '{}': TCP write error: {}", node_id, e);
                                    return Err(RemoteError::ConnectionLost(e.to_string()));
                                }
                                debug!("ClusterPeer '{}': sent {} bytes for '{}'", node_id, frame.len(), topic);
                            }
                        }
                        ClusterCommand::Shutdown => {
                            // Send Goodbye
                            let msg = ClusterMessage::Goodbye;
                            if let Ok(frame) = frame_message(&msg) {
                                let _ = write_half.write_all(&frame).await;
                            }
                            return Ok(());
                        }
                    }
                }

                // Handle incoming messages from peer
                result = read_half.read(&mut read_buf[buf_offset..]) => {
                    let n = result.map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;
                    if n == 0 {
                        return Err(RemoteError::ConnectionLost("Connection closed".to_string()));
                    }

                    buf_offset += n;

                    // Process complete frames
                    while buf_offset >= 4 {
                        let len = read_frame_length(&read_buf).unwrap() as usize;
                        if buf_offset < 4 + len {
                            break; // Need more data
                        }

                        if let Ok(msg) = ClusterMessage::decode(&read_buf[4..4 + len]) {
                            match msg {
                                ClusterMessage::Publish { topic, payload, qos, retain, origin_node } => {
                                    // Always process messages from cluster peers
                                    let qos_level = match qos {
                                        0 => QoS::AtMostOnce,
                                        1 => QoS::AtLeastOnce,
                                        _ => QoS::ExactlyOnce,
                                    };
                                    debug!(
                                        "ClusterPeer '{}': Received publish on '{}' (origin={})",
                                        node_id, topic, origin_node
                                    );
                                    inbound_callback(
                                        topic,
                                        Bytes::from(payload),
                                        qos_level,
                                        retain,
                                        origin_node,
                                    );
                                }
                                ClusterMessage::Ping => {
                                    let pong = ClusterMessage::Pong;
                                    if let Ok(frame) = frame_message(&pong) {
                                        let _ = write_half.write_all(&frame).await;
                                    }
                                }
                                ClusterMessage::Pong => {
                                    debug!("ClusterPeer '{}': Pong received", node_id);
                                }
                                ClusterMessage::Goodbye => {
                                    info!("ClusterPeer '{}': Received Goodbye", node_id);
                                    return Err(RemoteError::ConnectionLost("Peer disconnected".to_string()));
                                }
                                _ => {}
                            }
                        }

                        // Shift buffer
                        read_buf.copy_within(4 + len..buf_offset, 0);
                        buf_offset -= 4 + len;
                    }
                }

                // Send periodic ping
                _ = ping_timer.tick() => {
                    let ping = ClusterMessage::Ping;
                    if let Ok(frame) = frame_message(&ping) {
                        if let Err(e) = write_half.write_all(&frame).await {
                            return Err(RemoteError::ConnectionLost(e.to_string()));
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RemotePeer for ClusterPeer {
    fn name(&self) -> &str {
        &self.node_id
    }

    fn status(&self) -> RemotePeerStatus {
        *self.status.read()
    }

    async fn forward_publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RemoteError> {
        if self.status() == RemotePeerStatus::Connected {
            if let Some(ref tx) = self.command_tx {
                return tx
                    .send(ClusterCommand::Publish {
                        topic: topic.to_string(),
                        payload,
                        qos,
                        retain,
                        origin_node: self.local_node_id.clone(),
                    })
                    .await
                    .map_err(|_| RemoteError::ConnectionLost("Command channel closed".to_string()));
            }
        }

        // Peer is unreachable right now; hold the message for delivery on reconnect
        warn!(
            "ClusterPeer '{}': not connected, handing off publish on '{}'",
            self.node_id, topic
        );
        self.handoff
            .push(topic.to_string(), payload, qos, retain);
        Ok(())
    }

    async fn notify_subscribe(&self, _filter: &str, _qos: QoS) -> Result<(), RemoteError> {
        // Subscription state is replicated via the consensus log, not
        // peer-to-peer notification; nothing to do here.
        Ok(())
    }

    async fn notify_unsubscribe(&self, _filter: &str) -> Result<(), RemoteError> {
        Ok(())
    }

    fn should_forward(&self, _topic: &str) -> bool {
        // Routing decisions are made by the caller by consulting the
        // subscription digest before it ever reaches a specific peer.
        true
    }

    async fn start(&self) -> Result<(), RemoteError> {
        info!("ClusterPeer '{}': Starting", self.node_id);
        Ok(())
    }

    async fn stop(&self) -> Result<(), RemoteError> {
        if let Some(ref tx) = self.command_tx {
            let _ = tx.send(ClusterCommand::Shutdown).await;
        }
        info!("ClusterPeer '{}': Stopped", self.node_id);
        Ok(())
    }
}
