//! Glues the Raft log, state machine, and TCP network together into a
//! running consensus node, and exposes the narrow surface the broker needs:
//! propose a subscription change, read the resulting digest, and admit a
//! joining peer as a voter.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use openraft::{BasicNode, Config as RaftConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::digest::{node_id_for, SubscriptionDigest};
use super::network::{RaftNetworkFactoryImpl, RaftRpc, RaftRpcResponse};
use super::storage::{LogStore, StateMachineStore};
use super::types::{NodeId, Raft, SubscriptionCommand};

#[derive(Debug)]
pub enum ConsensusError {
    Raft(String),
    Io(std::io::Error),
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusError::Raft(e) => write!(f, "raft error: {}", e),
            ConsensusError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for ConsensusError {}

impl From<std::io::Error> for ConsensusError {
    fn from(e: std::io::Error) -> Self {
        ConsensusError::Io(e)
    }
}

/// A running consensus node: owns the Raft instance and the subscription
/// digest it drives. Cheap to clone (the inner `Raft` handle and the digest
/// are both reference-counted).
#[derive(Clone)]
pub struct ConsensusHandle {
    raft: Raft,
    digest: Arc<SubscriptionDigest>,
    node_id: NodeId,
    network: RaftNetworkFactoryImpl,
}

impl ConsensusHandle {
    /// Start a consensus node listening on `bind_addr` for Raft RPCs. With
    /// no seeds this node bootstraps as the sole voter of a new cluster;
    /// otherwise it starts as an uninitialized follower, waiting to be
    /// admitted by an existing member through `add_voter`.
    pub async fn start(
        node_name: &str,
        bind_addr: SocketAddr,
        advertise_addr: SocketAddr,
        seeds: &[String],
    ) -> Result<Self, ConsensusError> {
        let node_id = node_id_for(node_name);
        let digest = Arc::new(SubscriptionDigest::new());

        let log_store = LogStore::default();
        let state_machine = StateMachineStore::new(digest.clone());
        let network = RaftNetworkFactoryImpl::new();

        let raft_config = RaftConfig {
            cluster_name: "fenwickmq-subscription-digest".to_string(),
            heartbeat_interval: 250,
            election_timeout_min: 800,
            election_timeout_max: 1500,
            ..Default::default()
        };
        let raft_config = Arc::new(
            raft_config
                .validate()
                .map_err(|e| ConsensusError::Raft(e.to_string()))?,
        );

        let raft = Raft::new(node_id, raft_config, network.clone(), log_store, state_machine)
            .await
            .map_err(|e| ConsensusError::Raft(e.to_string()))?;

        let listener = TcpListener::bind(bind_addr).await?;
        let raft_for_listener = raft.clone();
        tokio::spawn(async move {
            rpc_listener_loop(listener, raft_for_listener).await;
        });

        let handle = Self {
            raft,
            digest,
            node_id,
            network,
        };

        if seeds.is_empty() {
            let mut members = BTreeMap::new();
            members.insert(node_id, BasicNode::new(advertise_addr.to_string()));
            match handle.raft.initialize(members).await {
                Ok(()) => info!(node_id, "subscription digest log bootstrapped as sole voter"),
                Err(e) => warn!("subscription digest log bootstrap skipped: {}", e),
            }
        }

        Ok(handle)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn digest(&self) -> &Arc<SubscriptionDigest> {
        &self.digest
    }

    /// Register where to reach another node's consensus RPC endpoint so this
    /// node's network factory can dial it, ahead of that node appearing in
    /// committed membership (e.g. right after a gossip-discovered join).
    pub async fn register_peer(&self, node_id: NodeId, addr: SocketAddr) {
        self.network.register(node_id, addr).await;
    }

    /// Admit a new node as a voting member. Call this on the current leader
    /// once the joining node's consensus endpoint is reachable.
    pub async fn add_voter(&self, node_id: NodeId, advertise_addr: SocketAddr) -> Result<(), ConsensusError> {
        let node = BasicNode::new(advertise_addr.to_string());

        self.raft
            .add_learner(node_id, node.clone(), true)
            .await
            .map_err(|e| ConsensusError::Raft(e.to_string()))?;

        let mut members: BTreeMap<NodeId, BasicNode> = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .nodes()
            .map(|(id, n)| (*id, n.clone()))
            .collect();
        members.insert(node_id, node);

        self.raft
            .change_membership(members, false)
            .await
            .map_err(|e| ConsensusError::Raft(e.to_string()))?;
        Ok(())
    }

    /// Propose a subscription digest change through the log. Fire-and-forget:
    /// failures (not the leader, no quorum) are logged and dropped, since a
    /// dropped `Subscribe` just means the next publish on that node proposes
    /// it again on the next topic match.
    pub async fn propose(&self, command: SubscriptionCommand) {
        if let Err(e) = self.raft.client_write(command).await {
            warn!("subscription digest proposal failed: {}", e);
        }
    }
}

async fn rpc_listener_loop(listener: TcpListener, raft: Raft) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let raft = raft.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_rpc_connection(stream, raft).await {
                        debug!("consensus RPC connection from {} ended: {}", addr, e);
                    }
                });
            }
            Err(e) => error!("consensus RPC accept error: {}", e),
        }
    }
}

async fn handle_rpc_connection(mut stream: TcpStream, raft: Raft) -> Result<(), ConsensusError> {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;

        let (rpc, _): (RaftRpc, usize) = bincode::serde::decode_from_slice(&buf, bincode::config::standard())
            .map_err(|e| ConsensusError::Raft(e.to_string()))?;

        let response = match rpc {
            RaftRpc::AppendEntries(req) => match raft.append_entries(req).await {
                Ok(resp) => RaftRpcResponse::AppendEntries(resp),
                Err(e) => RaftRpcResponse::Error(e.to_string()),
            },
            RaftRpc::InstallSnapshot(req) => match raft.install_snapshot(req).await {
                Ok(resp) => RaftRpcResponse::InstallSnapshot(resp),
                Err(e) => RaftRpcResponse::Error(e.to_string()),
            },
            RaftRpc::Vote(req) => match raft.vote(req).await {
                Ok(resp) => RaftRpcResponse::Vote(resp),
                Err(e) => RaftRpcResponse::Error(e.to_string()),
            },
        };

        let payload = bincode::serde::encode_to_vec(&response, bincode::config::standard())
            .map_err(|e| ConsensusError::Raft(e.to_string()))?;
        stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        stream.write_all(&payload).await?;
    }
}
