//! TCP transport for Raft RPCs (AppendEntries, InstallSnapshot, Vote).
//!
//! Each node dials a peer's consensus address directly; there's no
//! multiplexing with the gossip or peer-forwarding channels. Framing follows
//! the same length-prefixed-bincode shape used for cluster peer messages.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, VoteRequest,
    VoteResponse,
};
use openraft::BasicNode;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::types::{NodeId, TypeConfig};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum RaftRpc {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
    Vote(VoteRequest<NodeId>),
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum RaftRpcResponse {
    AppendEntries(AppendEntriesResponse<NodeId>),
    InstallSnapshot(InstallSnapshotResponse<NodeId>),
    Vote(VoteResponse<NodeId>),
    Error(String),
}

async fn send_rpc(addr: SocketAddr, rpc: &RaftRpc) -> std::io::Result<RaftRpcResponse> {
    let payload = bincode::serde::encode_to_vec(rpc, bincode::config::standard())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(&payload).await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;

    let (resp, _) = bincode::serde::decode_from_slice(&buf, bincode::config::standard())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(resp)
}

fn unreachable_err<E>(e: &std::io::Error) -> RPCError<NodeId, BasicNode, RaftError<NodeId, E>>
where
    E: std::fmt::Debug,
{
    RPCError::Unreachable(Unreachable::new(e))
}

/// One outbound connection target: a peer's consensus RPC address, dialed
/// fresh per call (there's no long-lived connection to keep warm; Raft RPCs
/// are infrequent enough that the overhead doesn't matter).
pub struct RaftNetworkConnection {
    addr: SocketAddr,
}

impl RaftNetwork<TypeConfig> for RaftNetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        match send_rpc(self.addr, &RaftRpc::AppendEntries(rpc)).await {
            Ok(RaftRpcResponse::AppendEntries(resp)) => Ok(resp),
            Ok(RaftRpcResponse::Error(msg)) => Err(unreachable_err(&std::io::Error::new(
                std::io::ErrorKind::Other,
                msg,
            ))),
            Ok(_) => Err(unreachable_err(&std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unexpected RPC response type",
            ))),
            Err(e) => Err(unreachable_err(&e)),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<InstallSnapshotResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>>
    {
        match send_rpc(self.addr, &RaftRpc::InstallSnapshot(rpc)).await {
            Ok(RaftRpcResponse::InstallSnapshot(resp)) => Ok(resp),
            Ok(RaftRpcResponse::Error(msg)) => Err(unreachable_err(&std::io::Error::new(
                std::io::ErrorKind::Other,
                msg,
            ))),
            Ok(_) => Err(unreachable_err(&std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unexpected RPC response type",
            ))),
            Err(e) => Err(unreachable_err(&e)),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        match send_rpc(self.addr, &RaftRpc::Vote(rpc)).await {
            Ok(RaftRpcResponse::Vote(resp)) => Ok(resp),
            Ok(RaftRpcResponse::Error(msg)) => Err(unreachable_err(&std::io::Error::new(
                std::io::ErrorKind::Other,
                msg,
            ))),
            Ok(_) => Err(unreachable_err(&std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unexpected RPC response type",
            ))),
            Err(e) => Err(unreachable_err(&e)),
        }
    }
}

/// Factory handing out a connection per target node, resolving the target's
/// consensus address from whatever `BasicNode` openraft passes us (falling
/// back to an explicitly registered address when the node's `addr` field
/// hasn't been populated yet, e.g. during initial bootstrap).
#[derive(Clone, Default)]
pub struct RaftNetworkFactoryImpl {
    addrs: Arc<Mutex<HashMap<NodeId, SocketAddr>>>,
}

impl RaftNetworkFactoryImpl {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, node_id: NodeId, addr: SocketAddr) {
        self.addrs.lock().await.insert(node_id, addr);
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftNetworkFactoryImpl {
    type Network = RaftNetworkConnection;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        let addr = node
            .addr
            .parse()
            .ok()
            .or_else(|| self.addrs.try_lock().ok().and_then(|m| m.get(&target).copied()))
            .unwrap_or_else(|| "127.0.0.1:0".parse().unwrap());
        RaftNetworkConnection { addr }
    }
}
