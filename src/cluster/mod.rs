//! Cluster Module
//!
//! Provides gossip-based horizontal clustering for Fenwick MQ.
//!
//! # Architecture
//!
//! The cluster uses three communication channels:
//! - **Gossip (UDP via chitchat)**: node discovery and membership only
//! - **Peer TCP**: direct message forwarding between nodes, plus handshake/keepalive
//! - **Consensus (see `crate::consensus`)**: replicates the subscription digest
//!   (which filters have local subscribers on which node) so every node agrees
//!   on where to forward a publish without gossiping JSON blobs through SWIM
//!
//! # Usage
//!
//! ```toml
//! # fenwickmq.toml
//! [[cluster]]
//! enabled = true
//! gossip_addr = "0.0.0.0:7946"
//! peer_addr = "0.0.0.0:7947"
//! seeds = ["node1:7946", "node2:7946"]
//! ```

mod manager;
mod peer;
mod protocol;

pub use manager::ClusterManager;
pub use peer::{ClusterInboundCallback, ClusterPeer};
pub use protocol::{ClusterMessage, CLUSTER_PROTOCOL_VERSION};

// Re-export cluster config
pub use crate::config::ClusterConfig;
