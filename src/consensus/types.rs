//! Raft type configuration for the subscription digest log.
//!
//! We replicate one thing over this log: which nodes have a local
//! subscriber for a given topic filter. Publications themselves never touch
//! Raft, only the routing table every node consults before forwarding one.

use std::fmt;

use openraft::BasicNode;
use serde::{Deserialize, Serialize};

/// A single change to the subscription digest: either a node gained its
/// first local subscriber for a filter, or lost its last one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubscriptionCommand {
    /// `node_id` now has at least one local subscriber on `filter`
    Subscribe { filter: String, node_id: String },
    /// `node_id` no longer has any local subscriber on `filter`
    Unsubscribe { filter: String, node_id: String },
}

/// Response returned from `client_write` once a command is committed
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SubscriptionResponse {
    pub applied: bool,
}

impl fmt::Display for SubscriptionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionCommand::Subscribe { filter, node_id } => {
                write!(f, "subscribe({}, {})", filter, node_id)
            }
            SubscriptionCommand::Unsubscribe { filter, node_id } => {
                write!(f, "unsubscribe({}, {})", filter, node_id)
            }
        }
    }
}

pub type NodeId = u64;

openraft::declare_raft_types!(
    /// Raft type configuration for the subscription digest log
    pub TypeConfig:
        D = SubscriptionCommand,
        R = SubscriptionResponse,
        NodeId = NodeId,
        Node = BasicNode,
);

pub type Raft = openraft::Raft<TypeConfig>;
pub type Entry = openraft::Entry<TypeConfig>;
pub type Vote = openraft::Vote<NodeId>;
pub type LogId = openraft::LogId<NodeId>;
pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, BasicNode>;
pub type StoredMembership = openraft::StoredMembership<NodeId, BasicNode>;
