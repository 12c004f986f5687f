//! Raft-replicated subscription digest.
//!
//! The only thing that crosses this log is "node X gained/lost its last
//! local subscriber on filter Y" — never a publication. Every node applies
//! the same committed sequence, so the forwarding table converges without
//! racing gossip updates through SWIM. See `crate::cluster` for the
//! publish-forwarding transport that actually moves message bytes.

mod digest;
mod network;
mod node;
mod storage;
pub mod types;

pub use digest::{node_id_for, SubscriptionDigest};
pub use node::{ConsensusError, ConsensusHandle};
pub use types::{NodeId, Raft, SubscriptionCommand, SubscriptionResponse, TypeConfig};
