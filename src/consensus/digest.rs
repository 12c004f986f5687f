//! The replicated subscription digest: which nodes have a local subscriber
//! for which topic filter. Every node applies the same committed command
//! sequence, so the digest converges without gossiping through SWIM.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

use crate::topic::TopicTrie;

use super::types::{NodeId, SubscriptionCommand};

/// Derive a stable Raft `NodeId` from a cluster node name. Raft itself only
/// needs the id to be `Ord + Hash`; the human-readable name travels in the
/// `BasicNode` address field and in every `SubscriptionCommand`.
pub fn node_id_for(name: &str) -> NodeId {
    let mut hasher = ahash::AHasher::default();
    name.hash(&mut hasher);
    hasher.finish()
}

/// Thread-safe view over which nodes subscribe to which filters, built by
/// applying the committed Raft log. Consulted by the publish path to decide
/// which peers a message needs forwarding to.
#[derive(Default)]
pub struct SubscriptionDigest {
    trie: RwLock<TopicTrie<HashSet<String>>>,
}

impl SubscriptionDigest {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    /// Apply a committed command, mutating the digest in place.
    pub fn apply(&self, command: &SubscriptionCommand) {
        match command {
            SubscriptionCommand::Subscribe { filter, node_id } => {
                let mut trie = self.trie.write();
                if let Some(nodes) = trie.get_mut(filter) {
                    nodes.insert(node_id.clone());
                } else {
                    let mut nodes = HashSet::new();
                    nodes.insert(node_id.clone());
                    trie.insert(filter, nodes);
                }
            }
            SubscriptionCommand::Unsubscribe { filter, node_id } => {
                let mut trie = self.trie.write();
                if let Some(nodes) = trie.get_mut(filter) {
                    nodes.remove(node_id);
                }
            }
        }
    }

    /// Nodes (other than `exclude`) whose local subscribers mean a publish
    /// on `topic` needs to be forwarded to them.
    pub fn targets_for(&self, topic: &str, exclude: &str) -> Vec<String> {
        let trie = self.trie.read();
        let mut targets = HashSet::new();
        trie.matches(topic, |nodes| {
            for node in nodes {
                if node != exclude {
                    targets.insert(node.clone());
                }
            }
        });
        targets.into_iter().collect()
    }

    /// Snapshot the entire digest as `(filter, nodes)` pairs, for Raft
    /// snapshot building.
    pub fn snapshot(&self) -> Vec<(String, Vec<String>)> {
        let trie = self.trie.read();
        let mut out = Vec::new();
        trie.for_each_with_filter(|filter, nodes| {
            out.push((filter.to_string(), nodes.iter().cloned().collect()));
        });
        out
    }

    /// Clear and rebuild the digest from a list of `(filter, nodes)` pairs.
    pub fn restore(&self, entries: Vec<(String, Vec<String>)>) {
        let mut trie = TopicTrie::new();
        for (filter, nodes) in entries {
            trie.insert(&filter, nodes.into_iter().collect());
        }
        *self.trie.write() = trie;
    }
}
