//! Fenwick MQ - clustered MQTT v3.1.1/v5.0 broker
//!
//! A multi-core MQTT broker that replicates subscription routing state
//! across nodes via a Raft-shaped consensus log, while forwarding the
//! publications themselves directly over a gossip membership transport.

pub mod acl;
pub mod auth;
pub mod broker;
pub mod buffer_pool;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod consensus;
pub mod flapping;
pub mod hooks;
pub mod metrics;
pub mod persistence;
#[cfg(feature = "pprof")]
pub mod profiling;
pub mod protocol;
pub mod proxy;
pub mod remote;
pub mod session;
pub mod topic;
pub mod transport;

pub use acl::AclProvider;
pub use auth::AuthProvider;
pub use broker::{Broker, BrokerConfig};
pub use cluster::{ClusterConfig, ClusterManager};
pub use config::Config;
pub use consensus::{ConsensusError, ConsensusHandle, SubscriptionDigest};
pub use flapping::{ConnectionLimitConfig, FlappingConfig, FlappingDetector};
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use metrics::{Metrics, MetricsServer};
pub use persistence::{FjallBackend, PersistenceManager, StorageBackend};
pub use protocol::{ProtocolVersion, QoS};
pub use remote::{RemoteError, RemotePeer, RemotePeerStatus};
