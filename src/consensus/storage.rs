//! In-memory Raft log and state machine storage for the subscription digest.
//!
//! There's no durability requirement here: the digest is a derived,
//! fully-replayable view (see `SubscriptionDigest::snapshot`/`restore`), so
//! losing this log on restart just means the node catches up from whichever
//! peer is leader rather than from disk.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{IOFlushed, LogState, RaftLogReader, RaftLogStorage, RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{BasicNode, Entry, EntryPayload, LogId, OptionalSend, StorageError, StoredMembership, Vote};
use tokio::sync::RwLock;

use super::digest::SubscriptionDigest;
use super::types::{NodeId, SubscriptionResponse, TypeConfig};

#[derive(Debug, Default)]
struct LogStoreState {
    log: BTreeMap<u64, Entry<TypeConfig>>,
    vote: Option<Vote<NodeId>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
}

/// Raft log storage, backed by an in-memory `BTreeMap`. Cheap to clone: all
/// state lives behind the shared `Arc<RwLock<_>>`.
#[derive(Clone, Default)]
pub struct LogStore {
    state: Arc<RwLock<LogStoreState>>,
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + std::fmt::Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let state = self.state.read().await;
        Ok(state.log.range(range).map(|(_, v)| v.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let state = self.state.read().await;
        let last_log_id = state.log.values().last().map(|e| e.log_id);
        Ok(LogState {
            last_purged_log_id: state.last_purged,
            last_log_id,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.state.write().await.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.state.read().await.vote)
    }

    async fn save_committed(&mut self, committed: Option<LogId<NodeId>>) -> Result<(), StorageError<NodeId>> {
        self.state.write().await.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.state.read().await.committed)
    }

    async fn append<I>(&mut self, entries: I, callback: IOFlushed<TypeConfig>) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut state = self.state.write().await;
        for entry in entries {
            state.log.insert(entry.log_id.index, entry);
        }
        drop(state);
        callback.io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let mut state = self.state.write().await;
        state.log.retain(|&idx, _| idx < log_id.index);
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let mut state = self.state.write().await;
        state.log.retain(|&idx, _| idx > log_id.index);
        state.last_purged = Some(log_id);
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}

/// State machine applying committed `SubscriptionCommand`s into a shared
/// `SubscriptionDigest`. Snapshots are just a serialized digest dump;
/// rebuilding from one calls `SubscriptionDigest::restore`.
#[derive(Clone)]
pub struct StateMachineStore {
    digest: Arc<SubscriptionDigest>,
    applied: Arc<RwLock<Option<LogId<NodeId>>>>,
    membership: Arc<RwLock<StoredMembership<NodeId, BasicNode>>>,
}

impl StateMachineStore {
    pub fn new(digest: Arc<SubscriptionDigest>) -> Self {
        Self {
            digest,
            applied: Arc::new(RwLock::new(None)),
            membership: Arc::new(RwLock::new(StoredMembership::default())),
        }
    }
}

impl RaftSnapshotBuilder<TypeConfig> for StateMachineStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let data = self.digest.snapshot();
        let bytes = serde_json::to_vec(&data).unwrap_or_default();
        let last_log_id = *self.applied.read().await;
        let last_membership = self.membership.read().await.clone();
        Ok(Snapshot {
            meta: openraft::SnapshotMeta {
                last_log_id,
                last_membership,
                snapshot_id: format!("{:?}-{}", last_log_id, bytes.len()),
            },
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for StateMachineStore {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>> {
        Ok((*self.applied.read().await, self.membership.read().await.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<SubscriptionResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut responses = Vec::new();
        for entry in entries {
            *self.applied.write().await = Some(entry.log_id);
            match entry.payload {
                EntryPayload::Blank => responses.push(SubscriptionResponse::default()),
                EntryPayload::Normal(cmd) => {
                    self.digest.apply(&cmd);
                    responses.push(SubscriptionResponse { applied: true });
                }
                EntryPayload::Membership(membership) => {
                    *self.membership.write().await = StoredMembership::new(Some(entry.log_id), membership);
                    responses.push(SubscriptionResponse::default());
                }
            }
        }
        Ok(responses)
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &openraft::SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data: Vec<(String, Vec<String>)> = serde_json::from_slice(snapshot.get_ref()).unwrap_or_default();
        self.digest.restore(data);
        *self.applied.write().await = meta.last_log_id;
        *self.membership.write().await = meta.last_membership.clone();
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(Some(self.build_snapshot().await?))
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }
}
