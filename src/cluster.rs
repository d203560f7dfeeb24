use crate::crypto::VerifyingKey;
use crate::services::{ClusterStorage, NodeStorage, ServiceResult};
use crate::types::PeerId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug)]
pub struct PeerData {
    pub id: PeerId,
    pub alias: String,
    pub public_key: VerifyingKey,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    Initial,
    Ready,
    SnapshotCreation,
    DownloadInProgress,
    Leaving,
    Offline,
}

pub fn can_start_own_consensus(state: NodeState) -> bool {
    matches!(state, NodeState::Ready)
}

pub fn can_participate_consensus(state: NodeState) -> bool {
    matches!(state, NodeState::Ready | NodeState::SnapshotCreation)
}

/// In-memory view of cluster membership.
pub struct InMemoryClusterStorage {
    peers: Mutex<HashMap<PeerId, PeerData>>,
    ready_and_full: Mutex<HashSet<PeerId>>,
}

impl InMemoryClusterStorage {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            ready_and_full: Mutex::new(HashSet::new()),
        }
    }

    pub fn add_peer(&self, peer: PeerData, ready_and_full: bool) {
        if ready_and_full {
            self.ready_and_full.lock().insert(peer.id);
        }
        self.peers.lock().insert(peer.id, peer);
    }

    pub fn remove_peer(&self, id: PeerId) {
        self.peers.lock().remove(&id);
        self.ready_and_full.lock().remove(&id);
    }
}

impl Default for InMemoryClusterStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterStorage for InMemoryClusterStorage {
    async fn get_peers(&self) -> ServiceResult<HashMap<PeerId, PeerData>> {
        Ok(self.peers.lock().clone())
    }

    async fn get_ready_and_full_peers(&self) -> ServiceResult<HashMap<PeerId, PeerData>> {
        let ready = self.ready_and_full.lock().clone();
        let peers = self.peers.lock();
        Ok(peers
            .iter()
            .filter(|(id, _)| ready.contains(id))
            .map(|(id, data)| (*id, data.clone()))
            .collect())
    }
}

/// In-memory node lifecycle state plus the last accepted snapshot height.
pub struct InMemoryNodeStorage {
    state: Mutex<NodeState>,
    snapshot_height: Mutex<u64>,
}

impl InMemoryNodeStorage {
    pub fn new(state: NodeState) -> Self {
        Self {
            state: Mutex::new(state),
            snapshot_height: Mutex::new(0),
        }
    }

    pub fn set_state(&self, state: NodeState) {
        *self.state.lock() = state;
    }

    pub fn set_snapshot_height(&self, height: u64) {
        *self.snapshot_height.lock() = height;
    }
}

#[async_trait]
impl NodeStorage for InMemoryNodeStorage {
    async fn get_node_state(&self) -> ServiceResult<NodeState> {
        Ok(*self.state.lock())
    }

    async fn get_last_snapshot_height(&self) -> ServiceResult<u64> {
        Ok(*self.snapshot_height.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn peer(id: PeerId) -> PeerData {
        PeerData {
            id,
            alias: format!("peer-{}", id),
            public_key: KeyPair::generate().verifying_key,
        }
    }

    #[test]
    fn test_state_predicates() {
        assert!(can_start_own_consensus(NodeState::Ready));
        assert!(!can_start_own_consensus(NodeState::SnapshotCreation));
        assert!(can_participate_consensus(NodeState::SnapshotCreation));
        assert!(!can_participate_consensus(NodeState::Offline));
    }

    #[tokio::test]
    async fn test_ready_and_full_filter() {
        let cluster = InMemoryClusterStorage::new();
        cluster.add_peer(peer(1), true);
        cluster.add_peer(peer(2), false);
        cluster.add_peer(peer(3), true);

        let all = cluster.get_peers().await.unwrap();
        assert_eq!(all.len(), 3);

        let ready = cluster.get_ready_and_full_peers().await.unwrap();
        assert_eq!(ready.len(), 2);
        assert!(ready.contains_key(&1));
        assert!(!ready.contains_key(&2));
    }

    #[tokio::test]
    async fn test_node_storage() {
        let node = InMemoryNodeStorage::new(NodeState::Initial);
        assert_eq!(node.get_node_state().await.unwrap(), NodeState::Initial);

        node.set_state(NodeState::Ready);
        assert_eq!(node.get_node_state().await.unwrap(), NodeState::Ready);

        node.set_snapshot_height(4);
        assert_eq!(node.get_last_snapshot_height().await.unwrap(), 4);
    }
}
