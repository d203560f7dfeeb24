use crate::cluster::{NodeState, PeerData};
use crate::messages::{ConsensusDataProposal, SelectedUnionBlock, UnionBlockProposal};
use crate::types::{
    Address, CheckpointCache, Hash, Observation, PeerId, RoundData, SignedObservationEdge,
    Transaction,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ServiceError(pub String);

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Persistent checkpoint block storage and the acceptance pipeline in front
/// of it. Blocks are keyed by their signed-observation-edge hash.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn store_soe(&self, soe: SignedObservationEdge) -> ServiceResult<()>;
    async fn store(&self, entry: CheckpointCache) -> ServiceResult<()>;
    async fn add_to_acceptance(&self, entry: CheckpointCache) -> ServiceResult<()>;
    async fn is_accepted(&self, hash: Hash) -> ServiceResult<bool>;
    async fn get(&self, hash: Hash) -> ServiceResult<Option<CheckpointCache>>;
    async fn is_waiting_for_resolving(&self, hash: Hash) -> ServiceResult<bool>;
    async fn is_in_acceptance(&self, hash: Hash) -> ServiceResult<bool>;
    async fn is_waiting_for_acceptance(&self, hash: Hash) -> ServiceResult<bool>;
    async fn is_awaiting(&self, hash: Hash) -> ServiceResult<bool>;
}

#[async_trait]
pub trait TransactionService: Send + Sync {
    async fn pull_for_consensus(&self, max: usize) -> ServiceResult<Vec<Transaction>>;
    async fn return_to_pending(&self, hashes: &[Hash]) -> ServiceResult<()>;
    async fn clear_in_consensus(&self, hashes: &[Hash]) -> ServiceResult<()>;
    async fn accept(&self, transaction: Transaction) -> ServiceResult<()>;
}

#[async_trait]
pub trait ObservationService: Send + Sync {
    async fn pull_for_consensus(&self, max: usize) -> ServiceResult<Vec<Observation>>;
    async fn return_to_pending(&self, hashes: &[Hash]) -> ServiceResult<()>;
    async fn clear_in_consensus(&self, hashes: &[Hash]) -> ServiceResult<()>;
    async fn accept(&self, observation: Observation) -> ServiceResult<()>;
}

/// Account balance cache seeded at genesis.
#[async_trait]
pub trait AddressStore: Send + Sync {
    async fn set_balance(&self, address: Address, balance: u64) -> ServiceResult<()>;
    async fn get_balance(&self, address: &str) -> ServiceResult<u64>;
}

#[async_trait]
pub trait ClusterStorage: Send + Sync {
    async fn get_peers(&self) -> ServiceResult<HashMap<PeerId, PeerData>>;
    async fn get_ready_and_full_peers(&self) -> ServiceResult<HashMap<PeerId, PeerData>>;
}

#[async_trait]
pub trait NodeStorage: Send + Sync {
    async fn get_node_state(&self) -> ServiceResult<NodeState>;
    async fn get_last_snapshot_height(&self) -> ServiceResult<u64>;
}

/// Outbound peer transport for the round protocol.
#[async_trait]
pub trait RemoteSender: Send + Sync {
    /// Unicast the round-start notification to every facilitator. Returns one
    /// acknowledgement flag per facilitator, in `round_data.facilitators`
    /// order.
    async fn notify_facilitators(&self, round_data: &RoundData) -> ServiceResult<Vec<bool>>;
    async fn broadcast_data_proposal(
        &self,
        peers: &[PeerId],
        proposal: ConsensusDataProposal,
    ) -> ServiceResult<()>;
    async fn broadcast_union_block(
        &self,
        peers: &[PeerId],
        proposal: UnionBlockProposal,
    ) -> ServiceResult<()>;
    async fn broadcast_selected(
        &self,
        peers: &[PeerId],
        selection: SelectedUnionBlock,
    ) -> ServiceResult<()>;
}

/// Work queue resolving checkpoints we reference but do not hold.
#[async_trait]
pub trait CheckpointResolver: Send + Sync {
    /// Returns whether the hash was taken on for resolution.
    async fn enqueue(&self, hash: Hash, hint_peer: PeerId) -> ServiceResult<bool>;
}

/// The record of external collaborators handed to the consensus core.
pub struct ConsensusServices {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub transactions: Arc<dyn TransactionService>,
    pub observations: Arc<dyn ObservationService>,
    pub addresses: Arc<dyn AddressStore>,
    pub cluster: Arc<dyn ClusterStorage>,
    pub node: Arc<dyn NodeStorage>,
    pub remote: Arc<dyn RemoteSender>,
    pub resolver: Arc<dyn CheckpointResolver>,
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CheckpointMaps {
    soes: HashMap<Hash, SignedObservationEdge>,
    stored: HashMap<Hash, CheckpointCache>,
    accepted: HashSet<Hash>,
    resolving: HashSet<Hash>,
    in_acceptance: HashSet<Hash>,
    waiting_for_acceptance: HashSet<Hash>,
    awaiting: HashSet<Hash>,
}

/// Checkpoint store whose acceptance pipeline completes synchronously.
pub struct InMemoryCheckpointStore {
    maps: Mutex<CheckpointMaps>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            maps: Mutex::new(CheckpointMaps::default()),
        }
    }

    pub fn accepted_hashes(&self) -> Vec<Hash> {
        self.maps.lock().accepted.iter().copied().collect()
    }

    pub fn get_soe(&self, hash: Hash) -> Option<SignedObservationEdge> {
        self.maps.lock().soes.get(&hash).cloned()
    }

    pub fn mark_resolving(&self, hash: Hash) {
        self.maps.lock().resolving.insert(hash);
    }

    pub fn mark_awaiting(&self, hash: Hash) {
        self.maps.lock().awaiting.insert(hash);
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn store_soe(&self, soe: SignedObservationEdge) -> ServiceResult<()> {
        self.maps.lock().soes.insert(soe.hash, soe);
        Ok(())
    }

    async fn store(&self, entry: CheckpointCache) -> ServiceResult<()> {
        self.maps.lock().stored.insert(entry.block.soe_hash(), entry);
        Ok(())
    }

    async fn add_to_acceptance(&self, entry: CheckpointCache) -> ServiceResult<()> {
        let hash = entry.block.soe_hash();
        let mut maps = self.maps.lock();
        maps.stored.entry(hash).or_insert(entry);
        maps.resolving.remove(&hash);
        maps.in_acceptance.remove(&hash);
        maps.waiting_for_acceptance.remove(&hash);
        maps.awaiting.remove(&hash);
        maps.accepted.insert(hash);
        Ok(())
    }

    async fn is_accepted(&self, hash: Hash) -> ServiceResult<bool> {
        Ok(self.maps.lock().accepted.contains(&hash))
    }

    async fn get(&self, hash: Hash) -> ServiceResult<Option<CheckpointCache>> {
        Ok(self.maps.lock().stored.get(&hash).cloned())
    }

    async fn is_waiting_for_resolving(&self, hash: Hash) -> ServiceResult<bool> {
        Ok(self.maps.lock().resolving.contains(&hash))
    }

    async fn is_in_acceptance(&self, hash: Hash) -> ServiceResult<bool> {
        Ok(self.maps.lock().in_acceptance.contains(&hash))
    }

    async fn is_waiting_for_acceptance(&self, hash: Hash) -> ServiceResult<bool> {
        Ok(self.maps.lock().waiting_for_acceptance.contains(&hash))
    }

    async fn is_awaiting(&self, hash: Hash) -> ServiceResult<bool> {
        Ok(self.maps.lock().awaiting.contains(&hash))
    }
}

/// Shared mempool shape for transactions and observations: an ordered
/// pending queue plus the set currently locked into a round.
struct Pool<T> {
    pending: Vec<T>,
    in_consensus: HashMap<Hash, T>,
    accepted: Vec<T>,
}

impl<T: Clone> Pool<T> {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            in_consensus: HashMap::new(),
            accepted: Vec::new(),
        }
    }

    fn pull(&mut self, max: usize, hash_of: impl Fn(&T) -> Hash) -> Vec<T> {
        let take = max.min(self.pending.len());
        let pulled: Vec<T> = self.pending.drain(..take).collect();
        for item in &pulled {
            self.in_consensus.insert(hash_of(item), item.clone());
        }
        pulled
    }

    fn return_to_pending(&mut self, hashes: &[Hash], hash_of: impl Fn(&T) -> Hash) {
        for hash in hashes {
            if let Some(item) = self.in_consensus.remove(hash) {
                if !self.pending.iter().any(|p| hash_of(p) == *hash) {
                    self.pending.push(item);
                }
            }
        }
    }

    fn clear_in_consensus(&mut self, hashes: &[Hash]) {
        for hash in hashes {
            self.in_consensus.remove(hash);
        }
    }

    fn accept(&mut self, item: T, hash: Hash, hash_of: impl Fn(&T) -> Hash) {
        self.in_consensus.remove(&hash);
        self.pending.retain(|p| hash_of(p) != hash);
        self.accepted.push(item);
    }
}

pub struct InMemoryTransactionService {
    pool: Mutex<Pool<Transaction>>,
}

impl InMemoryTransactionService {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(Pool::new()),
        }
    }

    pub fn put_pending(&self, tx: Transaction) {
        self.pool.lock().pending.push(tx);
    }

    pub fn pending_hashes(&self) -> Vec<Hash> {
        self.pool.lock().pending.iter().map(|t| t.hash).collect()
    }

    pub fn in_consensus_len(&self) -> usize {
        self.pool.lock().in_consensus.len()
    }

    pub fn accepted(&self) -> Vec<Transaction> {
        self.pool.lock().accepted.clone()
    }
}

impl Default for InMemoryTransactionService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionService for InMemoryTransactionService {
    async fn pull_for_consensus(&self, max: usize) -> ServiceResult<Vec<Transaction>> {
        Ok(self.pool.lock().pull(max, |t| t.hash))
    }

    async fn return_to_pending(&self, hashes: &[Hash]) -> ServiceResult<()> {
        self.pool.lock().return_to_pending(hashes, |t| t.hash);
        Ok(())
    }

    async fn clear_in_consensus(&self, hashes: &[Hash]) -> ServiceResult<()> {
        self.pool.lock().clear_in_consensus(hashes);
        Ok(())
    }

    async fn accept(&self, transaction: Transaction) -> ServiceResult<()> {
        let hash = transaction.hash;
        self.pool.lock().accept(transaction, hash, |t| t.hash);
        Ok(())
    }
}

pub struct InMemoryObservationService {
    pool: Mutex<Pool<Observation>>,
}

impl InMemoryObservationService {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(Pool::new()),
        }
    }

    pub fn put_pending(&self, observation: Observation) {
        self.pool.lock().pending.push(observation);
    }

    pub fn pending_hashes(&self) -> Vec<Hash> {
        self.pool.lock().pending.iter().map(|o| o.hash).collect()
    }

    pub fn in_consensus_len(&self) -> usize {
        self.pool.lock().in_consensus.len()
    }

    pub fn accepted(&self) -> Vec<Observation> {
        self.pool.lock().accepted.clone()
    }
}

impl Default for InMemoryObservationService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObservationService for InMemoryObservationService {
    async fn pull_for_consensus(&self, max: usize) -> ServiceResult<Vec<Observation>> {
        Ok(self.pool.lock().pull(max, |o| o.hash))
    }

    async fn return_to_pending(&self, hashes: &[Hash]) -> ServiceResult<()> {
        self.pool.lock().return_to_pending(hashes, |o| o.hash);
        Ok(())
    }

    async fn clear_in_consensus(&self, hashes: &[Hash]) -> ServiceResult<()> {
        self.pool.lock().clear_in_consensus(hashes);
        Ok(())
    }

    async fn accept(&self, observation: Observation) -> ServiceResult<()> {
        let hash = observation.hash;
        self.pool.lock().accept(observation, hash, |o| o.hash);
        Ok(())
    }
}

pub struct InMemoryAddressStore {
    balances: Mutex<HashMap<Address, u64>>,
}

impl InMemoryAddressStore {
    pub fn new() -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryAddressStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AddressStore for InMemoryAddressStore {
    async fn set_balance(&self, address: Address, balance: u64) -> ServiceResult<()> {
        self.balances.lock().insert(address, balance);
        Ok(())
    }

    async fn get_balance(&self, address: &str) -> ServiceResult<u64> {
        Ok(self.balances.lock().get(address).copied().unwrap_or(0))
    }
}

/// Resolver that records what was enqueued; `accept` controls whether hashes
/// are taken on, which lets tests drive the missing-parents path.
pub struct RecordingResolver {
    accept: bool,
    queue: Mutex<Vec<(Hash, PeerId)>>,
}

impl RecordingResolver {
    pub fn new(accept: bool) -> Self {
        Self {
            accept,
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn enqueued(&self) -> Vec<(Hash, PeerId)> {
        self.queue.lock().clone()
    }
}

#[async_trait]
impl CheckpointResolver for RecordingResolver {
    async fn enqueue(&self, hash: Hash, hint_peer: PeerId) -> ServiceResult<bool> {
        if self.accept {
            self.queue.lock().push((hash, hint_peer));
        }
        Ok(self.accept)
    }
}
