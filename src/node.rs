use crate::cluster::{InMemoryClusterStorage, InMemoryNodeStorage, NodeState};
use crate::config::ConsensusConfig;
use crate::crypto::KeyPair;
use crate::genesis::{GenesisAllocation, GenesisBuilder, GenesisObservation};
use crate::messages::ConsensusMessage;
use crate::metrics::ConsensusMetrics;
use crate::network::{NetworkRemoteSender, SharedConsensusNetwork};
use crate::round_manager::{RoundError, RoundManager};
use crate::services::{
    ConsensusServices, InMemoryAddressStore, InMemoryCheckpointStore, InMemoryObservationService,
    InMemoryTransactionService, RecordingResolver, ServiceResult,
};
use crate::tips::TipSelector;
use crate::tx_chain::TransactionChainService;
use crate::types::{Address, PeerId, RoundId, Transaction};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// One consensus node: the round manager plus the wiring that feeds it —
/// the network pump and the periodic long-running-round sweep.
pub struct ConsensusNode {
    pub peer_id: PeerId,
    pub keypair: KeyPair,
    pub manager: Arc<RoundManager>,
    pub services: Arc<ConsensusServices>,
    pub tips: Arc<TipSelector>,
    pub metrics: Arc<ConsensusMetrics>,
    pub tx_chains: Arc<TransactionChainService>,
    config: ConsensusConfig,
}

/// Concrete handles to the in-memory services behind a node built with
/// [`ConsensusNode::in_memory`], for seeding pools and inspecting state.
pub struct InMemoryServiceHandles {
    pub checkpoints: Arc<InMemoryCheckpointStore>,
    pub transactions: Arc<InMemoryTransactionService>,
    pub observations: Arc<InMemoryObservationService>,
    pub addresses: Arc<InMemoryAddressStore>,
    pub cluster: Arc<InMemoryClusterStorage>,
    pub node: Arc<InMemoryNodeStorage>,
}

impl ConsensusNode {
    pub fn new(
        peer_id: PeerId,
        keypair: KeyPair,
        config: ConsensusConfig,
        services: Arc<ConsensusServices>,
        tips: Arc<TipSelector>,
        metrics: Arc<ConsensusMetrics>,
    ) -> Self {
        let manager = RoundManager::new(
            peer_id,
            keypair.clone(),
            config.clone(),
            services.clone(),
            tips.clone(),
            metrics.clone(),
        );
        Self {
            peer_id,
            keypair,
            manager,
            services,
            tips,
            metrics,
            tx_chains: Arc::new(TransactionChainService::new()),
            config,
        }
    }

    /// Build a node over in-memory services, attached to the shared network.
    pub fn in_memory(
        peer_id: PeerId,
        keypair: KeyPair,
        config: ConsensusConfig,
        network: Arc<SharedConsensusNetwork>,
    ) -> (Self, InMemoryServiceHandles) {
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let transactions = Arc::new(InMemoryTransactionService::new());
        let observations = Arc::new(InMemoryObservationService::new());
        let addresses = Arc::new(InMemoryAddressStore::new());
        let cluster = Arc::new(InMemoryClusterStorage::new());
        let node_storage = Arc::new(InMemoryNodeStorage::new(NodeState::Ready));

        let services = Arc::new(ConsensusServices {
            checkpoints: checkpoints.clone(),
            transactions: transactions.clone(),
            observations: observations.clone(),
            addresses: addresses.clone(),
            cluster: cluster.clone(),
            node: node_storage.clone(),
            remote: Arc::new(NetworkRemoteSender::new(peer_id, network)),
            resolver: Arc::new(RecordingResolver::new(true)),
        });
        let tips = Arc::new(TipSelector::new());
        let metrics = ConsensusMetrics::new();

        let node = Self::new(peer_id, keypair, config, services, tips, metrics);
        let handles = InMemoryServiceHandles {
            checkpoints,
            transactions,
            observations,
            addresses,
            cluster,
            node: node_storage,
        };
        (node, handles)
    }

    /// Start the outcome drain, the incoming-message pump and the periodic
    /// sweep. The returned handle is the pump's.
    pub fn start(
        &self,
        mut incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> tokio::task::JoinHandle<()> {
        self.manager.start();

        let sweeper = self.manager.clone();
        let interval = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                sweeper.clean_long_running().await;
            }
        });

        let manager = self.manager.clone();
        tokio::spawn(async move {
            while let Some(bytes) = incoming.recv().await {
                match bincode::deserialize::<ConsensusMessage>(&bytes) {
                    Ok(message) => manager.handle_message(message).await,
                    Err(err) => warn!(error = %err, "failed to deserialize network message"),
                }
            }
        })
    }

    /// Seed the DAG deterministically; every node installs the same three
    /// blocks.
    pub async fn install_genesis(
        &self,
        allocations: &[GenesisAllocation],
    ) -> ServiceResult<GenesisObservation> {
        let builder = GenesisBuilder::new(self.peer_id);
        let observation = builder.build(allocations);
        builder
            .install(
                &observation,
                allocations,
                self.services.checkpoints.as_ref(),
                self.services.addresses.as_ref(),
                &self.tips,
            )
            .await?;
        Ok(observation)
    }

    /// Build the next transaction on `source`'s chain. The caller decides
    /// which pool it lands in.
    pub fn create_transaction(
        &self,
        source: Address,
        destination: Address,
        amount: u64,
        keypair: &KeyPair,
    ) -> Transaction {
        self.tx_chains
            .set_last_transaction(source, destination, amount, keypair, false)
    }

    pub async fn start_round(&self) -> Result<RoundId, RoundError> {
        self.manager
            .start_own_round()
            .await
            .map(|info| info.round_id)
    }

    pub async fn shutdown(&self) {
        self.manager.terminate_all().await;
    }
}
