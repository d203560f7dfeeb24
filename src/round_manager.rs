use crate::cluster::{can_participate_consensus, can_start_own_consensus, NodeState};
use crate::config::ConsensusConfig;
use crate::crypto::{KeyPair, VerifyingKey};
use crate::messages::ConsensusMessage;
use crate::metrics::ConsensusMetrics;
use crate::round::{RoundHandle, RoundMessage, RoundOutcome, RoundProtocol};
use crate::services::{ConsensusServices, ServiceError};
use crate::tips::TipSelector;
use crate::types::{Hash, Observation, PeerId, RoundData, RoundId, TipsSoe, Transaction};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Rounds remembered after teardown so that late messages are discarded
/// instead of buffered forever.
const FINISHED_ROUNDS_CAPACITY: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    #[error("node state {0:?} does not permit consensus")]
    InvalidNodeState(NodeState),
    #[error("own consensus round already in progress")]
    OwnRoundAlreadyInProgress,
    #[error("round {0}: fewer than two tips available")]
    NoTipsForConsensus(RoundId),
    #[error("round {0}: no facilitator peers after filtering")]
    NoPeersForConsensus(RoundId),
    #[error("round {0}: not every facilitator acknowledged the start")]
    NotAllPeersParticipate(RoundId),
    #[error("round {0}: parent checkpoints could not be resolved")]
    MissingParents(RoundId),
    #[error("round {round_id}: {message}")]
    ConsensusError { round_id: RoundId, message: String },
    #[error("round {round_id}: tip height {tip_height} at or below snapshot height {snapshot_height}")]
    SnapshotHeightAboveTip {
        round_id: RoundId,
        tip_height: u64,
        snapshot_height: u64,
    },
    #[error("round {round_id}: {source}")]
    ConsensusStartError {
        round_id: RoundId,
        #[source]
        source: ServiceError,
    },
}

impl RoundError {
    pub fn kind_label(&self) -> &'static str {
        match self {
            RoundError::InvalidNodeState(_) => "invalid_node_state",
            RoundError::OwnRoundAlreadyInProgress => "own_round_in_progress",
            RoundError::NoTipsForConsensus(_) => "no_tips",
            RoundError::NoPeersForConsensus(_) => "no_peers",
            RoundError::NotAllPeersParticipate(_) => "not_all_peers",
            RoundError::MissingParents(_) => "missing_parents",
            RoundError::ConsensusError { .. } => "consensus_error",
            RoundError::SnapshotHeightAboveTip { .. } => "snapshot_height_above_tip",
            RoundError::ConsensusStartError { .. } => "consensus_start_error",
        }
    }
}

fn start_error(round_id: RoundId) -> impl FnOnce(ServiceError) -> RoundError {
    move |source| RoundError::ConsensusStartError { round_id, source }
}

#[derive(Clone)]
pub struct ConsensusInfo {
    pub round_id: RoundId,
    pub handle: RoundHandle,
    pub tip_min_height: u64,
    pub started_at: Instant,
}

/// The single own-round slot. Published as a stub before assembly so the
/// mutual-exclusion check happens without holding the lock across I/O.
struct OwnConsensus {
    round_id: RoundId,
    info: Option<ConsensusInfo>,
}

struct BufferedProposals {
    messages: Vec<RoundMessage>,
    buffered_at: Instant,
}

#[derive(Default)]
struct ManagerState {
    consensuses: HashMap<RoundId, ConsensusInfo>,
    own: Option<OwnConsensus>,
    proposals: HashMap<RoundId, BufferedProposals>,
    finished: VecDeque<RoundId>,
}

impl ManagerState {
    fn mark_finished(&mut self, round_id: RoundId) {
        if self.finished.contains(&round_id) {
            return;
        }
        self.finished.push_back(round_id);
        if self.finished.len() > FINISHED_ROUNDS_CAPACITY {
            self.finished.pop_front();
        }
    }
}

/// Creates, tracks and tears down concurrent consensus rounds: rounds this
/// node initiates (at most one in flight) and rounds it joins as a
/// facilitator.
pub struct RoundManager {
    own_peer: PeerId,
    keypair: KeyPair,
    config: ConsensusConfig,
    services: Arc<ConsensusServices>,
    tips: Arc<TipSelector>,
    metrics: Arc<ConsensusMetrics>,
    state: Mutex<ManagerState>,
    outcome_tx: mpsc::UnboundedSender<RoundOutcome>,
    outcome_rx: Mutex<Option<mpsc::UnboundedReceiver<RoundOutcome>>>,
}

impl RoundManager {
    pub fn new(
        own_peer: PeerId,
        keypair: KeyPair,
        config: ConsensusConfig,
        services: Arc<ConsensusServices>,
        tips: Arc<TipSelector>,
        metrics: Arc<ConsensusMetrics>,
    ) -> Arc<Self> {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            own_peer,
            keypair,
            config,
            services,
            tips,
            metrics,
            state: Mutex::new(ManagerState::default()),
            outcome_tx,
            outcome_rx: Mutex::new(Some(outcome_rx)),
        })
    }

    /// Drain round outcomes. Must be running for rounds to be cleaned up
    /// after they commit or fail.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let receiver = self.outcome_rx.lock().take();
        tokio::spawn(async move {
            let mut receiver = match receiver {
                Some(receiver) => receiver,
                None => return,
            };
            while let Some(outcome) = receiver.recv().await {
                match outcome {
                    RoundOutcome::Committed {
                        round_id,
                        cache,
                        facilitators,
                    } => {
                        manager.remove_round(round_id);
                        manager
                            .tips
                            .register_accepted(&cache.block, cache.height, &facilitators);
                        manager.metrics.rounds_committed.inc();
                        info!(round = %round_id, block = %cache.block.soe_hash(), "round finished");
                    }
                    RoundOutcome::Failed {
                        round_id,
                        transactions,
                        observations,
                        kind,
                    } => {
                        manager
                            .metrics
                            .rounds_failed
                            .with_label_values(&[kind.as_str()])
                            .inc();
                        manager
                            .stop_round(round_id, &transactions, &observations)
                            .await;
                    }
                }
            }
        })
    }

    /// Start a round initiated by this node. Holds the state lock only
    /// across the round-id allocation; all external calls happen after the
    /// stub own-slot is published.
    pub async fn start_own_round(&self) -> Result<ConsensusInfo, RoundError> {
        let node_state = self
            .services
            .node
            .get_node_state()
            .await
            .map_err(start_error(Uuid::nil()))?;
        if !can_start_own_consensus(node_state) {
            return Err(RoundError::InvalidNodeState(node_state));
        }

        let round_id = {
            let mut state = self.state.lock();
            if state.own.is_some() {
                return Err(RoundError::OwnRoundAlreadyInProgress);
            }
            let round_id = Uuid::new_v4();
            state.own = Some(OwnConsensus {
                round_id,
                info: None,
            });
            self.update_gauges(&state);
            round_id
        };

        match self.assemble_own_round(round_id).await {
            Ok(info) => {
                self.metrics.rounds_started.inc();
                info!(round = %round_id, "own round started");
                Ok(info)
            }
            Err(err) => {
                self.metrics
                    .rounds_failed
                    .with_label_values(&[err.kind_label()])
                    .inc();
                warn!(round = %round_id, error = %err, "own round failed to start");
                Err(err)
            }
        }
    }

    async fn assemble_own_round(&self, round_id: RoundId) -> Result<ConsensusInfo, RoundError> {
        let transactions = match self
            .services
            .transactions
            .pull_for_consensus(self.config.max_transaction_threshold as usize)
            .await
        {
            Ok(transactions) => transactions,
            Err(source) => {
                self.stop_round(round_id, &[], &[]).await;
                return Err(RoundError::ConsensusStartError { round_id, source });
            }
        };
        let observations = match self
            .services
            .observations
            .pull_for_consensus(self.config.max_observation_threshold as usize)
            .await
        {
            Ok(observations) => observations,
            Err(source) => {
                self.stop_round(round_id, &transactions, &[]).await;
                return Err(RoundError::ConsensusStartError { round_id, source });
            }
        };

        match self
            .assemble_with_inputs(round_id, &transactions, &observations)
            .await
        {
            Ok(info) => Ok(info),
            Err(err) => {
                self.stop_round(round_id, &transactions, &observations).await;
                Err(err)
            }
        }
    }

    async fn assemble_with_inputs(
        &self,
        round_id: RoundId,
        transactions: &[Transaction],
        observations: &[Observation],
    ) -> Result<ConsensusInfo, RoundError> {
        let ready = self
            .services
            .cluster
            .get_ready_and_full_peers()
            .await
            .map_err(start_error(round_id))?;
        let (tips, tip_peers) = match self.tips.pull_tips(&ready) {
            Some(pulled) => pulled,
            None => return Err(RoundError::NoTipsForConsensus(round_id)),
        };
        let facilitators: Vec<PeerId> = tip_peers
            .into_iter()
            .filter(|peer| *peer != self.own_peer)
            .collect();
        if facilitators.is_empty() {
            return Err(RoundError::NoPeersForConsensus(round_id));
        }

        self.resolve_parents(round_id, &tips, self.own_peer).await?;

        let facilitator_keys: HashMap<PeerId, VerifyingKey> = ready
            .iter()
            .filter(|(id, _)| facilitators.contains(id))
            .map(|(id, data)| (*id, data.public_key))
            .collect();
        let round_data = RoundData {
            round_id,
            initiator: self.own_peer,
            facilitators: facilitators.clone(),
            transactions: transactions.to_vec(),
            observations: observations.to_vec(),
            tips,
        };
        let handle = RoundProtocol::spawn(
            round_data.clone(),
            self.own_peer,
            self.keypair.clone(),
            facilitator_keys,
            self.services.clone(),
            self.metrics.clone(),
            self.outcome_tx.clone(),
        );
        let info = ConsensusInfo {
            round_id,
            handle: handle.clone(),
            tip_min_height: round_data.tips.min_height,
            started_at: Instant::now(),
        };

        {
            let mut state = self.state.lock();
            match state.own.as_mut() {
                Some(own) if own.round_id == round_id => own.info = Some(info.clone()),
                _ => {
                    drop(state);
                    handle.send(RoundMessage::Stop);
                    return Err(RoundError::ConsensusError {
                        round_id,
                        message: "own slot cleared during assembly".into(),
                    });
                }
            }
            // Replay anything that arrived while the stub was empty.
            if let Some(buffered) = state.proposals.remove(&round_id) {
                for message in buffered.messages {
                    handle.send(message);
                }
            }
            self.update_gauges(&state);
        }

        let acks = self
            .services
            .remote
            .notify_facilitators(&round_data)
            .await
            .map_err(start_error(round_id))?;
        if acks.len() != round_data.facilitators.len() || acks.iter().any(|ack| !ack) {
            return Err(RoundError::NotAllPeersParticipate(round_id));
        }
        Ok(info)
    }

    /// Join a round another node initiated.
    pub async fn participate_in_round(
        &self,
        round_data: RoundData,
    ) -> Result<ConsensusInfo, RoundError> {
        let round_id = round_data.round_id;
        let node_state = self
            .services
            .node
            .get_node_state()
            .await
            .map_err(start_error(round_id))?;
        if !can_participate_consensus(node_state) {
            return Err(RoundError::InvalidNodeState(node_state));
        }

        let snapshot_height = self
            .services
            .node
            .get_last_snapshot_height()
            .await
            .map_err(start_error(round_id))?;
        if round_data.tips.min_height <= snapshot_height {
            self.metrics.snapshot_height_above_tip.inc();
            return Err(RoundError::SnapshotHeightAboveTip {
                round_id,
                tip_height: round_data.tips.min_height,
                snapshot_height,
            });
        }

        {
            let state = self.state.lock();
            let own_match = state
                .own
                .as_ref()
                .map_or(false, |own| own.round_id == round_id);
            if own_match || state.consensuses.contains_key(&round_id) {
                return Err(RoundError::ConsensusError {
                    round_id,
                    message: "round already installed".into(),
                });
            }
        }

        // Adjust the facilitator set: drop self, make sure the initiator is
        // present.
        let mut facilitators: Vec<PeerId> = round_data
            .facilitators
            .iter()
            .copied()
            .filter(|peer| *peer != self.own_peer)
            .collect();
        let peers = self
            .services
            .cluster
            .get_peers()
            .await
            .map_err(start_error(round_id))?;
        if !facilitators.contains(&round_data.initiator) {
            if !peers.contains_key(&round_data.initiator) {
                return Err(RoundError::ConsensusError {
                    round_id,
                    message: format!("unknown round initiator {}", round_data.initiator),
                });
            }
            facilitators.push(round_data.initiator);
        }

        if let Err(err) = self
            .resolve_parents(round_id, &round_data.tips, round_data.initiator)
            .await
        {
            self.stop_round(round_id, &[], &[]).await;
            return Err(err);
        }

        let transactions = match self
            .services
            .transactions
            .pull_for_consensus(self.config.max_transaction_threshold as usize)
            .await
        {
            Ok(transactions) => transactions,
            Err(source) => {
                self.stop_round(round_id, &[], &[]).await;
                return Err(RoundError::ConsensusStartError { round_id, source });
            }
        };
        let observations = match self
            .services
            .observations
            .pull_for_consensus(self.config.max_observation_threshold as usize)
            .await
        {
            Ok(observations) => observations,
            Err(source) => {
                self.stop_round(round_id, &transactions, &[]).await;
                return Err(RoundError::ConsensusStartError { round_id, source });
            }
        };

        let facilitator_keys: HashMap<PeerId, VerifyingKey> = peers
            .iter()
            .filter(|(id, _)| facilitators.contains(id))
            .map(|(id, data)| (*id, data.public_key))
            .collect();
        let adjusted = RoundData {
            round_id,
            initiator: round_data.initiator,
            facilitators,
            transactions,
            observations,
            tips: round_data.tips,
        };
        let handle = RoundProtocol::spawn(
            adjusted.clone(),
            self.own_peer,
            self.keypair.clone(),
            facilitator_keys,
            self.services.clone(),
            self.metrics.clone(),
            self.outcome_tx.clone(),
        );
        let info = ConsensusInfo {
            round_id,
            handle: handle.clone(),
            tip_min_height: adjusted.tips.min_height,
            started_at: Instant::now(),
        };

        // Install and replay missed proposals under the same lock that
        // buffers them, so nothing is lost or reordered.
        {
            let mut state = self.state.lock();
            state.consensuses.insert(round_id, info.clone());
            if let Some(buffered) = state.proposals.remove(&round_id) {
                debug!(round = %round_id, count = buffered.messages.len(), "replaying missed proposals");
                for message in buffered.messages {
                    handle.send(message);
                }
            }
            self.update_gauges(&state);
        }

        self.metrics.rounds_started.inc();
        info!(round = %round_id, initiator = adjusted.initiator, "joined round");
        Ok(info)
    }

    /// Buffer a proposal that arrived before its round was installed.
    pub fn add_missed_proposal(&self, round_id: RoundId, message: RoundMessage) {
        let mut state = self.state.lock();
        self.buffer_proposal(&mut state, round_id, message);
    }

    fn buffer_proposal(&self, state: &mut ManagerState, round_id: RoundId, message: RoundMessage) {
        let entry = state
            .proposals
            .entry(round_id)
            .or_insert_with(|| BufferedProposals {
                messages: Vec::new(),
                buffered_at: Instant::now(),
            });
        entry.messages.push(message);
        self.metrics.missed_proposals_buffered.inc();
    }

    /// Dispatch an incoming wire message to its round, buffering it when the
    /// round is not installed yet and discarding it when the round already
    /// finished.
    pub async fn handle_message(&self, message: ConsensusMessage) {
        match message {
            ConsensusMessage::Start(notification) => {
                if let Err(err) = self.participate_in_round(notification.round_data).await {
                    warn!(error = %err, "could not join round");
                }
            }
            ConsensusMessage::DataProposal(proposal) => {
                self.route(proposal.round_id, RoundMessage::DataProposal(proposal));
            }
            ConsensusMessage::UnionProposal(proposal) => {
                self.route(proposal.round_id, RoundMessage::UnionProposal(proposal));
            }
            ConsensusMessage::Selection(selection) => {
                self.route(selection.round_id, RoundMessage::Selection(selection));
            }
        }
    }

    fn route(&self, round_id: RoundId, message: RoundMessage) {
        let mut state = self.state.lock();
        if state.finished.contains(&round_id) {
            self.metrics.proposals_discarded.inc();
            return;
        }
        if let Some(info) = state.consensuses.get(&round_id) {
            info.handle.send(message);
            return;
        }
        if let Some(own) = &state.own {
            if own.round_id == round_id {
                if let Some(info) = &own.info {
                    info.handle.send(message);
                    return;
                }
            }
        }
        self.buffer_proposal(&mut state, round_id, message);
    }

    /// Tear a round down and hand its inputs back to the pending pools.
    /// Safe to call more than once for the same round.
    pub async fn stop_round(
        &self,
        round_id: RoundId,
        transactions: &[Transaction],
        observations: &[Observation],
    ) {
        if let Some(handle) = self.remove_round(round_id) {
            handle.send(RoundMessage::Stop);
        }
        self.return_inputs(transactions, observations).await;
    }

    /// Remove the round from every table before any inputs are returned.
    fn remove_round(&self, round_id: RoundId) -> Option<RoundHandle> {
        let mut state = self.state.lock();
        let mut handle = None;
        if let Some(own) = &state.own {
            if own.round_id == round_id {
                handle = own.info.as_ref().map(|info| info.handle.clone());
                state.own = None;
            }
        }
        if let Some(info) = state.consensuses.remove(&round_id) {
            handle = Some(info.handle);
        }
        state.proposals.remove(&round_id);
        state.mark_finished(round_id);
        self.update_gauges(&state);
        handle
    }

    async fn return_inputs(&self, transactions: &[Transaction], observations: &[Observation]) {
        if !transactions.is_empty() {
            let hashes: Vec<Hash> = transactions.iter().map(|tx| tx.hash).collect();
            if let Err(err) = self.services.transactions.return_to_pending(&hashes).await {
                warn!(error = %err, "failed to return transactions to pending");
            }
            if let Err(err) = self.services.transactions.clear_in_consensus(&hashes).await {
                warn!(error = %err, "failed to clear transactions from consensus");
            }
        }
        if !observations.is_empty() {
            let hashes: Vec<Hash> = observations.iter().map(|obs| obs.hash).collect();
            if let Err(err) = self.services.observations.return_to_pending(&hashes).await {
                warn!(error = %err, "failed to return observations to pending");
            }
            if let Err(err) = self.services.observations.clear_in_consensus(&hashes).await {
                warn!(error = %err, "failed to clear observations from consensus");
            }
        }
    }

    /// Evict rounds that outlived the whole-round timeout and expire stale
    /// buffered proposals. This is the sole liveness recovery mechanism.
    pub async fn clean_long_running(&self) {
        let timeout = self.config.form_checkpoint_blocks_timeout;
        let expired: Vec<RoundId> = {
            let mut state = self.state.lock();
            state
                .proposals
                .retain(|_, buffered| buffered.buffered_at.elapsed() <= self.config.proposal_expiry);
            let mut expired: Vec<RoundId> = state
                .consensuses
                .values()
                .filter(|info| info.started_at.elapsed() > timeout)
                .map(|info| info.round_id)
                .collect();
            if let Some(own) = &state.own {
                if let Some(info) = &own.info {
                    if info.started_at.elapsed() > timeout {
                        expired.push(own.round_id);
                    }
                }
            }
            expired
        };
        for round_id in expired {
            warn!(round = %round_id, "evicting long-running round");
            self.metrics.consensus_timeout.inc();
            self.stop_round(round_id, &[], &[]).await;
        }
    }

    /// Stop every round after a grace period, for node shutdown.
    pub async fn terminate_all(&self) {
        tokio::time::sleep(self.config.terminate_grace).await;
        let round_ids: Vec<RoundId> = {
            let state = self.state.lock();
            state
                .consensuses
                .keys()
                .copied()
                .chain(state.own.as_ref().map(|own| own.round_id))
                .collect()
        };
        for round_id in round_ids {
            self.stop_round(round_id, &[], &[]).await;
        }
    }

    async fn resolve_parents(
        &self,
        round_id: RoundId,
        tips: &TipsSoe,
        hint_peer: PeerId,
    ) -> Result<(), RoundError> {
        let store = &self.services.checkpoints;
        let mut unresolved = Vec::new();
        for soe in &tips.soe {
            let hash = soe.hash;
            if store
                .is_accepted(hash)
                .await
                .map_err(start_error(round_id))?
            {
                continue;
            }
            if let Some(entry) = store.get(hash).await.map_err(start_error(round_id))? {
                // Known locally but not accepted yet; push it through the
                // acceptance pipeline.
                store
                    .add_to_acceptance(entry)
                    .await
                    .map_err(start_error(round_id))?;
                continue;
            }
            let in_progress = store
                .is_waiting_for_resolving(hash)
                .await
                .map_err(start_error(round_id))?
                || store
                    .is_in_acceptance(hash)
                    .await
                    .map_err(start_error(round_id))?
                || store
                    .is_waiting_for_acceptance(hash)
                    .await
                    .map_err(start_error(round_id))?
                || store.is_awaiting(hash).await.map_err(start_error(round_id))?;
            if in_progress {
                continue;
            }
            if self
                .services
                .resolver
                .enqueue(hash, hint_peer)
                .await
                .map_err(start_error(round_id))?
            {
                continue;
            }
            unresolved.push(hash);
        }
        if !unresolved.is_empty() {
            warn!(round = %round_id, missing = unresolved.len(), "parents unresolved");
            return Err(RoundError::MissingParents(round_id));
        }
        Ok(())
    }

    fn update_gauges(&self, state: &ManagerState) {
        let own = state.own.is_some();
        self.metrics
            .active_rounds
            .set(state.consensuses.len() as i64 + own as i64);
        self.metrics.own_round_in_flight.set(own as i64);
    }

    pub fn own_round_id(&self) -> Option<RoundId> {
        self.state.lock().own.as_ref().map(|own| own.round_id)
    }

    pub fn active_round_count(&self) -> usize {
        let state = self.state.lock();
        state.consensuses.len() + state.own.is_some() as usize
    }

    pub fn buffered_proposal_count(&self, round_id: RoundId) -> usize {
        self.state
            .lock()
            .proposals
            .get(&round_id)
            .map_or(0, |buffered| buffered.messages.len())
    }
}
