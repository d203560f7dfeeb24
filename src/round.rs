use crate::crypto::{KeyPair, VerifyingKey};
use crate::messages::{ConsensusDataProposal, SelectedUnionBlock, UnionBlockProposal};
use crate::metrics::ConsensusMetrics;
use crate::services::{ConsensusServices, ServiceResult};
use crate::types::{
    CheckpointBlock, CheckpointCache, Hash, Height, Observation, PeerId, RoundData, RoundId,
    Transaction, TypedEdgeHash,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum RoundPhase {
    WaitingForProposals,
    WaitingForBlockUnions,
    WaitingForSelection,
    Committed,
    Failed,
}

impl RoundPhase {
    fn is_terminal(self) -> bool {
        matches!(self, RoundPhase::Committed | RoundPhase::Failed)
    }
}

#[derive(Clone, Debug)]
pub enum RoundMessage {
    DataProposal(ConsensusDataProposal),
    UnionProposal(UnionBlockProposal),
    Selection(SelectedUnionBlock),
    Stop,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoundFailureKind {
    Cancelled,
    Divergence,
    EmptyPayload,
    Broadcast,
    Storage,
}

impl RoundFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoundFailureKind::Cancelled => "cancelled",
            RoundFailureKind::Divergence => "divergence",
            RoundFailureKind::EmptyPayload => "empty_payload",
            RoundFailureKind::Broadcast => "broadcast",
            RoundFailureKind::Storage => "storage",
        }
    }
}

/// What a finished round reports back to the manager.
#[derive(Clone, Debug)]
pub enum RoundOutcome {
    Committed {
        round_id: RoundId,
        cache: CheckpointCache,
        facilitators: Vec<PeerId>,
    },
    Failed {
        round_id: RoundId,
        transactions: Vec<Transaction>,
        observations: Vec<Observation>,
        kind: RoundFailureKind,
    },
}

#[derive(Clone)]
pub struct RoundHandle {
    pub round_id: RoundId,
    sender: mpsc::UnboundedSender<RoundMessage>,
}

impl RoundHandle {
    pub fn send(&self, message: RoundMessage) {
        if self.sender.send(message).is_err() {
            debug!(round = %self.round_id, "round actor already gone");
        }
    }
}

/// Multiset union of all facilitators' payloads, de-duplicated by content
/// hash and sorted canonically by content hash ascending.
fn canonical_union(
    proposals: &HashMap<PeerId, ConsensusDataProposal>,
) -> (Vec<Transaction>, Vec<Observation>) {
    let mut transactions: HashMap<Hash, Transaction> = HashMap::new();
    let mut observations: HashMap<Hash, Observation> = HashMap::new();
    for proposal in proposals.values() {
        for tx in &proposal.transactions {
            transactions.entry(tx.hash).or_insert_with(|| tx.clone());
        }
        for obs in &proposal.observations {
            observations.entry(obs.hash).or_insert_with(|| obs.clone());
        }
    }
    let mut transactions: Vec<Transaction> = transactions.into_values().collect();
    let mut observations: Vec<Observation> = observations.into_values().collect();
    transactions.sort_by_key(|tx| tx.hash);
    observations.sort_by_key(|obs| obs.hash);
    (transactions, observations)
}

/// The lexicographically smallest base hash wins; ties break on the lowest
/// facilitator id.
fn select_winner(proposals: &HashMap<PeerId, UnionBlockProposal>) -> Option<Hash> {
    proposals
        .values()
        .min_by_key(|p| (p.block.base_hash, p.facilitator))
        .map(|p| p.block.base_hash)
}

/// One three-phase block-selection state machine. All transitions serialize
/// through the actor's inbox; the manager interacts only via `RoundHandle`
/// and the outcome channel.
pub struct RoundProtocol {
    data: RoundData,
    own_peer: PeerId,
    keypair: KeyPair,
    facilitator_keys: HashMap<PeerId, VerifyingKey>,
    services: Arc<ConsensusServices>,
    metrics: Arc<ConsensusMetrics>,
    outcome: mpsc::UnboundedSender<RoundOutcome>,

    phase: RoundPhase,
    data_proposals: HashMap<PeerId, ConsensusDataProposal>,
    union_proposals: HashMap<PeerId, UnionBlockProposal>,
    selections: HashMap<PeerId, SelectedUnionBlock>,
    union_inbox: Vec<UnionBlockProposal>,
    selection_inbox: Vec<SelectedUnionBlock>,
}

impl RoundProtocol {
    /// Spawn the round actor. `data.facilitators` are the remote peers this
    /// node coordinates with; `data.transactions`/`observations` are its own
    /// proposal payload.
    pub fn spawn(
        data: RoundData,
        own_peer: PeerId,
        keypair: KeyPair,
        facilitator_keys: HashMap<PeerId, VerifyingKey>,
        services: Arc<ConsensusServices>,
        metrics: Arc<ConsensusMetrics>,
        outcome: mpsc::UnboundedSender<RoundOutcome>,
    ) -> RoundHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = RoundHandle {
            round_id: data.round_id,
            sender,
        };
        let protocol = Self {
            data,
            own_peer,
            keypair,
            facilitator_keys,
            services,
            metrics,
            outcome,
            phase: RoundPhase::WaitingForProposals,
            data_proposals: HashMap::new(),
            union_proposals: HashMap::new(),
            selections: HashMap::new(),
            union_inbox: Vec::new(),
            selection_inbox: Vec::new(),
        };
        tokio::spawn(protocol.run(receiver));
        handle
    }

    fn expected(&self) -> usize {
        self.data.facilitators.len() + 1
    }

    fn is_facilitator(&self, peer: PeerId) -> bool {
        peer == self.own_peer || self.data.facilitators.contains(&peer)
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<RoundMessage>) {
        let own_proposal = ConsensusDataProposal {
            round_id: self.data.round_id,
            facilitator: self.own_peer,
            transactions: self.data.transactions.clone(),
            observations: self.data.observations.clone(),
        };
        if let Err(err) = self
            .services
            .remote
            .broadcast_data_proposal(&self.data.facilitators, own_proposal.clone())
            .await
        {
            warn!(round = %self.data.round_id, error = %err, "failed to broadcast data proposal");
            self.fail(RoundFailureKind::Broadcast);
            return;
        }
        if let Err(err) = self.apply_data_proposal(own_proposal).await {
            warn!(round = %self.data.round_id, error = %err, "round failed applying own proposal");
            self.fail(RoundFailureKind::Storage);
            return;
        }
        if self.phase.is_terminal() {
            return;
        }

        while let Some(message) = inbox.recv().await {
            let result = match message {
                RoundMessage::DataProposal(proposal) => self.apply_data_proposal(proposal).await,
                RoundMessage::UnionProposal(proposal) => self.apply_union_proposal(proposal).await,
                RoundMessage::Selection(selection) => self.apply_selection(selection).await,
                RoundMessage::Stop => {
                    self.fail(RoundFailureKind::Cancelled);
                    return;
                }
            };
            if let Err(err) = result {
                warn!(round = %self.data.round_id, error = %err, "round failed on external service");
                self.fail(RoundFailureKind::Storage);
                return;
            }
            if self.phase.is_terminal() {
                return;
            }
        }
    }

    async fn apply_data_proposal(&mut self, proposal: ConsensusDataProposal) -> ServiceResult<()> {
        if self.phase != RoundPhase::WaitingForProposals {
            self.metrics.proposals_discarded.inc();
            return Ok(());
        }
        if !self.is_facilitator(proposal.facilitator) {
            warn!(round = %self.data.round_id, peer = proposal.facilitator, "data proposal from non-facilitator");
            return Ok(());
        }
        self.data_proposals
            .entry(proposal.facilitator)
            .or_insert(proposal);
        if self.data_proposals.len() < self.expected() {
            return Ok(());
        }

        let (transactions, observations) = canonical_union(&self.data_proposals);
        if transactions.is_empty() && observations.is_empty() {
            info!(round = %self.data.round_id, "empty union payload");
            self.fail(RoundFailureKind::EmptyPayload);
            return Ok(());
        }

        let parents = [
            TypedEdgeHash::checkpoint(
                self.data.tips.soe[0].hash,
                Some(self.data.tips.soe[0].base_hash),
            ),
            TypedEdgeHash::checkpoint(
                self.data.tips.soe[1].hash,
                Some(self.data.tips.soe[1].base_hash),
            ),
        ];
        let block = CheckpointBlock::new(
            transactions,
            observations,
            parents,
            self.own_peer,
            &self.keypair,
        );
        let own_union = UnionBlockProposal {
            round_id: self.data.round_id,
            facilitator: self.own_peer,
            block,
        };

        self.services
            .remote
            .broadcast_union_block(&self.data.facilitators, own_union.clone())
            .await?;
        self.phase = RoundPhase::WaitingForBlockUnions;
        debug!(round = %self.data.round_id, "advanced to block-union phase");

        self.apply_union_proposal(own_union).await?;
        for buffered in std::mem::take(&mut self.union_inbox) {
            self.apply_union_proposal(buffered).await?;
        }
        Ok(())
    }

    async fn apply_union_proposal(&mut self, proposal: UnionBlockProposal) -> ServiceResult<()> {
        match self.phase {
            RoundPhase::WaitingForProposals => {
                // Arrived ahead of our own transition; park it.
                self.union_inbox.push(proposal);
                return Ok(());
            }
            RoundPhase::WaitingForBlockUnions => {}
            _ => {
                self.metrics.proposals_discarded.inc();
                return Ok(());
            }
        }
        if !self.is_facilitator(proposal.facilitator) {
            warn!(round = %self.data.round_id, peer = proposal.facilitator, "union proposal from non-facilitator");
            return Ok(());
        }
        if !self.verify_union_proposal(&proposal) {
            warn!(round = %self.data.round_id, peer = proposal.facilitator, "invalid union block proposal");
            return Ok(());
        }
        self.union_proposals
            .entry(proposal.facilitator)
            .or_insert(proposal);
        if self.union_proposals.len() < self.expected() {
            return Ok(());
        }

        let selected = match select_winner(&self.union_proposals) {
            Some(hash) => hash,
            None => return Ok(()),
        };
        let own_selection = SelectedUnionBlock {
            round_id: self.data.round_id,
            facilitator: self.own_peer,
            selected,
        };
        self.services
            .remote
            .broadcast_selected(&self.data.facilitators, own_selection.clone())
            .await?;
        self.phase = RoundPhase::WaitingForSelection;
        debug!(round = %self.data.round_id, selected = %selected, "advanced to selection phase");

        self.apply_selection(own_selection).await?;
        for buffered in std::mem::take(&mut self.selection_inbox) {
            self.apply_selection(buffered).await?;
        }
        Ok(())
    }

    async fn apply_selection(&mut self, selection: SelectedUnionBlock) -> ServiceResult<()> {
        match self.phase {
            RoundPhase::WaitingForProposals | RoundPhase::WaitingForBlockUnions => {
                self.selection_inbox.push(selection);
                return Ok(());
            }
            RoundPhase::WaitingForSelection => {}
            _ => {
                self.metrics.proposals_discarded.inc();
                return Ok(());
            }
        }
        if !self.is_facilitator(selection.facilitator) {
            warn!(round = %self.data.round_id, peer = selection.facilitator, "selection from non-facilitator");
            return Ok(());
        }
        self.selections
            .entry(selection.facilitator)
            .or_insert(selection);
        if self.selections.len() < self.expected() {
            return Ok(());
        }

        let mut hashes = self.selections.values().map(|s| s.selected);
        let first = match hashes.next() {
            Some(hash) => hash,
            None => return Ok(()),
        };
        if hashes.any(|hash| hash != first) {
            warn!(round = %self.data.round_id, "facilitators diverged on selection");
            self.fail(RoundFailureKind::Divergence);
            return Ok(());
        }

        self.finalize(first).await
    }

    fn verify_union_proposal(&self, proposal: &UnionBlockProposal) -> bool {
        let block = &proposal.block;
        let recomputed = CheckpointBlock::compute_base_hash(
            &block.transactions,
            &block.observations,
            &block.parents,
        );
        if recomputed != block.base_hash {
            return false;
        }
        if proposal.facilitator == self.own_peer {
            return true;
        }
        match self.facilitator_keys.get(&proposal.facilitator) {
            Some(key) => KeyPair::verify_bytes(key, &block.base_hash.0, &block.soe.signature),
            // Without a known key we accept the structural check alone.
            None => true,
        }
    }

    async fn finalize(&mut self, selected: Hash) -> ServiceResult<()> {
        let mut block = match self
            .union_proposals
            .values()
            .find(|p| p.block.base_hash == selected)
        {
            Some(proposal) => proposal.block.clone(),
            None => {
                warn!(round = %self.data.round_id, "selected hash matches no proposal");
                self.fail(RoundFailureKind::Divergence);
                return Ok(());
            }
        };
        for proposal in self.union_proposals.values() {
            if proposal.block.base_hash == selected {
                for signature in &proposal.block.signatures {
                    block.add_signature(signature.clone());
                }
            }
        }

        let height = self.block_height(&block).await?;
        let cache = CheckpointCache {
            block: block.clone(),
            height,
        };
        self.services.checkpoints.store_soe(block.soe.clone()).await?;
        self.services.checkpoints.store(cache.clone()).await?;
        self.services.checkpoints.add_to_acceptance(cache.clone()).await?;

        let tx_hashes: Vec<Hash> = block.transactions.iter().map(|t| t.hash).collect();
        let obs_hashes: Vec<Hash> = block.observations.iter().map(|o| o.hash).collect();
        for tx in &block.transactions {
            self.services.transactions.accept(tx.clone()).await?;
        }
        for obs in &block.observations {
            self.services.observations.accept(obs.clone()).await?;
        }
        self.services.transactions.clear_in_consensus(&tx_hashes).await?;
        self.services.observations.clear_in_consensus(&obs_hashes).await?;

        self.phase = RoundPhase::Committed;
        info!(
            round = %self.data.round_id,
            block = %block.soe_hash(),
            transactions = block.transactions.len(),
            observations = block.observations.len(),
            "round committed checkpoint block"
        );

        let mut facilitators = self.data.facilitators.clone();
        facilitators.push(self.own_peer);
        let _ = self.outcome.send(RoundOutcome::Committed {
            round_id: self.data.round_id,
            cache,
            facilitators,
        });
        Ok(())
    }

    async fn block_height(&self, block: &CheckpointBlock) -> ServiceResult<Height> {
        let first = self.services.checkpoints.get(block.parents[0].hash).await?;
        let second = self.services.checkpoints.get(block.parents[1].hash).await?;
        Ok(match (first, second) {
            (Some(a), Some(b)) => Height::child_of(a.height, b.height),
            // Parents resolved elsewhere; fall back to the reported tip height.
            _ => Height {
                min: self.data.tips.min_height + 1,
                max: self.data.tips.min_height + 1,
            },
        })
    }

    fn fail(&mut self, kind: RoundFailureKind) {
        if self.phase.is_terminal() {
            return;
        }
        self.phase = RoundPhase::Failed;
        let _ = self.outcome.send(RoundOutcome::Failed {
            round_id: self.data.round_id,
            transactions: self.data.transactions.clone(),
            observations: self.data.observations.clone(),
            kind,
        });
    }
}
