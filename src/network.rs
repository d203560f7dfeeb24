use crate::messages::{ConsensusMessage, RoundStartNotification};
use crate::services::{RemoteSender, ServiceResult};
use crate::types::{PeerId, RoundData};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// In-process transport connecting every node of a test or demo cluster.
/// Payloads travel bincode-encoded so the wire contract stays lossless.
pub struct SharedConsensusNetwork {
    peers: Mutex<HashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl SharedConsensusNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Attach a peer; messages addressed to it arrive on the returned
    /// receiver.
    pub fn register(&self, peer: PeerId) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.peers.lock().insert(peer, sender);
        receiver
    }

    pub fn disconnect(&self, peer: PeerId) {
        self.peers.lock().remove(&peer);
    }

    fn send_to(&self, peer: PeerId, message: &ConsensusMessage) -> bool {
        let bytes = match bincode::serialize(message) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to encode consensus message");
                return false;
            }
        };
        match self.peers.lock().get(&peer) {
            Some(sender) => sender.send(bytes).is_ok(),
            None => false,
        }
    }
}

/// `RemoteSender` bound to one local peer on the shared network.
pub struct NetworkRemoteSender {
    local: PeerId,
    network: Arc<SharedConsensusNetwork>,
}

impl NetworkRemoteSender {
    pub fn new(local: PeerId, network: Arc<SharedConsensusNetwork>) -> Self {
        Self { local, network }
    }

    fn broadcast(&self, peers: &[PeerId], message: ConsensusMessage) {
        for peer in peers {
            if *peer == self.local {
                continue;
            }
            if !self.network.send_to(*peer, &message) {
                warn!(peer = *peer, "peer unreachable");
            }
        }
    }
}

#[async_trait]
impl RemoteSender for NetworkRemoteSender {
    async fn notify_facilitators(&self, round_data: &RoundData) -> ServiceResult<Vec<bool>> {
        Ok(round_data
            .facilitators
            .iter()
            .map(|peer| {
                if *peer == self.local {
                    return true;
                }
                self.network.send_to(
                    *peer,
                    &ConsensusMessage::Start(RoundStartNotification {
                        round_data: round_data.clone(),
                    }),
                )
            })
            .collect())
    }

    async fn broadcast_data_proposal(
        &self,
        peers: &[PeerId],
        proposal: crate::messages::ConsensusDataProposal,
    ) -> ServiceResult<()> {
        self.broadcast(peers, ConsensusMessage::DataProposal(proposal));
        Ok(())
    }

    async fn broadcast_union_block(
        &self,
        peers: &[PeerId],
        proposal: crate::messages::UnionBlockProposal,
    ) -> ServiceResult<()> {
        self.broadcast(peers, ConsensusMessage::UnionProposal(proposal));
        Ok(())
    }

    async fn broadcast_selected(
        &self,
        peers: &[PeerId],
        selection: crate::messages::SelectedUnionBlock,
    ) -> ServiceResult<()> {
        self.broadcast(peers, ConsensusMessage::Selection(selection));
        Ok(())
    }
}
