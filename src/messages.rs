use crate::types::{Hash, Observation, PeerId, RoundData, RoundId, Transaction};
use crate::types::CheckpointBlock;
use serde::{Deserialize, Serialize};

/// Phase-1 payload: one facilitator's selected transactions and observations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusDataProposal {
    pub round_id: RoundId,
    pub facilitator: PeerId,
    pub transactions: Vec<Transaction>,
    pub observations: Vec<Observation>,
}

/// Phase-2 payload: one facilitator's signed candidate over the union.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnionBlockProposal {
    pub round_id: RoundId,
    pub facilitator: PeerId,
    pub block: CheckpointBlock,
}

/// Phase-3 payload: the base hash this facilitator selected.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectedUnionBlock {
    pub round_id: RoundId,
    pub facilitator: PeerId,
    pub selected: Hash,
}

/// Unicast sent by the round initiator to each facilitator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundStartNotification {
    pub round_data: RoundData,
}

/// Everything the consensus transport carries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Start(RoundStartNotification),
    DataProposal(ConsensusDataProposal),
    UnionProposal(UnionBlockProposal),
    Selection(SelectedUnionBlock),
}

impl ConsensusMessage {
    pub fn round_id(&self) -> RoundId {
        match self {
            ConsensusMessage::Start(n) => n.round_data.round_id,
            ConsensusMessage::DataProposal(p) => p.round_id,
            ConsensusMessage::UnionProposal(p) => p.round_id,
            ConsensusMessage::Selection(s) => s.round_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::types::{LastTransactionRef, SignedObservationEdge, TipsSoe};

    #[test]
    fn test_wire_round_trip() {
        let kp = KeyPair::from_seed(&[5u8; 32]);
        let tx = Transaction::new(
            "alice".into(),
            "bob".into(),
            3,
            LastTransactionRef::empty(),
            &kp,
            false,
        );
        let soe = SignedObservationEdge::new(Hash::digest(b"tip"), &kp);
        let msg = ConsensusMessage::Start(RoundStartNotification {
            round_data: RoundData {
                round_id: uuid::Uuid::new_v4(),
                initiator: 0,
                facilitators: vec![1, 2],
                transactions: vec![tx],
                observations: vec![],
                tips: TipsSoe {
                    soe: [soe.clone(), soe],
                    min_height: 1,
                },
            },
        });

        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: ConsensusMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.round_id(), msg.round_id());

        match (msg, decoded) {
            (ConsensusMessage::Start(a), ConsensusMessage::Start(b)) => {
                assert_eq!(a.round_data.transactions, b.round_data.transactions);
                assert_eq!(a.round_data.facilitators, b.round_data.facilitators);
            }
            _ => panic!("variant changed in round trip"),
        }
    }
}
