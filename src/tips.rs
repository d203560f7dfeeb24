use crate::cluster::PeerData;
use crate::types::{CheckpointBlock, Hash, Height, PeerId, SignedObservationEdge, TipsSoe};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Clone, Debug)]
struct TipData {
    soe: SignedObservationEdge,
    height: Height,
    /// Peers able to vouch for this tip. `None` means any peer may, which
    /// only genesis-installed tips use.
    vouchers: Option<HashSet<PeerId>>,
}

/// Tracks accepted checkpoint blocks with no accepted children and hands two
/// of them to a starting round.
pub struct TipSelector {
    tips: Mutex<Vec<(Hash, TipData)>>,
}

impl TipSelector {
    pub fn new() -> Self {
        Self {
            tips: Mutex::new(Vec::new()),
        }
    }

    /// Select two parent tips and the facilitator peers able to vouch for
    /// both. Returns `None` when fewer than two tips exist.
    pub fn pull_tips(
        &self,
        ready_peers: &HashMap<PeerId, PeerData>,
    ) -> Option<(TipsSoe, Vec<PeerId>)> {
        let tips = self.tips.lock();
        if tips.len() < 2 {
            return None;
        }
        let (_, first) = &tips[0];
        let (_, second) = &tips[1];

        let vouches = |tip: &TipData, peer: PeerId| match &tip.vouchers {
            None => true,
            Some(set) => set.contains(&peer),
        };

        let mut peers: Vec<PeerId> = ready_peers
            .keys()
            .copied()
            .filter(|peer| vouches(first, *peer) && vouches(second, *peer))
            .collect();
        peers.sort_unstable();

        let min_height = first.height.min.min(second.height.min);
        Some((
            TipsSoe {
                soe: [first.soe.clone(), second.soe.clone()],
                min_height,
            },
            peers,
        ))
    }

    /// Record a newly accepted block: its parents stop being tips, the block
    /// itself becomes one.
    pub fn register_accepted(&self, block: &CheckpointBlock, height: Height, vouchers: &[PeerId]) {
        let mut tips = self.tips.lock();
        tips.retain(|(hash, _)| block.parents.iter().all(|p| p.hash != *hash));
        let hash = block.soe_hash();
        if tips.iter().any(|(h, _)| *h == hash) {
            return;
        }
        debug!(tip = %hash, min = height.min, "registered tip");
        tips.push((
            hash,
            TipData {
                soe: block.soe.clone(),
                height,
                vouchers: Some(vouchers.iter().copied().collect()),
            },
        ));
    }

    /// Genesis acceptance is the only path that may insert tips without
    /// round selection.
    pub fn install_genesis_tips(&self, blocks: [(&CheckpointBlock, Height); 2]) {
        let mut tips = self.tips.lock();
        tips.clear();
        for (block, height) in blocks {
            tips.push((
                block.soe_hash(),
                TipData {
                    soe: block.soe.clone(),
                    height,
                    vouchers: None,
                },
            ));
        }
    }

    pub fn tip_count(&self) -> usize {
        self.tips.lock().len()
    }
}

impl Default for TipSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::types::TypedEdgeHash;

    fn peers(ids: &[PeerId]) -> HashMap<PeerId, PeerData> {
        ids.iter()
            .map(|id| {
                (
                    *id,
                    PeerData {
                        id: *id,
                        alias: format!("peer-{}", id),
                        public_key: KeyPair::generate().verifying_key,
                    },
                )
            })
            .collect()
    }

    fn block(tag: &[u8], keypair: &KeyPair) -> CheckpointBlock {
        CheckpointBlock::new(
            vec![],
            vec![],
            [
                TypedEdgeHash::checkpoint(Hash::digest(tag), None),
                TypedEdgeHash::checkpoint(Hash::digest(tag), None),
            ],
            0,
            keypair,
        )
    }

    #[test]
    fn test_fewer_than_two_tips_yields_none() {
        let selector = TipSelector::new();
        assert!(selector.pull_tips(&peers(&[1, 2])).is_none());

        let kp = KeyPair::from_seed(&[2u8; 32]);
        let b = block(b"a", &kp);
        selector.register_accepted(&b, Height { min: 1, max: 1 }, &[1]);
        assert!(selector.pull_tips(&peers(&[1, 2])).is_none());
    }

    #[test]
    fn test_pull_reports_min_height_and_vouching_peers() {
        let selector = TipSelector::new();
        let kp = KeyPair::from_seed(&[2u8; 32]);

        let a = block(b"a", &kp);
        let b = block(b"b", &kp);
        selector.register_accepted(&a, Height { min: 2, max: 3 }, &[1, 2]);
        selector.register_accepted(&b, Height { min: 4, max: 4 }, &[2, 3]);

        let (tips, facilitators) = selector.pull_tips(&peers(&[1, 2, 3])).unwrap();
        assert_eq!(tips.min_height, 2);
        // Only peer 2 vouches for both tips.
        assert_eq!(facilitators, vec![2]);
    }

    #[test]
    fn test_genesis_tips_vouched_by_everyone() {
        let selector = TipSelector::new();
        let kp = KeyPair::from_seed(&[2u8; 32]);
        let a = block(b"a", &kp);
        let b = block(b"b", &kp);
        selector.install_genesis_tips([(&a, Height { min: 1, max: 1 }), (&b, Height { min: 1, max: 1 })]);

        let (_, facilitators) = selector.pull_tips(&peers(&[5, 6])).unwrap();
        assert_eq!(facilitators, vec![5, 6]);
    }

    #[test]
    fn test_register_retires_parents() {
        let selector = TipSelector::new();
        let kp = KeyPair::from_seed(&[2u8; 32]);
        let a = block(b"a", &kp);
        let b = block(b"b", &kp);
        selector.install_genesis_tips([(&a, Height { min: 1, max: 1 }), (&b, Height { min: 1, max: 1 })]);

        let child = CheckpointBlock::new(
            vec![],
            vec![],
            [
                TypedEdgeHash::checkpoint(a.soe_hash(), Some(a.base_hash)),
                TypedEdgeHash::checkpoint(b.soe_hash(), Some(b.base_hash)),
            ],
            0,
            &kp,
        );
        selector.register_accepted(&child, Height { min: 2, max: 2 }, &[1]);

        assert_eq!(selector.tip_count(), 1);
        assert!(selector.pull_tips(&peers(&[1])).is_none());
    }
}
