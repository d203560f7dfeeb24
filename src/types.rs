use crate::crypto::KeyPair;
use blake2::{Blake2s256, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type PeerId = u32;
pub type Address = String;
pub type RoundId = uuid::Uuid;

/// The synthetic source address funding the initial distribution.
pub const COINBASE_ADDRESS: &str = "coinbase";

#[derive(Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Blake2s256::new();
        hasher.update(bytes);
        Hash(hasher.finalize().into())
    }

    /// The empty previous-transaction reference.
    pub fn zero() -> Self {
        Hash([0u8; 32])
    }

    /// Sentinel parent reference used by the genesis block.
    pub fn coinbase() -> Self {
        Hash::digest(COINBASE_ADDRESS.as_bytes())
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.hex()[..8])
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct LastTransactionRef {
    pub prev_hash: Hash,
    pub ordinal: u64,
}

impl LastTransactionRef {
    pub fn empty() -> Self {
        Self {
            prev_hash: Hash::zero(),
            ordinal: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct Transaction {
    pub source: Address,
    pub destination: Address,
    pub amount: u64,
    pub last_ref: LastTransactionRef,
    pub ordinal: u64,
    pub signature: Vec<u8>,
    pub is_dummy: bool,
    pub hash: Hash,
}

impl Transaction {
    /// Build a transaction chained onto `last_ref` and sign its content hash.
    pub fn new(
        source: Address,
        destination: Address,
        amount: u64,
        last_ref: LastTransactionRef,
        keypair: &KeyPair,
        is_dummy: bool,
    ) -> Self {
        let ordinal = last_ref.ordinal + 1;
        let hash = Self::content_hash(&source, &destination, amount, &last_ref, ordinal, is_dummy);
        let signature = keypair.sign(&hash.0).to_bytes().to_vec();
        Self {
            source,
            destination,
            amount,
            last_ref,
            ordinal,
            signature,
            is_dummy,
            hash,
        }
    }

    /// Deterministic content hash over every field except the signature.
    pub fn content_hash(
        source: &Address,
        destination: &Address,
        amount: u64,
        last_ref: &LastTransactionRef,
        ordinal: u64,
        is_dummy: bool,
    ) -> Hash {
        let mut hasher = Blake2s256::new();
        hasher.update(source.as_bytes());
        hasher.update(destination.as_bytes());
        hasher.update(amount.to_le_bytes());
        hasher.update(last_ref.prev_hash.0);
        hasher.update(last_ref.ordinal.to_le_bytes());
        hasher.update(ordinal.to_le_bytes());
        hasher.update([is_dummy as u8]);
        Hash(hasher.finalize().into())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum ObservationEvent {
    RequestTimedOut,
    CheckpointInvalid(Hash),
    SnapshotMisalignment { declared: u64, actual: u64 },
}

/// A signed statement about another node's behavior, carried alongside
/// transactions in checkpoint blocks.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct Observation {
    pub observer: PeerId,
    pub subject: PeerId,
    pub event: ObservationEvent,
    pub signature: Vec<u8>,
    pub hash: Hash,
}

impl Observation {
    pub fn new(observer: PeerId, subject: PeerId, event: ObservationEvent, keypair: &KeyPair) -> Self {
        let hash = Self::content_hash(observer, subject, &event);
        let signature = keypair.sign(&hash.0).to_bytes().to_vec();
        Self {
            observer,
            subject,
            event,
            signature,
            hash,
        }
    }

    pub fn content_hash(observer: PeerId, subject: PeerId, event: &ObservationEvent) -> Hash {
        let mut hasher = Blake2s256::new();
        hasher.update(observer.to_le_bytes());
        hasher.update(subject.to_le_bytes());
        hasher.update(bincode::serialize(event).unwrap_or_default());
        Hash(hasher.finalize().into())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum EdgeHashType {
    CheckpointHash,
    TransactionHash,
    ObservationHash,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct TypedEdgeHash {
    pub hash: Hash,
    pub edge_type: EdgeHashType,
    pub base_hash: Option<Hash>,
}

impl TypedEdgeHash {
    pub fn checkpoint(hash: Hash, base_hash: Option<Hash>) -> Self {
        Self {
            hash,
            edge_type: EdgeHashType::CheckpointHash,
            base_hash,
        }
    }
}

/// The signed head edge of a checkpoint block. Its hash is what parent
/// references and tip bookkeeping are keyed by.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct SignedObservationEdge {
    pub hash: Hash,
    pub base_hash: Hash,
    pub signature: Vec<u8>,
}

impl SignedObservationEdge {
    pub fn new(base_hash: Hash, keypair: &KeyPair) -> Self {
        let signature = keypair.sign(&base_hash.0).to_bytes().to_vec();
        let mut hasher = Blake2s256::new();
        hasher.update(base_hash.0);
        hasher.update(&signature);
        Self {
            hash: Hash(hasher.finalize().into()),
            base_hash,
            signature,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct PeerSignature {
    pub peer: PeerId,
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct CheckpointBlock {
    pub transactions: Vec<Transaction>,
    pub observations: Vec<Observation>,
    pub parents: [TypedEdgeHash; 2],
    pub signatures: Vec<PeerSignature>,
    pub base_hash: Hash,
    pub soe: SignedObservationEdge,
}

impl CheckpointBlock {
    /// Assemble a block over an already-canonicalized payload, sign its base
    /// hash and derive the signed observation edge.
    pub fn new(
        transactions: Vec<Transaction>,
        observations: Vec<Observation>,
        parents: [TypedEdgeHash; 2],
        signer: PeerId,
        keypair: &KeyPair,
    ) -> Self {
        let base_hash = Self::compute_base_hash(&transactions, &observations, &parents);
        let soe = SignedObservationEdge::new(base_hash, keypair);
        let signature = keypair.sign(&base_hash.0).to_bytes().to_vec();
        Self {
            transactions,
            observations,
            parents,
            signatures: vec![PeerSignature {
                peer: signer,
                signature,
            }],
            base_hash,
            soe,
        }
    }

    /// Content hash over the block payload, excluding signatures.
    pub fn compute_base_hash(
        transactions: &[Transaction],
        observations: &[Observation],
        parents: &[TypedEdgeHash; 2],
    ) -> Hash {
        let mut hasher = Blake2s256::new();
        for parent in parents {
            hasher.update(parent.hash.0);
        }
        for tx in transactions {
            hasher.update(tx.hash.0);
        }
        for obs in observations {
            hasher.update(obs.hash.0);
        }
        Hash(hasher.finalize().into())
    }

    pub fn soe_hash(&self) -> Hash {
        self.soe.hash
    }

    /// Attach a facilitator signature, ignoring duplicates from the same peer.
    pub fn add_signature(&mut self, signature: PeerSignature) {
        if self.signatures.iter().any(|s| s.peer == signature.peer) {
            return;
        }
        self.signatures.push(signature);
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct Height {
    pub min: u64,
    pub max: u64,
}

impl Height {
    pub fn genesis() -> Self {
        Self { min: 0, max: 0 }
    }

    /// Height of a block extending two parents.
    pub fn child_of(a: Height, b: Height) -> Self {
        Self {
            min: a.min.min(b.min) + 1,
            max: a.max.max(b.max) + 1,
        }
    }
}

/// What the checkpoint store holds per block.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct CheckpointCache {
    pub block: CheckpointBlock,
    pub height: Height,
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct TipsSoe {
    pub soe: [SignedObservationEdge; 2],
    pub min_height: u64,
}

/// Everything a facilitator needs to join a round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundData {
    pub round_id: RoundId,
    pub initiator: PeerId,
    pub facilitators: Vec<PeerId>,
    pub transactions: Vec<Transaction>,
    pub observations: Vec<Observation>,
    pub tips: TipsSoe,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> KeyPair {
        KeyPair::from_seed(&[3u8; 32])
    }

    #[test]
    fn test_transaction_hash_excludes_signature() {
        let kp = keypair();
        let other = KeyPair::from_seed(&[4u8; 32]);
        let tx1 = Transaction::new(
            "alice".into(),
            "bob".into(),
            10,
            LastTransactionRef::empty(),
            &kp,
            false,
        );
        let tx2 = Transaction::new(
            "alice".into(),
            "bob".into(),
            10,
            LastTransactionRef::empty(),
            &other,
            false,
        );

        assert_eq!(tx1.hash, tx2.hash);
        assert_ne!(tx1.signature, tx2.signature);
    }

    #[test]
    fn test_transaction_ordinal_advances_last_ref() {
        let kp = keypair();
        let tx = Transaction::new(
            "alice".into(),
            "bob".into(),
            10,
            LastTransactionRef::empty(),
            &kp,
            false,
        );
        assert_eq!(tx.ordinal, 1);

        let next = Transaction::new(
            "alice".into(),
            "carol".into(),
            5,
            LastTransactionRef {
                prev_hash: tx.hash,
                ordinal: tx.ordinal,
            },
            &kp,
            false,
        );
        assert_eq!(next.ordinal, 2);
        assert_eq!(next.last_ref.prev_hash, tx.hash);
    }

    #[test]
    fn test_block_base_hash_ignores_signatures() {
        let kp = keypair();
        let parents = [
            TypedEdgeHash::checkpoint(Hash::coinbase(), None),
            TypedEdgeHash::checkpoint(Hash::coinbase(), None),
        ];
        let tx = Transaction::new(
            "alice".into(),
            "bob".into(),
            1,
            LastTransactionRef::empty(),
            &kp,
            false,
        );

        let mut block = CheckpointBlock::new(vec![tx.clone()], vec![], parents, 0, &kp);
        let base = block.base_hash;
        block.add_signature(PeerSignature {
            peer: 1,
            signature: vec![9; 64],
        });

        assert_eq!(
            base,
            CheckpointBlock::compute_base_hash(&block.transactions, &block.observations, &parents)
        );
        assert_eq!(block.signatures.len(), 2);
    }

    #[test]
    fn test_block_signature_deduplication() {
        let kp = keypair();
        let parents = [
            TypedEdgeHash::checkpoint(Hash::coinbase(), None),
            TypedEdgeHash::checkpoint(Hash::coinbase(), None),
        ];
        let mut block = CheckpointBlock::new(vec![], vec![], parents, 0, &kp);

        block.add_signature(PeerSignature {
            peer: 0,
            signature: vec![1; 64],
        });
        assert_eq!(block.signatures.len(), 1);
    }

    #[test]
    fn test_height_child_of() {
        let genesis = Height::genesis();
        let child = Height::child_of(genesis, genesis);
        assert_eq!(child, Height { min: 1, max: 1 });

        let uneven = Height::child_of(Height { min: 1, max: 3 }, Height { min: 2, max: 2 });
        assert_eq!(uneven, Height { min: 2, max: 4 });
    }

    #[test]
    fn test_hash_ordering_matches_hex() {
        let a = Hash([0u8; 32]);
        let b = Hash([255u8; 32]);
        assert!(a < b);
        assert!(a.hex() < b.hex());
    }

    #[test]
    fn test_observation_hash_deterministic() {
        let kp = keypair();
        let a = Observation::new(1, 2, ObservationEvent::RequestTimedOut, &kp);
        let b = Observation::new(1, 2, ObservationEvent::RequestTimedOut, &kp);
        assert_eq!(a.hash, b.hash);

        let c = Observation::new(1, 3, ObservationEvent::RequestTimedOut, &kp);
        assert_ne!(a.hash, c.hash);
    }
}
