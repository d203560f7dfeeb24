use crate::crypto::KeyPair;
use crate::types::{Address, LastTransactionRef, Transaction};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Enforces the strict per-sender ordinal sequence: each new transaction
/// references the previous one's hash and carries `ordinal = prev + 1`.
///
/// The outer map lock is only held to fetch or create an address slot; the
/// read-modify-write serializes on the slot's own lock, so two senders never
/// contend with each other.
pub struct TransactionChainService {
    slots: Mutex<HashMap<Address, Arc<Mutex<LastTransactionRef>>>>,
}

impl TransactionChainService {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, address: &str) -> Arc<Mutex<LastTransactionRef>> {
        let mut slots = self.slots.lock();
        slots
            .entry(address.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(LastTransactionRef::empty())))
            .clone()
    }

    pub fn get_last_ref(&self, address: &str) -> LastTransactionRef {
        self.slots
            .lock()
            .get(address)
            .map(|slot| *slot.lock())
            .unwrap_or_else(LastTransactionRef::empty)
    }

    /// Build the next transaction on `source`'s chain and advance the slot.
    /// Concurrent calls on the same address serialize; the later call
    /// observes the earlier call's update.
    pub fn set_last_transaction(
        &self,
        source: Address,
        destination: Address,
        amount: u64,
        keypair: &KeyPair,
        is_dummy: bool,
    ) -> Transaction {
        let slot = self.slot(&source);
        let mut last_ref = slot.lock();
        let transaction = Transaction::new(source, destination, amount, *last_ref, keypair, is_dummy);
        *last_ref = LastTransactionRef {
            prev_hash: transaction.hash,
            ordinal: transaction.ordinal,
        };
        transaction
    }

    /// Build a zero-effect transaction that only extends the chain.
    pub fn set_dummy_transaction(&self, source: Address, keypair: &KeyPair) -> Transaction {
        let destination = source.clone();
        self.set_last_transaction(source, destination, 0, keypair, true)
    }

    /// Drop an address slot once its last ordinal is fully persisted at or
    /// below the snapshot horizon. Returns whether a slot was removed.
    pub fn prune(&self, address: &str, persisted_ordinal: u64) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(address) {
            Some(slot) if slot.lock().ordinal <= persisted_ordinal => {
                slots.remove(address);
                true
            }
            _ => false,
        }
    }
}

impl Default for TransactionChainService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash;

    #[test]
    fn test_empty_chain_starts_at_zero() {
        let chains = TransactionChainService::new();
        let last = chains.get_last_ref("alice");
        assert_eq!(last.ordinal, 0);
        assert_eq!(last.prev_hash, Hash::zero());
    }

    #[test]
    fn test_ordinals_one_through_n() {
        let chains = TransactionChainService::new();
        let kp = KeyPair::from_seed(&[8u8; 32]);

        let mut prev_hash = Hash::zero();
        for expected in 1..=5u64 {
            let tx = chains.set_last_transaction("alice".into(), "bob".into(), 1, &kp, false);
            assert_eq!(tx.ordinal, expected);
            assert_eq!(tx.last_ref.prev_hash, prev_hash);
            prev_hash = tx.hash;
        }

        assert_eq!(chains.get_last_ref("alice").ordinal, 5);
    }

    #[test]
    fn test_chains_are_per_address() {
        let chains = TransactionChainService::new();
        let kp = KeyPair::from_seed(&[8u8; 32]);

        chains.set_last_transaction("alice".into(), "bob".into(), 1, &kp, false);
        let tx = chains.set_last_transaction("carol".into(), "bob".into(), 1, &kp, false);
        assert_eq!(tx.ordinal, 1);
    }

    #[test]
    fn test_dummy_transaction_extends_chain() {
        let chains = TransactionChainService::new();
        let kp = KeyPair::from_seed(&[8u8; 32]);

        chains.set_last_transaction("alice".into(), "bob".into(), 1, &kp, false);
        let dummy = chains.set_dummy_transaction("alice".into(), &kp);
        assert!(dummy.is_dummy);
        assert_eq!(dummy.amount, 0);
        assert_eq!(dummy.ordinal, 2);
    }

    #[test]
    fn test_concurrent_same_address_serializes() {
        let chains = Arc::new(TransactionChainService::new());
        let kp = KeyPair::from_seed(&[8u8; 32]);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let chains = chains.clone();
            let kp = kp.clone();
            handles.push(std::thread::spawn(move || {
                let mut ordinals = Vec::new();
                for _ in 0..25 {
                    let tx =
                        chains.set_last_transaction("alice".into(), "bob".into(), 1, &kp, false);
                    ordinals.push(tx.ordinal);
                }
                ordinals
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();

        // Every ordinal 1..=200 assigned exactly once.
        assert_eq!(all, (1..=200).collect::<Vec<u64>>());
    }

    #[test]
    fn test_prune_requires_persisted_ordinal() {
        let chains = TransactionChainService::new();
        let kp = KeyPair::from_seed(&[8u8; 32]);

        chains.set_last_transaction("alice".into(), "bob".into(), 1, &kp, false);
        chains.set_last_transaction("alice".into(), "bob".into(), 1, &kp, false);

        assert!(!chains.prune("alice", 1));
        assert!(chains.prune("alice", 2));
        assert_eq!(chains.get_last_ref("alice").ordinal, 0);
        assert!(!chains.prune("alice", 2));
    }
}
