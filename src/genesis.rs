use crate::crypto::KeyPair;
use crate::services::{AddressStore, CheckpointStore, ServiceResult};
use crate::tips::TipSelector;
use crate::types::{
    Address, CheckpointBlock, CheckpointCache, Hash, Height, LastTransactionRef, PeerId,
    Transaction, TypedEdgeHash, COINBASE_ADDRESS,
};
use tracing::info;

/// Fixed seed for the coinbase signing key; every node derives the same
/// genesis blocks from the same allocation table.
const COINBASE_SEED: [u8; 32] = *b"tessera-coinbase-seed-0000000000";

#[derive(Clone, Debug)]
pub struct GenesisAllocation {
    pub address: Address,
    pub balance: u64,
}

/// The three-block seed of the DAG: the genesis block carrying the initial
/// distribution, and its two sibling children serving as the first tips.
#[derive(Clone, Debug)]
pub struct GenesisObservation {
    pub genesis: CheckpointBlock,
    pub distribution_one: CheckpointBlock,
    pub distribution_two: CheckpointBlock,
}

pub struct GenesisBuilder {
    keypair: KeyPair,
    local_peer: PeerId,
}

impl GenesisBuilder {
    pub fn new(local_peer: PeerId) -> Self {
        Self {
            keypair: KeyPair::from_seed(&COINBASE_SEED),
            local_peer,
        }
    }

    /// Construct the deterministic genesis observation. No network
    /// interaction occurs; every field is a function of the allocations.
    pub fn build(&self, allocations: &[GenesisAllocation]) -> GenesisObservation {
        let mut last_ref = LastTransactionRef::empty();
        let mut distribution = Vec::with_capacity(allocations.len());
        for allocation in allocations {
            let tx = Transaction::new(
                COINBASE_ADDRESS.to_owned(),
                allocation.address.clone(),
                allocation.balance,
                last_ref,
                &self.keypair,
                false,
            );
            last_ref = LastTransactionRef {
                prev_hash: tx.hash,
                ordinal: tx.ordinal,
            };
            distribution.push(tx);
        }

        let coinbase_parents = [
            TypedEdgeHash::checkpoint(Hash::coinbase(), None),
            TypedEdgeHash::checkpoint(Hash::coinbase(), None),
        ];
        let genesis = CheckpointBlock::new(
            distribution,
            vec![],
            coinbase_parents,
            self.local_peer,
            &self.keypair,
        );

        let genesis_edge = TypedEdgeHash::checkpoint(genesis.soe_hash(), Some(genesis.base_hash));

        // Sibling blocks over identical parents would collapse to one hash
        // under deterministic signing, so each carries a distinct dummy
        // transaction extending the coinbase chain.
        let distribution_one = self.distribution_block(genesis_edge, &mut last_ref);
        let distribution_two = self.distribution_block(genesis_edge, &mut last_ref);

        GenesisObservation {
            genesis,
            distribution_one,
            distribution_two,
        }
    }

    fn distribution_block(
        &self,
        genesis_edge: TypedEdgeHash,
        last_ref: &mut LastTransactionRef,
    ) -> CheckpointBlock {
        let dummy = Transaction::new(
            COINBASE_ADDRESS.to_owned(),
            COINBASE_ADDRESS.to_owned(),
            0,
            *last_ref,
            &self.keypair,
            true,
        );
        *last_ref = LastTransactionRef {
            prev_hash: dummy.hash,
            ordinal: dummy.ordinal,
        };
        CheckpointBlock::new(
            vec![dummy],
            vec![],
            [genesis_edge, genesis_edge],
            self.local_peer,
            &self.keypair,
        )
    }

    /// Persist the three blocks at heights (0,0), (1,1), (1,1), seed the
    /// address balances and install the two distribution blocks as the
    /// initial tips.
    pub async fn install(
        &self,
        observation: &GenesisObservation,
        allocations: &[GenesisAllocation],
        checkpoints: &dyn CheckpointStore,
        addresses: &dyn AddressStore,
        tips: &TipSelector,
    ) -> ServiceResult<()> {
        let entries = [
            (&observation.genesis, Height::genesis()),
            (&observation.distribution_one, Height { min: 1, max: 1 }),
            (&observation.distribution_two, Height { min: 1, max: 1 }),
        ];
        for (block, height) in entries {
            checkpoints.store_soe(block.soe.clone()).await?;
            let entry = CheckpointCache {
                block: block.clone(),
                height,
            };
            checkpoints.store(entry.clone()).await?;
            checkpoints.add_to_acceptance(entry).await?;
        }

        for allocation in allocations {
            addresses
                .set_balance(allocation.address.clone(), allocation.balance)
                .await?;
        }

        tips.install_genesis_tips([
            (&observation.distribution_one, Height { min: 1, max: 1 }),
            (&observation.distribution_two, Height { min: 1, max: 1 }),
        ]);

        info!(
            genesis = %observation.genesis.soe_hash(),
            allocations = allocations.len(),
            "genesis installed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{InMemoryAddressStore, InMemoryCheckpointStore};

    fn allocations() -> Vec<GenesisAllocation> {
        vec![
            GenesisAllocation {
                address: "A".into(),
                balance: 100,
            },
            GenesisAllocation {
                address: "B".into(),
                balance: 50,
            },
        ]
    }

    #[test]
    fn test_genesis_block_shape() {
        let builder = GenesisBuilder::new(0);
        let observation = builder.build(&allocations());

        assert_eq!(observation.genesis.transactions.len(), 2);
        assert_eq!(observation.genesis.transactions[0].amount, 100);
        assert_eq!(observation.genesis.transactions[1].amount, 50);
        // Distribution transactions chain on the coinbase address.
        assert_eq!(observation.genesis.transactions[0].ordinal, 1);
        assert_eq!(observation.genesis.transactions[1].ordinal, 2);

        for parent in &observation.genesis.parents {
            assert_eq!(parent.hash, Hash::coinbase());
        }
    }

    #[test]
    fn test_distribution_blocks_are_distinct_siblings() {
        let builder = GenesisBuilder::new(0);
        let observation = builder.build(&allocations());

        let genesis_hash = observation.genesis.soe_hash();
        for block in [&observation.distribution_one, &observation.distribution_two] {
            for parent in &block.parents {
                assert_eq!(parent.hash, genesis_hash);
            }
            assert_eq!(block.transactions.len(), 1);
            assert!(block.transactions[0].is_dummy);
            assert_eq!(block.transactions[0].amount, 0);
        }
        assert_ne!(
            observation.distribution_one.soe_hash(),
            observation.distribution_two.soe_hash()
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = GenesisBuilder::new(0).build(&allocations());
        let b = GenesisBuilder::new(0).build(&allocations());

        assert_eq!(a.genesis.soe_hash(), b.genesis.soe_hash());
        assert_eq!(
            a.distribution_one.soe_hash(),
            b.distribution_one.soe_hash()
        );
        assert_eq!(
            a.distribution_two.soe_hash(),
            b.distribution_two.soe_hash()
        );
    }

    #[tokio::test]
    async fn test_install_seeds_balances_and_tips() {
        let builder = GenesisBuilder::new(0);
        let allocations = allocations();
        let observation = builder.build(&allocations);

        let checkpoints = InMemoryCheckpointStore::new();
        let addresses = InMemoryAddressStore::new();
        let tips = TipSelector::new();

        builder
            .install(&observation, &allocations, &checkpoints, &addresses, &tips)
            .await
            .unwrap();

        use crate::services::{AddressStore, CheckpointStore};
        assert_eq!(addresses.get_balance("A").await.unwrap(), 100);
        assert_eq!(addresses.get_balance("B").await.unwrap(), 50);
        assert_eq!(addresses.get_balance("unknown").await.unwrap(), 0);

        assert!(checkpoints
            .is_accepted(observation.genesis.soe_hash())
            .await
            .unwrap());
        let stored = checkpoints
            .get(observation.genesis.soe_hash())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.height, Height::genesis());

        let one = checkpoints
            .get(observation.distribution_one.soe_hash())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(one.height, Height { min: 1, max: 1 });

        assert_eq!(tips.tip_count(), 2);
    }
}
