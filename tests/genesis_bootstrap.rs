// Genesis bootstrap: the deterministic three-block seed, initial balances
// and the first two tips.

use tessera::config::ConsensusConfig;
use tessera::crypto::KeyPair;
use tessera::genesis::GenesisAllocation;
use tessera::network::SharedConsensusNetwork;
use tessera::node::ConsensusNode;
use tessera::services::{AddressStore, CheckpointStore};
use tessera::types::{Hash, Height};

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

#[tokio::test]
async fn test_genesis_seeds_blocks_balances_and_tips() {
    let network = SharedConsensusNetwork::new();
    let (node, services) = ConsensusNode::in_memory(
        0,
        KeyPair::generate(),
        ConsensusConfig::default(),
        network,
    );

    let observation = node.install_genesis(&allocations()).await.unwrap();

    // Genesis block: one distribution transaction per allocation, at (0,0).
    assert_eq!(observation.genesis.transactions.len(), 2);
    let genesis_entry = services
        .checkpoints
        .get(observation.genesis.soe_hash())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(genesis_entry.height, Height { min: 0, max: 0 });
    for parent in &genesis_entry.block.parents {
        assert_eq!(parent.hash, Hash::coinbase());
    }

    // Distribution blocks at (1,1), both children of the genesis block.
    for block in [&observation.distribution_one, &observation.distribution_two] {
        let entry = services
            .checkpoints
            .get(block.soe_hash())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.height, Height { min: 1, max: 1 });
        for parent in &entry.block.parents {
            assert_eq!(parent.hash, observation.genesis.soe_hash());
        }
    }

    // Signed observation edges are stored alongside the blocks.
    assert!(services
        .checkpoints
        .get_soe(observation.genesis.soe_hash())
        .is_some());

    // Balances are seeded from the allocation table.
    assert_eq!(services.addresses.get_balance("A").await.unwrap(), 100);
    assert_eq!(services.addresses.get_balance("B").await.unwrap(), 50);

    // The two distribution blocks are the initial tips.
    assert_eq!(node.tips.tip_count(), 2);
}

#[tokio::test]
async fn test_genesis_is_identical_across_nodes() {
    let network = SharedConsensusNetwork::new();
    let (node_a, _) = ConsensusNode::in_memory(
        0,
        KeyPair::generate(),
        ConsensusConfig::default(),
        network.clone(),
    );
    let (node_b, _) = ConsensusNode::in_memory(
        1,
        KeyPair::generate(),
        ConsensusConfig::default(),
        network,
    );

    let a = node_a.install_genesis(&allocations()).await.unwrap();
    let b = node_b.install_genesis(&allocations()).await.unwrap();

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
