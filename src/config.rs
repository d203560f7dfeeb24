use std::time::Duration;

/// Tunables for the round lifecycle. Defaults mirror the recognized
/// configuration options:
/// `consensus.maxTransactionThreshold`, `consensus.maxObservationThreshold`,
/// `constellation.consensus.form-checkpoint-blocks-timeout` and
/// `constellation.cache.expire-after-min.cache`.
#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    /// Cap on transactions pulled from the mempool per round.
    pub max_transaction_threshold: u32,
    /// Cap on observations pulled per round.
    pub max_observation_threshold: u32,
    /// Whole-round timeout; rounds older than this are evicted by the sweep.
    pub form_checkpoint_blocks_timeout: Duration,
    /// TTL for proposals buffered before their round is installed locally.
    pub proposal_expiry: Duration,
    /// How often the long-running-round sweep fires.
    pub cleanup_interval: Duration,
    /// Grace period before `terminate_all` tears rounds down.
    pub terminate_grace: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            max_transaction_threshold: 50,
            max_observation_threshold: 50,
            form_checkpoint_blocks_timeout: Duration::from_secs(45),
            proposal_expiry: Duration::from_secs(10 * 60),
            cleanup_interval: Duration::from_secs(10),
            terminate_grace: Duration::from_secs(5),
        }
    }
}
