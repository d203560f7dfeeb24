use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Counters for the round lifecycle, exposed in Prometheus text format.
pub struct ConsensusMetrics {
    pub registry: Registry,

    /// Rounds this node has started or joined.
    pub rounds_started: IntCounter,
    /// Rounds that committed a checkpoint block.
    pub rounds_committed: IntCounter,
    /// Rounds that failed, labeled by error kind.
    pub rounds_failed: IntCounterVec,
    /// Rounds evicted by the long-running sweep.
    pub consensus_timeout: IntCounter,
    /// Messages dropped for an earlier phase or a finished round.
    pub proposals_discarded: IntCounter,
    /// Proposals buffered before their round was installed locally.
    pub missed_proposals_buffered: IntCounter,
    /// Participations dropped because the tip was at or below the snapshot.
    pub snapshot_height_above_tip: IntCounter,

    /// Rounds currently tracked in either table.
    pub active_rounds: IntGauge,
    /// Whether an own round is in flight (0 or 1).
    pub own_round_in_flight: IntGauge,
}

impl ConsensusMetrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        let rounds_started =
            IntCounter::new("tessera_rounds_started_total", "Rounds started or joined").unwrap();
        let rounds_committed = IntCounter::new(
            "tessera_rounds_committed_total",
            "Rounds that committed a checkpoint block",
        )
        .unwrap();
        let rounds_failed = IntCounterVec::new(
            Opts::new("tessera_rounds_failed_total", "Rounds failed, by kind"),
            &["kind"],
        )
        .unwrap();
        let consensus_timeout = IntCounter::new(
            "tessera_consensus_timeout_total",
            "Rounds evicted by the long-running sweep",
        )
        .unwrap();
        let proposals_discarded = IntCounter::new(
            "tessera_proposals_discarded_total",
            "Messages dropped for an earlier phase or finished round",
        )
        .unwrap();
        let missed_proposals_buffered = IntCounter::new(
            "tessera_missed_proposals_buffered_total",
            "Proposals buffered before round installation",
        )
        .unwrap();
        let snapshot_height_above_tip = IntCounter::new(
            "tessera_snapshot_height_above_tip_total",
            "Participations dropped below the snapshot height",
        )
        .unwrap();
        let active_rounds =
            IntGauge::new("tessera_active_rounds", "Rounds currently tracked").unwrap();
        let own_round_in_flight =
            IntGauge::new("tessera_own_round_in_flight", "Own round in flight").unwrap();

        registry.register(Box::new(rounds_started.clone())).unwrap();
        registry
            .register(Box::new(rounds_committed.clone()))
            .unwrap();
        registry.register(Box::new(rounds_failed.clone())).unwrap();
        registry
            .register(Box::new(consensus_timeout.clone()))
            .unwrap();
        registry
            .register(Box::new(proposals_discarded.clone()))
            .unwrap();
        registry
            .register(Box::new(missed_proposals_buffered.clone()))
            .unwrap();
        registry
            .register(Box::new(snapshot_height_above_tip.clone()))
            .unwrap();
        registry.register(Box::new(active_rounds.clone())).unwrap();
        registry
            .register(Box::new(own_round_in_flight.clone()))
            .unwrap();

        Arc::new(Self {
            registry,
            rounds_started,
            rounds_committed,
            rounds_failed,
            consensus_timeout,
            proposals_discarded,
            missed_proposals_buffered,
            snapshot_height_above_tip,
            active_rounds,
            own_round_in_flight,
        })
    }

    /// Encode all metrics into Prometheus text format.
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}
