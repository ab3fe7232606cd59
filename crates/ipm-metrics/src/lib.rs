use anyhow::Result;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Metrics collector for iptmgr
pub struct Metrics {
    registry: Registry,

    // Registry metrics
    rule_sets: IntGauge,
    epoch: IntGauge,

    // Engine metrics
    rule_set_ops: IntCounterVec,
    rollbacks: IntCounterVec,

    // Cluster metrics
    peers: IntGauge,
    messages: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let rule_sets = IntGauge::new("iptmgr_rule_sets", "Number of registered rule sets")?;
        registry.register(Box::new(rule_sets.clone()))?;

        let epoch = IntGauge::new("iptmgr_epoch", "Current logical epoch of this node")?;
        registry.register(Box::new(epoch.clone()))?;

        let rule_set_ops = IntCounterVec::new(
            Opts::new(
                "iptmgr_rule_set_ops_total",
                "Rule set create/delete operations",
            ),
            &["op", "result"],
        )?;
        registry.register(Box::new(rule_set_ops.clone()))?;

        let rollbacks = IntCounterVec::new(
            Opts::new(
                "iptmgr_rollbacks_total",
                "Partially applied rule changes that were rolled back",
            ),
            &["op"],
        )?;
        registry.register(Box::new(rollbacks.clone()))?;

        let peers = IntGauge::new("iptmgr_peers", "Number of joined cluster peers")?;
        registry.register(Box::new(peers.clone()))?;

        let messages = IntCounterVec::new(
            Opts::new(
                "iptmgr_messages_total",
                "Cluster messages received from peers",
            ),
            &["type"],
        )?;
        registry.register(Box::new(messages.clone()))?;

        Ok(Self {
            registry,
            rule_sets,
            epoch,
            rule_set_ops,
            rollbacks,
            peers,
            messages,
        })
    }

    pub fn set_rule_sets(&self, count: usize) {
        self.rule_sets.set(count as i64);
    }

    pub fn set_epoch(&self, epoch: i64) {
        self.epoch.set(epoch);
    }

    /// Record a rule set operation (`create` / `delete`)
    pub fn record_rule_set_op(&self, op: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.rule_set_ops.with_label_values(&[op, result]).inc();
    }

    pub fn record_rollback(&self, op: &str) {
        self.rollbacks.with_label_values(&[op]).inc();
    }

    pub fn set_peers(&self, count: usize) {
        self.peers.set(count as i64);
    }

    pub fn record_message(&self, kind: &str) {
        self.messages.with_label_values(&[kind]).inc();
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
