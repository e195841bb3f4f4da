//! Orchestrator configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default heartbeat timeout in seconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 90;
/// Default cap on concurrently assigned tasks per node.
pub const DEFAULT_MAX_TASKS_PER_NODE: usize = 10;
/// Default fraction of participants required before a round may advance.
pub const DEFAULT_QUORUM_FRACTION: f64 = 0.67;
/// Default round deadline in seconds, overridable per job.
pub const DEFAULT_ROUND_DEADLINE_SECS: u64 = 300;
/// Uptime below this threshold halves the derived reputation.
pub const DEFAULT_REPUTATION_PENALTY_THRESHOLD: f64 = 50.0;

/// Node selection strategy for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStrategy {
    /// Rotate through candidates with a persistent index.
    #[default]
    RoundRobin,
    /// Fewest active tasks wins; ties broken by lower id.
    LeastLoaded,
    /// Highest reputation wins; ties broken by lower id.
    BestReputation,
}

impl SchedulerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerStrategy::RoundRobin => "round_robin",
            SchedulerStrategy::LeastLoaded => "least_loaded",
            SchedulerStrategy::BestReputation => "best_reputation",
        }
    }

    /// Parse a configured strategy name. Unknown names fall back to
    /// round-robin so that a bad config value cannot stall scheduling.
    pub fn parse_or_default(s: &str) -> SchedulerStrategy {
        match s {
            "round_robin" => SchedulerStrategy::RoundRobin,
            "least_loaded" => SchedulerStrategy::LeastLoaded,
            "best_reputation" => SchedulerStrategy::BestReputation,
            _ => SchedulerStrategy::RoundRobin,
        }
    }
}

impl fmt::Display for SchedulerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tunables for the replicated orchestration core.
///
/// All fields are consensus-relevant: every replica must run with the same
/// values for a given chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Seconds since the last heartbeat after which a node is offline.
    pub heartbeat_timeout_secs: u64,
    /// Maximum concurrently assigned tasks per node.
    pub max_tasks_per_node: usize,
    /// Fraction of round participants required before aggregation.
    pub quorum_fraction: f64,
    /// Round deadline in seconds; jobs may override via their config map.
    pub round_deadline_secs: u64,
    /// Uptime threshold below which reputation is halved.
    pub reputation_penalty_threshold: f64,
    /// Node selection strategy.
    pub scheduler_strategy: SchedulerStrategy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            max_tasks_per_node: DEFAULT_MAX_TASKS_PER_NODE,
            quorum_fraction: DEFAULT_QUORUM_FRACTION,
            round_deadline_secs: DEFAULT_ROUND_DEADLINE_SECS,
            reputation_penalty_threshold: DEFAULT_REPUTATION_PENALTY_THRESHOLD,
            scheduler_strategy: SchedulerStrategy::RoundRobin,
        }
    }
}

impl OrchestratorConfig {
    /// Heartbeat timeout in nanoseconds of block time.
    pub fn heartbeat_timeout_ns(&self) -> u64 {
        self.heartbeat_timeout_secs * 1_000_000_000
    }

    /// Round deadline in nanoseconds of block time.
    pub fn round_deadline_ns(&self) -> u64 {
        self.round_deadline_secs * 1_000_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.heartbeat_timeout_secs, 90);
        assert_eq!(config.max_tasks_per_node, 10);
        assert!((config.quorum_fraction - 0.67).abs() < f64::EPSILON);
        assert_eq!(config.reputation_penalty_threshold, 50.0);
        assert_eq!(config.scheduler_strategy, SchedulerStrategy::RoundRobin);
    }

    #[test]
    fn test_strategy_fallback() {
        assert_eq!(
            SchedulerStrategy::parse_or_default("least_loaded"),
            SchedulerStrategy::LeastLoaded
        );
        assert_eq!(
            SchedulerStrategy::parse_or_default("best_reputation"),
            SchedulerStrategy::BestReputation
        );
        assert_eq!(
            SchedulerStrategy::parse_or_default("lottery"),
            SchedulerStrategy::RoundRobin
        );
    }

    #[test]
    fn test_config_partial_deserialization() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"heartbeat_timeout_secs": 30}"#).unwrap();
        assert_eq!(config.heartbeat_timeout_secs, 30);
        assert_eq!(config.max_tasks_per_node, 10);
    }
}
