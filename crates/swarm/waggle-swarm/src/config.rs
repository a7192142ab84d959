//! Aggregate coordinator configuration

use crate::pool::PoolConfig;
use serde::{Deserialize, Serialize};
use waggle_bus::BusConfig;
use waggle_consensus::ConsensusConfig;
use waggle_core::SwarmResult;
use waggle_topology::TopologyConfig;

/// Configuration for the swarm coordinator and its components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Namespace stamped into the swarm identifier.
    pub namespace: String,
    pub topology: TopologyConfig,
    pub consensus: ConsensusConfig,
    pub bus: BusConfig,
    /// Defaults applied to domain pools.
    pub pool: PoolConfig,
    /// Hard cap on registered agents.
    pub max_agents: usize,
    /// Hard cap on tracked tasks.
    pub max_tasks: usize,
    pub heartbeat_interval_ms: u64,
    pub health_check_interval_ms: u64,
    /// Default task timeout when a submission does not set one.
    pub task_timeout_ms: u64,
    /// Period of the metrics gauge refresh.
    pub metrics_interval_ms: u64,
    pub auto_scaling: bool,
    /// Re-queue the current task of an agent whose health collapses.
    pub auto_recovery: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
            topology: TopologyConfig::default(),
            consensus: ConsensusConfig::default(),
            bus: BusConfig::default(),
            pool: PoolConfig::default(),
            max_agents: 100,
            max_tasks: 1_000,
            heartbeat_interval_ms: waggle_core::DEFAULT_HEARTBEAT_INTERVAL_MS,
            health_check_interval_ms: waggle_core::DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            task_timeout_ms: waggle_core::DEFAULT_TASK_TIMEOUT_MS,
            metrics_interval_ms: 5_000,
            auto_scaling: true,
            auto_recovery: true,
        }
    }
}

impl CoordinatorConfig {
    /// Validate the aggregate and every component section.
    pub fn validate(&self) -> SwarmResult<()> {
        self.topology.validate()?;
        self.consensus.validate()?;
        self.bus.validate()?;
        self.pool.validate()?;
        if self.max_agents == 0 {
            return Err(waggle_core::SwarmError::Configuration(
                "maxAgents must be positive".into(),
            ));
        }
        if self.max_tasks == 0 {
            return Err(waggle_core::SwarmError::Configuration(
                "maxTasks must be positive".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 || self.health_check_interval_ms == 0 {
            return Err(waggle_core::SwarmError::Configuration(
                "heartbeat and health check intervals must be positive".into(),
            ));
        }
        if self.task_timeout_ms == 0 {
            return Err(waggle_core::SwarmError::Configuration(
                "taskTimeoutMs must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waggle_core::ConsensusAlgorithmKind;

    #[test]
    fn default_config_is_valid() {
        assert!(CoordinatorConfig::default().validate().is_ok());
    }

    #[test]
    fn reserved_consensus_algorithm_refuses_to_validate() {
        let config = CoordinatorConfig {
            consensus: ConsensusConfig {
                algorithm: ConsensusAlgorithmKind::Paxos,
                ..ConsensusConfig::default()
            },
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_caps_are_rejected() {
        let config = CoordinatorConfig {
            max_agents: 0,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
