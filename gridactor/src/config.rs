/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for the rebalancer.
//!
//! Values come from coded defaults with an environment-variable override
//! layer (`GRIDACTOR_REBALANCER_*`); unparsable variables are ignored.
//! Validation is eager: an out-of-range configuration is rejected at
//! startup, never at runtime.

use std::env;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Tunables for the communication-graph rebalancer. See
/// [`Rebalancer`](crate::rebalancer::Rebalancer).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RebalancerConfig {
    /// Whether messages touching anchored or mid-migration actors are
    /// excluded from traffic sampling.
    pub anchoring_filter_enabled: bool,

    /// The false-positive budget of the probabilistic edge counter,
    /// strictly between 0 and 1.
    pub probabilistic_filtering_max_allowed_error_rate: f64,

    /// The edge capacity the probabilistic counter is sized for, and the
    /// cap on migrations issued per round.
    pub max_edge_count: usize,

    /// The maximum number of heaviest edges a round snapshots for
    /// consideration.
    pub max_unprocessed_edges: usize,

    /// The shortest interval between rebalancing rounds.
    pub min_rebalancing_period: Duration,

    /// The longest interval between rebalancing rounds; idle rounds back
    /// off toward it.
    pub max_rebalancing_period: Duration,

    /// The mandatory pause after any round that issued migrations.
    pub recovery_period: Duration,

    /// The budget for one directory round trip during a round (a
    /// migration request or a location read); elapse counts as a
    /// rejection for the round.
    pub migration_timeout: Duration,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            anchoring_filter_enabled: true,
            probabilistic_filtering_max_allowed_error_rate: 0.01,
            max_edge_count: 10_000,
            max_unprocessed_edges: 10_000,
            min_rebalancing_period: Duration::from_secs(60),
            max_rebalancing_period: Duration::from_secs(120),
            recovery_period: Duration::from_secs(60),
            migration_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration rejected at startup.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    /// The error rate must lie strictly between 0 and 1.
    #[error("probabilistic filtering error rate {0} is outside (0, 1)")]
    ErrorRateOutOfRange(f64),

    /// The edge capacity must be positive.
    #[error("max edge count must be positive")]
    ZeroMaxEdgeCount,

    /// The snapshot size must be positive.
    #[error("max unprocessed edges must be positive")]
    ZeroMaxUnprocessedEdges,

    /// The period bounds must be ordered.
    #[error("min rebalancing period {min:?} exceeds max {max:?}")]
    PeriodsInverted {
        /// The configured minimum period.
        min: Duration,
        /// The configured maximum period.
        max: Duration,
    },
}

impl RebalancerConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("GRIDACTOR_REBALANCER_ANCHORING_FILTER_ENABLED") {
            if let Ok(parsed) = val.parse::<bool>() {
                config.anchoring_filter_enabled = parsed;
            }
        }
        if let Ok(val) = env::var("GRIDACTOR_REBALANCER_MAX_ALLOWED_ERROR_RATE") {
            if let Ok(parsed) = val.parse::<f64>() {
                config.probabilistic_filtering_max_allowed_error_rate = parsed;
            }
        }
        if let Ok(val) = env::var("GRIDACTOR_REBALANCER_MAX_EDGE_COUNT") {
            if let Ok(parsed) = val.parse::<usize>() {
                config.max_edge_count = parsed;
            }
        }
        if let Ok(val) = env::var("GRIDACTOR_REBALANCER_MAX_UNPROCESSED_EDGES") {
            if let Ok(parsed) = val.parse::<usize>() {
                config.max_unprocessed_edges = parsed;
            }
        }
        if let Ok(val) = env::var("GRIDACTOR_REBALANCER_MIN_PERIOD_SECS") {
            if let Ok(parsed) = val.parse::<u64>() {
                config.min_rebalancing_period = Duration::from_secs(parsed);
            }
        }
        if let Ok(val) = env::var("GRIDACTOR_REBALANCER_MAX_PERIOD_SECS") {
            if let Ok(parsed) = val.parse::<u64>() {
                config.max_rebalancing_period = Duration::from_secs(parsed);
            }
        }
        if let Ok(val) = env::var("GRIDACTOR_REBALANCER_RECOVERY_PERIOD_SECS") {
            if let Ok(parsed) = val.parse::<u64>() {
                config.recovery_period = Duration::from_secs(parsed);
            }
        }
        if let Ok(val) = env::var("GRIDACTOR_REBALANCER_MIGRATION_TIMEOUT_SECS") {
            if let Ok(parsed) = val.parse::<u64>() {
                config.migration_timeout = Duration::from_secs(parsed);
            }
        }

        config
    }

    /// Reject out-of-range values. Called once at startup by
    /// [`Rebalancer::new`](crate::rebalancer::Rebalancer::new).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate = self.probabilistic_filtering_max_allowed_error_rate;
        if !(rate > 0.0 && rate < 1.0) {
            return Err(ConfigError::ErrorRateOutOfRange(rate));
        }
        if self.max_edge_count == 0 {
            return Err(ConfigError::ZeroMaxEdgeCount);
        }
        if self.max_unprocessed_edges == 0 {
            return Err(ConfigError::ZeroMaxUnprocessedEdges);
        }
        if self.min_rebalancing_period > self.max_rebalancing_period {
            return Err(ConfigError::PeriodsInverted {
                min: self.min_rebalancing_period,
                max: self.max_rebalancing_period,
            });
        }
        Ok(())
    }
}
