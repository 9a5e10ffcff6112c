// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Building an aggregator from a configuration file.
//!
//! ```
//! use hitcount::{AggregatorConfig, CountAggregator};
//! use hitcount_core::store_fn;
//!
//! let config = AggregatorConfig::from_toml_str(r#"
//!     intake_workers = 2
//!
//!     [policy]
//!     kind = "timing"
//!     flush_delay_secs = 60
//! "#).unwrap();
//!
//! let mut aggregator = config.build(store_fn(|_: &str, _| Ok(()))).unwrap();
//! aggregator.increase("home", 1).unwrap();
//! aggregator.destroy().unwrap();
//! ```

use std::{io, time::Duration};

use hitcount_core::{CountAggregator, CountStore};
use serde::Deserialize;

use crate::{ThresholdAggregator, TimingAggregator, pipeline::PipelineOptions};

/// A configuration value that can't be used to build an aggregator.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The flush threshold must be at least 1.
    #[error("flush threshold must be positive, got {0}")]
    NonPositiveThreshold(i64),
    /// The timing policy needs a non-zero interval.
    #[error("flush interval must not be zero")]
    ZeroFlushInterval,
    /// At least one intake worker is needed to apply signals.
    #[error("intake worker count must not be zero")]
    NoIntakeWorkers,
    /// Thread names are used as prefixes for every spawned thread.
    #[error("thread name must not be empty")]
    EmptyThreadName,
    /// Shutdown needs a grace period for queued work.
    #[error("shutdown timeout must not be zero")]
    ZeroShutdownTimeout,
    /// The configuration text isn't valid.
    #[error("invalid aggregator configuration")]
    Parse(#[from] toml::de::Error),
}

/// Failure to build an aggregator.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The configuration was rejected before anything was started.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A worker thread couldn't be spawned.
    #[error("failed to spawn aggregator thread")]
    Spawn(#[source] io::Error),
}

/// When pending totals leave memory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Flush a key once its pending total reaches `threshold`. See [`ThresholdAggregator`].
    Threshold {
        /// Count at which a key is flushed
        threshold: i64,
    },
    /// Flush the whole table every `flush_delay_secs` seconds. See [`TimingAggregator`].
    Timing {
        /// Seconds between flushes
        flush_delay_secs: u64,
    },
}

/// Everything needed to build an aggregator, deserializable from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregatorConfig {
    /// Flush policy and its parameter
    pub policy: FlushPolicy,
    /// Number of intake workers. Defaults to the available parallelism.
    #[serde(default)]
    pub intake_workers: Option<usize>,
    /// Grace period for queued work during shutdown. Defaults to 30 seconds.
    #[serde(default)]
    pub shutdown_timeout_secs: Option<u64>,
    /// Prefix for the names of spawned threads. Defaults to `hitcount`.
    #[serde(default)]
    pub thread_name: Option<String>,
}

impl AggregatorConfig {
    /// Configuration for the given policy with every other setting at its default
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            policy,
            intake_workers: None,
            shutdown_timeout_secs: None,
            thread_name: None,
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject non-positive values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.policy {
            FlushPolicy::Threshold { threshold } if threshold <= 0 => {
                return Err(ConfigError::NonPositiveThreshold(threshold));
            }
            FlushPolicy::Timing {
                flush_delay_secs: 0,
            } => return Err(ConfigError::ZeroFlushInterval),
            _ => {}
        }
        self.pipeline_options().validate()
    }

    pub(crate) fn pipeline_options(&self) -> PipelineOptions {
        let mut options = PipelineOptions::default();
        if let Some(workers) = self.intake_workers {
            options.intake_workers = workers;
        }
        if let Some(secs) = self.shutdown_timeout_secs {
            options.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(name) = &self.thread_name {
            options.thread_name = name.clone();
        }
        options
    }

    /// Build the configured aggregator on top of `store`.
    pub fn build<S>(&self, store: S) -> Result<Box<dyn CountAggregator>, BuildError>
    where
        S: CountStore + Send + 'static,
    {
        self.validate()?;
        let options = self.pipeline_options();
        let aggregator: Box<dyn CountAggregator> = match self.policy {
            FlushPolicy::Threshold { threshold } => Box::new(
                ThresholdAggregator::builder(threshold)
                    .with_options(options)
                    .build(store)?,
            ),
            FlushPolicy::Timing { flush_delay_secs } => Box::new(
                TimingAggregator::builder(Duration::from_secs(flush_delay_secs))
                    .with_options(options)
                    .build(store)?,
            ),
        };
        Ok(aggregator)
    }
}
