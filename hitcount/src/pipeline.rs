// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Intake pool plus flush thread, shared by both aggregation policies.

use std::{num::NonZeroUsize, thread, time::Duration};

use hitcount_core::{CountStore, DrainError, FlushRecord, SignalError, StoreError};

use crate::{
    config::ConfigError,
    flush::{FlushExecutor, FlushQueue, FlushStats},
    intake::{IntakePool, Task},
};

/// Thread and shutdown settings common to both builders.
#[derive(Debug, Clone)]
pub(crate) struct PipelineOptions {
    pub(crate) intake_workers: usize,
    pub(crate) thread_name: String,
    pub(crate) shutdown_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            intake_workers: thread::available_parallelism().map_or(4, NonZeroUsize::get),
            thread_name: "hitcount".into(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineOptions {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.intake_workers == 0 {
            return Err(ConfigError::NoIntakeWorkers);
        }
        if self.thread_name.is_empty() {
            return Err(ConfigError::EmptyThreadName);
        }
        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::ZeroShutdownTimeout);
        }
        Ok(())
    }
}

pub(crate) struct Pipeline<S> {
    intake: IntakePool,
    flusher: FlushExecutor<S>,
    shutdown_timeout: Duration,
}

impl<S: CountStore + Send + 'static> Pipeline<S> {
    pub(crate) fn start(options: &PipelineOptions, store: S) -> std::io::Result<Self> {
        let mut flusher = FlushExecutor::start(store, &options.thread_name)?;
        let intake = match IntakePool::start(options.intake_workers, &options.thread_name) {
            Ok(intake) => intake,
            Err(err) => {
                flusher.shut_down(Duration::ZERO);
                return Err(err);
            }
        };
        tracing::info!(
            name = %options.thread_name,
            workers = options.intake_workers,
            "hitcount aggregator started"
        );
        Ok(Self {
            intake,
            flusher,
            shutdown_timeout: options.shutdown_timeout,
        })
    }

    pub(crate) fn submit(&self, task: Task) -> Result<(), SignalError> {
        self.intake.submit(task)
    }

    pub(crate) fn flush_queue(&self) -> FlushQueue {
        self.flusher.queue()
    }

    pub(crate) fn settle(&self, timeout: Duration) -> bool {
        self.intake.settle(timeout)
    }

    pub(crate) fn stats(&self) -> FlushStats {
        self.flusher.stats()
    }

    /// Stop the intake pool, letting queued signals finish within the shutdown timeout.
    pub(crate) fn stop_intake(&mut self) {
        self.intake.shut_down(self.shutdown_timeout);
    }

    /// Stop the flush thread and take the store back.
    pub(crate) fn stop_flusher(&mut self) -> Option<S> {
        self.flusher.shut_down(self.shutdown_timeout)
    }
}

/// Store `records` from the calling thread, attempting every record even after failures.
pub(crate) fn drain_into<S: CountStore>(
    store: Option<&mut S>,
    records: Vec<FlushRecord>,
) -> Result<(), DrainError> {
    let attempted = records.len();
    if attempted == 0 {
        return Ok(());
    }
    let failures: Vec<_> = match store {
        Some(store) => records
            .into_iter()
            .filter_map(|record| match store.store(record.key(), record.total()) {
                Ok(()) => None,
                Err(err) => Some((record, err)),
            })
            .collect(),
        None => records
            .into_iter()
            .map(|record| (record, StoreError::msg("store was lost when the flush thread panicked")))
            .collect(),
    };
    tracing::info!(attempted, failed = failures.len(), "drained pending totals");
    if failures.is_empty() {
        Ok(())
    } else {
        Err(DrainError::new(attempted, failures))
    }
}

#[cfg(test)]
mod tests {
    use hitcount_core::test_util::TestStore;

    use super::*;

    #[test]
    fn drain_attempts_every_record() {
        let mut store = TestStore::default();
        store.fail_key("b");
        let err = drain_into(
            Some(&mut store),
            vec![
                FlushRecord::new("a", 1),
                FlushRecord::new("b", 2),
                FlushRecord::new("c", 3),
            ],
        )
        .unwrap_err();
        assert_eq!(err.attempted(), 3);
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].0, FlushRecord::new("b", 2));
        assert_eq!(store.totals_for("a"), vec![1]);
        assert_eq!(store.totals_for("c"), vec![3]);
    }

    #[test]
    fn drain_without_store_fails_everything() {
        let err = drain_into::<TestStore>(None, vec![FlushRecord::new("a", 1)]).unwrap_err();
        assert_eq!(err.failures().len(), 1);
    }

    #[test]
    fn default_options_are_valid() {
        assert!(PipelineOptions::default().validate().is_ok());
        let options = PipelineOptions {
            intake_workers: 0,
            ..PipelineOptions::default()
        };
        assert!(matches!(options.validate(), Err(ConfigError::NoIntakeWorkers)));
    }
}
