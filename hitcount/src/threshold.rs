// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Flush a key as soon as its pending total reaches a threshold.

use std::{sync::Arc, time::Duration};

use hitcount_core::{
    CountAggregator, CountStore, DrainError, FlushRecord, FlushWait, SignalError, validate_signal,
};

use crate::{
    config::{BuildError, ConfigError},
    flush::{FlushQueue, FlushStats},
    lock_table::KeyLockTable,
    pipeline::{Pipeline, PipelineOptions, drain_into},
};

/// Builder for [`ThresholdAggregator`]
#[derive(Debug, Clone)]
pub struct ThresholdAggregatorBuilder {
    threshold: i64,
    options: PipelineOptions,
}

impl ThresholdAggregatorBuilder {
    /// Start building an aggregator that flushes a key once its pending total reaches `threshold`.
    pub fn new(threshold: i64) -> Self {
        Self {
            threshold,
            options: PipelineOptions::default(),
        }
    }

    /// Number of threads applying signals to the pending totals.
    ///
    /// Defaults to the available parallelism.
    pub fn intake_workers(mut self, workers: usize) -> Self {
        self.options.intake_workers = workers;
        self
    }

    /// Prefix for the names of the threads this aggregator spawns. Defaults to `hitcount`.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.options.thread_name = name.into();
        self
    }

    /// How long `destroy` waits for queued signals, and then for queued flush records, before
    /// dropping them.
    ///
    /// Defaults to 30 seconds. Each of the two phases gets the full timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.options.shutdown_timeout = timeout;
        self
    }

    pub(crate) fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the settings and start the aggregator's threads.
    ///
    /// The store is moved onto the flush thread; use a cloneable handle such as `Arc<Mutex<_>>` if
    /// the caller needs to reach it too.
    pub fn build<S>(self, store: S) -> Result<ThresholdAggregator<S>, BuildError>
    where
        S: CountStore + Send + 'static,
    {
        if self.threshold <= 0 {
            return Err(ConfigError::NonPositiveThreshold(self.threshold).into());
        }
        self.options.validate()?;
        let pipeline = Pipeline::start(&self.options, store).map_err(BuildError::Spawn)?;
        let state = Arc::new(ThresholdState {
            threshold: self.threshold,
            table: KeyLockTable::default(),
            flush: pipeline.flush_queue(),
        });
        Ok(ThresholdAggregator {
            state,
            pipeline,
            destroyed: false,
        })
    }
}

struct ThresholdState {
    threshold: i64,
    table: KeyLockTable,
    flush: FlushQueue,
}

impl ThresholdState {
    fn increase(&self, key: &str, delta: i64) {
        if delta >= self.threshold {
            // large enough on its own, no need to touch the table
            self.flush.submit(FlushRecord::new(key, delta));
            return;
        }
        self.table.update(key, |total| {
            let next = total.map_or(delta, |pending| pending.saturating_add(delta));
            if next >= self.threshold {
                *total = None;
                // submitted under the key lock so batches for one key reach the store in order
                self.flush.submit(FlushRecord::new(key, next));
            } else {
                *total = Some(next);
            }
        });
    }

    fn decrease(&self, key: &str, delta: i64) {
        self.table.update(key, |total| {
            if let Some(pending) = *total {
                let next = pending.saturating_sub(delta);
                *total = (next > 0).then_some(next);
            }
        });
    }
}

/// Aggregator that flushes each key as soon as its pending total reaches a threshold.
///
/// Signals for one key are serialized by a lock owned by that key, so concurrent signals never
/// lose updates and unrelated keys never wait on each other. A single signal that reaches the
/// threshold by itself is flushed without touching the pending total of its key.
///
/// Decrements can't push a total below zero: a total that would reach zero or less is discarded,
/// and the next increment starts from scratch. Totals saturate at `i64::MAX` instead of wrapping.
///
/// # Example
/// ```
/// # use std::time::Duration;
/// # use hitcount::{CountAggregator, ThresholdAggregator};
/// # use hitcount_core::test_util::TestStore;
/// let store = TestStore::default();
/// let mut visits = ThresholdAggregator::builder(10).build(store.clone()).unwrap();
///
/// visits.increase("u1", 4).unwrap();
/// visits.increase("u1", 3).unwrap();
/// visits.increase("u1", 5).unwrap();
/// assert!(visits.settle(Duration::from_secs(5)));
/// futures::executor::block_on(visits.flush_async());
///
/// assert_eq!(store.totals_for("u1"), vec![12]);
/// assert_eq!(visits.pending("u1"), None);
/// # visits.destroy().unwrap();
/// ```
pub struct ThresholdAggregator<S: CountStore + Send + 'static> {
    state: Arc<ThresholdState>,
    pipeline: Pipeline<S>,
    destroyed: bool,
}

impl ThresholdAggregator<Box<dyn CountStore + Send>> {
    /// Create a [`ThresholdAggregatorBuilder`] for the given threshold
    ///
    /// The store type is picked by [`ThresholdAggregatorBuilder::build`].
    pub fn builder(threshold: i64) -> ThresholdAggregatorBuilder {
        ThresholdAggregatorBuilder::new(threshold)
    }
}

impl<S: CountStore + Send + 'static> ThresholdAggregator<S> {
    /// The count at which a key is flushed
    pub fn threshold(&self) -> i64 {
        self.state.threshold
    }

    /// The pending total of `key`, reflecting only the signals that have been applied so far.
    pub fn pending(&self, key: &str) -> Option<i64> {
        self.state.table.pending(key)
    }

    /// Number of keys with a pending total
    pub fn pending_len(&self) -> usize {
        self.state.table.len()
    }

    /// Block until every signal enqueued so far has been applied, or `timeout` elapses.
    ///
    /// Returns `false` on timeout. Flush records produced by those signals may still be queued for
    /// the store; await [`Self::flush_async`] afterwards to wait for them too.
    pub fn settle(&self, timeout: Duration) -> bool {
        self.pipeline.settle(timeout)
    }

    /// Wait until every flush record queued so far has been handed to the store.
    pub fn flush_async(&self) -> FlushWait {
        self.pipeline.flush_queue().flush_async()
    }

    /// Flush thread counters
    pub fn stats(&self) -> FlushStats {
        self.pipeline.stats()
    }
}

impl<S: CountStore + Send + 'static> CountAggregator for ThresholdAggregator<S> {
    fn increase(&self, key: &str, value: i64) -> Result<(), SignalError> {
        validate_signal(key, value)?;
        let state = Arc::clone(&self.state);
        let key = key.to_owned();
        self.pipeline
            .submit(Box::new(move || state.increase(&key, value)))
    }

    fn decrease(&self, key: &str, value: i64) -> Result<(), SignalError> {
        validate_signal(key, value)?;
        let state = Arc::clone(&self.state);
        let key = key.to_owned();
        self.pipeline
            .submit(Box::new(move || state.decrease(&key, value)))
    }

    fn destroy(&mut self) -> Result<(), DrainError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        tracing::info!(threshold = self.state.threshold, "shutting down threshold aggregator");
        self.pipeline.stop_intake();
        let mut store = self.pipeline.stop_flusher();
        drain_into(store.as_mut(), self.state.table.drain())
    }
}

impl<S: CountStore + Send + 'static> Drop for ThresholdAggregator<S> {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            tracing::error!(%err, "threshold aggregator dropped with totals that couldn't be stored");
        }
    }
}

#[cfg(test)]
mod tests {
    use hitcount_core::test_util::TestStore;

    use super::*;

    fn aggregator(threshold: i64, store: &TestStore) -> ThresholdAggregator<TestStore> {
        ThresholdAggregator::builder(threshold)
            .intake_workers(4)
            .thread_name("threshold-test")
            .build(store.clone())
            .unwrap()
    }

    fn settled<S: CountStore + Send + 'static>(aggregator: &ThresholdAggregator<S>) {
        assert!(aggregator.settle(Duration::from_secs(60)));
        futures::executor::block_on(aggregator.flush_async());
    }

    #[test]
    fn accumulates_until_threshold() {
        let store = TestStore::default();
        let aggregator = aggregator(10, &store);

        aggregator.increase("u1", 4).unwrap();
        settled(&aggregator);
        assert_eq!(aggregator.pending("u1"), Some(4));
        assert!(store.records().is_empty());

        aggregator.increase("u1", 3).unwrap();
        settled(&aggregator);
        assert_eq!(aggregator.pending("u1"), Some(7));
        assert!(store.records().is_empty());

        aggregator.increase("u1", 5).unwrap();
        settled(&aggregator);
        assert_eq!(aggregator.pending("u1"), None);
        assert_eq!(store.records(), vec![FlushRecord::new("u1", 12)]);
        assert_eq!(aggregator.pending_len(), 0);
    }

    #[test]
    fn large_signal_bypasses_table() {
        let store = TestStore::default();
        let aggregator = aggregator(10, &store);
        aggregator.increase("u1", 3).unwrap();
        settled(&aggregator);
        aggregator.increase("u1", 25).unwrap();
        settled(&aggregator);
        assert_eq!(store.totals_for("u1"), vec![25]);
        // the pending total is left alone
        assert_eq!(aggregator.pending("u1"), Some(3));
    }

    #[test]
    fn threshold_is_inclusive() {
        let store = TestStore::default();
        let aggregator = aggregator(10, &store);
        aggregator.increase("u1", 6).unwrap();
        settled(&aggregator);
        aggregator.increase("u1", 4).unwrap();
        settled(&aggregator);
        assert_eq!(store.totals_for("u1"), vec![10]);
        assert_eq!(aggregator.pending("u1"), None);
    }

    #[test]
    fn decrement_floors_at_zero() {
        let store = TestStore::default();
        let aggregator = aggregator(10, &store);
        aggregator.increase("k", 5).unwrap();
        settled(&aggregator);
        aggregator.decrease("k", 2).unwrap();
        settled(&aggregator);
        assert_eq!(aggregator.pending("k"), Some(3));

        aggregator.decrease("k", 7).unwrap();
        settled(&aggregator);
        assert_eq!(aggregator.pending("k"), None);
        assert_eq!(aggregator.pending_len(), 0);

        aggregator.increase("k", 3).unwrap();
        settled(&aggregator);
        assert_eq!(aggregator.pending("k"), Some(3));
        assert!(store.records().is_empty());
    }

    #[test]
    fn decrement_of_unseen_key_is_a_no_op() {
        let store = TestStore::default();
        let aggregator = aggregator(10, &store);
        aggregator.decrease("ghost", 4).unwrap();
        settled(&aggregator);
        assert_eq!(aggregator.pending("ghost"), None);
        assert_eq!(aggregator.pending_len(), 0);
    }

    #[test]
    fn rejects_invalid_threshold() {
        let err = ThresholdAggregator::builder(0)
            .build(TestStore::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BuildError::Config(ConfigError::NonPositiveThreshold(0))
        ));
    }

    #[test]
    fn huge_totals_saturate_and_flush() {
        let store = TestStore::default();
        let aggregator = aggregator(i64::MAX, &store);
        aggregator.increase("k", i64::MAX - 1).unwrap();
        settled(&aggregator);
        aggregator.increase("k", i64::MAX - 1).unwrap();
        settled(&aggregator);
        assert_eq!(store.totals_for("k"), vec![i64::MAX]);
        assert_eq!(aggregator.pending("k"), None);
        assert_eq!(aggregator.stats().records_stored, 1);
    }
}
