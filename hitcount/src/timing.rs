// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Flush every pending total on a fixed interval.

use std::{
    io,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_utils::sync::{Parker, Unparker};
use hashbrown::HashMap;
use hitcount_core::{
    CountAggregator, CountStore, DrainError, FlushRecord, FlushWait, SignalError, validate_signal,
};

use crate::{
    config::{BuildError, ConfigError},
    flush::{FlushQueue, FlushStats},
    pipeline::{Pipeline, PipelineOptions, drain_into},
};

/// Builder for [`TimingAggregator`]
#[derive(Debug, Clone)]
pub struct TimingAggregatorBuilder {
    interval: Duration,
    options: PipelineOptions,
}

impl TimingAggregatorBuilder {
    /// Start building an aggregator that flushes every pending total each `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
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
    /// dropping them. Defaults to 30 seconds.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.options.shutdown_timeout = timeout;
        self
    }

    pub(crate) fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the settings and start the aggregator's threads, including the flush timer.
    ///
    /// The first scheduled flush happens one interval after this returns.
    pub fn build<S>(self, store: S) -> Result<TimingAggregator<S>, BuildError>
    where
        S: CountStore + Send + 'static,
    {
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval.into());
        }
        self.options.validate()?;
        let mut pipeline = Pipeline::start(&self.options, store).map_err(BuildError::Spawn)?;
        let state = Arc::new(TimingState {
            table: Mutex::default(),
            sweep: Mutex::default(),
            flush: pipeline.flush_queue(),
        });
        let timer = match FlushTimer::start(Arc::clone(&state), self.interval, &self.options.thread_name) {
            Ok(timer) => timer,
            Err(err) => {
                pipeline.stop_intake();
                pipeline.stop_flusher();
                return Err(BuildError::Spawn(err));
            }
        };
        Ok(TimingAggregator {
            state,
            pipeline,
            timer,
            interval: self.interval,
            destroyed: false,
        })
    }
}

struct TimingState {
    table: Mutex<HashMap<String, i64>>,
    // serializes sweeps so batches for one key reach the store in order
    sweep: Mutex<()>,
    flush: FlushQueue,
}

impl TimingState {
    fn table(&self) -> MutexGuard<'_, HashMap<String, i64>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, key: &str, delta: i64) {
        let mut table = self.table();
        match table.get_mut(key) {
            Some(total) => {
                *total = total.saturating_add(delta);
                if *total <= 0 {
                    table.remove(key);
                }
            }
            None if delta > 0 => {
                table.insert(key.to_owned(), delta);
            }
            None => {}
        }
    }

    /// Swap out the table and hand every total to the flush thread. Returns how many were handed over.
    fn sweep(&self) -> usize {
        let _sweep = self.sweep.lock().unwrap_or_else(PoisonError::into_inner);
        // the table lock is held only for the swap, signals keep landing in the fresh table
        let snapshot = std::mem::take(&mut *self.table());
        let count = snapshot.len();
        for (key, total) in snapshot {
            self.flush.submit(FlushRecord::new(key, total));
        }
        if count > 0 {
            tracing::debug!(count, "flushing pending totals");
        }
        count
    }

    fn take_all(&self) -> Vec<FlushRecord> {
        let _sweep = self.sweep.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *self.table())
            .into_iter()
            .map(FlushRecord::from)
            .collect()
    }
}

struct FlushTimer {
    stop: Arc<AtomicBool>,
    unparker: Unparker,
    handle: Option<thread::JoinHandle<()>>,
}

impl FlushTimer {
    fn start(state: Arc<TimingState>, interval: Duration, thread_name: &str) -> io::Result<Self> {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("{thread_name}-timer"))
            .spawn(move || run_timer(&state, interval, &parker, &thread_stop))?;
        Ok(Self {
            stop,
            unparker,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        self.unparker.unpark();
        if handle.join().is_err() {
            tracing::error!("flush timer panicked");
        }
    }
}

fn run_timer(state: &TimingState, interval: Duration, parker: &Parker, stop: &AtomicBool) {
    let mut next = Instant::now() + interval;
    loop {
        parker.park_deadline(next);
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now < next {
            // spurious wakeup
            continue;
        }
        state.sweep();
        next += interval;
        if next <= now {
            // fell behind, skip the missed ticks
            next = now + interval;
        }
    }
}

/// Aggregator that flushes every pending total on a fixed interval.
///
/// Signals from any key are applied under one table lock, which is held only for a single update or
/// for the swap that starts a flush. A flush takes the whole table at once and leaves an empty one
/// in its place, so signals arriving during a flush accumulate for the next one and every applied
/// signal ends up in exactly one flushed total.
///
/// A total that decrements bring to zero or below is removed from the table and isn't flushed.
/// Totals saturate at `i64::MAX` instead of wrapping.
///
/// # Example
/// ```
/// # use std::time::Duration;
/// # use hitcount::{CountAggregator, TimingAggregator};
/// # use hitcount_core::test_util::TestStore;
/// let store = TestStore::default();
/// let mut visits = TimingAggregator::builder(Duration::from_secs(3600))
///     .build(store.clone())
///     .unwrap();
///
/// visits.increase("a", 2).unwrap();
/// visits.increase("b", 1).unwrap();
/// visits.increase("a", 3).unwrap();
/// assert!(visits.settle(Duration::from_secs(5)));
/// assert_eq!(visits.flush_now(), 2);
/// futures::executor::block_on(visits.flush_async());
///
/// assert_eq!(store.totals_for("a"), vec![5]);
/// assert_eq!(store.totals_for("b"), vec![1]);
/// # visits.destroy().unwrap();
/// ```
pub struct TimingAggregator<S: CountStore + Send + 'static> {
    state: Arc<TimingState>,
    pipeline: Pipeline<S>,
    timer: FlushTimer,
    interval: Duration,
    destroyed: bool,
}

impl TimingAggregator<Box<dyn CountStore + Send>> {
    /// Create a [`TimingAggregatorBuilder`] for the given flush interval
    ///
    /// The store type is picked by [`TimingAggregatorBuilder::build`].
    pub fn builder(interval: Duration) -> TimingAggregatorBuilder {
        TimingAggregatorBuilder::new(interval)
    }
}

impl<S: CountStore + Send + 'static> TimingAggregator<S> {
    /// Time between scheduled flushes
    pub fn flush_interval(&self) -> Duration {
        self.interval
    }

    /// The pending total of `key`, reflecting only the signals that have been applied so far.
    pub fn pending(&self, key: &str) -> Option<i64> {
        self.state.table().get(key).copied()
    }

    /// Number of keys with a pending total
    pub fn pending_len(&self) -> usize {
        self.state.table().len()
    }

    /// Flush the table now instead of waiting for the timer. Returns the number of totals flushed.
    ///
    /// The timer keeps its schedule.
    pub fn flush_now(&self) -> usize {
        self.state.sweep()
    }

    /// Block until every signal enqueued so far has been applied, or `timeout` elapses.
    ///
    /// Returns `false` on timeout.
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

impl<S: CountStore + Send + 'static> CountAggregator for TimingAggregator<S> {
    fn increase(&self, key: &str, value: i64) -> Result<(), SignalError> {
        validate_signal(key, value)?;
        let state = Arc::clone(&self.state);
        let key = key.to_owned();
        self.pipeline
            .submit(Box::new(move || state.apply(&key, value)))
    }

    fn decrease(&self, key: &str, value: i64) -> Result<(), SignalError> {
        validate_signal(key, value)?;
        let state = Arc::clone(&self.state);
        let key = key.to_owned();
        self.pipeline
            .submit(Box::new(move || state.apply(&key, -value)))
    }

    fn destroy(&mut self) -> Result<(), DrainError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        tracing::info!(interval = ?self.interval, "shutting down timing aggregator");
        self.pipeline.stop_intake();
        self.timer.stop();
        let mut store = self.pipeline.stop_flusher();
        drain_into(store.as_mut(), self.state.take_all())
    }
}

impl<S: CountStore + Send + 'static> Drop for TimingAggregator<S> {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            tracing::error!(%err, "timing aggregator dropped with totals that couldn't be stored");
        }
    }
}

#[cfg(test)]
mod tests {
    use hitcount_core::test_util::TestStore;

    use super::*;

    const NEVER: Duration = Duration::from_secs(3600);

    fn aggregator(interval: Duration, store: &TestStore) -> TimingAggregator<TestStore> {
        TimingAggregator::builder(interval)
            .intake_workers(4)
            .thread_name("timing-test")
            .build(store.clone())
            .unwrap()
    }

    #[test]
    fn flush_now_empties_the_table() {
        let store = TestStore::default();
        let aggregator = aggregator(NEVER, &store);
        aggregator.increase("a", 2).unwrap();
        aggregator.increase("b", 1).unwrap();
        aggregator.increase("a", 3).unwrap();
        assert!(aggregator.settle(Duration::from_secs(60)));
        assert_eq!(aggregator.pending("a"), Some(5));

        assert_eq!(aggregator.flush_now(), 2);
        futures::executor::block_on(aggregator.flush_async());
        assert_eq!(aggregator.pending_len(), 0);
        assert_eq!(store.totals_for("a"), vec![5]);
        assert_eq!(store.totals_for("b"), vec![1]);

        // nothing pending, nothing flushed
        assert_eq!(aggregator.flush_now(), 0);
    }

    #[test]
    fn decrement_removes_exhausted_total() {
        let store = TestStore::default();
        let aggregator = aggregator(NEVER, &store);
        aggregator.increase("k", 5).unwrap();
        assert!(aggregator.settle(Duration::from_secs(60)));
        aggregator.decrease("k", 2).unwrap();
        assert!(aggregator.settle(Duration::from_secs(60)));
        assert_eq!(aggregator.pending("k"), Some(3));
        aggregator.decrease("k", 7).unwrap();
        assert!(aggregator.settle(Duration::from_secs(60)));
        assert_eq!(aggregator.pending("k"), None);

        aggregator.decrease("ghost", 1).unwrap();
        assert!(aggregator.settle(Duration::from_secs(60)));
        assert_eq!(aggregator.pending_len(), 0);
        assert_eq!(aggregator.flush_now(), 0);
    }

    #[test]
    fn timer_flushes_on_its_own() {
        let store = TestStore::default();
        let aggregator = aggregator(Duration::from_millis(500), &store);
        aggregator.increase("a", 2).unwrap();
        aggregator.increase("a", 3).unwrap();
        assert!(aggregator.settle(Duration::from_secs(60)));
        assert!(store.wait_for_calls(1, Duration::from_secs(60)));
        assert_eq!(store.sums()["a"], 5);
    }

    #[test]
    fn rejects_zero_interval() {
        let err = TimingAggregator::builder(Duration::ZERO)
            .build(TestStore::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BuildError::Config(ConfigError::ZeroFlushInterval)
        ));
    }

    #[test]
    fn destroy_drains_and_stops_the_timer() {
        let store = TestStore::default();
        let mut aggregator = aggregator(NEVER, &store);
        aggregator.increase("a", 4).unwrap();
        aggregator.destroy().unwrap();
        assert_eq!(store.totals_for("a"), vec![4]);
        assert_eq!(aggregator.increase("a", 1), Err(SignalError::ShutDown));
        // second destroy has nothing left to do
        aggregator.destroy().unwrap();
        assert_eq!(store.calls(), 1);
    }

    #[test]
    fn huge_totals_saturate_instead_of_vanishing() {
        let store = TestStore::default();
        let mut aggregator = aggregator(NEVER, &store);
        aggregator.increase("k", i64::MAX).unwrap();
        assert!(aggregator.settle(Duration::from_secs(60)));
        aggregator.increase("k", 1).unwrap();
        assert!(aggregator.settle(Duration::from_secs(60)));
        assert_eq!(aggregator.pending("k"), Some(i64::MAX));

        aggregator.decrease("k", 1).unwrap();
        assert!(aggregator.settle(Duration::from_secs(60)));
        assert_eq!(aggregator.pending("k"), Some(i64::MAX - 1));
        aggregator.destroy().unwrap();
        assert_eq!(store.totals_for("k"), vec![i64::MAX - 1]);
    }
}
