// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crate::{CountStore, FlushRecord, StoreError};

#[derive(Debug, Default)]
struct Recorded {
    records: Vec<FlushRecord>,
    failing_keys: HashSet<String>,
    failures: usize,
    delay: Option<Duration>,
}

/// In-memory [`CountStore`] that records every call.
///
/// Cloning gives another handle to the same recording, so a clone can be moved into an aggregator
/// while the test keeps inspecting the original.
///
/// # Example
/// ```
/// # use hitcount_core::{CountStore, test_util::TestStore};
/// let store = TestStore::default();
/// let mut handle = store.clone();
/// handle.store("home", 3).unwrap();
/// assert_eq!(store.totals_for("home"), vec![3]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TestStore {
    inner: Arc<Mutex<Recorded>>,
    in_call: Arc<AtomicUsize>,
    overlapped: Arc<AtomicBool>,
}

impl TestStore {
    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every future `store` call for `key` fail
    pub fn fail_key(&self, key: impl Into<String>) {
        self.lock().failing_keys.insert(key.into());
    }

    /// Sleep for `delay` inside every `store` call, to simulate slow storage
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    /// Every successfully stored record, in call order
    pub fn records(&self) -> Vec<FlushRecord> {
        self.lock().records.clone()
    }

    /// Successfully stored totals for one key, in call order
    pub fn totals_for(&self, key: &str) -> Vec<i64> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.key() == key)
            .map(FlushRecord::total)
            .collect()
    }

    /// Sum of every stored total, per key
    pub fn sums(&self) -> BTreeMap<String, i64> {
        let mut sums = BTreeMap::new();
        for record in &self.lock().records {
            *sums.entry(record.key().to_owned()).or_default() += record.total();
        }
        sums
    }

    /// Number of `store` calls that returned an error
    pub fn failures(&self) -> usize {
        self.lock().failures
    }

    /// Number of `store` calls, successful or not
    pub fn calls(&self) -> usize {
        let inner = self.lock();
        inner.records.len() + inner.failures
    }

    /// Whether two `store` calls ever ran at the same time
    pub fn saw_overlapping_calls(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    /// Poll until at least `calls` store calls happened. Returns false on timeout.
    pub fn wait_for_calls(&self, calls: usize, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.calls() >= calls {
                return true;
            }
            if start.elapsed() > timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl CountStore for TestStore {
    fn store(&mut self, key: &str, total: i64) -> Result<(), StoreError> {
        if self.in_call.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let result = {
            let mut inner = self.lock();
            if inner.failing_keys.contains(key) {
                inner.failures += 1;
                Err(StoreError::msg(format!("refusing to store {key}")))
            } else {
                inner.records.push(FlushRecord::new(key, total));
                Ok(())
            }
        };
        self.in_call.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
