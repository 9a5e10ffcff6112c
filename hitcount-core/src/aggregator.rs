// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The application side of an aggregator.

use std::fmt;

use crate::{FlushRecord, StoreError};

/// Errors returned synchronously when a signal can't be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// Keys must be non-empty.
    #[error("signal key must not be empty")]
    EmptyKey,
    /// Increments and decrements carry a positive magnitude.
    #[error("signal value must be positive, got {0}")]
    NonPositiveValue(i64),
    /// The aggregator has been destroyed.
    #[error("aggregator has been shut down")]
    ShutDown,
}

/// Check the arguments of an `increase`/`decrease` call before anything is enqueued.
pub fn validate_signal(key: &str, value: i64) -> Result<(), SignalError> {
    if key.is_empty() {
        return Err(SignalError::EmptyKey);
    }
    if value <= 0 {
        return Err(SignalError::NonPositiveValue(value));
    }
    Ok(())
}

/// Returned by [`CountAggregator::destroy`] when the final drain couldn't store everything.
///
/// Every pending total is attempted even after a failure, so `failures` lists each record that was
/// lost.
#[derive(Debug)]
pub struct DrainError {
    attempted: usize,
    failures: Vec<(FlushRecord, StoreError)>,
}

impl DrainError {
    /// Create a drain error. `attempted` counts all records the drain tried to store.
    pub fn new(attempted: usize, failures: Vec<(FlushRecord, StoreError)>) -> Self {
        Self {
            attempted,
            failures,
        }
    }

    /// Number of records the drain tried to store
    pub fn attempted(&self) -> usize {
        self.attempted
    }

    /// Records that couldn't be stored, with the store's error
    pub fn failures(&self) -> &[(FlushRecord, StoreError)] {
        &self.failures
    }

    /// Consume the error, returning the failed records
    pub fn into_failures(self) -> Vec<(FlushRecord, StoreError)> {
        self.failures
    }
}

impl fmt::Display for DrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to store {} of {} pending totals while draining",
            self.failures.len(),
            self.attempted
        )?;
        if let Some((record, err)) = self.failures.first() {
            write!(f, " (first: {record}: {err})")?;
        }
        Ok(())
    }
}

impl std::error::Error for DrainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|(_, err)| err as &(dyn std::error::Error + 'static))
    }
}

/// Accepts counting signals and eventually persists aggregated totals.
///
/// `increase` and `decrease` are fire-and-forget: `Ok(())` means the signal was *enqueued*, not that
/// it has been applied or stored. The only way to observe a signal is through the totals that
/// eventually reach the store.
pub trait CountAggregator: Send + Sync {
    /// Add `value` to the pending total of `key`.
    fn increase(&self, key: &str, value: i64) -> Result<(), SignalError>;

    /// Subtract `value` from the pending total of `key`. A total that reaches zero or below is
    /// discarded rather than carried as a negative balance.
    fn decrease(&self, key: &str, value: i64) -> Result<(), SignalError>;

    /// Stop accepting signals, finish queued work and store every remaining pending total from the
    /// calling thread.
    ///
    /// Calling `destroy` again after it returned is a no-op.
    fn destroy(&mut self) -> Result<(), DrainError>;
}

impl<A: CountAggregator + ?Sized> CountAggregator for Box<A> {
    fn increase(&self, key: &str, value: i64) -> Result<(), SignalError> {
        (**self).increase(key, value)
    }

    fn decrease(&self, key: &str, value: i64) -> Result<(), SignalError> {
        (**self).decrease(key, value)
    }

    fn destroy(&mut self) -> Result<(), DrainError> {
        (**self).destroy()
    }
}
