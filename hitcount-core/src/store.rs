// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The storage side of an aggregator.

use std::{
    error::Error as StdError,
    fmt, io,
    sync::{Arc, Mutex, PoisonError},
};

/// Error returned by a [`CountStore`] that couldn't persist a total.
///
/// Aggregators never retry a failed record. A store that needs delivery guarantees has to retry
/// internally before returning this error.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct StoreError {
    #[source]
    source: Box<dyn StdError + Send + Sync + 'static>,
}

impl StoreError {
    /// Wrap an arbitrary error
    pub fn new(err: impl Into<Box<dyn StdError + Send + Sync + 'static>>) -> Self {
        Self { source: err.into() }
    }

    /// Create an error from a plain message
    pub fn msg(msg: impl fmt::Display) -> Self {
        Self::new(msg.to_string())
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::new(value)
    }
}

/// Persists aggregated totals.
///
/// Aggregators move their store onto a single flush thread, so a store is never called from two
/// threads at once and doesn't need its own locking. During shutdown the store is handed back to
/// the thread calling `destroy` for the final drain.
///
/// Calls may repeat a key with different totals. Each call is one aggregated batch.
pub trait CountStore {
    /// Persist `total` for `key`.
    fn store(&mut self, key: &str, total: i64) -> Result<(), StoreError>;
}

impl<S: CountStore + ?Sized> CountStore for Box<S> {
    fn store(&mut self, key: &str, total: i64) -> Result<(), StoreError> {
        (**self).store(key, total)
    }
}

/// Allows the caller to keep a handle on a store that is owned by an aggregator.
impl<S: CountStore> CountStore for Arc<Mutex<S>> {
    fn store(&mut self, key: &str, total: i64) -> Result<(), StoreError> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .store(key, total)
    }
}

/// A [`CountStore`] backed by a closure. See [`store_fn`].
pub struct FnStore<F>(F);

impl<F> fmt::Debug for FnStore<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FnStore").finish_non_exhaustive()
    }
}

impl<F> CountStore for FnStore<F>
where
    F: FnMut(&str, i64) -> Result<(), StoreError>,
{
    fn store(&mut self, key: &str, total: i64) -> Result<(), StoreError> {
        (self.0)(key, total)
    }
}

/// Use a closure as a [`CountStore`].
///
/// ```
/// # use hitcount_core::{CountStore, store_fn};
/// let mut seen = Vec::new();
/// let mut store = store_fn(|key: &str, total| {
///     seen.push((key.to_owned(), total));
///     Ok(())
/// });
/// store.store("home", 3).unwrap();
/// drop(store);
/// assert_eq!(seen, [("home".to_owned(), 3)]);
/// ```
pub fn store_fn<F>(f: F) -> FnStore<F>
where
    F: FnMut(&str, i64) -> Result<(), StoreError>,
{
    FnStore(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Last(Option<(String, i64)>);

    impl CountStore for Last {
        fn store(&mut self, key: &str, total: i64) -> Result<(), StoreError> {
            self.0 = Some((key.to_owned(), total));
            Ok(())
        }
    }

    #[test]
    fn shared_store_is_visible_to_caller() {
        let shared = Arc::new(Mutex::new(Last::default()));
        let mut handle = Arc::clone(&shared);
        handle.store("a", 4).unwrap();
        assert_eq!(shared.lock().unwrap().0, Some(("a".to_owned(), 4)));
    }

    #[test]
    fn boxed_store_forwards() {
        let mut boxed: Box<dyn CountStore> = Box::new(store_fn(|key: &str, _| {
            Err(StoreError::msg(format!("{key} is read only")))
        }));
        let err = boxed.store("a", 1).unwrap_err();
        assert_eq!(err.to_string(), "a is read only");
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn io_errors_convert() {
        let err: StoreError = io::Error::other("disk full").into();
        assert_eq!(err.to_string(), "disk full");
    }
}
