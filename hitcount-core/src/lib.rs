// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contracts shared by the `hitcount` aggregators.
//!
//! An aggregator accepts increment and decrement signals for string keys, keeps the running totals
//! in memory and eventually hands aggregated [`FlushRecord`]s to a [`CountStore`]. This crate holds
//! the traits and types on both sides of that exchange, so storage backends can be written without
//! depending on the aggregator implementations.

#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use crate::aggregator::{CountAggregator, DrainError, SignalError, validate_signal};
pub use crate::record::FlushRecord;
pub use crate::store::{CountStore, FnStore, StoreError, store_fn};
pub use crate::wait::FlushWait;

pub mod aggregator;
pub mod record;
pub mod store;
pub mod wait;

/// Recording [`CountStore`] for testing code that feeds an aggregator.
///
/// To enable this module, you must enable the `test-util` feature.
#[cfg(feature = "test-util")]
pub mod test_util;
