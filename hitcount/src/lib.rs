// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Write-behind hit counting.
//!
//! Callers signal `increase(key, n)` / `decrease(key, n)` without blocking. Signals are applied
//! to in-memory pending totals by a pool of intake workers, and aggregated totals are handed to a
//! [`CountStore`] from a single flush thread. Two policies decide when a total leaves memory:
//!
//! - [`ThresholdAggregator`] flushes a key as soon as its pending total reaches a threshold.
//! - [`TimingAggregator`] swaps out the whole table on a fixed interval and flushes all of it.
//!
//! Persistence is eventually consistent. [`CountAggregator::destroy`] drains everything that is
//! still pending from the calling thread before returning.
//!
//! ```
//! use std::time::Duration;
//! use hitcount::{CountAggregator, ThresholdAggregator};
//! use hitcount_core::store_fn;
//!
//! let mut visits = ThresholdAggregator::builder(10)
//!     .build(store_fn(|key: &str, total| {
//!         println!("{key} += {total}");
//!         Ok(())
//!     }))
//!     .unwrap();
//!
//! visits.increase("/index.html", 4).unwrap();
//! visits.increase("/index.html", 3).unwrap();
//! assert!(visits.settle(Duration::from_secs(5)));
//! assert_eq!(visits.pending("/index.html"), Some(7));
//! visits.destroy().unwrap();
//! ```

#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
mod flush;
mod intake;
mod lock_table;
mod pipeline;
pub(crate) mod rate_limit;
pub mod threshold;
pub mod timing;

pub use config::{AggregatorConfig, BuildError, ConfigError, FlushPolicy};
pub use flush::FlushStats;
pub use hitcount_core::{
    CountAggregator, CountStore, DrainError, FlushRecord, FlushWait, SignalError, StoreError,
};
pub use threshold::{ThresholdAggregator, ThresholdAggregatorBuilder};
pub use timing::{TimingAggregator, TimingAggregatorBuilder};
