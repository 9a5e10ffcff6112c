// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::OnceLock,
    time::{Duration, Instant},
};

#[doc(hidden)]
pub(crate) fn elapsed_since_first_use() -> Duration {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed()
}

/// Run `$call` only if this call site hasn't run it within the last `$interval`.
///
/// Every expansion owns one static, shared by all threads. The flush and intake threads wrap their
/// error logs in it: an unreachable store fails each record in turn, and one line per interval is
/// enough to show the outage is still going on. Intervals are tracked in whole seconds.
macro_rules! rate_limited {
    ($interval:expr, $call:expr) => {{
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT_ALLOWED_SECS: AtomicU64 = AtomicU64::new(0);
        let interval: std::time::Duration = $interval;
        debug_assert!(
            interval >= std::time::Duration::from_secs(1),
            "sub-second intervals round down to zero"
        );

        let now = $crate::rate_limit::elapsed_since_first_use();
        let allowed = NEXT_ALLOWED_SECS.load(Ordering::Relaxed);
        if allowed <= now.as_secs() {
            let next = now.saturating_add(interval).as_secs();
            if NEXT_ALLOWED_SECS
                .compare_exchange(allowed, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                $call;
            }
        }
    }};
}
pub(crate) use rate_limited;
