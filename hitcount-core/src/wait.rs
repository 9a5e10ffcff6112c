// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Waiting for queued flush records.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// This struct contains a future that can be used to wait for queued flush records to be stored
///
/// In synchronous code, you can use `futures::executor::block_on` to wait for this future to complete.
#[must_use = "future does nothing unless polled"]
pub struct FlushWait(Pin<Box<dyn Future<Output = ()> + Send + 'static>>);

impl Future for FlushWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

impl FlushWait {
    /// Return a FlushWait that is ready immediately
    pub fn ready() -> Self {
        Self(Box::pin(std::future::ready(())))
    }

    /// Create a FlushWait that returns when a future is ready
    pub fn from_future(f: impl Future<Output = ()> + Send + 'static) -> Self {
        Self(Box::pin(f))
    }
}

impl std::fmt::Debug for FlushWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushWait").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_resolves() {
        futures::executor::block_on(FlushWait::ready());
        futures::executor::block_on(FlushWait::from_future(async {}));
    }
}
