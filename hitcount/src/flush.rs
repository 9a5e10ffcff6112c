// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Single-threaded executor that owns the store.

use std::{
    io,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
        mpsc::{Receiver, Sender, channel},
    },
    thread,
    time::{Duration, Instant},
};

use hitcount_core::{CountStore, FlushRecord, FlushWait};

use crate::rate_limit::rate_limited;

enum FlushMessage {
    Record(FlushRecord),
    // drop the sender to signal that everything queued before it has been handled
    Wait(tokio::sync::oneshot::Sender<()>),
    Shutdown,
}

/// Counters kept by the flush thread.
///
/// Obtained from `stats()` on either aggregator. The values are read individually, so a snapshot
/// taken while the flush thread is busy may be off by the record in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Records the store accepted
    pub records_stored: u64,
    /// Records the store returned an error for. These are not retried.
    pub store_errors: u64,
    /// Records dropped without calling the store because shutdown ran out of time
    pub records_dropped: u64,
}

#[derive(Default)]
struct Counters {
    stored: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> FlushStats {
        FlushStats {
            records_stored: self.stored.load(Ordering::Relaxed),
            store_errors: self.errors.load(Ordering::Relaxed),
            records_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Cheap, cloneable handle for submitting records to the flush thread.
#[derive(Clone)]
pub(crate) struct FlushQueue {
    sender: Sender<FlushMessage>,
}

impl FlushQueue {
    pub(crate) fn submit(&self, record: FlushRecord) {
        if let Err(err) = self.sender.send(FlushMessage::Record(record)) {
            let FlushMessage::Record(record) = err.0 else {
                return;
            };
            rate_limited!(
                Duration::from_secs(1),
                tracing::error!(%record, "flush thread is gone, dropping record")
            );
        }
    }

    /// Resolves once every record submitted before this call has been handed to the store.
    pub(crate) fn flush_async(&self) -> FlushWait {
        let (channel, receiver) = tokio::sync::oneshot::channel();
        // if the flush thread is gone, the sender is dropped with the message and the wait resolves
        self.sender.send(FlushMessage::Wait(channel)).ok();
        FlushWait::from_future(async move {
            let _ = receiver.await;
        })
    }
}

/// Owns the flush thread. Joining it hands the store back.
pub(crate) struct FlushExecutor<S> {
    queue: FlushQueue,
    counters: Arc<Counters>,
    deadline: Arc<OnceLock<Instant>>,
    handle: Option<thread::JoinHandle<S>>,
}

impl<S: CountStore + Send + 'static> FlushExecutor<S> {
    pub(crate) fn start(store: S, thread_name: &str) -> io::Result<Self> {
        let (sender, receiver) = channel();
        let counters = Arc::new(Counters::default());
        let deadline = Arc::new(OnceLock::new());
        let worker = FlushWorker {
            store,
            counters: Arc::clone(&counters),
            deadline: Arc::clone(&deadline),
        };
        let handle = thread::Builder::new()
            .name(format!("{thread_name}-flush"))
            .spawn(move || worker.run(receiver))?;
        Ok(Self {
            queue: FlushQueue { sender },
            counters,
            deadline,
            handle: Some(handle),
        })
    }

    pub(crate) fn queue(&self) -> FlushQueue {
        self.queue.clone()
    }

    pub(crate) fn stats(&self) -> FlushStats {
        self.counters.snapshot()
    }

    /// Finish the queued records, giving up on whatever is left after `grace`, and return the store.
    ///
    /// Returns `None` if the flush thread panicked (the store panicked inside `store`).
    pub(crate) fn shut_down(&mut self, grace: Duration) -> Option<S> {
        let handle = self.handle.take()?;
        let _ = self.deadline.set(Instant::now() + grace);
        self.queue.sender.send(FlushMessage::Shutdown).ok();
        tracing::debug!("awaiting flush thread shutdown");
        match handle.join() {
            Ok(store) => Some(store),
            Err(_) => {
                tracing::error!("flush thread panicked, remaining totals can't be stored");
                None
            }
        }
    }
}

struct FlushWorker<S> {
    store: S,
    counters: Arc<Counters>,
    deadline: Arc<OnceLock<Instant>>,
}

impl<S: CountStore> FlushWorker<S> {
    fn run(mut self, receiver: Receiver<FlushMessage>) -> S {
        let span = tracing::span!(tracing::Level::TRACE, "hitcount flush thread");
        let _enter = span.enter();
        while let Ok(message) = receiver.recv() {
            match message {
                FlushMessage::Record(record) => self.consume(record),
                FlushMessage::Wait(signal) => drop(signal),
                FlushMessage::Shutdown => break,
            }
        }
        let dropped = self.counters.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            tracing::warn!(dropped, "flush thread hit the shutdown deadline, records were dropped");
        }
        self.store
    }

    fn consume(&mut self, record: FlushRecord) {
        if self.deadline.get().is_some_and(|deadline| Instant::now() >= *deadline) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.store.store(record.key(), record.total()) {
            Ok(()) => {
                self.counters.stored.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%record, "stored flush record");
            }
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                rate_limited!(
                    Duration::from_secs(1),
                    tracing::error!(%err, %record, "couldn't store flush record, total is lost")
                );
            }
        }
    }
}
