// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker pool that applies signals off the caller's thread.

use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_queue::SegQueue;
use crossbeam_utils::sync::{Parker, Unparker};
use hitcount_core::SignalError;

use crate::rate_limit::rate_limited;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

// Upper bound on how long an idle worker sleeps before rechecking the queue by itself.
const IDLE_PARK: Duration = Duration::from_millis(100);

struct Accounting {
    // submitted but not yet finished (or discarded)
    outstanding: usize,
    accepting: bool,
}

struct Shared {
    queue: SegQueue<Task>,
    accounting: Mutex<Accounting>,
    idle: Condvar,
    // workers exit once the queue is empty
    stopping: AtomicBool,
    // workers drop remaining tasks without running them
    discarding: AtomicBool,
}

impl Shared {
    fn accounting(&self) -> MutexGuard<'_, Accounting> {
        self.accounting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_one(&self) {
        let mut accounting = self.accounting();
        accounting.outstanding -= 1;
        if accounting.outstanding == 0 {
            self.idle.notify_all();
        }
    }

    // Returns true if nothing is outstanding by the deadline.
    fn wait_idle_until(&self, deadline: Instant) -> bool {
        let mut accounting = self.accounting();
        while accounting.outstanding > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            accounting = self
                .idle
                .wait_timeout(accounting, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// Fixed set of threads draining an unbounded task queue.
///
/// Submitting never blocks beyond a short bookkeeping lock. Tasks run in no particular order
/// relative to each other; anything that needs ordering must get it from its own locking.
pub(crate) struct IntakePool {
    shared: Arc<Shared>,
    unparkers: Vec<Unparker>,
    next_worker: AtomicUsize,
    workers: Vec<thread::JoinHandle<()>>,
}

impl IntakePool {
    pub(crate) fn start(workers: usize, thread_name: &str) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: SegQueue::new(),
            accounting: Mutex::new(Accounting {
                outstanding: 0,
                accepting: true,
            }),
            idle: Condvar::new(),
            stopping: AtomicBool::new(false),
            discarding: AtomicBool::new(false),
        });

        let mut pool = IntakePool {
            shared,
            unparkers: Vec::with_capacity(workers),
            next_worker: AtomicUsize::new(0),
            workers: Vec::with_capacity(workers),
        };
        for index in 0..workers {
            let parker = Parker::new();
            let unparker = parker.unparker().clone();
            let shared = Arc::clone(&pool.shared);
            let spawned = thread::Builder::new()
                .name(format!("{thread_name}-intake-{index}"))
                .spawn(move || run_worker(&shared, &parker));
            match spawned {
                Ok(handle) => {
                    pool.unparkers.push(unparker);
                    pool.workers.push(handle);
                }
                Err(err) => {
                    // stop the workers that did start before reporting
                    pool.shut_down(Duration::ZERO);
                    return Err(err);
                }
            }
        }
        tracing::debug!(workers, "intake pool started");
        Ok(pool)
    }

    /// Enqueue `task`. Fails only once the pool has started shutting down.
    pub(crate) fn submit(&self, task: Task) -> Result<(), SignalError> {
        {
            let mut accounting = self.shared.accounting();
            if !accounting.accepting {
                return Err(SignalError::ShutDown);
            }
            accounting.outstanding += 1;
        }
        self.shared.queue.push(task);
        // Wake workers round-robin. A busy worker drains the queue before parking, so a task is
        // never stranded behind a worker that didn't get the wakeup.
        if !self.unparkers.is_empty() {
            let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.unparkers.len();
            self.unparkers[index].unpark();
        }
        Ok(())
    }

    /// Block until every task submitted so far has run, or `timeout` elapses.
    pub(crate) fn settle(&self, timeout: Duration) -> bool {
        self.shared.wait_idle_until(Instant::now() + timeout)
    }

    /// Stop accepting tasks and let the queued ones finish. Tasks still queued after `grace` are
    /// discarded. Returns whether the queue drained within the grace period.
    pub(crate) fn shut_down(&mut self, grace: Duration) -> bool {
        self.shared.accounting().accepting = false;
        let drained = self.shared.wait_idle_until(Instant::now() + grace);
        if !drained {
            tracing::warn!(
                ?grace,
                "intake queue did not drain within the shutdown grace period, discarding remaining signals"
            );
            self.shared.discarding.store(true, Ordering::SeqCst);
        }
        self.shared.stopping.store(true, Ordering::SeqCst);
        for unparker in &self.unparkers {
            unparker.unpark();
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("intake worker panicked outside of a task");
            }
        }
        tracing::debug!(drained, "intake pool shut down");
        drained
    }
}

fn run_worker(shared: &Shared, parker: &Parker) {
    loop {
        while let Some(task) = shared.queue.pop() {
            if !shared.discarding.load(Ordering::Relaxed) {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    let payload = panic_message(&*panic);
                    rate_limited!(
                        Duration::from_secs(1),
                        tracing::error!(payload, "signal task panicked")
                    );
                }
            }
            shared.finish_one();
        }
        if shared.stopping.load(Ordering::SeqCst) {
            return;
        }
        parker.park_timeout(IDLE_PARK);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
