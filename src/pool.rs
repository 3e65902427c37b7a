// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sender::{Operation, Receiver, Scheduler, Sender};
use core::fmt;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Work = Box<dyn FnOnce() + Send>;

/// A fixed set of worker threads draining one shared queue.
///
/// [`scheduler`](Self::scheduler) hands out the [`PoolScheduler`] whose
/// `schedule()` sender completes on a worker thread. Dropping the pool stops
/// the workers after the queue has drained and joins them.
pub struct StaticThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    available: Condvar,
}

impl fmt::Debug for PoolShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.queue.lock().unwrap();
        f.debug_struct("PoolShared")
            .field("queued", &queue.items.len())
            .field("shutdown", &queue.shutdown)
            .finish()
    }
}

struct PoolQueue {
    items: VecDeque<Work>,
    shutdown: bool,
}

// === impl StaticThreadPool ===

impl StaticThreadPool {
    /// Starts a pool of `workers` threads.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero or a worker thread cannot be spawned.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "a thread pool needs at least one worker");

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                items: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let workers = (0..workers)
            .map(|index| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("kscope-pool-{index}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn pool worker thread")
            })
            .collect();

        Self { shared, workers }
    }

    pub fn scheduler(&self) -> PoolScheduler {
        PoolScheduler {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for StaticThreadPool {
    fn drop(&mut self) {
        self.shared.queue.lock().unwrap().shutdown = true;
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for StaticThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticThreadPool")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

fn worker_loop(shared: &PoolShared) {
    let mut queue = shared.queue.lock().unwrap();
    loop {
        if let Some(work) = queue.items.pop_front() {
            drop(queue);
            work();
            queue = shared.queue.lock().unwrap();
        } else if queue.shutdown {
            break;
        } else {
            queue = shared.available.wait(queue).unwrap();
        }
    }
}

/// Handle yielding senders that complete on the pool. Implements
/// [`Scheduler`].
#[derive(Clone)]
pub struct PoolScheduler {
    shared: Arc<PoolShared>,
}

// === impl PoolScheduler ===

impl Scheduler for PoolScheduler {
    type ScheduleSender = SchedulePool;

    fn schedule(&self) -> SchedulePool {
        SchedulePool {
            shared: self.shared.clone(),
        }
    }
}

impl fmt::Debug for PoolScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolScheduler").finish_non_exhaustive()
    }
}

/// Sender returned by [`PoolScheduler::schedule`].
///
/// Completes with `()` on a worker thread, or stopped if the receiver's stop
/// was requested by the time the work is dequeued, or stopped inline if the
/// pool has already shut down.
#[derive(Debug)]
pub struct SchedulePool {
    shared: Arc<PoolShared>,
}

pub struct SchedulePoolOp<R> {
    shared: Arc<PoolShared>,
    receiver: R,
}

// === impl SchedulePool ===

impl Sender for SchedulePool {
    type Item = ();

    type Op<R>
        = SchedulePoolOp<R>
    where
        R: Receiver<Item = ()>;

    fn connect<R>(self, receiver: R) -> SchedulePoolOp<R>
    where
        R: Receiver<Item = ()>,
    {
        SchedulePoolOp {
            shared: self.shared,
            receiver,
        }
    }
}

impl<R> Operation for SchedulePoolOp<R>
where
    R: Receiver<Item = ()>,
{
    fn start(self) {
        let Self { shared, receiver } = self;
        let stop = receiver.env().stop_token().clone();

        let mut queue = shared.queue.lock().unwrap();
        if queue.shutdown {
            drop(queue);
            receiver.set_stopped();
            return;
        }
        queue.items.push_back(Box::new(move || {
            if stop.stop_requested() {
                receiver.set_stopped();
            } else {
                receiver.set_value(());
            }
        }));
        drop(queue);
        shared.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::{sync_wait, then};
    use crate::env::Env;
    use crate::sender::CallbackReceiver;
    use crate::stop::StopSource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn completes_on_a_worker_thread() {
        let pool = StaticThreadPool::new(1);
        let main = thread::current().id();
        let worker =
            sync_wait(then(pool.scheduler().schedule(), |()| thread::current().id()))
                .unwrap()
                .unwrap();
        assert_ne!(main, worker);
    }

    #[test]
    fn drains_every_item() {
        let pool = StaticThreadPool::new(4);
        let scheduler = pool.scheduler();
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..100 {
            let counter = counter.clone();
            let tx = tx.clone();
            scheduler
                .schedule()
                .connect(CallbackReceiver::new(
                    Env::new(),
                    move |()| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tx.send(()).unwrap();
                    },
                    |error| panic!("schedule failed: {error}"),
                    || panic!("schedule stopped"),
                ))
                .start();
        }
        for _ in 0..100 {
            rx.recv().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn requested_stop_is_observed_at_dequeue() {
        let pool = StaticThreadPool::new(1);
        let source = StopSource::new();
        source.request_stop();

        let (tx, rx) = mpsc::channel();
        pool.scheduler()
            .schedule()
            .connect(CallbackReceiver::new(
                Env::new().with_stop_token(source.token()),
                |()| panic!("work must not run after stop"),
                |error| panic!("schedule failed: {error}"),
                move || tx.send(()).unwrap(),
            ))
            .start();
        rx.recv().unwrap();
    }
}
