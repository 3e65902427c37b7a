// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A time scheduler built as an async resource, proving the protocol
//! generalizes beyond scopes.
//!
//! [`TimeResource`] owns a background thread driving a queue ordered by
//! `(deadline, sequence number)`; the sequence number is a monotonic counter
//! so equal-deadline entries complete in insertion order. Its token yields
//! [`schedule_at`]/[`schedule_after`] senders completing with the requested
//! and observed time points.
//!
//! Phases are the reduced subset `Constructed → Running → Closing → Closed`:
//! open parks until the thread observes `Running`, close wakes the thread
//! and completes once the queue has drained, and run completes last, with
//! the thread detached so the OS may still be tearing it down.
//!
//! [`schedule_at`]: TimeToken::schedule_at
//! [`schedule_after`]: TimeToken::schedule_after

mod queue;

use crate::resource::{Resource, ResourceToken};
use crate::sender::{Operation, Receiver, Sender};
use core::fmt;
use core::time::Duration;
use queue::{EntryKey, TimerEntry, TimerFire};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

/// Ready entries completed per wakeup with the lock released; bounding the
/// batch keeps insertions from starving while a burst drains.
const BATCH: usize = 10;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum TimerPhase {
    Constructed,
    Running,
    Closing,
    Closed,
}

type Waiter = Box<dyn FnOnce() + Send>;

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

impl fmt::Debug for TimerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("TimerShared")
            .field("phase", &state.phase)
            .field("pending", &state.queue.len())
            .finish_non_exhaustive()
    }
}

struct TimerState {
    phase: TimerPhase,
    run_started: bool,
    next_seq: u64,
    queue: queue::TimerQueue,
    open_waiter: Option<Box<dyn FnOnce(TimeToken) + Send>>,
    close_waiter: Option<Waiter>,
    run_waiter: Option<Waiter>,
}

/// A timed-queue resource. Implements [`Resource`].
pub struct TimeResource {
    shared: Arc<TimerShared>,
}

// === impl TimeResource ===

impl TimeResource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState {
                    phase: TimerPhase::Constructed,
                    run_started: false,
                    next_seq: 0,
                    queue: queue::TimerQueue::new(),
                    open_waiter: None,
                    close_waiter: None,
                    run_waiter: None,
                }),
                wake: Condvar::new(),
            }),
        }
    }
}

impl Default for TimeResource {
    fn default() -> Self {
        Self::new()
    }
}

impl Resource for TimeResource {
    type Token = TimeToken;
    type OpenSender = OpenTimer;
    type RunSender = RunTimer;

    fn open(&self) -> OpenTimer {
        OpenTimer {
            shared: self.shared.clone(),
        }
    }

    fn run(&self) -> RunTimer {
        RunTimer {
            shared: self.shared.clone(),
        }
    }
}

impl fmt::Debug for TimeResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("TimeResource")
            .field("phase", &state.phase)
            .field("pending", &state.queue.len())
            .finish_non_exhaustive()
    }
}

/// Operations on an open [`TimeResource`].
pub trait TimeScheduler: ResourceToken {
    type ScheduleAt: Sender<Item = (Instant, Instant)>;
    type ScheduleAfter: Sender<Item = (Instant, Instant)>;

    fn now(&self) -> Instant;

    /// Completes on the timer thread once `at` has passed, delivering the
    /// requested and observed time points.
    fn schedule_at(&self, at: Instant) -> Self::ScheduleAt;

    /// Completes on the timer thread once `delay` has elapsed, measured
    /// from the operation's start.
    fn schedule_after(&self, delay: Duration) -> Self::ScheduleAfter;
}

/// Token obtained by opening a [`TimeResource`].
#[derive(Clone)]
pub struct TimeToken {
    shared: Arc<TimerShared>,
}

// === impl TimeToken ===

impl TimeToken {
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    pub fn schedule_at(&self, at: Instant) -> ScheduleAt {
        ScheduleAt {
            shared: self.shared.clone(),
            at,
        }
    }

    pub fn schedule_after(&self, delay: Duration) -> ScheduleAfter {
        ScheduleAfter {
            shared: self.shared.clone(),
            delay,
        }
    }
}

impl ResourceToken for TimeToken {
    type CloseSender = CloseTimer;

    fn close(&self) -> CloseTimer {
        CloseTimer {
            shared: self.shared.clone(),
        }
    }
}

impl TimeScheduler for TimeToken {
    type ScheduleAt = ScheduleAt;
    type ScheduleAfter = ScheduleAfter;

    fn now(&self) -> Instant {
        TimeToken::now(self)
    }

    fn schedule_at(&self, at: Instant) -> ScheduleAt {
        TimeToken::schedule_at(self, at)
    }

    fn schedule_after(&self, delay: Duration) -> ScheduleAfter {
        TimeToken::schedule_after(self, delay)
    }
}

impl fmt::Debug for TimeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeToken").finish_non_exhaustive()
    }
}

/// Inserts a timer entry for `at` and wires its receiver up, including stop
/// cancellation.
fn start_entry<R>(shared: Arc<TimerShared>, at: Instant, receiver: R)
where
    R: Receiver<Item = (Instant, Instant)>,
{
    let stop = receiver.env().stop_token().clone();

    let key = {
        let mut state = shared.state.lock().unwrap();
        assert!(
            state.phase != TimerPhase::Closed,
            "work scheduled on a closed time resource"
        );
        let key = EntryKey {
            at,
            seq: state.next_seq,
        };
        state.next_seq += 1;
        state.queue.insert(
            key,
            TimerEntry::new(move |fire| match fire {
                TimerFire::At(now) => receiver.set_value((at, now)),
                TimerFire::Cancelled => receiver.set_stopped(),
            }),
        );
        tracing::trace!(?key, "timer entry registered");
        key
    };
    shared.wake.notify_all();

    // Register cancellation only after the entry is in the queue, so a stop
    // that has already been requested finds something to remove.
    let registration = stop.on_stop({
        let shared = shared.clone();
        move || {
            let entry = shared.state.lock().unwrap().queue.remove(&key);
            if let Some(entry) = entry {
                tracing::trace!(?key, "timer entry cancelled");
                shared.wake.notify_all();
                entry.fire(TimerFire::Cancelled);
            }
        }
    });
    let mut state = shared.state.lock().unwrap();
    if let Some(entry) = state.queue.get_mut(&key) {
        entry.attach_registration(registration);
    }
    // a missing entry already fired or cancelled; dropping the registration
    // deregisters the callback
}

/// Sender returned by [`TimeToken::schedule_at`].
#[derive(Debug)]
pub struct ScheduleAt {
    shared: Arc<TimerShared>,
    at: Instant,
}

pub struct ScheduleAtOp<R> {
    shared: Arc<TimerShared>,
    at: Instant,
    receiver: R,
}

// === impl ScheduleAt ===

impl Sender for ScheduleAt {
    type Item = (Instant, Instant);

    type Op<R>
        = ScheduleAtOp<R>
    where
        R: Receiver<Item = (Instant, Instant)>;

    fn connect<R>(self, receiver: R) -> ScheduleAtOp<R>
    where
        R: Receiver<Item = (Instant, Instant)>,
    {
        ScheduleAtOp {
            shared: self.shared,
            at: self.at,
            receiver,
        }
    }
}

impl<R> Operation for ScheduleAtOp<R>
where
    R: Receiver<Item = (Instant, Instant)>,
{
    fn start(self) {
        start_entry(self.shared, self.at, self.receiver);
    }
}

/// Sender returned by [`TimeToken::schedule_after`].
#[derive(Debug)]
pub struct ScheduleAfter {
    shared: Arc<TimerShared>,
    delay: Duration,
}

pub struct ScheduleAfterOp<R> {
    shared: Arc<TimerShared>,
    delay: Duration,
    receiver: R,
}

// === impl ScheduleAfter ===

impl Sender for ScheduleAfter {
    type Item = (Instant, Instant);

    type Op<R>
        = ScheduleAfterOp<R>
    where
        R: Receiver<Item = (Instant, Instant)>;

    fn connect<R>(self, receiver: R) -> ScheduleAfterOp<R>
    where
        R: Receiver<Item = (Instant, Instant)>,
    {
        ScheduleAfterOp {
            shared: self.shared,
            delay: self.delay,
            receiver,
        }
    }
}

impl<R> Operation for ScheduleAfterOp<R>
where
    R: Receiver<Item = (Instant, Instant)>,
{
    fn start(self) {
        // the deadline is measured from start, not from connect
        let at = Instant::now() + self.delay;
        start_entry(self.shared, at, self.receiver);
    }
}

/// Sender returned by [`TimeResource::open`].
#[derive(Debug)]
pub struct OpenTimer {
    shared: Arc<TimerShared>,
}

pub struct OpenTimerOp<R> {
    shared: Arc<TimerShared>,
    receiver: R,
}

// === impl OpenTimer ===

impl Sender for OpenTimer {
    type Item = TimeToken;

    type Op<R>
        = OpenTimerOp<R>
    where
        R: Receiver<Item = TimeToken>;

    fn connect<R>(self, receiver: R) -> OpenTimerOp<R>
    where
        R: Receiver<Item = TimeToken>,
    {
        OpenTimerOp {
            shared: self.shared,
            receiver,
        }
    }
}

impl<R> Operation for OpenTimerOp<R>
where
    R: Receiver<Item = TimeToken>,
{
    fn start(self) {
        let Self { shared, receiver } = self;
        let mut state = shared.state.lock().unwrap();
        match state.phase {
            TimerPhase::Constructed => {
                assert!(
                    state.open_waiter.is_none(),
                    "open already started on this time resource"
                );
                state.open_waiter = Some(Box::new(move |token| receiver.set_value(token)));
                if state.run_started {
                    state.phase = TimerPhase::Running;
                    drop(state);
                    shared.wake.notify_all();
                }
            }
            phase => panic!("open started on a time resource in the {phase:?} phase"),
        }
    }
}

/// Sender returned by [`TimeResource::run`].
#[derive(Debug)]
pub struct RunTimer {
    shared: Arc<TimerShared>,
}

pub struct RunTimerOp<R> {
    shared: Arc<TimerShared>,
    receiver: R,
}

// === impl RunTimer ===

impl Sender for RunTimer {
    type Item = ();

    type Op<R>
        = RunTimerOp<R>
    where
        R: Receiver<Item = ()>;

    fn connect<R>(self, receiver: R) -> RunTimerOp<R>
    where
        R: Receiver<Item = ()>,
    {
        RunTimerOp {
            shared: self.shared,
            receiver,
        }
    }
}

impl<R> Operation for RunTimerOp<R>
where
    R: Receiver<Item = ()>,
{
    fn start(self) {
        let Self { shared, receiver } = self;
        {
            let mut state = shared.state.lock().unwrap();
            assert!(
                !state.run_started,
                "run already started on this time resource"
            );
            state.run_started = true;
            state.run_waiter = Some(Box::new(move || receiver.set_value(())));
            if state.open_waiter.is_some() {
                state.phase = TimerPhase::Running;
            }
        }

        let loop_shared = shared.clone();
        thread::Builder::new()
            .name("kscope-timer".into())
            .spawn(move || timer_loop(&loop_shared))
            .expect("failed to spawn timer thread");
        // the JoinHandle is dropped: the thread detaches itself so run can
        // complete while the OS reclaims it
    }
}

/// Sender returned by [`TimeToken::close`].
#[derive(Debug)]
pub struct CloseTimer {
    shared: Arc<TimerShared>,
}

pub struct CloseTimerOp<R> {
    shared: Arc<TimerShared>,
    receiver: R,
}

// === impl CloseTimer ===

impl Sender for CloseTimer {
    type Item = ();

    type Op<R>
        = CloseTimerOp<R>
    where
        R: Receiver<Item = ()>;

    fn connect<R>(self, receiver: R) -> CloseTimerOp<R>
    where
        R: Receiver<Item = ()>,
    {
        CloseTimerOp {
            shared: self.shared,
            receiver,
        }
    }
}

impl<R> Operation for CloseTimerOp<R>
where
    R: Receiver<Item = ()>,
{
    fn start(self) {
        let Self { shared, receiver } = self;
        {
            let mut state = shared.state.lock().unwrap();
            assert_eq!(
                state.phase,
                TimerPhase::Running,
                "close started on a time resource that is not running"
            );
            state.phase = TimerPhase::Closing;
            assert!(
                state.close_waiter.is_none(),
                "close already started on this time resource"
            );
            state.close_waiter = Some(Box::new(move || receiver.set_value(())));
        }
        shared.wake.notify_all();
    }
}

fn timer_loop(shared: &Arc<TimerShared>) {
    let mut state = shared.state.lock().unwrap();

    // wait for the open/run race to settle
    while state.phase == TimerPhase::Constructed {
        state = shared.wake.wait(state).unwrap();
    }

    if let Some(open) = state.open_waiter.take() {
        drop(state);
        tracing::debug!("timer running, delivering token");
        open(TimeToken {
            shared: shared.clone(),
        });
        state = shared.state.lock().unwrap();
    }

    loop {
        if state.queue.is_empty() {
            if state.phase != TimerPhase::Running {
                break;
            }
            state = shared.wake.wait(state).unwrap();
            continue;
        }

        // `now` is sampled once per batch; entries landing between the
        // sample and the unlock wait for the next wakeup
        let now = Instant::now();
        let batch = state.queue.pop_ready(now, BATCH);
        if !batch.is_empty() {
            drop(state);
            tracing::trace!(count = batch.len(), "completing timer batch");
            for entry in batch {
                entry.fire(TimerFire::At(now));
            }
            state = shared.state.lock().unwrap();
            continue;
        }

        let deadline = state
            .queue
            .next_deadline()
            .expect("non-empty queue must have a deadline");
        let timeout = deadline.saturating_duration_since(Instant::now());
        let (guard, _timed_out) = shared.wake.wait_timeout(state, timeout).unwrap();
        state = guard;
    }

    // the queue has drained and close was requested
    state.phase = TimerPhase::Closed;
    let close = state.close_waiter.take();
    let run = state.run_waiter.take();
    drop(state);

    tracing::debug!("timer shut down");
    if let Some(close) = close {
        close();
    }
    if let Some(run) = run {
        run();
    }
}
