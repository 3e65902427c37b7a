// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::env::Env;
use crate::error::BoxError;
use crate::resource::Resource;
use crate::scope::{CountingScope, ScopeToken};
use crate::sender::{CallbackReceiver, Operation, Receiver, Sender};
use crate::time::{TimeResource, TimeToken};
use core::fmt;
use core::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Installs a thread-local fmt subscriber so `RUST_LOG` controls test
/// traces. Keep the guard alive for the duration of the test.
pub(crate) fn init_tracing() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}

/// A cross-thread completion log: receivers push names, tests drain and
/// assert the order.
#[derive(Clone)]
pub(crate) struct Completions {
    shared: Arc<(Mutex<Vec<&'static str>>, Condvar)>,
}

impl Completions {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new((Mutex::new(Vec::new()), Condvar::new())),
        }
    }

    pub(crate) fn push(&self, name: &'static str) {
        self.shared.0.lock().unwrap().push(name);
        self.shared.1.notify_all();
    }

    /// Drains and returns everything logged so far.
    pub(crate) fn take(&self) -> Vec<&'static str> {
        core::mem::take(&mut *self.shared.0.lock().unwrap())
    }

    /// Blocks until at least `count` entries have been logged since the last
    /// [`take`](Self::take).
    pub(crate) fn wait_for(&self, count: usize) {
        let mut log = self.shared.0.lock().unwrap();
        while log.len() < count {
            log = self.shared.1.wait(log).unwrap();
        }
    }

    /// A receiver that logs `name` on a value and panics on anything else.
    pub(crate) fn expect_value<T: 'static>(&self, name: &'static str) -> LogReceiver<T> {
        LogReceiver {
            log: self.clone(),
            name,
            expected: Signal::Value,
            _item: PhantomData,
        }
    }

    /// A receiver that logs `name` on stopped and panics on anything else.
    pub(crate) fn expect_stopped<T: 'static>(&self, name: &'static str) -> LogReceiver<T> {
        LogReceiver {
            log: self.clone(),
            name,
            expected: Signal::Stopped,
            _item: PhantomData,
        }
    }

    /// A receiver that logs `name` on an error and panics on anything else.
    pub(crate) fn expect_error<T: 'static>(&self, name: &'static str) -> LogReceiver<T> {
        LogReceiver {
            log: self.clone(),
            name,
            expected: Signal::Error,
            _item: PhantomData,
        }
    }
}

impl fmt::Debug for Completions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completions")
            .field("logged", &*self.shared.0.lock().unwrap())
            .finish()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Signal {
    Value,
    Error,
    Stopped,
}

/// Logs its name when the expected terminal signal arrives; panics on any
/// other signal.
pub(crate) struct LogReceiver<T> {
    log: Completions,
    name: &'static str,
    expected: Signal,
    _item: PhantomData<fn(T)>,
}

impl<T: 'static> Receiver for LogReceiver<T> {
    type Item = T;

    fn set_value(self, _value: T) {
        assert_eq!(
            self.expected,
            Signal::Value,
            "{}: unexpected value completion",
            self.name,
        );
        self.log.push(self.name);
    }

    fn set_error(self, error: BoxError) {
        assert_eq!(
            self.expected,
            Signal::Error,
            "{}: unexpected error completion: {error}",
            self.name,
        );
        self.log.push(self.name);
    }

    fn set_stopped(self) {
        assert_eq!(
            self.expected,
            Signal::Stopped,
            "{}: unexpected stopped completion",
            self.name,
        );
        self.log.push(self.name);
    }
}

/// Starts run and open on `scope` and returns the token (delivered inline,
/// because run went first) plus a log that will record the "close" and "run"
/// completions.
pub(crate) fn running_scope(scope: &CountingScope) -> (ScopeToken, Completions) {
    let log = Completions::new();
    scope.run().connect(log.expect_value("run")).start();

    let slot = Arc::new(Mutex::new(None));
    scope
        .open()
        .connect(CallbackReceiver::new(
            Env::new(),
            {
                let slot = slot.clone();
                move |token| *slot.lock().unwrap() = Some(token)
            },
            |error| panic!("scope open failed: {error}"),
            || panic!("scope open stopped"),
        ))
        .start();
    let token = slot
        .lock()
        .unwrap()
        .take()
        .expect("open must complete inline once run has started");
    (token, log)
}

/// Starts run and open on `timer` and returns the token (delivered from the
/// timer thread) plus a log that will record the "close" and "run"
/// completions.
pub(crate) fn running_timer(timer: &TimeResource) -> (TimeToken, Completions) {
    let log = Completions::new();
    timer.run().connect(log.expect_value("run")).start();

    let (tx, rx) = std::sync::mpsc::channel();
    timer
        .open()
        .connect(CallbackReceiver::new(
            Env::new(),
            move |token| tx.send(token).unwrap(),
            |error| panic!("timer open failed: {error}"),
            || panic!("timer open stopped"),
        ))
        .start();
    let token = rx.recv().unwrap();
    (token, log)
}

/// A unit sender completed by hand from the test body.
pub(crate) fn manual() -> (ManualHandle, ManualSender) {
    let shared = Arc::new(ManualShared {
        slot: Mutex::new(ManualSlot {
            waiter: None,
            triggered: false,
        }),
    });
    (
        ManualHandle {
            shared: shared.clone(),
        },
        ManualSender { shared },
    )
}

struct ManualShared {
    slot: Mutex<ManualSlot>,
}

struct ManualSlot {
    waiter: Option<Box<dyn FnOnce() + Send>>,
    triggered: bool,
}

pub(crate) struct ManualHandle {
    shared: Arc<ManualShared>,
}

pub(crate) struct ManualSender {
    shared: Arc<ManualShared>,
}

pub(crate) struct ManualOp<R> {
    shared: Arc<ManualShared>,
    receiver: R,
}

impl ManualHandle {
    pub(crate) fn trigger(&self) {
        let waiter = {
            let mut slot = self.shared.slot.lock().unwrap();
            slot.triggered = true;
            slot.waiter.take()
        };
        if let Some(waiter) = waiter {
            waiter();
        }
    }
}

impl Sender for ManualSender {
    type Item = ();

    type Op<R>
        = ManualOp<R>
    where
        R: Receiver<Item = ()>;

    fn connect<R>(self, receiver: R) -> ManualOp<R>
    where
        R: Receiver<Item = ()>,
    {
        ManualOp {
            shared: self.shared,
            receiver,
        }
    }
}

impl<R> Operation for ManualOp<R>
where
    R: Receiver<Item = ()>,
{
    fn start(self) {
        let Self { shared, receiver } = self;
        let mut slot = shared.slot.lock().unwrap();
        if slot.triggered {
            drop(slot);
            receiver.set_value(());
        } else {
            slot.waiter = Some(Box::new(move || receiver.set_value(())));
        }
    }
}

/// A sender that completes inline with an error.
pub(crate) fn fail<T>(message: &'static str) -> Fail<T> {
    Fail {
        message,
        _item: PhantomData,
    }
}

pub(crate) struct Fail<T> {
    message: &'static str,
    _item: PhantomData<fn(T)>,
}

pub(crate) struct FailOp<T, R> {
    message: &'static str,
    receiver: R,
    _item: PhantomData<fn(T)>,
}

#[derive(Debug)]
struct TestError(&'static str);

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl core::error::Error for TestError {}

impl<T: 'static> Sender for Fail<T> {
    type Item = T;

    type Op<R>
        = FailOp<T, R>
    where
        R: Receiver<Item = T>;

    fn connect<R>(self, receiver: R) -> FailOp<T, R>
    where
        R: Receiver<Item = T>,
    {
        FailOp {
            message: self.message,
            receiver,
            _item: PhantomData,
        }
    }
}

impl<T: 'static, R> Operation for FailOp<T, R>
where
    R: Receiver<Item = T>,
{
    fn start(self) {
        let error: BoxError = Box::new(TestError(self.message));
        self.receiver.set_error(error);
    }
}

/// A sender that completes inline with stopped.
pub(crate) fn stopped<T>() -> Stopped<T> {
    Stopped { _item: PhantomData }
}

pub(crate) struct Stopped<T> {
    _item: PhantomData<fn(T)>,
}

pub(crate) struct StoppedOp<T, R> {
    receiver: R,
    _item: PhantomData<fn(T)>,
}

impl<T: 'static> Sender for Stopped<T> {
    type Item = T;

    type Op<R>
        = StoppedOp<T, R>
    where
        R: Receiver<Item = T>;

    fn connect<R>(self, receiver: R) -> StoppedOp<T, R>
    where
        R: Receiver<Item = T>,
    {
        StoppedOp {
            receiver,
            _item: PhantomData,
        }
    }
}

impl<T: 'static, R> Operation for StoppedOp<T, R>
where
    R: Receiver<Item = T>,
{
    fn start(self) {
        self.receiver.set_stopped();
    }
}

/// A unit sender that completes stopped when its receiver's stop-token
/// fires, and records that the stop was observed.
pub(crate) fn stop_observed() -> (StopObserver, StopObserved) {
    let shared = Arc::new(ObserverShared {
        saw: AtomicBool::new(false),
        _registration: Mutex::new(None),
    });
    (
        StopObserver {
            shared: shared.clone(),
        },
        StopObserved { shared },
    )
}

struct ObserverShared {
    saw: AtomicBool,
    // written only to keep the stop callback registered
    _registration: Mutex<Option<crate::stop::StopRegistration>>,
}

pub(crate) struct StopObserver {
    shared: Arc<ObserverShared>,
}

pub(crate) struct StopObserved {
    shared: Arc<ObserverShared>,
}

pub(crate) struct StopObservedOp<R> {
    shared: Arc<ObserverShared>,
    receiver: R,
}

impl StopObserver {
    pub(crate) fn saw_stop(&self) -> bool {
        self.shared.saw.load(Ordering::SeqCst)
    }
}

impl Sender for StopObserved {
    type Item = ();

    type Op<R>
        = StopObservedOp<R>
    where
        R: Receiver<Item = ()>;

    fn connect<R>(self, receiver: R) -> StopObservedOp<R>
    where
        R: Receiver<Item = ()>,
    {
        StopObservedOp {
            shared: self.shared,
            receiver,
        }
    }
}

impl<R> Operation for StopObservedOp<R>
where
    R: Receiver<Item = ()>,
{
    fn start(self) {
        let Self { shared, receiver } = self;
        let token = receiver.env().stop_token().clone();
        let registration = token.on_stop({
            let shared = shared.clone();
            move || {
                shared.saw.store(true, Ordering::SeqCst);
                receiver.set_stopped();
            }
        });
        *shared._registration.lock().unwrap() = Some(registration);
    }
}
