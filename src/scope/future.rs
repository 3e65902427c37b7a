// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::env::Env;
use crate::error::BoxError;
use crate::scope::ScopeToken;
use crate::scope::nest::Nest;
use crate::sender::{Operation, Outcome, Receiver, Sender};
use crate::stop::{StopRegistration, StopSource};
use core::fmt;
use std::sync::{Arc, Mutex};

/// Steps of a future's shared state.
///
/// `Created` until the future value is handed to the caller, `Future` while
/// the caller (or its connected operation) holds it, `NoFuture` once the
/// holder gave up without consuming a result, `Deleted` once the result slot
/// can never be read again.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Step {
    Created,
    Future,
    NoFuture,
    Deleted,
}

/// State shared between the eagerly started work and the future sender.
struct FutureState<T> {
    /// Local stop source; the consumer's stop request is forwarded here and
    /// the running work observes it through its environment.
    stop: StopSource,
    inner: Mutex<FutureInner<T>>,
}

struct FutureInner<T> {
    step: Step,
    outcome: Option<Outcome<T>>,
    consumer: Option<Box<dyn FnOnce(Outcome<T>) + Send>>,
}

/// Eagerly starts `sender` within the scope and returns the future sender.
pub(super) fn spawn_future<S>(token: &ScopeToken, sender: S) -> SpawnFuture<S::Item>
where
    S: Sender,
    S::Item: Send + 'static,
{
    let state = Arc::new(FutureState {
        stop: StopSource::new(),
        inner: Mutex::new(FutureInner {
            step: Step::Created,
            outcome: None,
            consumer: None,
        }),
    });

    let nested = Nest::new(token.context().clone(), sender, true);
    nested
        .connect(FutureReceiver {
            state: state.clone(),
        })
        .start();

    state.step_from_to(Step::Created, Step::Future);
    SpawnFuture { state: Some(state) }
}

// === impl FutureState ===

impl<T> FutureState<T> {
    fn step_from_to(&self, from: Step, to: Step) {
        let mut inner = self.inner.lock().unwrap();
        assert_eq!(inner.step, from, "future state step out of order");
        inner.step = to;
    }

    /// Records the work's completion and dispatches it.
    fn complete(&self, outcome: Outcome<T>) {
        let mut inner = self.inner.lock().unwrap();
        match inner.step {
            Step::NoFuture => {
                // nobody is waiting for the result; dispose of it
                inner.step = Step::Deleted;
                drop(inner);
                tracing::trace!("future result abandoned before completion");
            }
            Step::Created | Step::Future => {
                if let Some(consumer) = inner.consumer.take() {
                    inner.step = Step::Deleted;
                    drop(inner);
                    consumer(outcome);
                } else {
                    inner.outcome = Some(outcome);
                }
            }
            Step::Deleted => panic!("future work completed twice"),
        }
    }

    /// Called when the future (or its unstarted operation) is dropped
    /// without consuming a result.
    fn abandon(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.outcome.take().is_some() {
            // the work already finished; the result dies here
            inner.step = Step::Deleted;
        } else {
            assert_eq!(inner.step, Step::Future, "future state step out of order");
            inner.step = Step::NoFuture;
        }
    }
}

/// Writes the work's completion into the shared state.
struct FutureReceiver<T> {
    state: Arc<FutureState<T>>,
}

// === impl FutureReceiver ===

impl<T> Receiver for FutureReceiver<T>
where
    T: Send + 'static,
{
    type Item = T;

    fn set_value(self, value: T) {
        self.state.complete(Outcome::Value(value));
    }

    fn set_error(self, error: BoxError) {
        self.state.complete(Outcome::Error(error));
    }

    fn set_stopped(self) {
        self.state.complete(Outcome::Stopped);
    }

    fn env(&self) -> Env {
        Env::new().with_stop_token(self.state.stop.token())
    }
}

/// Sender returned by
/// [`ScopeToken::spawn_future`](crate::scope::ScopeToken::spawn_future).
///
/// Delivers the spawned work's buffered result, or parks its consumer until
/// the work completes. Dropping the future before the work completes hands
/// the result's ownership back to the work, which disposes of it.
pub struct SpawnFuture<T> {
    state: Option<Arc<FutureState<T>>>,
}

pub struct FutureOp<T, R> {
    state: Option<Arc<FutureState<T>>>,
    receiver: Option<R>,
    forward: Option<StopRegistration>,
}

// === impl SpawnFuture ===

impl<T> Sender for SpawnFuture<T>
where
    T: Send + 'static,
{
    type Item = T;

    type Op<R>
        = FutureOp<T, R>
    where
        R: Receiver<Item = T>;

    fn connect<R>(mut self, receiver: R) -> FutureOp<T, R>
    where
        R: Receiver<Item = T>,
    {
        let state = self.state.take().expect("future already connected");

        // Forward the consumer's stop into the local stop source for the
        // life of the operation.
        let forward = receiver.env().stop_token().on_stop({
            let state = state.clone();
            move || {
                tracing::trace!("forwarding consumer stop into spawned work");
                state.stop.request_stop();
            }
        });

        FutureOp {
            state: Some(state),
            receiver: Some(receiver),
            forward: Some(forward),
        }
    }
}

impl<T> Drop for SpawnFuture<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.abandon();
        }
    }
}

impl<T> fmt::Debug for SpawnFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnFuture")
            .field("connected", &self.state.is_none())
            .finish()
    }
}

// === impl FutureOp ===

fn deliver<T, R>(receiver: R, outcome: Outcome<T>, forward: Option<StopRegistration>)
where
    R: Receiver<Item = T>,
{
    drop(forward);
    if receiver.env().stop_token().stop_requested() {
        receiver.set_stopped();
    } else {
        outcome.deliver(receiver);
    }
}

impl<T, R> Operation for FutureOp<T, R>
where
    T: Send + 'static,
    R: Receiver<Item = T>,
{
    fn start(mut self) {
        let state = self.state.take().expect("future operation started twice");
        let receiver = self.receiver.take().expect("future operation started twice");
        let forward = self.forward.take();

        let mut inner = state.inner.lock().unwrap();
        if let Some(outcome) = inner.outcome.take() {
            inner.step = Step::Deleted;
            drop(inner);
            deliver(receiver, outcome, forward);
        } else {
            inner.consumer = Some(Box::new(move |outcome| {
                deliver(receiver, outcome, forward);
            }));
        }
    }
}

impl<T, R> Drop for FutureOp<T, R> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::{sync_wait, then};
    use crate::resource::ResourceToken;
    use crate::scope::CountingScope;
    use crate::sender::CallbackReceiver;
    use crate::test_util::{Completions, fail, manual, running_scope, running_timer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn close(token: &ScopeToken, log: &Completions) {
        token.close().connect(log.expect_value("close")).start();
    }

    #[test]
    fn buffered_result_is_delivered() {
        let scope = CountingScope::new();
        let (token, log) = running_scope(&scope);

        // `just` completes during spawn_future, so the result is buffered
        let future = token.spawn_future(crate::algo::just(42));
        assert_eq!(sync_wait(future).unwrap(), Some(42));

        close(&token, &log);
        assert_eq!(log.take(), ["close", "run"]);
    }

    #[test]
    fn parked_consumer_is_woken() {
        let scope = CountingScope::new();
        let (token, log) = running_scope(&scope);

        let (handle, sender) = manual();
        let future = token.spawn_future(then(sender, |()| 5u32));

        let seen = Arc::new(AtomicUsize::new(0));
        future
            .connect(CallbackReceiver::new(
                Env::new(),
                {
                    let seen = seen.clone();
                    move |value: u32| seen.store(value as usize, Ordering::SeqCst)
                },
                |error| panic!("future failed: {error}"),
                || panic!("future stopped"),
            ))
            .start();
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        handle.trigger();
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        close(&token, &log);
        assert_eq!(log.take(), ["close", "run"]);
    }

    #[test]
    fn dropping_the_future_does_not_block_the_work() {
        let scope = CountingScope::new();
        let (token, log) = running_scope(&scope);

        let completions = Arc::new(AtomicUsize::new(0));
        let (handle, sender) = manual();
        let future = token.spawn_future(then(sender, {
            let completions = completions.clone();
            move |()| {
                completions.fetch_add(1, Ordering::SeqCst);
            }
        }));
        drop(future);

        close(&token, &log);
        assert!(log.take().is_empty(), "abandoned work still counts");

        handle.trigger();
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(log.take(), ["close", "run"]);
    }

    #[test]
    fn dropping_a_connected_operation_abandons_too() {
        let scope = CountingScope::new();
        let (token, log) = running_scope(&scope);

        let (handle, sender) = manual();
        let future = token.spawn_future(then(sender, |()| 9u32));
        let op = future.connect(CallbackReceiver::new(
            Env::new(),
            |_value: u32| panic!("must never complete"),
            |error| panic!("future failed: {error}"),
            || panic!("future stopped"),
        ));
        drop(op);

        handle.trigger();
        close(&token, &log);
        assert_eq!(log.take(), ["close", "run"]);
    }

    #[test]
    fn errors_are_surfaced_to_the_consumer() {
        let scope = CountingScope::new();
        let (token, log) = running_scope(&scope);

        let future = token.spawn_future(fail::<u32>("inner failed"));
        let error = sync_wait(future).unwrap_err();
        assert_eq!(error.to_string(), "inner failed");

        close(&token, &log);
        assert_eq!(log.take(), ["close", "run"]);
    }

    #[test]
    fn stopping_a_consumer_cancels_a_long_timer() {
        let scope = CountingScope::new();
        let (token, log) = running_scope(&scope);
        let timer = crate::time::TimeResource::new();
        let (time_token, timer_log) = running_timer(&timer);

        let future = token.spawn_future(then(
            time_token.schedule_after(core::time::Duration::from_secs(300)),
            |_| (),
        ));

        let source = StopSource::new();
        let outcome = Completions::new();
        future
            .connect(CallbackReceiver::new(
                Env::new().with_stop_token(source.token()),
                |_value: ()| panic!("the timer must not fire"),
                |error| panic!("future failed: {error}"),
                {
                    let outcome = outcome.clone();
                    move || outcome.push("stopped")
                },
            ))
            .start();

        source.request_stop();
        assert_eq!(outcome.take(), ["stopped"]);

        // the cancelled entry released the scope's only child
        close(&token, &log);
        assert_eq!(log.take(), ["close", "run"]);

        time_token
            .close()
            .connect(timer_log.expect_value("close"))
            .start();
        timer_log.wait_for(2);
        assert_eq!(timer_log.take(), ["close", "run"]);
    }

    #[test]
    fn consumer_stop_reaches_the_running_work() {
        let scope = CountingScope::new();
        let (token, log) = running_scope(&scope);

        // work that completes stopped when its environment's stop fires
        let (observer, sender) = crate::test_util::stop_observed();
        let future = token.spawn_future(sender);

        let source = StopSource::new();
        let outcome = Completions::new();
        future
            .connect(CallbackReceiver::new(
                Env::new().with_stop_token(source.token()),
                |_value: ()| panic!("must not produce a value"),
                |error| panic!("future failed: {error}"),
                {
                    let outcome = outcome.clone();
                    move || outcome.push("stopped")
                },
            ))
            .start();
        assert!(outcome.take().is_empty());

        source.request_stop();
        assert!(observer.saw_stop(), "inner work must observe the stop");
        assert_eq!(outcome.take(), ["stopped"]);

        // the active count returned to zero, so close completes immediately
        close(&token, &log);
        assert_eq!(log.take(), ["close", "run"]);
    }
}
