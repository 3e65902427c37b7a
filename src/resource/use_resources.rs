// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::env::Env;
use crate::error::{BoxError, CloseError};
use crate::resource::{Deferred, Resource, ResourceToken};
use crate::sender::{CallbackReceiver, Operation, Outcome, Receiver, Sender};
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

/// Composes deferred resources and a user body into one sender.
///
/// When the returned sender is started it
///
/// 1. materializes each deferred resource in a stable location,
/// 2. starts every resource's `run`,
/// 3. starts every resource's `open`; once all tokens have arrived the body
///    is called with the token tuple and its sender is started,
/// 4. on the body's terminal signal starts `close` on every token,
/// 5. completes once every close and every run has completed, re-delivering
///    the body's signal.
///
/// A close error is surfaced only when the body completed with a value;
/// otherwise the body's signal wins. The materialized resources stay alive
/// inside the composed operation until the final delivery.
pub fn use_resources<F, S, Rs>(body: F, resources: Rs) -> UseResources<F, Rs>
where
    Rs: ResourceSet,
    F: FnOnce(Rs::Tokens) -> S + Send + 'static,
    S: Sender,
    S::Item: Send + 'static,
{
    UseResources { body, resources }
}

/// Sender returned by [`use_resources`].
pub struct UseResources<F, Rs> {
    body: F,
    resources: Rs,
}

/// Operation returned by connecting a [`UseResources`].
pub struct UseResourcesOp<F, Rs, R> {
    body: F,
    resources: Rs,
    receiver: R,
}

/// A tuple of [`Deferred`] resources usable with [`use_resources`].
///
/// Implemented for tuples of one to three deferred resources.
pub trait ResourceSet: Send + 'static {
    type Tokens: Clone + Send + 'static;

    const COUNT: usize;

    fn launch<F, S, Rcv>(self, body: F, receiver: Rcv)
    where
        F: FnOnce(Self::Tokens) -> S + Send + 'static,
        S: Sender,
        S::Item: Send + 'static,
        Rcv: Receiver<Item = S::Item>;

    fn close_all<T, R>(tokens: Self::Tokens, core: Arc<UseCore<T, R>>)
    where
        T: Send + 'static,
        R: Receiver<Item = T>;
}

// === impl UseResources ===

impl<F, S, Rs> Sender for UseResources<F, Rs>
where
    Rs: ResourceSet,
    F: FnOnce(Rs::Tokens) -> S + Send + 'static,
    S: Sender,
    S::Item: Send + 'static,
{
    type Item = S::Item;

    type Op<R>
        = UseResourcesOp<F, Rs, R>
    where
        R: Receiver<Item = S::Item>;

    fn connect<R>(self, receiver: R) -> Self::Op<R>
    where
        R: Receiver<Item = S::Item>,
    {
        UseResourcesOp {
            body: self.body,
            resources: self.resources,
            receiver,
        }
    }
}

impl<F, S, Rs, R> Operation for UseResourcesOp<F, Rs, R>
where
    Rs: ResourceSet,
    F: FnOnce(Rs::Tokens) -> S + Send + 'static,
    S: Sender,
    S::Item: Send + 'static,
    R: Receiver<Item = S::Item>,
{
    fn start(self) {
        self.resources.launch(self.body, self.receiver);
    }
}

/// Completion bookkeeping shared by every receiver a [`use_resources`]
/// expression wires up.
pub struct UseCore<T, R> {
    state: Mutex<CoreState<T, R>>,
}

struct CoreState<T, R> {
    runs_remaining: usize,
    closes_remaining: usize,
    body_outcome: Option<Outcome<T>>,
    close_error: Option<BoxError>,
    receiver: Option<R>,
    resources: Option<Box<dyn Any + Send>>,
}

// === impl UseCore ===

impl<T, R> UseCore<T, R>
where
    T: Send + 'static,
    R: Receiver<Item = T>,
{
    fn new(receiver: R, count: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CoreState {
                runs_remaining: count,
                closes_remaining: count,
                body_outcome: None,
                close_error: None,
                receiver: Some(receiver),
                resources: None,
            }),
        })
    }

    fn hold_resources(&self, resources: Box<dyn Any + Send>) {
        self.state.lock().unwrap().resources = Some(resources);
    }

    fn run_done(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.runs_remaining > 0, "resource run completed twice");
        state.runs_remaining -= 1;
        tracing::trace!(remaining = state.runs_remaining, "resource run completed");
        Self::try_finish(state);
    }

    fn body_done(&self, outcome: Outcome<T>) {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.body_outcome.is_none(),
            "use_resources body completed twice"
        );
        state.body_outcome = Some(outcome);
    }

    fn close_done(&self, error: Option<BoxError>) {
        let mut state = self.state.lock().unwrap();
        assert!(state.closes_remaining > 0, "resource close completed twice");
        state.closes_remaining -= 1;
        if state.close_error.is_none() {
            state.close_error = error;
        }
        Self::try_finish(state);
    }

    fn try_finish(mut state: MutexGuard<'_, CoreState<T, R>>) {
        if state.body_outcome.is_none()
            || state.closes_remaining != 0
            || state.runs_remaining != 0
        {
            return;
        }

        let receiver = state.receiver.take().expect("use_resources completed twice");
        let outcome = state.body_outcome.take().unwrap();
        let close_error = state.close_error.take();
        let resources = state.resources.take();
        drop(state);
        drop(resources);

        let outcome = match close_error {
            Some(error) if outcome.is_value() => {
                Outcome::Error(Box::new(CloseError::new(error)))
            }
            _ => outcome,
        };
        outcome.deliver(receiver);
    }
}

/// Observes the body sender; its completion is what triggers the close step.
struct BodyReceiver<Rs: ResourceSet, T, R> {
    core: Arc<UseCore<T, R>>,
    tokens: Rs::Tokens,
    env: Env,
}

// === impl BodyReceiver ===

impl<Rs, T, R> BodyReceiver<Rs, T, R>
where
    Rs: ResourceSet,
    T: Send + 'static,
    R: Receiver<Item = T>,
{
    fn finish(self, outcome: Outcome<T>) {
        let BodyReceiver { core, tokens, .. } = self;
        core.body_done(outcome);
        Rs::close_all(tokens, core);
    }
}

impl<Rs, T, R> Receiver for BodyReceiver<Rs, T, R>
where
    Rs: ResourceSet,
    T: Send + 'static,
    R: Receiver<Item = T>,
{
    type Item = T;

    fn set_value(self, value: T) {
        self.finish(Outcome::Value(value));
    }

    fn set_error(self, error: BoxError) {
        self.finish(Outcome::Error(error));
    }

    fn set_stopped(self) {
        self.finish(Outcome::Stopped);
    }

    fn env(&self) -> Env {
        self.env.clone()
    }
}

/// Per-arity token collection; filled in by each open completion.
trait TokenSlots {
    type Tokens;

    fn try_take(&mut self) -> Option<Self::Tokens>;
}

macro_rules! impl_token_slots {
    ($(($T:ident, $idx:tt)),+) => {
        impl<$($T: Clone + Send + 'static),+> TokenSlots for ($(Option<$T>,)+) {
            type Tokens = ($($T,)+);

            fn try_take(&mut self) -> Option<Self::Tokens> {
                if $(self.$idx.is_some())&&+ {
                    Some(($(self.$idx.take().unwrap(),)+))
                } else {
                    None
                }
            }
        }
    };
}

impl_token_slots!((T0, 0));
impl_token_slots!((T0, 0), (T1, 1));
impl_token_slots!((T0, 0), (T1, 1), (T2, 2));

macro_rules! impl_resource_set {
    ($count:literal; $(($R:ident, $idx:tt)),+) => {
        impl<$($R),+> ResourceSet for ($(Deferred<$R>,)+)
        where
            $($R: Resource + Send + 'static,)+
        {
            type Tokens = ($($R::Token,)+);

            const COUNT: usize = $count;

            fn launch<F, S, Rcv>(mut self, body: F, receiver: Rcv)
            where
                F: FnOnce(Self::Tokens) -> S + Send + 'static,
                S: Sender,
                S::Item: Send + 'static,
                Rcv: Receiver<Item = S::Item>,
            {
                $(self.$idx.materialize();)+

                let env = receiver.env();
                let core = UseCore::new(receiver, Self::COUNT);
                let pending = Arc::new(Mutex::new((
                    Some(body),
                    ($(None::<$R::Token>,)+),
                )));

                let run_ops = ($(
                    {
                        let core = core.clone();
                        self.$idx.get().run().connect(CallbackReceiver::new(
                            Env::new(),
                            move |()| core.run_done(),
                            |error: BoxError| {
                                panic!("resource run failed inside use_resources: {error}")
                            },
                            || panic!("resource run was stopped inside use_resources"),
                        ))
                    },
                )+);

                let open_ops = ($(
                    {
                        let pending = pending.clone();
                        let body_core = core.clone();
                        let body_env = env.clone();
                        let on_token = move |token: <$R as Resource>::Token| {
                            let mut guard = pending.lock().unwrap();
                            guard.1.$idx = Some(token);
                            if let Some(tokens) = guard.1.try_take() {
                                let body = guard
                                    .0
                                    .take()
                                    .expect("use_resources body already started");
                                drop(guard);
                                tracing::trace!("all resources opened, starting body");
                                body(tokens.clone())
                                    .connect(BodyReceiver::<Self, S::Item, Rcv> {
                                        core: body_core,
                                        tokens,
                                        env: body_env,
                                    })
                                    .start();
                            }
                        };
                        self.$idx.get().open().connect(CallbackReceiver::new(
                            env.clone(),
                            on_token,
                            |error: BoxError| {
                                panic!("resource open failed inside use_resources: {error}")
                            },
                            || panic!("resource open was stopped inside use_resources"),
                        ))
                    },
                )+);

                // The deferred slots must outlive every operation derived
                // from them; they are released at the final delivery.
                core.hold_resources(Box::new(self));

                $(run_ops.$idx.start();)+
                $(open_ops.$idx.start();)+
            }

            fn close_all<T, R>(tokens: Self::Tokens, core: Arc<UseCore<T, R>>)
            where
                T: Send + 'static,
                R: Receiver<Item = T>,
            {
                $(
                    {
                        let value_core = core.clone();
                        let error_core = core.clone();
                        let stopped_core = core.clone();
                        tokens
                            .$idx
                            .close()
                            .connect(CallbackReceiver::new(
                                Env::new(),
                                move |()| value_core.close_done(None),
                                move |error: BoxError| error_core.close_done(Some(error)),
                                move || stopped_core.close_done(None),
                            ))
                            .start();
                    }
                )+
            }
        }
    };
}

impl_resource_set!(1; (R0, 0));
impl_resource_set!(2; (R0, 0), (R1, 1));
impl_resource_set!(3; (R0, 0), (R1, 1), (R2, 2));
