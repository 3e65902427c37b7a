// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::env::Env;
use crate::error::BoxError;
use core::fmt;
use core::marker::PhantomData;

/// The one terminal signal an operation delivers to its receiver.
#[derive(Debug)]
pub enum Outcome<T> {
    Value(T),
    Error(BoxError),
    Stopped,
}

/// A sink for exactly one terminal signal.
///
/// Each terminal operation consumes the receiver, so delivering twice is
/// impossible by construction. [`env`] exposes the read-only environment the
/// completing operation may query.
///
/// Receivers are `Send + 'static` because a suspended operation parks its
/// receiver wherever the completion will eventually come from, which may be
/// another thread.
///
/// [`env`]: Self::env
pub trait Receiver: Send + 'static {
    type Item;

    fn set_value(self, value: Self::Item);
    fn set_error(self, error: BoxError);
    fn set_stopped(self);

    fn env(&self) -> Env {
        Env::new()
    }
}

/// A connected sender/receiver pair.
///
/// `start` consumes the operation: every observable effect of an operation is
/// a start-time effect, and whatever must outlive the call is parked where
/// its completion will come from. A connected operation that is dropped
/// without being started has no effect.
pub trait Operation {
    fn start(self);
}

/// A lazy description of an asynchronous computation.
///
/// Connecting a sender to a [`Receiver`] yields an [`Operation`]; starting
/// the operation runs the computation until it delivers exactly one of
/// *value*, *error* or *stopped* to the receiver.
pub trait Sender {
    type Item;

    type Op<R>: Operation
    where
        R: Receiver<Item = Self::Item>;

    fn connect<R>(self, receiver: R) -> Self::Op<R>
    where
        R: Receiver<Item = Self::Item>;
}

/// Yields senders that complete on some execution context.
pub trait Scheduler: Clone + Send + 'static {
    type ScheduleSender: Sender<Item = ()>;

    fn schedule(&self) -> Self::ScheduleSender;
}

// === impl Outcome ===

impl<T> Outcome<T> {
    /// Delivers this outcome to `receiver` as the matching terminal signal.
    pub fn deliver<R>(self, receiver: R)
    where
        R: Receiver<Item = T>,
    {
        match self {
            Outcome::Value(value) => receiver.set_value(value),
            Outcome::Error(error) => receiver.set_error(error),
            Outcome::Stopped => receiver.set_stopped(),
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }
}

/// A [`Receiver`] assembled from three closures and an [`Env`].
pub struct CallbackReceiver<T, V, E, S> {
    env: Env,
    on_value: V,
    on_error: E,
    on_stopped: S,
    _item: PhantomData<fn(T)>,
}

// === impl CallbackReceiver ===

impl<T, V, E, S> CallbackReceiver<T, V, E, S>
where
    T: 'static,
    V: FnOnce(T) + Send + 'static,
    E: FnOnce(BoxError) + Send + 'static,
    S: FnOnce() + Send + 'static,
{
    pub fn new(env: Env, on_value: V, on_error: E, on_stopped: S) -> Self {
        Self {
            env,
            on_value,
            on_error,
            on_stopped,
            _item: PhantomData,
        }
    }
}

impl<T, V, E, S> Receiver for CallbackReceiver<T, V, E, S>
where
    T: 'static,
    V: FnOnce(T) + Send + 'static,
    E: FnOnce(BoxError) + Send + 'static,
    S: FnOnce() + Send + 'static,
{
    type Item = T;

    fn set_value(self, value: T) {
        (self.on_value)(value);
    }

    fn set_error(self, error: BoxError) {
        (self.on_error)(error);
    }

    fn set_stopped(self) {
        (self.on_stopped)();
    }

    fn env(&self) -> Env {
        self.env.clone()
    }
}

impl<T, V, E, S> fmt::Debug for CallbackReceiver<T, V, E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackReceiver")
            .field("env", &self.env)
            .finish_non_exhaustive()
    }
}
