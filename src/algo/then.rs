// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::env::Env;
use crate::error::BoxError;
use crate::sender::{Receiver, Sender};
use core::marker::PhantomData;

/// Returns a sender that applies `f` to the value channel of `inner`.
///
/// Error and stopped signals pass through untouched, as does the receiver's
/// environment.
pub fn then<S, F, U>(inner: S, f: F) -> Then<S, F>
where
    S: Sender,
    F: FnOnce(S::Item) -> U + Send + 'static,
{
    Then { inner, f }
}

/// Sender returned by [`then`].
#[derive(Debug)]
pub struct Then<S, F> {
    inner: S,
    f: F,
}

/// Receiver that maps the value channel before forwarding.
pub struct ThenReceiver<F, T, R> {
    f: F,
    next: R,
    _input: PhantomData<fn(T)>,
}

// === impl Then ===

impl<S, F, U> Sender for Then<S, F>
where
    S: Sender,
    S::Item: 'static,
    F: FnOnce(S::Item) -> U + Send + 'static,
    U: 'static,
{
    type Item = U;

    type Op<R>
        = S::Op<ThenReceiver<F, S::Item, R>>
    where
        R: Receiver<Item = U>;

    fn connect<R>(self, receiver: R) -> Self::Op<R>
    where
        R: Receiver<Item = U>,
    {
        self.inner.connect(ThenReceiver {
            f: self.f,
            next: receiver,
            _input: PhantomData,
        })
    }
}

// === impl ThenReceiver ===

impl<F, T, U, R> Receiver for ThenReceiver<F, T, R>
where
    T: 'static,
    U: 'static,
    F: FnOnce(T) -> U + Send + 'static,
    R: Receiver<Item = U>,
{
    type Item = T;

    fn set_value(self, value: T) {
        self.next.set_value((self.f)(value));
    }

    fn set_error(self, error: BoxError) {
        self.next.set_error(error);
    }

    fn set_stopped(self) {
        self.next.set_stopped();
    }

    fn env(&self) -> Env {
        self.next.env()
    }
}
