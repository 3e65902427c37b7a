// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::env::Env;
use crate::error::BoxError;
use crate::scope::ScopeContext;
use crate::sender::{Operation, Receiver, Sender};
use core::fmt;
use std::sync::Arc;

/// Sender returned by [`ScopeToken::nest`](crate::scope::ScopeToken::nest).
///
/// Equivalent to the wrapped sender, with two bracketing effects: starting
/// the nested operation increments the scope's active count, and the count
/// is decremented after the inner completion has been delivered to the outer
/// receiver. Connecting without starting has no effect on the scope.
///
/// Starting while the scope is in a phase that cannot accept work completes
/// with a [`PhaseViolation`](crate::PhaseViolation) error and leaves the
/// count untouched.
pub struct Nest<S> {
    ctx: Arc<ScopeContext>,
    inner: S,
    /// Eagerly started work (spawn, spawn_future) must find the scope
    /// `Running`; lazily nested work may also start while `Closing`.
    eager: bool,
}

pub struct NestOp<S, R> {
    ctx: Arc<ScopeContext>,
    eager: bool,
    inner: S,
    receiver: R,
}

pub struct NestReceiver<R> {
    ctx: Arc<ScopeContext>,
    receiver: R,
}

// === impl Nest ===

impl<S> Nest<S>
where
    S: Sender,
{
    pub(super) fn new(ctx: Arc<ScopeContext>, inner: S, eager: bool) -> Self {
        Self { ctx, inner, eager }
    }
}

impl<S> Sender for Nest<S>
where
    S: Sender,
{
    type Item = S::Item;

    type Op<R>
        = NestOp<S, R>
    where
        R: Receiver<Item = S::Item>;

    fn connect<R>(self, receiver: R) -> NestOp<S, R>
    where
        R: Receiver<Item = S::Item>,
    {
        NestOp {
            ctx: self.ctx,
            eager: self.eager,
            inner: self.inner,
            receiver,
        }
    }
}

impl<S> fmt::Debug for Nest<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nest")
            .field("ctx", &self.ctx)
            .field("eager", &self.eager)
            .finish_non_exhaustive()
    }
}

// === impl NestOp ===

impl<S, R> Operation for NestOp<S, R>
where
    S: Sender,
    R: Receiver<Item = S::Item>,
{
    fn start(self) {
        let NestOp {
            ctx,
            eager,
            inner,
            receiver,
        } = self;
        match ctx.add_child(eager) {
            Ok(()) => inner.connect(NestReceiver { ctx, receiver }).start(),
            Err(violation) => receiver.set_error(Box::new(violation)),
        }
    }
}

// === impl NestReceiver ===

impl<R> Receiver for NestReceiver<R>
where
    R: Receiver,
{
    type Item = R::Item;

    fn set_value(self, value: R::Item) {
        let NestReceiver { ctx, receiver } = self;
        receiver.set_value(value);
        ctx.child_completed();
    }

    fn set_error(self, error: BoxError) {
        let NestReceiver { ctx, receiver } = self;
        receiver.set_error(error);
        ctx.child_completed();
    }

    fn set_stopped(self) {
        let NestReceiver { ctx, receiver } = self;
        receiver.set_stopped();
        ctx.child_completed();
    }

    fn env(&self) -> Env {
        self.receiver.env()
    }
}
