// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A counting async scope: bounds the lifetime of dynamically spawned
//! asynchronous work.
//!
//! [`CountingScope`] implements the [resource protocol](crate::resource). Its
//! token hands out three ways to attach work:
//!
//! - [`nest`](ScopeToken::nest) wraps a sender so the scope tracks it without
//!   starting it,
//! - [`spawn`](ScopeToken::spawn) wraps and eagerly starts, keeping no handle,
//! - [`spawn_future`](ScopeToken::spawn_future) wraps, eagerly starts, and
//!   returns a sender that delivers the work's result.
//!
//! The scope's close sender completes exactly when no tracked work remains
//! and close has been requested; its run sender completes immediately after
//! close. No tracked work outlives the scope.

mod future;
mod nest;
mod spawn;

use crate::env::Env;
use crate::error::PhaseViolation;
use crate::resource::{Resource, ResourceToken};
use crate::sender::{Operation, Receiver, Sender};
use core::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

pub use future::SpawnFuture;
pub use nest::Nest;

/// Phases of a scope's lifecycle.
///
/// `Pending` and `Opening` are the two transitory states of the open/run
/// race: `Pending` when run started first, `Opening` when open did. Either
/// order converges on `Running`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Constructed,
    Pending,
    Opening,
    Running,
    Closing,
    Closed,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Constructed => "Constructed",
            Phase::Pending => "Pending",
            Phase::Opening => "Opening",
            Phase::Running => "Running",
            Phase::Closing => "Closing",
            Phase::Closed => "Closed",
        }
    }
}

/// Notification delivered to a parked open operation.
enum OpenNotify {
    /// The scope reached `Running`; the waiter builds its token from the
    /// context.
    Granted(Arc<ScopeContext>),
    /// Close overtook the open; the waiter completes stopped.
    Overtaken,
}

type OpenWaiter = Box<dyn FnOnce(OpenNotify) + Send>;
type Waiter = Box<dyn FnOnce() + Send>;

pub(crate) struct ScopeContext {
    state: Mutex<ScopeState>,
}

struct ScopeState {
    phase: Phase,
    /// Number of live nested or spawned children.
    active: usize,
    run_started: bool,
    open_waiter: Option<OpenWaiter>,
    close_waiter: Option<Waiter>,
    run_waiter: Option<Waiter>,
}

// === impl ScopeContext ===

impl ScopeContext {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ScopeState {
                phase: Phase::Constructed,
                active: 0,
                run_started: false,
                open_waiter: None,
                close_waiter: None,
                run_waiter: None,
            }),
        })
    }

    /// Final transition: `Closing` becomes `Closed` and both remaining
    /// waiters are delivered, close strictly before run.
    ///
    /// Callers must hold the lock with the active count at zero and the
    /// phase `Closing` or `Closed`. The lock is released before either
    /// waiter runs; the close waiter's receiver may delete the scope.
    fn shutdown(mut state: MutexGuard<'_, ScopeState>) {
        debug_assert_eq!(state.active, 0);
        debug_assert!(matches!(state.phase, Phase::Closing | Phase::Closed));

        state.phase = Phase::Closed;
        let close = state.close_waiter.take();
        let run = state.run_waiter.take();
        drop(state);

        tracing::debug!("scope shut down");
        if let Some(close) = close {
            close();
        }
        if let Some(run) = run {
            run();
        }
    }

    /// Accounts for a nested or spawned child starting.
    ///
    /// Nested work may start while the scope is `Running` or `Closing`; in
    /// any other phase the caller delivers the returned violation instead of
    /// starting. Eagerly spawned work requires `Running` and panics
    /// otherwise.
    fn add_child(&self, eager: bool) -> Result<(), PhaseViolation> {
        let mut state = self.state.lock().unwrap();
        match state.phase {
            Phase::Running => {}
            Phase::Closing if !eager => {}
            phase if eager => {
                panic!("cannot spawn work on a scope in the {phase:?} phase")
            }
            phase => return Err(PhaseViolation::new(phase.name())),
        }
        state.active += 1;
        tracing::trace!(active = state.active, "child started");
        Ok(())
    }

    /// Accounts for a child's completion, after the child's own receiver has
    /// observed the completion.
    fn child_completed(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.active > 0, "scope active count underflow");
        state.active -= 1;
        tracing::trace!(active = state.active, "child completed");
        if state.active == 0 && state.phase == Phase::Closing {
            Self::shutdown(state);
        }
    }
}

impl Drop for ScopeContext {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let state = self.state.get_mut().unwrap();
        debug_assert!(
            matches!(state.phase, Phase::Constructed | Phase::Closed),
            "scope dropped in the {:?} phase",
            state.phase,
        );
        debug_assert_eq!(state.active, 0);
        debug_assert!(state.open_waiter.is_none());
        debug_assert!(state.close_waiter.is_none());
        debug_assert!(state.run_waiter.is_none());
    }
}

impl fmt::Debug for ScopeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ScopeContext")
            .field("phase", &state.phase)
            .field("active", &state.active)
            .finish_non_exhaustive()
    }
}

/// An async scope that counts its children. Implements [`Resource`].
pub struct CountingScope {
    ctx: Arc<ScopeContext>,
}

// === impl CountingScope ===

impl CountingScope {
    pub fn new() -> Self {
        Self {
            ctx: ScopeContext::new(),
        }
    }
}

impl Default for CountingScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Resource for CountingScope {
    type Token = ScopeToken;
    type OpenSender = OpenScope;
    type RunSender = RunScope;

    fn open(&self) -> OpenScope {
        OpenScope {
            ctx: self.ctx.clone(),
        }
    }

    fn run(&self) -> RunScope {
        RunScope {
            ctx: self.ctx.clone(),
        }
    }
}

impl fmt::Debug for CountingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingScope")
            .field("ctx", &self.ctx)
            .finish()
    }
}

/// Token obtained by opening a [`CountingScope`].
///
/// Carries the environment of the receiver that opened the scope; spawned
/// work inherits it.
#[derive(Clone)]
pub struct ScopeToken {
    ctx: Arc<ScopeContext>,
    env: Env,
}

// === impl ScopeToken ===

impl ScopeToken {
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Wraps `sender` so this scope's active count tracks it.
    ///
    /// The wrapper forwards the inner sender's completions and environment
    /// untouched; the count is incremented when the nested operation starts
    /// and decremented after its completion has been delivered.
    pub fn nest<S>(&self, sender: S) -> Nest<S>
    where
        S: Sender,
    {
        Nest::new(self.ctx.clone(), sender, false)
    }

    /// Eagerly starts `sender` within this scope, keeping no handle.
    ///
    /// # Panics
    ///
    /// Panics if the scope is not in the `Running` phase, or (per the spawn
    /// contract) if the spawned sender later completes with an error.
    pub fn spawn<S>(&self, sender: S)
    where
        S: Sender<Item = ()>,
    {
        spawn::spawn(self, sender);
    }

    /// Eagerly starts `sender` within this scope and returns a sender that
    /// delivers its result.
    ///
    /// Every completion of the inner sender is surfaced, errors included.
    /// Dropping the returned future abandons the result without cancelling
    /// the work; a consumer's stop request is forwarded into the running
    /// work's environment.
    ///
    /// # Panics
    ///
    /// Panics if the scope is not in the `Running` phase.
    pub fn spawn_future<S>(&self, sender: S) -> SpawnFuture<S::Item>
    where
        S: Sender,
        S::Item: Send + 'static,
    {
        future::spawn_future(self, sender)
    }

    pub(crate) fn context(&self) -> &Arc<ScopeContext> {
        &self.ctx
    }
}

impl ResourceToken for ScopeToken {
    type CloseSender = CloseScope;

    fn close(&self) -> CloseScope {
        CloseScope {
            ctx: self.ctx.clone(),
        }
    }
}

impl fmt::Debug for ScopeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeToken")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

/// The token capability set of an async scope.
pub trait AsyncScope: ResourceToken {
    type Nested<S>: Sender<Item = S::Item>
    where
        S: Sender;

    type Future<T>: Sender<Item = T>
    where
        T: Send + 'static;

    fn nest<S>(&self, sender: S) -> Self::Nested<S>
    where
        S: Sender;

    fn spawn<S>(&self, sender: S)
    where
        S: Sender<Item = ()>;

    fn spawn_future<S>(&self, sender: S) -> Self::Future<S::Item>
    where
        S: Sender,
        S::Item: Send + 'static;
}

impl AsyncScope for ScopeToken {
    type Nested<S>
        = Nest<S>
    where
        S: Sender;

    type Future<T>
        = SpawnFuture<T>
    where
        T: Send + 'static;

    fn nest<S>(&self, sender: S) -> Nest<S>
    where
        S: Sender,
    {
        ScopeToken::nest(self, sender)
    }

    fn spawn<S>(&self, sender: S)
    where
        S: Sender<Item = ()>,
    {
        ScopeToken::spawn(self, sender);
    }

    fn spawn_future<S>(&self, sender: S) -> SpawnFuture<S::Item>
    where
        S: Sender,
        S::Item: Send + 'static,
    {
        ScopeToken::spawn_future(self, sender)
    }
}

/// Sender returned by [`CountingScope::open`].
///
/// Completes with a [`ScopeToken`] once the scope is running, or stopped if
/// close overtakes a parked open.
#[derive(Debug)]
pub struct OpenScope {
    ctx: Arc<ScopeContext>,
}

pub struct OpenScopeOp<R> {
    ctx: Arc<ScopeContext>,
    receiver: R,
}

// === impl OpenScope ===

impl Sender for OpenScope {
    type Item = ScopeToken;

    type Op<R>
        = OpenScopeOp<R>
    where
        R: Receiver<Item = ScopeToken>;

    fn connect<R>(self, receiver: R) -> OpenScopeOp<R>
    where
        R: Receiver<Item = ScopeToken>,
    {
        OpenScopeOp {
            ctx: self.ctx,
            receiver,
        }
    }
}

impl<R> Operation for OpenScopeOp<R>
where
    R: Receiver<Item = ScopeToken>,
{
    fn start(self) {
        let Self { ctx, receiver } = self;
        let mut state = ctx.state.lock().unwrap();
        tracing::trace!(phase = ?state.phase, "scope open started");
        match state.phase {
            Phase::Constructed => {
                state.phase = Phase::Opening;
                let env = receiver.env();
                state.open_waiter = Some(Box::new(move |notify| match notify {
                    OpenNotify::Granted(ctx) => receiver.set_value(ScopeToken { ctx, env }),
                    OpenNotify::Overtaken => receiver.set_stopped(),
                }));
            }
            Phase::Pending | Phase::Running => {
                // run already arrived; hand the token out inline
                state.phase = Phase::Running;
                let env = receiver.env();
                drop(state);
                receiver.set_value(ScopeToken {
                    ctx: ctx.clone(),
                    env,
                });
            }
            Phase::Opening => panic!("open already started on this scope"),
            phase @ (Phase::Closing | Phase::Closed) => {
                panic!("open started on a scope in the {phase:?} phase")
            }
        }
    }
}

/// Sender returned by [`CountingScope::run`].
///
/// Completes after close has completed and the scope has fully shut down.
#[derive(Debug)]
pub struct RunScope {
    ctx: Arc<ScopeContext>,
}

pub struct RunScopeOp<R> {
    ctx: Arc<ScopeContext>,
    receiver: R,
}

// === impl RunScope ===

impl Sender for RunScope {
    type Item = ();

    type Op<R>
        = RunScopeOp<R>
    where
        R: Receiver<Item = ()>;

    fn connect<R>(self, receiver: R) -> RunScopeOp<R>
    where
        R: Receiver<Item = ()>,
    {
        RunScopeOp {
            ctx: self.ctx,
            receiver,
        }
    }
}

impl<R> Operation for RunScopeOp<R>
where
    R: Receiver<Item = ()>,
{
    fn start(self) {
        let Self { ctx, receiver } = self;
        let mut state = ctx.state.lock().unwrap();
        tracing::trace!(phase = ?state.phase, "scope run started");
        assert!(!state.run_started, "run already started on this scope");
        state.run_started = true;
        match state.phase {
            Phase::Constructed => {
                // run won the race; open will find the scope pending
                state.phase = Phase::Pending;
                state.run_waiter = Some(Box::new(move || receiver.set_value(())));
            }
            Phase::Opening => {
                state.phase = Phase::Running;
                state.run_waiter = Some(Box::new(move || receiver.set_value(())));
                let open = state.open_waiter.take();
                drop(state);
                if let Some(open) = open {
                    open(OpenNotify::Granted(ctx.clone()));
                }
            }
            Phase::Closing => {
                // shutdown will deliver once the active count drains
                state.run_waiter = Some(Box::new(move || receiver.set_value(())));
            }
            Phase::Closed => {
                // a close-only lifecycle already shut the scope down
                drop(state);
                receiver.set_value(());
            }
            phase @ (Phase::Pending | Phase::Running) => {
                panic!("scope in the {phase:?} phase without a running run operation")
            }
        }
    }
}

/// Sender returned by [`ScopeToken::close`].
///
/// Completes once the active count has drained to zero and the scope has
/// shut down.
#[derive(Debug)]
pub struct CloseScope {
    ctx: Arc<ScopeContext>,
}

pub struct CloseScopeOp<R> {
    ctx: Arc<ScopeContext>,
    receiver: R,
}

// === impl CloseScope ===

impl Sender for CloseScope {
    type Item = ();

    type Op<R>
        = CloseScopeOp<R>
    where
        R: Receiver<Item = ()>;

    fn connect<R>(self, receiver: R) -> CloseScopeOp<R>
    where
        R: Receiver<Item = ()>,
    {
        CloseScopeOp {
            ctx: self.ctx,
            receiver,
        }
    }
}

impl<R> CloseScopeOp<R>
where
    R: Receiver<Item = ()>,
{
    fn park_and_maybe_shutdown(mut state: MutexGuard<'_, ScopeState>, receiver: R) {
        assert!(
            state.close_waiter.is_none(),
            "close already started on this scope"
        );
        state.close_waiter = Some(Box::new(move || receiver.set_value(())));
        if state.active == 0 {
            ScopeContext::shutdown(state);
        }
    }
}

impl<R> Operation for CloseScopeOp<R>
where
    R: Receiver<Item = ()>,
{
    fn start(self) {
        let Self { ctx, receiver } = self;
        let mut state = ctx.state.lock().unwrap();
        tracing::trace!(phase = ?state.phase, active = state.active, "scope close started");
        match state.phase {
            Phase::Constructed | Phase::Pending | Phase::Opening => {
                state.phase = Phase::Closing;
                let open = state.open_waiter.take();
                if let Some(open) = open {
                    drop(state);
                    open(OpenNotify::Overtaken);
                    state = ctx.state.lock().unwrap();
                }
                Self::park_and_maybe_shutdown(state, receiver);
            }
            Phase::Running => {
                state.phase = Phase::Closing;
                Self::park_and_maybe_shutdown(state, receiver);
            }
            Phase::Closing => panic!("close already started on this scope"),
            Phase::Closed => {
                drop(state);
                receiver.set_value(());
            }
        }
    }
}
