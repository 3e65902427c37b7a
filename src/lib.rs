// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Structured-concurrency primitives built on a sender/receiver model.
//!
//! A [`Sender`] is a lazy description of an asynchronous computation;
//! connecting it to a [`Receiver`] and starting the resulting operation runs
//! it until exactly one of *value*, *error* or *stopped* is delivered. On top
//! of that model this crate provides
//!
//! - the async [resource protocol](resource) (open → run → close),
//! - [`CountingScope`](scope::CountingScope), a scope that bounds the
//!   lifetime of dynamically spawned work,
//! - [`TimeResource`](time::TimeResource), a timed-queue scheduler resource
//!   driven by its own thread,
//! - [`use_resources`](resource::use_resources()), which composes deferred
//!   resources and a user body into one sender.

mod error;

pub mod algo;
pub mod env;
pub mod pool;
pub mod resource;
pub mod scope;
pub mod sender;
pub mod stop;
pub mod time;

#[cfg(test)]
mod test_util;

pub use error::{BoxError, CloseError, PhaseViolation};
pub use sender::{CallbackReceiver, Operation, Outcome, Receiver, Scheduler, Sender};
