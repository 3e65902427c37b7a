// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The async-resource protocol: open, run, close.
//!
//! A resource exposes three operations, each yielding a sender:
//!
//! - [`open`] completes with a [`token`], a cheaply clonable handle to the
//!   running resource. It may park until [`run`] has been started; both
//!   orderings of the open/run race reach the same running state.
//! - [`run`] starts the resource's own asynchronous work (threads, timers,
//!   scope bookkeeping) and completes only after a close sender derived from
//!   the token has been started and all shutdown has finished.
//! - [`close`][ResourceToken::close] triggers shutdown and completes when
//!   shutdown is complete. Close always completes before run.
//!
//! [`use_resources`] ties the three together for one or more resources and a
//! user body; [`Deferred`] supplies the stable construction slot resources
//! require.
//!
//! [`open`]: Resource::open
//! [`run`]: Resource::run
//! [`token`]: Resource::Token
//! [`use_resources`]: use_resources()

mod deferred;
mod use_resources;

use crate::sender::Sender;

pub use deferred::Deferred;
pub use use_resources::{ResourceSet, UseResources, use_resources};

/// An asynchronous resource with an open/run/close lifecycle.
pub trait Resource {
    type Token: ResourceToken;

    type OpenSender: Sender<Item = Self::Token>;
    type RunSender: Sender<Item = ()>;

    /// A sender that completes with this resource's token once the resource
    /// is running.
    fn open(&self) -> Self::OpenSender;

    /// A sender that runs the resource's asynchronous work until shutdown
    /// has finished.
    fn run(&self) -> Self::RunSender;
}

/// Handle obtained by opening a [`Resource`].
///
/// The token is valid until the first close sender derived from it is
/// started.
pub trait ResourceToken: Clone + Send + 'static {
    type CloseSender: Sender<Item = ()>;

    /// A sender that triggers shutdown and completes when shutdown is
    /// complete.
    fn close(&self) -> Self::CloseSender;
}
