// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::pool::PoolScheduler;
use crate::stop::StopToken;

/// The read-only environment a [`Receiver`] exposes to the operation that
/// completes it.
///
/// Two queries are recognized:
///
/// - the stop-token, consumed by inner operations that support cancellation.
///   The default is the never token, which disables observation.
/// - the scheduler, consulted by algorithms that need a default execution
///   context. The default is no answer.
///
/// Every query returns a concrete value or a well-defined "no answer"; an
/// `Env` is cheap to clone and carries no interior mutability.
///
/// [`Receiver`]: crate::sender::Receiver
#[derive(Clone, Debug, Default)]
pub struct Env {
    stop: StopToken,
    scheduler: Option<PoolScheduler>,
}

// === impl Env ===

impl Env {
    /// An environment answering every query with its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stop-token answered by this environment.
    #[must_use]
    pub fn with_stop_token(mut self, stop: StopToken) -> Self {
        self.stop = stop;
        self
    }

    /// Replaces the scheduler answered by this environment.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: PoolScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn stop_token(&self) -> &StopToken {
        &self.stop
    }

    pub fn scheduler(&self) -> Option<&PoolScheduler> {
        self.scheduler.as_ref()
    }
}
