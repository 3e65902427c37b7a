// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::BoxError;
use crate::sender::{Operation, Outcome, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};

/// Drives `sender` to completion, blocking the calling thread.
///
/// Returns `Ok(Some(value))` for a value completion, `Ok(None)` for stopped,
/// and the error for an error completion. The receiver handed to the sender
/// answers every environment query with its default.
pub fn sync_wait<S>(sender: S) -> Result<Option<S::Item>, BoxError>
where
    S: Sender,
    S::Item: Send + 'static,
{
    let slot = Arc::new(WaitSlot {
        outcome: Mutex::new(None),
        wake: Condvar::new(),
    });

    sender.connect(SyncWaitReceiver { slot: slot.clone() }).start();

    let mut outcome = slot.outcome.lock().unwrap();
    while outcome.is_none() {
        outcome = slot.wake.wait(outcome).unwrap();
    }

    match outcome.take().unwrap() {
        Outcome::Value(value) => Ok(Some(value)),
        Outcome::Stopped => Ok(None),
        Outcome::Error(error) => Err(error),
    }
}

struct WaitSlot<T> {
    outcome: Mutex<Option<Outcome<T>>>,
    wake: Condvar,
}

struct SyncWaitReceiver<T> {
    slot: Arc<WaitSlot<T>>,
}

// === impl SyncWaitReceiver ===

impl<T> SyncWaitReceiver<T> {
    fn finish(self, outcome: Outcome<T>) {
        *self.slot.outcome.lock().unwrap() = Some(outcome);
        self.slot.wake.notify_one();
    }
}

impl<T: Send + 'static> Receiver for SyncWaitReceiver<T> {
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
}
