// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sender::{Operation, Receiver, Sender};

/// Returns a sender that completes inline with `value` when started.
pub fn just<T>(value: T) -> Just<T> {
    Just { value }
}

/// Sender returned by [`just`].
#[derive(Debug)]
pub struct Just<T> {
    value: T,
}

/// Operation returned by connecting a [`Just`].
pub struct JustOp<T, R> {
    value: T,
    receiver: R,
}

// === impl Just ===

impl<T: 'static> Sender for Just<T> {
    type Item = T;

    type Op<R>
        = JustOp<T, R>
    where
        R: Receiver<Item = T>;

    fn connect<R>(self, receiver: R) -> JustOp<T, R>
    where
        R: Receiver<Item = T>,
    {
        JustOp {
            value: self.value,
            receiver,
        }
    }
}

impl<T: 'static, R> Operation for JustOp<T, R>
where
    R: Receiver<Item = T>,
{
    fn start(self) {
        self.receiver.set_value(self.value);
    }
}
