// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// A slot that delays construction of a resource until its stable address is
/// known.
///
/// A `Deferred` stores the constructor (with its captured arguments) and may
/// be moved freely until [`materialize`] is called. Materialization runs the
/// constructor exactly once into a heap slot whose address never changes
/// afterwards, which is what lets senders derived from the resource hold on
/// to it for the life of the enclosing expression.
///
/// Materializing twice, or reading the value before materialization, is a
/// contract violation and panics.
///
/// [`materialize`]: Self::materialize
pub struct Deferred<T> {
    ctor: Option<Box<dyn FnOnce() -> T + Send>>,
    value: Option<Box<T>>,
}

// === impl Deferred ===

impl<T> Deferred<T> {
    pub fn new(ctor: impl FnOnce() -> T + Send + 'static) -> Self {
        Self {
            ctor: Some(Box::new(ctor)),
            value: None,
        }
    }

    /// Constructs the value in place.
    ///
    /// # Panics
    ///
    /// Panics if the value was already constructed.
    pub fn materialize(&mut self) {
        let ctor = self
            .ctor
            .take()
            .expect("deferred resource already constructed");
        self.value = Some(Box::new(ctor()));
    }

    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.value.is_some()
    }

    /// Returns the constructed value.
    ///
    /// # Panics
    ///
    /// Panics if [`materialize`](Self::materialize) has not been called.
    pub fn get(&self) -> &T {
        self.value
            .as_deref()
            .expect("deferred resource not constructed yet")
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("materialized", &self.is_materialized())
            .finish()
    }
}
