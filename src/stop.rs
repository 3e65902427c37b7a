// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback = Box<dyn FnOnce() + Send>;

/// Shared stop state with one-shot callback registration.
///
/// A `StopSource` hands out [`StopToken`]s that observe it. Calling
/// [`request_stop`] flips the source into the stopped state exactly once and
/// runs every callback registered through [`StopToken::on_stop`]. Dropping a
/// `StopSource` does *not* request stop; work attached to the source keeps
/// running.
///
/// [`request_stop`]: Self::request_stop
#[derive(Clone)]
pub struct StopSource {
    inner: Arc<Inner>,
}

/// Observer half of a [`StopSource`].
///
/// The default token is the *never* token: it reports no stop, accepts no
/// callbacks, and thereby disables cancellation observation entirely.
#[derive(Clone, Default)]
pub struct StopToken {
    inner: Option<Arc<Inner>>,
}

/// Guard for a callback registered with [`StopToken::on_stop`].
///
/// Dropping the registration deregisters the callback if it has not run yet.
#[must_use = "dropping the registration deregisters the callback"]
pub struct StopRegistration {
    inner: Weak<Inner>,
    id: u64,
}

struct Inner {
    stopped: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

// === impl StopSource ===

impl StopSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                stopped: AtomicBool::new(false),
                callbacks: Mutex::new(Callbacks::default()),
            }),
        }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> StopToken {
        StopToken {
            inner: Some(self.inner.clone()),
        }
    }

    /// Returns `true` if stop has been requested on this source.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Moves the source into the stopped state and runs all registered
    /// callbacks.
    ///
    /// Returns `true` for the call that performed the transition; concurrent
    /// and subsequent calls return `false` and run nothing.
    pub fn request_stop(&self) -> bool {
        let callbacks = {
            let mut callbacks = self.inner.callbacks.lock().unwrap();
            if self.inner.stopped.swap(true, Ordering::AcqRel) {
                return false;
            }
            core::mem::take(&mut callbacks.entries)
        };

        tracing::trace!(count = callbacks.len(), "stop requested, running callbacks");
        for (_, callback) in callbacks {
            callback();
        }
        true
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StopSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSource")
            .field("stopped", &self.stop_requested())
            .finish_non_exhaustive()
    }
}

// === impl StopToken ===

impl StopToken {
    /// The token that never reports a stop.
    #[must_use]
    pub fn never() -> Self {
        Self { inner: None }
    }

    /// Returns `true` if the observed source has been stopped. Always `false`
    /// for the never token.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.stopped.load(Ordering::Acquire))
    }

    /// Registers `callback` to run when stop is requested.
    ///
    /// If stop was already requested the callback runs inline, on the calling
    /// thread, before this method returns. On the never token the callback is
    /// dropped without running. Either way the returned registration is inert.
    pub fn on_stop(&self, callback: impl FnOnce() + Send + 'static) -> StopRegistration {
        let Some(inner) = self.inner.as_ref() else {
            return StopRegistration::inert();
        };

        let id = {
            let mut callbacks = inner.callbacks.lock().unwrap();
            if inner.stopped.load(Ordering::Acquire) {
                drop(callbacks);
                callback();
                return StopRegistration::inert();
            }
            let id = callbacks.next_id;
            callbacks.next_id += 1;
            callbacks.entries.push((id, Box::new(callback)));
            id
        };

        StopRegistration {
            inner: Arc::downgrade(inner),
            id,
        }
    }
}

impl fmt::Debug for StopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopToken")
            .field("never", &self.inner.is_none())
            .field("stopped", &self.stop_requested())
            .finish()
    }
}

// === impl StopRegistration ===

impl StopRegistration {
    fn inert() -> Self {
        Self {
            inner: Weak::new(),
            id: 0,
        }
    }
}

impl Drop for StopRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut callbacks = inner.callbacks.lock().unwrap();
            callbacks.entries.retain(|(id, _)| *id != self.id);
        }
    }
}

impl fmt::Debug for StopRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopRegistration")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn callback_runs_on_stop() {
        let source = StopSource::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _reg = source.token().on_stop({
            let hits = hits.clone();
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(source.request_stop());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // the transition happens once
        assert!(!source.request_stop());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_after_stop_runs_inline() {
        let source = StopSource::new();
        source.request_stop();

        let hits = Arc::new(AtomicUsize::new(0));
        let _reg = source.token().on_stop({
            let hits = hits.clone();
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_registration_deregisters() {
        let source = StopSource::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let reg = source.token().on_stop({
            let hits = hits.clone();
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });
        drop(reg);

        source.request_stop();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn never_token_observes_nothing() {
        let token = StopToken::never();
        assert!(!token.stop_requested());
        let _reg = token.on_stop(|| panic!("never token must not run callbacks"));
    }

    #[test]
    fn token_reports_stop() {
        let source = StopSource::new();
        let token = source.token();
        assert!(!token.stop_requested());
        source.request_stop();
        assert!(token.stop_requested());
    }
}
