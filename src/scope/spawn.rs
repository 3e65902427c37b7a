// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::env::Env;
use crate::error::BoxError;
use crate::scope::nest::Nest;
use crate::scope::ScopeToken;
use crate::sender::{Operation, Receiver, Sender};

/// Wraps `sender` in the scope's tracking and starts it eagerly.
///
/// The started operation owns itself: its state survives inside whatever the
/// inner sender parks until the completion arrives, and the completion is
/// discarded. Spawned work inherits the token's environment, so it observes
/// the token's stop-token and scheduler.
pub(super) fn spawn<S>(token: &ScopeToken, sender: S)
where
    S: Sender<Item = ()>,
{
    let nested = Nest::new(token.context().clone(), sender, true);
    nested
        .connect(SpawnReceiver {
            env: token.env().clone(),
        })
        .start();
}

/// Discards value and stopped completions of spawned work.
///
/// Spawn is contracted not to accept senders that can fail; an error
/// completion arriving here is a bug in the caller and terminates.
struct SpawnReceiver {
    env: Env,
}

// === impl SpawnReceiver ===

impl Receiver for SpawnReceiver {
    type Item = ();

    fn set_value(self, (): ()) {}

    fn set_error(self, error: BoxError) {
        panic!("sender spawned on a scope completed with an error: {error}");
    }

    fn set_stopped(self) {}

    fn env(&self) -> Env {
        self.env.clone()
    }
}

#[cfg(test)]
mod tests {
    use crate::algo::just;
    use crate::resource::ResourceToken;
    use crate::scope::CountingScope;
    use crate::sender::{Operation, Sender};
    use crate::test_util::running_scope;

    #[test]
    fn spawned_value_is_discarded_and_accounted() {
        let scope = CountingScope::new();
        let (token, log) = running_scope(&scope);

        // completes inline; the active count returns to zero immediately
        token.spawn(just(()));

        token.close().connect(log.expect_value("close")).start();
        assert_eq!(log.take(), ["close", "run"]);
    }
}
