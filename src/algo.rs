// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The minimal sender combinators the rest of the crate composes with.
//!
//! This is deliberately not a full combinator algebra; it is only the set of
//! collaborators the resource and scope layers need to be usable on their
//! own: an immediate value, a value-channel map, and a blocking driver.

mod just;
mod sync_wait;
mod then;

pub use just::{Just, just};
pub use sync_wait::sync_wait;
pub use then::{Then, then};
