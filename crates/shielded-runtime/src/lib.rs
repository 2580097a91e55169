//! Optimistic-concurrency software transactional memory.
//!
//! Application code wraps reads and writes of [`Shielded`] cells and
//! [`ShieldedDict`] maps in [`Shield::in_transaction`]. The runner gives the
//! body snapshot isolation against a process-wide version clock and retries
//! it transparently whenever a concurrent commit would otherwise violate
//! that isolation.
//!
//! ```
//! use shielded_runtime::{Shield, Shielded};
//!
//! let counter = Shielded::new(0i64);
//! Shield::in_transaction(|| {
//!     let current = counter.read();
//!     counter.assign(current + 1);
//! });
//! assert_eq!(counter.read(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cell;
mod clock;
mod context;
mod dict;
mod participant;
mod runner;
mod spin;
mod trim;

pub use cell::Shielded;
pub use dict::ShieldedDict;
pub use participant::Participant;
pub use runner::Shield;

#[cfg(test)]
mod tests_support;
