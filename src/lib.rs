//! # Shielded
//!
//! Optimistic-concurrency software transactional memory for ordinary Rust
//! values — snapshot isolation over a process-wide version clock, with
//! automatic retry on conflict.
//!
//! Wrap shared state in a [`Shielded`] cell or a [`ShieldedDict`] map, then
//! read and write it only from inside [`Shield::in_transaction`]. The
//! runner samples a start stamp when the transaction begins, buffers every
//! write locally, and validates the whole read/write set against the
//! committed world at commit time; a conflict rolls the attempt back and
//! retries it from the top, so application code never sees a torn read or
//! a lost update.
//!
//! # Quick Start
//!
//! ```
//! use shielded::{Shield, Shielded};
//!
//! let balance = Shielded::new(100i64);
//!
//! Shield::in_transaction(|| {
//!     let current = balance.read();
//!     balance.assign(current - 25);
//! });
//!
//! assert_eq!(balance.read(), 75);
//! ```
//!
//! # Primitives
//!
//! | Primitive | Purpose | Key Methods |
//! |-----------|---------|-------------|
//! | **Shield** | Transaction boundary and commit protocol | `in_transaction`, `pre_commit`, `side_effect`, `sync_side_effect`, `rollback` |
//! | **Shielded\<T\>** | Single-variable MVCC register | `read`, `assign`, `modify`, `commute` |
//! | **ShieldedDict\<K, V\>** | Keyed MVCC map, one version chain per key | `get`, `set`, `remove`, `get_or_default` |
//!
//! # Architecture
//!
//! [`Shield`] is the only entry point application code calls directly.
//! Everything else — the version clock, the per-thread transaction
//! context, the `Participant` contract cells and dictionaries implement,
//! and the trimming of version chains no open transaction can still see —
//! lives in `shielded-runtime` and is not exposed here beyond the types
//! re-exported below. Errors surfaced to callers (misuse of the API
//! outside a transaction, or an internal protocol violation) are defined
//! in `shielded-core` independently of the engine, so they can be matched
//! on without pulling in the concurrency runtime itself.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use shielded_core::{Error, Result};
pub use shielded_runtime::{Participant, Shield, Shielded, ShieldedDict};
