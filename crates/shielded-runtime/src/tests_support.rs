//! Shared helpers for the concurrency-scenario unit tests scattered across
//! this crate's modules. Not part of the public API; compiled only under
//! `#[cfg(test)]`.

use std::thread;

/// Spawns `n` real OS threads, each running `f(i)` for its own `i` in
/// `0..n`, and blocks until every one of them has returned. Used wherever a
/// test needs genuine cross-thread contention rather than sequential calls
/// standing in for it.
pub(crate) fn run_concurrently<F>(n: usize, f: F)
where
    F: Fn(usize) + Send + Sync,
{
    thread::scope(|scope| {
        for i in 0..n {
            scope.spawn(|| f(i));
        }
    });
}
