use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::clock::{OpenTransactions, VersionClock};
use crate::context::{self, PreCommit, RollbackSignal};
use crate::participant::Participant;
use crate::trim;

static CLOCK: VersionClock = VersionClock::new();
static OPEN_TRANSACTIONS: OpenTransactions = OpenTransactions::new();

/// Process-wide commit critical section (§4.5 "Global commit critical
/// section"). Held from write-stamp allocation through `SyncSideEffect`
/// draining, giving commits the total order §5 and §8 invariants 3 and 4
/// require without asking every participant to coordinate one on its own.
static COMMIT_LOCK: Mutex<()> = Mutex::new(());

/// Diagnostic counter, incremented once per attempt (including retries).
/// Not part of the public surface; exists so tests and `tracing` events can
/// report which attempt of a transaction they are looking at.
static ATTEMPT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Entry point for the transactional API. A unit struct rather than a set
/// of free functions so the public surface reads as `Shield::in_transaction`
/// the way the source names it, without needing an instance anywhere.
pub struct Shield;

impl Shield {
    /// Runs `body` atomically against the current thread's transaction
    /// context, retrying on every detected conflict until it commits.
    ///
    /// A call made while a transaction is already active on this thread
    /// joins the outer context (§4.5 "Nesting"): it runs `body` directly
    /// and never enters its own validate/commit/retry loop.
    pub fn in_transaction<R>(body: impl Fn() -> R) -> R {
        if context::is_installed() {
            return body();
        }

        loop {
            let attempt = ATTEMPT_COUNTER.fetch_add(1, Ordering::Relaxed);
            let start_stamp = CLOCK.current();
            context::install(start_stamp);
            OPEN_TRANSACTIONS.register(start_stamp);
            trace!(target: "shielded::txn", attempt, start_stamp, "transaction attempt started");

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let result = body();
                run_pre_commits();
                resolve_commutes();
                result
            }));

            let result = match outcome {
                Ok(result) => result,
                Err(payload) => {
                    rollback_enlisted(None);
                    OPEN_TRANSACTIONS.unregister(start_stamp);
                    context::teardown();
                    if payload.downcast_ref::<RollbackSignal>().is_some() {
                        debug!(target: "shielded::txn", attempt, start_stamp, "rollback requested, retrying");
                        continue;
                    }
                    warn!(target: "shielded::txn", attempt, start_stamp, "transaction body panicked, not retrying");
                    panic::resume_unwind(payload);
                }
            };

            let has_changes = context::with_current("Shield::in_transaction", |ctx| ctx.has_any_changes());
            if !has_changes {
                trace!(target: "shielded::txn", attempt, start_stamp, "read-only transaction, skipping commit phase");
                OPEN_TRANSACTIONS.unregister(start_stamp);
                let ctx = context::teardown();
                run_side_effects(ctx.sync_side_effects);
                run_side_effects(ctx.side_effects);
                return result;
            }

            let (write_stamp, committed) = {
                let _critical_section = COMMIT_LOCK.lock();
                let write_stamp = CLOCK.next_write_stamp();
                let all_valid = context::with_current("Shield::in_transaction", |ctx| {
                    let mut all_valid = true;
                    for participant in &ctx.enlisted {
                        if !participant.can_commit(ctx, write_stamp) {
                            all_valid = false;
                        }
                    }
                    all_valid
                });

                if all_valid {
                    context::with_current("Shield::in_transaction", |ctx| {
                        for participant in &ctx.enlisted {
                            if participant.commit(ctx, write_stamp) {
                                trim::register(participant);
                            }
                        }
                        let sync_fx = std::mem::take(&mut ctx.sync_side_effects);
                        for fx in sync_fx {
                            fx();
                        }
                    });
                }
                (write_stamp, all_valid)
            };

            if committed {
                debug!(target: "shielded::txn", attempt, start_stamp, write_stamp, "transaction committed");
                OPEN_TRANSACTIONS.unregister(start_stamp);
                let ctx = context::teardown();
                run_side_effects(ctx.side_effects);
                trim::trim_all(OPEN_TRANSACTIONS.min_open(&CLOCK));
                return result;
            }

            trace!(target: "shielded::txn", attempt, start_stamp, write_stamp, "conflict detected, rolling back and retrying");
            rollback_enlisted(Some(write_stamp));
            OPEN_TRANSACTIONS.unregister(start_stamp);
            context::teardown();
        }
    }

    /// True iff a transaction is active on the current thread.
    pub fn is_in_transaction() -> bool {
        context::is_installed()
    }

    /// The current transaction's start stamp. Fails loudly if none is
    /// active on this thread.
    pub fn current_transaction_start_stamp() -> u64 {
        context::with_current("Shield::current_transaction_start_stamp", |ctx| ctx.start_stamp)
    }

    /// Registers `participant` with the current transaction.
    pub fn enlist(participant: std::sync::Arc<dyn Participant>) {
        context::with_current_for_shield("Shield::enlist", |ctx| ctx.enlist(participant));
    }

    /// Installs a pre-commit hook valid for the current transaction attempt
    /// (§4.6). `predicate` is evaluated once, after the body returns; if it
    /// is true, `action` runs in the same pass, with the transaction's
    /// buffered writes already visible to both.
    pub fn pre_commit(
        predicate: impl Fn() -> bool + Send + 'static,
        action: impl Fn() + Send + 'static,
    ) {
        context::with_current_for_shield("Shield::pre_commit", |ctx| {
            ctx.pre_commits.push(PreCommit {
                predicate: Box::new(predicate),
                action: Box::new(action),
            });
        });
    }

    /// Enqueues `fx` to run once, after a successful commit, with no
    /// ordering guarantee relative to other threads' side effects.
    pub fn side_effect(fx: impl FnOnce() + Send + 'static) {
        context::with_current_for_shield("Shield::side_effect", |ctx| {
            ctx.side_effects.push(Box::new(fx));
        });
    }

    /// Enqueues `fx` to run once, after a successful commit but before the
    /// commit critical section is released, so its relative order across
    /// threads equals commit order (§5, §8 invariant 4).
    pub fn sync_side_effect(fx: impl FnOnce() + Send + 'static) {
        context::with_current_for_shield("Shield::sync_side_effect", |ctx| {
            ctx.sync_side_effects.push(Box::new(fx));
        });
    }

    /// Aborts the current attempt; the runner rolls back every enlisted
    /// participant and retries. Never returns.
    pub fn rollback() -> ! {
        context::with_current_for_shield("Shield::rollback", |_ctx| ());
        panic::panic_any(RollbackSignal)
    }
}

/// Drains `ctx.pre_commits` in FIFO order, evaluating each predicate and,
/// if it fires, its action, outside the context borrow so the closures
/// are free to read and write participants (which re-enter the thread
/// local) without a re-entrant borrow panic.
fn run_pre_commits() {
    loop {
        let next = context::with_current("Shield::in_transaction pre-commit sweep", |ctx| {
            if ctx.pre_commits.is_empty() {
                None
            } else {
                Some(ctx.pre_commits.remove(0))
            }
        });
        match next {
            Some(pre_commit) => {
                if (pre_commit.predicate)() {
                    (pre_commit.action)();
                }
            }
            None => break,
        }
    }
}

/// Drains `ctx.commutes` in FIFO order, resolving each either inline
/// (degenerate case, when its participant was already read) or eagerly
/// via its own sub-transaction (§4.6).
fn resolve_commutes() {
    loop {
        let next = context::with_current("Shield::in_transaction commute resolution", |ctx| {
            if ctx.commutes.is_empty() {
                return None;
            }
            let entry = ctx.commutes.remove(0);
            let already_read = ctx
                .local
                .borrow()
                .get(&entry.participant_id)
                .map(|local| local.is_read())
                .unwrap_or(false);
            Some((entry, already_read))
        });
        match next {
            Some((entry, already_read)) => (entry.resolve)(already_read),
            None => break,
        }
    }
}

/// Calls `rollback(ctx, write_stamp)` on every participant enlisted by the
/// current attempt, in enlistment order.
fn rollback_enlisted(write_stamp: Option<u64>) {
    context::with_current("Shield::in_transaction rollback", |ctx| {
        for participant in &ctx.enlisted {
            participant.rollback(ctx, write_stamp);
        }
    });
}

fn run_side_effects(effects: Vec<Box<dyn FnOnce() + Send>>) {
    for fx in effects {
        fx();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Shielded;
    use crate::tests_support::run_concurrently;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn read_only_transaction_skips_commit_phase() {
        let cell = Shielded::new(1i64);
        let before = CLOCK.current();
        Shield::in_transaction(|| {
            let _ = cell.read();
        });
        assert_eq!(CLOCK.current(), before);
    }

    #[test]
    fn explicit_rollback_retries_until_condition_holds() {
        let attempts = AtomicUsize::new(0);
        let cell = Shielded::new(0i64);
        Shield::in_transaction(|| {
            let count = attempts.fetch_add(1, Ordering::Relaxed);
            if count < 2 {
                Shield::rollback();
            }
            cell.assign(count as i64);
        });
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
        assert_eq!(cell.read(), 2);
    }

    #[test]
    #[should_panic(expected = "continuation already completed")]
    fn rollback_outside_a_transaction_fails_as_a_continuation_error() {
        Shield::rollback();
    }

    #[test]
    #[should_panic]
    fn user_panic_propagates_without_retry() {
        let cell = Shielded::new(0i64);
        Shield::in_transaction(|| {
            cell.assign(1);
            panic!("boom");
        });
    }

    #[test]
    fn user_panic_rolls_back_pending_writes() {
        let cell = Shielded::new(0i64);
        let _ = panic::catch_unwind(AssertUnwindSafe(|| {
            Shield::in_transaction(|| {
                cell.assign(99);
                panic!("boom");
            });
        }));
        assert_eq!(cell.read(), 0);
    }

    #[test]
    fn nested_in_transaction_joins_the_outer_context() {
        let cell = Shielded::new(0i64);
        Shield::in_transaction(|| {
            Shield::in_transaction(|| {
                cell.assign(7);
            });
            assert_eq!(cell.read(), 7);
        });
        assert_eq!(cell.read(), 7);
    }

    #[test]
    fn pre_commit_rolls_back_when_predicate_fires() {
        // The predicate is keyed off a budget that strictly counts down
        // every attempt (rather than off the cell's own value), so the
        // retry loop is guaranteed to terminate regardless of what the
        // transaction body does.
        let attempts = Arc::new(AtomicUsize::new(0));
        let cell = Shielded::new(0i64);
        let attempts_in_body = attempts.clone();
        Shield::in_transaction(|| {
            let seen = attempts_in_body.fetch_add(1, Ordering::Relaxed);
            cell.assign(seen as i64 + 1);
            let attempts_in_predicate = attempts_in_body.clone();
            Shield::pre_commit(
                move || attempts_in_predicate.load(Ordering::Relaxed) < 3,
                || Shield::rollback(),
            );
        });
        assert!(attempts.load(Ordering::Relaxed) >= 3);
    }

    #[test]
    fn side_effect_runs_once_after_commit() {
        let cell = Shielded::new(0i64);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        Shield::in_transaction(|| {
            cell.assign(1);
            let fired = fired_clone.clone();
            Shield::side_effect(move || {
                fired.fetch_add(1, Ordering::Relaxed);
            });
        });
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn sync_side_effect_sees_committed_value_before_lock_release() {
        let cell = Shielded::new(0i64);
        Shield::in_transaction(|| {
            cell.assign(10);
            let cell = cell.clone();
            Shield::sync_side_effect(move || {
                assert_eq!(cell.read(), 10);
            });
        });
    }

    #[test]
    fn sync_side_effects_are_ordered_by_commit_order() {
        let cell = Shielded::new(0i64);
        let log: Arc<StdMutex<Vec<i64>>> = Arc::new(StdMutex::new(Vec::new()));
        run_concurrently(64, |_| {
            let log = log.clone();
            Shield::in_transaction(|| {
                let old = cell.read();
                cell.assign(old + 1);
                let log = log.clone();
                Shield::sync_side_effect(move || {
                    log.lock().unwrap().push(old);
                });
            });
        });
        let mut recorded = log.lock().unwrap().clone();
        recorded.sort_unstable();
        let expected: Vec<i64> = (0..64).collect();
        assert_eq!(recorded, expected);
        assert_eq!(cell.read(), 64);
    }

    #[test]
    fn concurrent_counter_increments_land_exactly_n_times() {
        let cell = Shielded::new(0i64);
        run_concurrently(200, |_| {
            Shield::in_transaction(|| {
                let current = cell.read();
                cell.assign(current + 1);
            });
        });
        assert_eq!(cell.read(), 200);
    }

    #[test]
    fn commute_does_not_conflict_with_concurrent_commutes() {
        let cell = Shielded::new(0i64);
        run_concurrently(200, |_| {
            Shield::in_transaction(|| {
                cell.commute(|v| v + 1);
            });
        });
        assert_eq!(cell.read(), 200);
    }

    #[test]
    fn commute_degenerates_when_cell_already_read_by_pre_commit() {
        let test_field = Shielded::new(0i64);
        let effect_field = Shielded::new(0i64);

        run_concurrently(2, |which| {
            if which == 0 {
                for _ in 0..200 {
                    Shield::in_transaction(|| {
                        let effect_for_predicate = effect_field.clone();
                        let test_for_action = test_field.clone();
                        Shield::pre_commit(
                            move || effect_for_predicate.read() > 0,
                            move || {
                                assert_eq!(test_for_action.read() % 2, 0);
                            },
                        );
                        if test_field.read() % 2 == 0 {
                            effect_field.commute(|v| v + 1);
                        }
                    });
                }
            } else {
                for _ in 0..200 {
                    Shield::in_transaction(|| {
                        test_field.modify(|v| v + 1);
                    });
                }
            }
        });
    }
}
