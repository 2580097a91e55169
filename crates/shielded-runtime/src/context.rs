use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::participant::Participant;

/// Per-participant local state, type-erased so [`Context`] does not need to
/// know about `Shielded<T>`/`ShieldedDict<K, V>` generics.
///
/// Implemented by `CellLocal<T>` and `DictLocal<K, V>` in their owning
/// modules. `is_read` is used only by commute-degeneracy detection (§4.6):
/// it answers "has this participant already been read by this attempt?"
/// without the caller needing to know its concrete type.
pub(crate) trait LocalMarker: Send {
    fn is_read(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// A `(predicate, action)` pair installed via `Shield::pre_commit`.
pub(crate) struct PreCommit {
    pub(crate) predicate: Box<dyn Fn() -> bool + Send>,
    pub(crate) action: Box<dyn Fn() + Send>,
}

/// A deferred commute, queued via `Shielded::commute`.
///
/// `resolve` is invoked once, during commute resolution (§4.6), with
/// whether the target participant was already read by this attempt. The
/// closure is built by the cell itself, so it alone decides what "already
/// read" means for its own degenerate vs. eager-lock resolution.
pub(crate) struct CommuteEntry {
    pub(crate) participant_id: u64,
    pub(crate) resolve: Box<dyn FnOnce(bool) + Send>,
}

/// Per-thread transaction state. Reached only through `thread_local!`
/// storage (see the free functions below); never handed to application
/// code directly.
pub(crate) struct Context {
    pub(crate) start_stamp: u64,
    pub(crate) enlisted: Vec<Arc<dyn Participant>>,
    enlisted_ids: HashSet<u64>,
    pub(crate) pre_commits: Vec<PreCommit>,
    pub(crate) commutes: Vec<CommuteEntry>,
    pub(crate) side_effects: Vec<Box<dyn FnOnce() + Send>>,
    pub(crate) sync_side_effects: Vec<Box<dyn FnOnce() + Send>>,
    /// `RefCell` so participants can mutate their own slot through the
    /// shared `&Context` the `Participant` contract hands them.
    pub(crate) local: RefCell<HashMap<u64, Box<dyn LocalMarker>>>,
}

impl Context {
    pub(crate) fn new(start_stamp: u64) -> Self {
        Context {
            start_stamp,
            enlisted: Vec::new(),
            enlisted_ids: HashSet::new(),
            pre_commits: Vec::new(),
            commutes: Vec::new(),
            side_effects: Vec::new(),
            sync_side_effects: Vec::new(),
            local: RefCell::new(HashMap::new()),
        }
    }

    /// Registers `participant` with this transaction, deduplicating by id.
    pub(crate) fn enlist(&mut self, participant: Arc<dyn Participant>) {
        if self.enlisted_ids.insert(participant.id()) {
            self.enlisted.push(participant);
        }
    }

    /// True iff any enlisted participant has a pending write.
    pub(crate) fn has_any_changes(&self) -> bool {
        self.enlisted.iter().any(|p| p.has_changes(self))
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Zero-sized marker unwound via `panic_any` to implement `Shield::rollback`
/// and the runner's own internal transient-conflict retries. Never allowed
/// to escape `in_transaction`.
pub(crate) struct RollbackSignal;

/// Installs a fresh context for a new attempt. Panics if one is already
/// installed; callers must check `is_installed()` first (flat nesting joins
/// instead of calling this again).
pub(crate) fn install(start_stamp: u64) {
    CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        assert!(slot.is_none(), "shielded: context already installed");
        *slot = Some(Context::new(start_stamp));
    });
}

/// Removes and returns the current thread's context. Panics if none is
/// installed.
pub(crate) fn teardown() -> Context {
    CONTEXT.with(|cell| {
        cell.borrow_mut()
            .take()
            .expect("shielded: no context to tear down")
    })
}

/// True iff a transaction context is installed on this thread.
pub(crate) fn is_installed() -> bool {
    CONTEXT.with(|cell| cell.borrow().is_some())
}

/// Runs `f` with mutable access to the current context, panicking with
/// `Error::not_in_transaction(op)` if none is installed.
pub(crate) fn with_current<R>(op: &'static str, f: impl FnOnce(&mut Context) -> R) -> R {
    CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        match slot.as_mut() {
            Some(ctx) => f(ctx),
            None => panic!("{}", shielded_core::Error::not_in_transaction(op)),
        }
    })
}

/// Runs `f` with mutable access to the current context, or returns `None`
/// if no transaction is active. Used by operations that behave differently
/// outside a transaction rather than failing loudly (cell/dict reads).
pub(crate) fn try_with_current<R>(f: impl FnOnce(&mut Context) -> R) -> Option<R> {
    CONTEXT.with(|cell| cell.borrow_mut().as_mut().map(f))
}

/// Like [`with_current`], but for the `Shield::enlist`/`pre_commit`/
/// `side_effect`/`sync_side_effect`/`rollback` family: calling any of these
/// with no active context is a continuation that already finished on this
/// thread, not a bare "you forgot to open a transaction" (§7 distinguishes
/// the two), so the panic carries `Error::ContinuationCompleted` instead.
pub(crate) fn with_current_for_shield<R>(op: &'static str, f: impl FnOnce(&mut Context) -> R) -> R {
    CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        match slot.as_mut() {
            Some(ctx) => f(ctx),
            None => panic!("{}", shielded_core::Error::continuation_completed(op)),
        }
    })
}
