use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;

use crate::context::{self, CommuteEntry, Context, LocalMarker};
use crate::participant::{self, Participant};
use crate::spin::SpinWait;

/// A write-stamp lock value a commute sub-transaction holds instead of a
/// real write stamp, reserved until the main commit allocates one. Clock
/// values never reach `u64::MAX` in any run this runtime could complete.
const COMMUTE_LOCK: u64 = u64::MAX;

struct Node<T> {
    version: u64,
    value: T,
    older: ArcSwapOption<Node<T>>,
}

#[derive(Default)]
struct CellLocal<T> {
    read: bool,
    write: Option<T>,
    commute_locked: bool,
}

impl<T: Send + 'static> LocalMarker for CellLocal<T> {
    fn is_read(&self) -> bool {
        self.read
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// A single-variable MVCC register.
///
/// Always held behind an `Arc` (returned directly by [`Shielded::new`]) so
/// that reads and writes performed through any clone enlist the same
/// underlying participant.
pub struct Shielded<T> {
    id: u64,
    head: ArcSwapOption<Node<T>>,
    write_stamp: AtomicU64,
    self_ref: Weak<Shielded<T>>,
}

impl<T: Clone + Default + Send + Sync + 'static> Shielded<T> {
    /// Creates a new cell with an initial committed value at version `0`,
    /// which every transaction can always see.
    pub fn new(value: T) -> Arc<Self> {
        Arc::new_cyclic(|weak| Shielded {
            id: participant::next_participant_id(),
            head: ArcSwapOption::from_pointee(Node {
                version: 0,
                value,
                older: ArcSwapOption::from(None),
            }),
            write_stamp: AtomicU64::new(0),
            self_ref: weak.clone(),
        })
    }

    /// Reads the cell. Outside a transaction this is the latest committed
    /// value; inside, it is the value visible as of the transaction's start
    /// stamp, or the value this transaction already buffered for this cell.
    pub fn read(&self) -> T {
        match context::try_with_current(|ctx| self.read_in_transaction(ctx)) {
            Some(value) => value,
            None => self.current_head_value(),
        }
    }

    /// Buffers `value` as this transaction's pending write. Disallowed
    /// outside a transaction.
    pub fn assign(&self, value: T) {
        context::with_current("Shielded::assign", |ctx| {
            self.check_lock_and_enlist(ctx);
            self.store_local_write(ctx, value);
        });
    }

    /// Reads the current value (respecting any local buffered write) and
    /// assigns `f` applied to it. Ordinary, non-commutative update.
    pub fn modify(&self, f: impl FnOnce(T) -> T) {
        let current = self.read();
        self.assign(f(current));
    }

    /// Queues a commutative update: `f` is applied to the latest committed
    /// value at commit-resolution time rather than to this transaction's
    /// snapshot, so concurrent commutes on the same cell do not conflict
    /// with each other (§4.3, §4.6) — unless this cell has already been
    /// read by this attempt, in which case the commute degenerates into an
    /// ordinary `modify`.
    pub fn commute(&self, f: impl FnOnce(T) -> T + Send + 'static)
    where
        T: 'static,
    {
        context::with_current("Shielded::commute", |ctx| {
            let cell: Arc<Shielded<T>> =
                self.self_ref.upgrade().expect("shielded cell dropped");
            ctx.commutes.push(CommuteEntry {
                participant_id: self.id,
                resolve: Box::new(move |already_read| {
                    if already_read {
                        let current = cell.read();
                        cell.assign(f(current));
                    } else {
                        cell.resolve_commute_eagerly(f);
                    }
                }),
            });
        });
    }

    fn read_in_transaction(&self, ctx: &mut Context) -> T {
        self.check_lock_and_enlist(ctx);
        let mut local = ctx.local.borrow_mut();
        let entry = local
            .entry(self.id)
            .or_insert_with(|| Box::new(CellLocal::<T>::default()));
        let typed = entry.as_any_mut().downcast_mut::<CellLocal<T>>().unwrap();
        if let Some(buffered) = &typed.write {
            return buffered.clone();
        }
        typed.read = true;
        drop(local);
        self.visible_value(ctx.start_stamp)
    }

    fn store_local_write(&self, ctx: &mut Context, value: T) {
        let mut local = ctx.local.borrow_mut();
        let entry = local
            .entry(self.id)
            .or_insert_with(|| Box::new(CellLocal::<T>::default()));
        let typed = entry.as_any_mut().downcast_mut::<CellLocal<T>>().unwrap();
        typed.write = Some(value);
    }

    /// Spins while a conflicting writer ordered before us holds the lock,
    /// then enlists this cell with the current transaction.
    fn check_lock_and_enlist(&self, ctx: &mut Context) {
        let mut wait = SpinWait::new();
        loop {
            let ws = self.write_stamp.load(Ordering::Acquire);
            if ws == 0 || ws > ctx.start_stamp {
                break;
            }
            wait.spin();
        }
        let arc: Arc<dyn Participant> = self.self_ref.upgrade().expect("shielded cell dropped");
        ctx.enlist(arc);
    }

    /// Eagerly acquires this cell's write-stamp lock (using the reserved
    /// `COMMUTE_LOCK` sentinel, since the real write stamp is not allocated
    /// until validation) and applies `f` to the latest committed value.
    fn resolve_commute_eagerly(&self, f: impl FnOnce(T) -> T) {
        let mut wait = SpinWait::new();
        while self
            .write_stamp
            .compare_exchange(0, COMMUTE_LOCK, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            wait.spin();
        }
        let current = self.current_head_value();
        let new_value = f(current);
        context::with_current("Shielded::commute resolution", |ctx| {
            let arc: Arc<dyn Participant> =
                self.self_ref.upgrade().expect("shielded cell dropped");
            ctx.enlist(arc);
            let mut local = ctx.local.borrow_mut();
            let entry = local
                .entry(self.id)
                .or_insert_with(|| Box::new(CellLocal::<T>::default()));
            let typed = entry.as_any_mut().downcast_mut::<CellLocal<T>>().unwrap();
            typed.write = Some(new_value);
            typed.commute_locked = true;
        });
    }

    fn current_head_value(&self) -> T {
        match self.head.load_full() {
            Some(node) => node.value.clone(),
            None => T::default(),
        }
    }

    fn visible_value(&self, start_stamp: u64) -> T {
        let mut current = self.head.load_full();
        loop {
            match current {
                None => return T::default(),
                Some(node) if node.version <= start_stamp => return node.value.clone(),
                Some(node) => current = node.older.load_full(),
            }
        }
    }
}

impl<T: Clone + Default + Send + Sync + 'static> Participant for Shielded<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn has_changes(&self, ctx: &Context) -> bool {
        ctx.local
            .borrow()
            .get(&self.id)
            .map(|l| {
                l.as_any()
                    .downcast_ref::<CellLocal<T>>()
                    .expect("cell local state type mismatch")
                    .write
                    .is_some()
            })
            .unwrap_or(false)
    }

    fn can_commit(&self, ctx: &Context, write_stamp: u64) -> bool {
        let local = ctx.local.borrow();
        let typed = match local.get(&self.id) {
            Some(entry) => entry
                .as_any()
                .downcast_ref::<CellLocal<T>>()
                .expect("cell local state type mismatch"),
            None => return true,
        };
        if typed.read {
            let head_version = self.head.load_full().map(|n| n.version).unwrap_or(0);
            if head_version > ctx.start_stamp {
                return false;
            }
        }
        if typed.write.is_some() {
            if typed.commute_locked {
                return true;
            }
            return self
                .write_stamp
                .compare_exchange(0, write_stamp, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        }
        true
    }

    fn commit(&self, ctx: &Context, write_stamp: u64) -> bool {
        let entry = match ctx.local.borrow_mut().remove(&self.id) {
            Some(entry) => entry,
            None => return false,
        };
        let typed = entry
            .into_any()
            .downcast::<CellLocal<T>>()
            .expect("cell local state type mismatch");
        match typed.write {
            Some(value) => {
                let older = self.head.load_full();
                let node = Arc::new(Node {
                    version: write_stamp,
                    value,
                    older: ArcSwapOption::from(older),
                });
                self.head.store(Some(node));
                self.write_stamp.store(0, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn rollback(&self, ctx: &Context, write_stamp: Option<u64>) {
        let entry = match ctx.local.borrow_mut().remove(&self.id) {
            Some(entry) => entry,
            None => return,
        };
        let typed = entry
            .into_any()
            .downcast::<CellLocal<T>>()
            .expect("cell local state type mismatch");
        if typed.commute_locked {
            self.write_stamp.store(0, Ordering::Release);
        } else if let Some(ws) = write_stamp {
            let _ = self
                .write_stamp
                .compare_exchange(ws, 0, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    fn trim_copies(&self, min_open: u64) {
        let Some(mut node) = self.head.load_full() else {
            return;
        };
        loop {
            if node.version <= min_open {
                node.older.store(None);
                return;
            }
            match node.older.load_full() {
                Some(next) => node = next,
                None => return,
            }
        }
    }
}
