use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;

use crate::context::{self, Context, LocalMarker, RollbackSignal};
use crate::participant::{self, Participant};
use crate::spin::SpinWait;

struct Node<V> {
    version: u64,
    value: Option<V>,
    older: ArcSwapOption<Node<V>>,
}

struct DictLocal<K, V> {
    reads: HashSet<K>,
    writes: HashMap<K, Option<V>>,
}

impl<K, V> Default for DictLocal<K, V> {
    fn default() -> Self {
        DictLocal {
            reads: HashSet::new(),
            writes: HashMap::new(),
        }
    }
}

impl<K: Send + 'static, V: Send + 'static> LocalMarker for DictLocal<K, V> {
    fn is_read(&self) -> bool {
        !self.reads.is_empty()
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

/// A keyed MVCC map: each key has its own independent version chain and
/// write-stamp lock, so unrelated keys never conflict with each other.
pub struct ShieldedDict<K, V> {
    id: u64,
    entries: DashMap<K, ArcSwapOption<Node<V>>>,
    write_stamps: DashMap<K, u64>,
    recently_written: DashMap<K, u64>,
    self_ref: Weak<ShieldedDict<K, V>>,
}

impl<K, V> ShieldedDict<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new, empty dictionary.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| ShieldedDict {
            id: participant::next_participant_id(),
            entries: DashMap::new(),
            write_stamps: DashMap::new(),
            recently_written: DashMap::new(),
            self_ref: weak.clone(),
        })
    }

    /// Reads `key`. Outside a transaction this is the latest committed
    /// value; inside, it is the value visible as of the transaction's start
    /// stamp, or `None` if absent. Returns `V::default()` when absent and
    /// `V: Default`, via [`ShieldedDict::get_or_default`].
    pub fn get(&self, key: &K) -> Option<V> {
        match context::try_with_current(|ctx| self.get_in_transaction(ctx, key)) {
            Some(value) => value,
            None => self.current_head_value(key),
        }
    }

    /// Sets `key` to `value`. Disallowed outside a transaction.
    pub fn set(&self, key: K, value: V) {
        self.write(key, Some(value));
    }

    /// Removes `key`. Disallowed outside a transaction.
    pub fn remove(&self, key: K) {
        self.write(key, None);
    }

    fn write(&self, key: K, value: Option<V>) {
        context::with_current("ShieldedDict::write", |ctx| {
            self.check_lock_and_enlist(ctx, &key);
            let mut local = ctx.local.borrow_mut();
            let entry = local
                .entry(self.id)
                .or_insert_with(|| Box::new(DictLocal::<K, V>::default()));
            let typed = entry
                .as_any_mut()
                .downcast_mut::<DictLocal<K, V>>()
                .unwrap();
            typed.writes.insert(key, value);
        });
    }

    fn get_in_transaction(&self, ctx: &mut Context, key: &K) -> Option<V> {
        {
            let local = ctx.local.borrow();
            if let Some(entry) = local.get(&self.id) {
                let typed = entry.as_any().downcast_ref::<DictLocal<K, V>>().unwrap();
                if let Some(buffered) = typed.writes.get(key) {
                    let buffered = buffered.clone();
                    drop(local);
                    self.assert_no_newer_committed_version(ctx, key);
                    return buffered;
                }
            }
        }
        self.check_lock_and_enlist(ctx, key);
        let mut local = ctx.local.borrow_mut();
        let entry = local
            .entry(self.id)
            .or_insert_with(|| Box::new(DictLocal::<K, V>::default()));
        let typed = entry
            .as_any_mut()
            .downcast_mut::<DictLocal<K, V>>()
            .unwrap();
        typed.reads.insert(key.clone());
        drop(local);
        self.visible_value(key, ctx.start_stamp)
    }

    /// A writable-read collision: a key this transaction already wrote is
    /// found to have a newer committed version than our snapshot. This is
    /// a transient conflict (§7), so it retries the whole attempt rather
    /// than surfacing an error to the body.
    fn assert_no_newer_committed_version(&self, ctx: &Context, key: &K) {
        if let Some(node) = self.entries.get(key).and_then(|slot| slot.load_full()) {
            if node.version > ctx.start_stamp {
                std::panic::panic_any(RollbackSignal);
            }
        }
    }

    fn check_lock_and_enlist(&self, ctx: &mut Context, key: &K) {
        let mut wait = SpinWait::new();
        loop {
            let locked_before_us = self
                .write_stamps
                .get(key)
                .map(|ws| *ws <= ctx.start_stamp)
                .unwrap_or(false);
            if !locked_before_us {
                break;
            }
            wait.spin();
        }
        let arc: Arc<dyn Participant> = self.self_ref.upgrade().expect("shielded dict dropped");
        ctx.enlist(arc);
    }

    fn current_head_value(&self, key: &K) -> Option<V> {
        self.entries
            .get(key)
            .and_then(|slot| slot.load_full())
            .and_then(|node| node.value.clone())
    }

    fn visible_value(&self, key: &K, start_stamp: u64) -> Option<V> {
        let mut current = self.entries.get(key).and_then(|slot| slot.load_full());
        loop {
            match current {
                None => return None,
                Some(node) if node.version <= start_stamp => return node.value.clone(),
                Some(node) => current = node.older.load_full(),
            }
        }
    }
}

impl<K, V> ShieldedDict<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Default + Send + Sync + 'static,
{
    /// Convenience read that substitutes `V::default()` for an absent key,
    /// matching the cell primitive's read semantics.
    pub fn get_or_default(&self, key: &K) -> V {
        self.get(key).unwrap_or_default()
    }
}

impl<K, V> Participant for ShieldedDict<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.id
    }

    fn has_changes(&self, ctx: &Context) -> bool {
        ctx.local
            .borrow()
            .get(&self.id)
            .map(|l| {
                !l.as_any()
                    .downcast_ref::<DictLocal<K, V>>()
                    .expect("dict local state type mismatch")
                    .writes
                    .is_empty()
            })
            .unwrap_or(false)
    }

    fn can_commit(&self, ctx: &Context, write_stamp: u64) -> bool {
        let local = ctx.local.borrow();
        let typed = match local.get(&self.id) {
            Some(entry) => entry
                .as_any()
                .downcast_ref::<DictLocal<K, V>>()
                .expect("dict local state type mismatch"),
            None => return true,
        };
        for key in &typed.reads {
            let pending = self.write_stamps.contains_key(key);
            let head_too_new = self
                .entries
                .get(key)
                .and_then(|slot| slot.load_full())
                .map(|node| node.version > ctx.start_stamp)
                .unwrap_or(false);
            if pending || head_too_new {
                return false;
            }
        }
        for key in typed.writes.keys() {
            if self
                .write_stamps
                .insert(key.clone(), write_stamp)
                .is_some()
            {
                panic!(
                    "{}",
                    shielded_core::Error::protocol_violation(
                        "write-stamp slot for key already held during can_commit"
                    )
                );
            }
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
            .downcast::<DictLocal<K, V>>()
            .expect("dict local state type mismatch");
        let mut committed_any = false;
        for (key, value) in typed.writes {
            let older = self.entries.get(&key).and_then(|slot| slot.load_full());
            let node = Arc::new(Node {
                version: write_stamp,
                value,
                older: ArcSwapOption::from(older),
            });
            self.entries
                .entry(key.clone())
                .or_insert_with(|| ArcSwapOption::from(None))
                .store(Some(node));
            self.recently_written.insert(key.clone(), write_stamp);
            match self.write_stamps.remove(&key) {
                Some((_, held)) if held == write_stamp => {}
                _ => panic!(
                    "{}",
                    shielded_core::Error::protocol_violation(
                        "write-stamp slot held a different stamp at commit"
                    )
                ),
            }
            committed_any = true;
        }
        committed_any
    }

    fn rollback(&self, ctx: &Context, write_stamp: Option<u64>) {
        let entry = match ctx.local.borrow_mut().remove(&self.id) {
            Some(entry) => entry,
            None => return,
        };
        let typed = entry
            .into_any()
            .downcast::<DictLocal<K, V>>()
            .expect("dict local state type mismatch");
        if let Some(ws) = write_stamp {
            for key in typed.writes.keys() {
                if let Some(held) = self.write_stamps.get(key) {
                    if *held == ws {
                        drop(held);
                        self.write_stamps.remove(key);
                    }
                }
            }
        }
    }

    fn trim_copies(&self, min_open: u64) {
        let keys: Vec<K> = self
            .recently_written
            .iter()
            .filter(|entry| *entry.value() <= min_open)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some(mut node) = self.entries.get(&key).and_then(|slot| slot.load_full()) {
                loop {
                    if node.version <= min_open {
                        node.older.store(None);
                        break;
                    }
                    match node.older.load_full() {
                        Some(next) => node = next,
                        None => break,
                    }
                }
            }
            self.recently_written
                .remove_if(&key, |_, stamp| *stamp <= min_open);
        }
    }
}
