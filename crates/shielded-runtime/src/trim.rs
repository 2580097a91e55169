use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::participant::Participant;

static REGISTRY: Lazy<DashMap<u64, Weak<dyn Participant>>> = Lazy::new(DashMap::new);

/// Registers `participant` for opportunistic trimming, keyed by id. Called
/// by the runner the first time a participant commits a write; cheap
/// enough to call on every commit rather than tracking first-touch.
pub(crate) fn register(participant: &Arc<dyn Participant>) {
    REGISTRY.insert(participant.id(), Arc::downgrade(participant));
}

/// Runs `trim_copies(min_open)` on every still-live registered participant,
/// dropping entries whose participant has since been dropped.
pub(crate) fn trim_all(min_open: u64) {
    let mut dead = Vec::new();
    for entry in REGISTRY.iter() {
        match entry.value().upgrade() {
            Some(participant) => participant.trim_copies(min_open),
            None => dead.push(*entry.key()),
        }
    }
    for id in dead {
        REGISTRY.remove(&id);
    }
}
