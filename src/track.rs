//! Dependency table and the track/trigger protocol.
//!
//! Every observable container owns a [`Target`]. Reads call [`track`] with
//! the key they looked at; writes call [`trigger`] (or [`trigger_resize`] for
//! sequence length changes) with the kind of mutation. The table maps each
//! `(target, key)` pair to a dependency in the dep arena, which is unlinked
//! the moment its last subscriber goes away.

use crate::arena::{
    DepId, DepOwner, DirtyLevel, EffectId, Slot, dep_arena_insert, dep_arena_remove,
    tracking_effect,
};
use crate::batch::{SchedulingPause, queue_effect_scheduler};
use crate::hash::{FastHashMap, hash_key};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

thread_local! {
    static TARGET_MAP: RefCell<FastHashMap<TargetId, FastHashMap<Key, DepId>>> =
        RefCell::new(FastHashMap::default());
    static NEXT_TARGET: Cell<u64> = const { Cell::new(1) };
}

/// Identity of an observable container. Never reused on a thread.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct TargetId(u64);

impl TargetId {
    /// Raw numeric value, for logging.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Shape of a target; decides which synthetic keys a mutation also hits.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum TargetKind {
    /// A single value cell.
    Cell,
    /// A string-keyed record.
    Record,
    /// An ordered sequence.
    List,
    /// A keyed map.
    Map,
    /// A set.
    Set,
}

/// An observable container's identity plus its shape.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Target {
    id: TargetId,
    kind: TargetKind,
}

impl Target {
    /// Allocate a fresh target.
    pub fn new(kind: TargetKind) -> Self {
        let id = NEXT_TARGET.with(|next| {
            let id = next.get();
            next.set(id + 1);
            TargetId(id)
        });
        Self { id, kind }
    }

    /// The target's identity.
    pub fn id(self) -> TargetId {
        self.id
    }

    /// The target's shape.
    pub fn kind(self) -> TargetKind {
        self.kind
    }
}

/// What a dependency is keyed on within its target.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum Key {
    /// A named record field.
    Field(Rc<str>),
    /// A sequence index.
    Index(usize),
    /// A sequence's length.
    Length,
    /// Synthetic key read by enumeration.
    Iterate,
    /// Synthetic key read by enumerating only the keys of a map.
    KeyIterate,
    /// The content of a single value cell.
    Value,
    /// A hashed collection key.
    Entry(u64),
}

impl Key {
    /// Key for a record field.
    pub fn field(name: &str) -> Self {
        Key::Field(Rc::from(name))
    }

    /// Key for a map or set entry.
    pub fn entry<K: Hash + ?Sized>(key: &K) -> Self {
        Key::Entry(hash_key(key))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Field(name) => f.write_str(name),
            Key::Index(index) => write!(f, "[{index}]"),
            Key::Length => f.write_str("length"),
            Key::Iterate => f.write_str("<iterate>"),
            Key::KeyIterate => f.write_str("<keys>"),
            Key::Value => f.write_str("value"),
            Key::Entry(hash) => write!(f, "<entry {hash:#x}>"),
        }
    }
}

/// Kind of read being tracked.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TrackOp {
    /// A value read.
    Get,
    /// A membership test.
    Has,
    /// An enumeration.
    Iterate,
}

/// Kind of mutation being triggered.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TriggerOp {
    /// An existing key changed value.
    Set,
    /// A new key appeared.
    Add,
    /// An existing key was removed.
    Delete,
    /// Every key was removed.
    Clear,
}

/// Record a read of `key` on `target` against the active computation.
///
/// No-op when no computation is running or tracking is paused.
pub fn track(target: Target, op: TrackOp, key: Key) {
    let Some(effect) = tracking_effect() else {
        return;
    };
    tracing::trace!(target_id = target.id.0, ?op, %key, "track");
    let dep = dep_for(target.id, key);
    track_effect(effect, dep);
}

fn dep_for(target: TargetId, key: Key) -> DepId {
    let existing = TARGET_MAP.with_borrow(|map| map.get(&target).and_then(|keys| keys.get(&key)).copied());
    if let Some(dep) = existing {
        return dep;
    }
    let dep = dep_arena_insert(DepOwner::Key {
        target,
        key: key.clone(),
    });
    TARGET_MAP.with_borrow_mut(|map| map.entry(target).or_default().insert(key, dep));
    dep
}

/// Notify every computation that depends on what `op` changed.
pub fn trigger(target: Target, op: TriggerOp, key: Option<&Key>) {
    let deps = TARGET_MAP.with_borrow(|map| {
        let Some(keys) = map.get(&target.id) else {
            return Vec::new();
        };
        let mut deps = Vec::new();
        if op == TriggerOp::Clear {
            deps.extend(keys.values().copied());
            return deps;
        }
        if let Some(key) = key {
            deps.extend(keys.get(key).copied());
        }
        let mut hit = |synthetic: &Key| deps.extend(keys.get(synthetic).copied());
        match (op, target.kind) {
            (TriggerOp::Add, TargetKind::List) => hit(&Key::Length),
            (TriggerOp::Add | TriggerOp::Delete, TargetKind::Map) => {
                hit(&Key::Iterate);
                hit(&Key::KeyIterate);
            }
            (TriggerOp::Add | TriggerOp::Delete, TargetKind::List) => {}
            (TriggerOp::Add | TriggerOp::Delete, _) => hit(&Key::Iterate),
            (TriggerOp::Set, TargetKind::Map) => hit(&Key::Iterate),
            _ => {}
        }
        deps
    });
    if deps.is_empty() {
        return;
    }
    tracing::trace!(target_id = target.id.0, ?op, deps = deps.len(), "trigger");
    dispatch(deps);
}

/// Notify readers of a sequence's length and of every index at or past
/// `new_len`.
pub fn trigger_resize(target: Target, new_len: usize) {
    let deps: Vec<DepId> = TARGET_MAP.with_borrow(|map| {
        map.get(&target.id)
            .map(|keys| {
                keys.iter()
                    .filter(|(key, _)| match key {
                        Key::Length => true,
                        Key::Index(index) => *index >= new_len,
                        _ => false,
                    })
                    .map(|(_, dep)| *dep)
                    .collect()
            })
            .unwrap_or_default()
    });
    if deps.is_empty() {
        return;
    }
    tracing::trace!(target_id = target.id.0, new_len, deps = deps.len(), "trigger resize");
    dispatch(deps);
}

fn dispatch(deps: Vec<DepId>) {
    let _pause = SchedulingPause::new();
    for dep in deps {
        trigger_effects(dep, DirtyLevel::Dirty);
    }
}

/// Number of computations currently subscribed to `key` on `target`.
pub fn subscriber_count(target: Target, key: &Key) -> usize {
    TARGET_MAP
        .with_borrow(|map| map.get(&target.id).and_then(|keys| keys.get(key)).copied())
        .map_or(0, DepId::subscriber_count)
}

/// Record that `effect` read `dep` during its current run.
///
/// Re-runs that read the same dependencies in the same order reuse their
/// slots, so the list is only rewritten where the read order diverges.
pub(crate) fn track_effect(effect: EffectId, dep: DepId) {
    let Some(track_id) = effect
        .with(|meta| meta.active.then_some(meta.track_id))
        .flatten()
    else {
        return;
    };
    let fresh = dep
        .with_mut(|meta| {
            if meta.subscribers.get(&effect) == Some(&track_id) {
                false
            } else {
                meta.subscribers.insert(effect, track_id);
                true
            }
        })
        .unwrap_or(false);
    if !fresh {
        return;
    }
    let displaced = effect
        .with_mut(|meta| {
            let slot = meta.deps_len;
            meta.deps_len += 1;
            match meta.deps.get(slot).copied() {
                Some(old) if old == dep => None,
                Some(old) => {
                    meta.deps[slot] = dep;
                    Some(old)
                }
                None => {
                    meta.deps.push(dep);
                    None
                }
            }
        })
        .flatten();
    if let Some(old) = displaced {
        cov_mark::hit!(dep_slot_displaced);
        cleanup_dep_effect(old, effect);
    }
}

/// Drop `effect` from `dep` unless it has read `dep` in its current run.
pub(crate) fn cleanup_dep_effect(dep: DepId, effect: EffectId) {
    let track_id = effect.with(|meta| meta.track_id);
    let emptied = dep
        .with_mut(|meta| match meta.subscribers.get(&effect) {
            Some(stamp) if Some(*stamp) != track_id => {
                meta.subscribers.shift_remove(&effect);
                meta.subscribers.is_empty()
            }
            _ => false,
        })
        .unwrap_or(false);
    if emptied {
        release_dep(dep);
    }
}

/// Unlink an empty dependency from its owner and free it.
fn release_dep(dep: DepId) {
    let Some(meta) = dep_arena_remove(dep) else {
        return;
    };
    match meta.owner {
        DepOwner::Key { target, key } => {
            let _ = TARGET_MAP.try_with(|map| {
                let Ok(mut map) = map.try_borrow_mut() else {
                    return;
                };
                if let Some(keys) = map.get_mut(&target) {
                    if keys.get(&key) == Some(&dep) {
                        keys.remove(&key);
                    }
                    if keys.is_empty() {
                        map.remove(&target);
                    }
                }
            });
        }
        DepOwner::Computed(node) => {
            if let Some(node) = node.upgrade() {
                node.release_dep(dep);
            }
        }
    }
}

/// Start a run: new revision, nothing read yet.
pub(crate) fn pre_cleanup(effect: EffectId) {
    effect.with_mut(|meta| {
        meta.track_id = meta.track_id.wrapping_add(1);
        meta.deps_len = 0;
    });
}

/// Finish a run: drop every dependency past the used length.
pub(crate) fn post_cleanup(effect: EffectId) {
    let stale = effect
        .with_mut(|meta| {
            if meta.deps.len() > meta.deps_len {
                meta.deps.split_off(meta.deps_len)
            } else {
                Vec::new()
            }
        })
        .unwrap_or_default();
    for dep in stale {
        cleanup_dep_effect(dep, effect);
    }
}

/// Escalate every up-to-date subscriber of `dep` to at least `level`.
///
/// A subscriber whose stored revision is older than its current one has not
/// read `dep` in its latest run and is left alone. The first escalation past
/// Clean marks a subscriber for scheduling; its trigger runs immediately and
/// its scheduler is queued until the outermost scheduling pause ends.
pub(crate) fn trigger_effects(dep: DepId, level: DirtyLevel) {
    let _pause = SchedulingPause::new();
    let subscribers: Vec<EffectId> = dep
        .with(|meta| meta.subscribers.keys().copied().collect())
        .unwrap_or_default();
    for effect in subscribers {
        let Some(stamp) = dep.stamp(effect) else {
            continue;
        };
        let should_schedule = effect
            .with_mut(|meta| {
                if meta.track_id != stamp {
                    return false;
                }
                if meta.level < level {
                    meta.should_schedule |= meta.level == DirtyLevel::Clean;
                    meta.level = level;
                }
                meta.should_schedule
            })
            .unwrap_or(false);
        if !should_schedule {
            continue;
        }
        effect.call(Slot::Trigger);
        let enqueue = effect
            .with_mut(|meta| {
                let may_run = meta.runnings == 0 || meta.allow_recurse;
                if may_run && meta.level != DirtyLevel::ComputedPending {
                    meta.should_schedule = false;
                    meta.has_scheduler
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if enqueue {
            queue_effect_scheduler(effect);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Effect;
    use std::cell::Cell;

    fn reader(target: Target, key: Key, runs: Rc<Cell<usize>>) -> Effect {
        Effect::new(move || {
            track(target, TrackOp::Get, key.clone());
            runs.set(runs.get() + 1);
        })
    }

    #[test]
    fn track_outside_computation_registers_nothing() {
        let target = Target::new(TargetKind::Record);
        track(target, TrackOp::Get, Key::field("a"));
        assert_eq!(subscriber_count(target, &Key::field("a")), 0);
    }

    #[test]
    fn set_hits_only_the_exact_key() {
        let target = Target::new(TargetKind::Record);
        let a_runs = Rc::new(Cell::new(0));
        let iter_runs = Rc::new(Cell::new(0));
        let _a = reader(target, Key::field("a"), a_runs.clone());
        let _iter = reader(target, Key::Iterate, iter_runs.clone());

        trigger(target, TriggerOp::Set, Some(&Key::field("a")));
        assert_eq!(a_runs.get(), 2);
        assert_eq!(iter_runs.get(), 1);

        trigger(target, TriggerOp::Add, Some(&Key::field("b")));
        assert_eq!(a_runs.get(), 2);
        assert_eq!(iter_runs.get(), 2);
    }

    #[test]
    fn map_set_also_hits_iteration_but_not_key_iteration() {
        let target = Target::new(TargetKind::Map);
        let values_runs = Rc::new(Cell::new(0));
        let keys_runs = Rc::new(Cell::new(0));
        let _values = reader(target, Key::Iterate, values_runs.clone());
        let _keys = reader(target, Key::KeyIterate, keys_runs.clone());

        trigger(target, TriggerOp::Set, Some(&Key::Entry(7)));
        assert_eq!((values_runs.get(), keys_runs.get()), (2, 1));

        trigger(target, TriggerOp::Delete, Some(&Key::Entry(7)));
        assert_eq!((values_runs.get(), keys_runs.get()), (3, 2));
    }

    #[test]
    fn resize_hits_length_and_truncated_indices() {
        let target = Target::new(TargetKind::List);
        let low = Rc::new(Cell::new(0));
        let high = Rc::new(Cell::new(0));
        let length = Rc::new(Cell::new(0));
        let _low = reader(target, Key::Index(0), low.clone());
        let _high = reader(target, Key::Index(3), high.clone());
        let _length = reader(target, Key::Length, length.clone());

        trigger_resize(target, 2);
        assert_eq!((low.get(), high.get(), length.get()), (1, 2, 2));
    }

    #[test]
    fn clear_hits_every_key_of_the_target() {
        let target = Target::new(TargetKind::Set);
        let other = Target::new(TargetKind::Set);
        let a = Rc::new(Cell::new(0));
        let b = Rc::new(Cell::new(0));
        let untouched = Rc::new(Cell::new(0));
        let _a = reader(target, Key::Entry(1), a.clone());
        let _b = reader(target, Key::Iterate, b.clone());
        let _other = reader(other, Key::Iterate, untouched.clone());

        trigger(target, TriggerOp::Clear, None);
        assert_eq!((a.get(), b.get(), untouched.get()), (2, 2, 1));
    }

    #[test]
    fn reordered_reads_reuse_slots_and_trim_leftovers() {
        cov_mark::check!(dep_slot_displaced);
        let target = Target::new(TargetKind::Record);
        let flip = Rc::new(Cell::new(false));
        let flip_in_body = flip.clone();
        let effect = Effect::new(move || {
            if flip_in_body.get() {
                track(target, TrackOp::Get, Key::field("b"));
            } else {
                track(target, TrackOp::Get, Key::field("a"));
                track(target, TrackOp::Get, Key::field("b"));
            }
        });
        assert_eq!(effect.id().dep_count(), 2);

        flip.set(true);
        effect.run();
        assert_eq!(effect.id().dep_count(), 1);
        assert_eq!(subscriber_count(target, &Key::field("a")), 0);
        assert_eq!(subscriber_count(target, &Key::field("b")), 1);
    }
}
