// Keyed collections
//
// Map and set wrappers track per-entry dependencies under the hashed key,
// so membership tests and lookups only re-run when that entry changes.
// Enumeration depends on the synthetic iterate key; for maps, enumerating
// only the keys depends on a separate key-iterate key that value updates
// leave alone.

use super::{Access, readonly_violation};
use crate::error::Result;
use crate::track::{Key, Target, TargetKind, TrackOp, TriggerOp, track, trigger};
use indexmap::{IndexMap, IndexSet};
use std::cell::RefCell;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

struct MapInner<K, V> {
    target: Target,
    entries: RefCell<IndexMap<K, V>>,
}

/// Observable keyed map
///
/// Values are compared with `PartialEq` on write; an equal value triggers
/// nothing. Cloning shares the map, [`readonly`](Self::readonly) hands out a
/// view that rejects writes.
pub struct ReactiveMap<K, V> {
    inner: Rc<MapInner<K, V>>,
    access: Access,
}

impl<K, V> Clone for ReactiveMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            access: self.access,
        }
    }
}

impl<K, V> ReactiveMap<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + 'static,
    V: Clone + PartialEq + 'static,
{
    /// An empty map.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(MapInner {
                target: Target::new(TargetKind::Map),
                entries: RefCell::new(IndexMap::new()),
            }),
            access: Access::Mutable,
        }
    }

    /// The map's identity in the dependency table.
    pub fn target(&self) -> Target {
        self.inner.target
    }

    /// A readonly view of the same map.
    pub fn readonly(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            access: Access::Readonly,
        }
    }

    /// Whether writes are rejected.
    pub fn is_readonly(&self) -> bool {
        self.access == Access::Readonly
    }

    /// Look up an entry.
    pub fn get(&self, key: &K) -> Option<V> {
        track(self.target(), TrackOp::Get, Key::entry(key));
        self.inner.entries.borrow().get(key).cloned()
    }

    /// Whether an entry exists.
    pub fn has(&self, key: &K) -> bool {
        track(self.target(), TrackOp::Has, Key::entry(key));
        self.inner.entries.borrow().contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        track(self.target(), TrackOp::Iterate, Key::Iterate);
        self.inner.entries.borrow().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The keys, in insertion order. Not re-run by value updates.
    pub fn keys(&self) -> Vec<K> {
        track(self.target(), TrackOp::Iterate, Key::KeyIterate);
        self.inner.entries.borrow().keys().cloned().collect()
    }

    /// The values, in insertion order.
    pub fn values(&self) -> Vec<V> {
        track(self.target(), TrackOp::Iterate, Key::Iterate);
        self.inner.entries.borrow().values().cloned().collect()
    }

    /// The entries, in insertion order.
    pub fn entries(&self) -> Vec<(K, V)> {
        track(self.target(), TrackOp::Iterate, Key::Iterate);
        self.inner
            .entries
            .borrow()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Visit every entry. The map is copied first, so `f` may write to it.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for (key, value) in self.entries() {
            f(&key, &value);
        }
    }

    /// Insert or overwrite an entry.
    pub fn set(&self, key: K, value: V) -> Result<()> {
        let entry_key = Key::entry(&key);
        if self.is_readonly() {
            return Err(readonly_violation(self.target(), &entry_key));
        }
        let op = {
            let mut entries = self.inner.entries.borrow_mut();
            match entries.get_mut(&key) {
                Some(old) if *old == value => None,
                Some(old) => Some((TriggerOp::Set, Some(std::mem::replace(old, value)))),
                None => {
                    entries.insert(key, value);
                    Some((TriggerOp::Add, None))
                }
            }
        };
        if let Some((op, previous)) = op {
            trigger(self.target(), op, Some(&entry_key));
            drop(previous);
        }
        Ok(())
    }

    /// Remove an entry, returning its value.
    pub fn delete(&self, key: &K) -> Result<Option<V>> {
        let entry_key = Key::entry(key);
        if self.is_readonly() {
            return Err(readonly_violation(self.target(), &entry_key));
        }
        let removed = self.inner.entries.borrow_mut().shift_remove(key);
        if removed.is_some() {
            trigger(self.target(), TriggerOp::Delete, Some(&entry_key));
        }
        Ok(removed)
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<()> {
        if self.is_readonly() {
            return Err(readonly_violation(self.target(), &Key::Iterate));
        }
        let cleared = std::mem::take(&mut *self.inner.entries.borrow_mut());
        if !cleared.is_empty() {
            trigger(self.target(), TriggerOp::Clear, None);
        }
        Ok(())
    }
}

impl<K, V> Default for ReactiveMap<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + 'static,
    V: Clone + PartialEq + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for ReactiveMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveMap")
            .field("target", &self.inner.target.id())
            .field("entries", &self.inner.entries.try_borrow().ok())
            .field("access", &self.access)
            .finish()
    }
}

struct SetInner<K> {
    target: Target,
    items: RefCell<IndexSet<K>>,
}

/// Observable set
///
/// Membership tests track the tested value; enumeration and size track the
/// set's iterate key, re-run by additions, removals and clears.
pub struct ReactiveSet<K> {
    inner: Rc<SetInner<K>>,
    access: Access,
}

impl<K> Clone for ReactiveSet<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            access: self.access,
        }
    }
}

impl<K> ReactiveSet<K>
where
    K: Hash + Eq + Clone + fmt::Debug + 'static,
{
    /// An empty set.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SetInner {
                target: Target::new(TargetKind::Set),
                items: RefCell::new(IndexSet::new()),
            }),
            access: Access::Mutable,
        }
    }

    /// The set's identity in the dependency table.
    pub fn target(&self) -> Target {
        self.inner.target
    }

    /// A readonly view of the same set.
    pub fn readonly(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            access: Access::Readonly,
        }
    }

    /// Whether writes are rejected.
    pub fn is_readonly(&self) -> bool {
        self.access == Access::Readonly
    }

    /// Whether `item` is present.
    pub fn has(&self, item: &K) -> bool {
        track(self.target(), TrackOp::Has, Key::entry(item));
        self.inner.items.borrow().contains(item)
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        track(self.target(), TrackOp::Iterate, Key::Iterate);
        self.inner.items.borrow().len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The items, in insertion order.
    pub fn values(&self) -> Vec<K> {
        track(self.target(), TrackOp::Iterate, Key::Iterate);
        self.inner.items.borrow().iter().cloned().collect()
    }

    /// Visit every item. The set is copied first, so `f` may write to it.
    pub fn for_each(&self, mut f: impl FnMut(&K)) {
        for item in self.values() {
            f(&item);
        }
    }

    /// Add an item. Returns whether it was new.
    pub fn add(&self, item: K) -> Result<bool> {
        let entry_key = Key::entry(&item);
        if self.is_readonly() {
            return Err(readonly_violation(self.target(), &entry_key));
        }
        let added = self.inner.items.borrow_mut().insert(item);
        if added {
            trigger(self.target(), TriggerOp::Add, Some(&entry_key));
        }
        Ok(added)
    }

    /// Remove an item. Returns whether it was present.
    pub fn delete(&self, item: &K) -> Result<bool> {
        let entry_key = Key::entry(item);
        if self.is_readonly() {
            return Err(readonly_violation(self.target(), &entry_key));
        }
        let removed = self.inner.items.borrow_mut().shift_remove(item);
        if removed {
            trigger(self.target(), TriggerOp::Delete, Some(&entry_key));
        }
        Ok(removed)
    }

    /// Remove every item.
    pub fn clear(&self) -> Result<()> {
        if self.is_readonly() {
            return Err(readonly_violation(self.target(), &Key::Iterate));
        }
        let cleared = std::mem::take(&mut *self.inner.items.borrow_mut());
        if !cleared.is_empty() {
            trigger(self.target(), TriggerOp::Clear, None);
        }
        Ok(())
    }
}

impl<K> Default for ReactiveSet<K>
where
    K: Hash + Eq + Clone + fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug> fmt::Debug for ReactiveSet<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveSet")
            .field("target", &self.inner.target.id())
            .field("items", &self.inner.items.try_borrow().ok())
            .field("access", &self.access)
            .finish()
    }
}
