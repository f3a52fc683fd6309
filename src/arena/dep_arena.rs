// Dep arena - storage for dependency records
//
// A dependency is the shared subscription record of one observable source:
// either a (target, key) pair in the target table or the outward-facing
// source of a Computed value. It maps each subscribed computation to the
// run revision (track_id) in which that computation last read it.
//
// A dependency lives exactly as long as its subscriber map is non-empty.
// The owner says where it has to be unlinked from when that happens.

use super::{EffectId, next_generation};
use crate::computed::ComputedNode;
use crate::hash::FastIndexMap;
use crate::track::{Key, TargetId};
use slab::Slab;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Where a dependency is registered.
pub enum DepOwner {
    /// Entry `key` of `target` in the target table.
    Key {
        /// Owning target.
        target: TargetId,
        /// Key within the target.
        key: Key,
    },
    /// The outward-facing source of a computed value.
    Computed(Weak<dyn ComputedNode>),
}

/// Subscribers of one dependency and its owner.
pub struct DepMetadata {
    generation: u32,
    pub(crate) subscribers: FastIndexMap<EffectId, u32>,
    pub(crate) owner: DepOwner,
}

impl DepMetadata {
    fn new(owner: DepOwner) -> Self {
        Self {
            generation: 0,
            subscribers: FastIndexMap::default(),
            owner,
        }
    }
}

thread_local! {
    static DEP_ARENA: RefCell<Slab<DepMetadata>> = const { RefCell::new(Slab::new()) };
}

/// Handle to a dependency in the dep arena.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct DepId {
    slot: u32,
    generation: u32,
}

impl DepId {
    fn index(self) -> usize {
        self.slot as usize
    }

    /// Read the metadata. `None` once the dependency has been released.
    pub fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&DepMetadata) -> R,
    {
        DEP_ARENA
            .try_with(|arena| {
                let arena = arena.borrow();
                arena
                    .get(self.index())
                    .filter(|meta| meta.generation == self.generation)
                    .map(f)
            })
            .ok()
            .flatten()
    }

    /// Mutate the metadata. `None` once the dependency has been released.
    pub fn with_mut<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&mut DepMetadata) -> R,
    {
        DEP_ARENA
            .try_with(|arena| {
                let mut arena = arena.borrow_mut();
                arena
                    .get_mut(self.index())
                    .filter(|meta| meta.generation == self.generation)
                    .map(f)
            })
            .ok()
            .flatten()
    }

    /// Whether the dependency is still registered.
    pub fn is_live(self) -> bool {
        self.with(|_| ()).is_some()
    }

    /// Number of computations subscribed.
    pub fn subscriber_count(self) -> usize {
        self.with(|meta| meta.subscribers.len()).unwrap_or(0)
    }

    /// Revision stamp stored for `effect`, if it is subscribed.
    pub fn stamp(self, effect: EffectId) -> Option<u32> {
        self.with(|meta| meta.subscribers.get(&effect).copied()).flatten()
    }

    /// The computed value this dependency is the source of, if it is alive.
    pub fn computed(self) -> Option<Rc<dyn ComputedNode>> {
        self.with(|meta| match &meta.owner {
            DepOwner::Computed(node) => node.upgrade(),
            DepOwner::Key { .. } => None,
        })
        .flatten()
    }
}

/// Register a new, empty dependency.
pub fn dep_arena_insert(owner: DepOwner) -> DepId {
    let generation = next_generation();
    let mut metadata = DepMetadata::new(owner);
    metadata.generation = generation;
    DEP_ARENA.with_borrow_mut(|arena| DepId {
        slot: arena.insert(metadata) as u32,
        generation,
    })
}

/// Remove a dependency from the arena, handing back its metadata.
pub fn dep_arena_remove(id: DepId) -> Option<DepMetadata> {
    DEP_ARENA
        .try_with(|arena| {
            let mut arena = arena.try_borrow_mut().ok()?;
            let live = arena
                .get(id.index())
                .is_some_and(|meta| meta.generation == id.generation);
            live.then(|| arena.remove(id.index()))
        })
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Target;
    use crate::track::TargetKind;

    #[test]
    fn released_dep_reports_empty() {
        let target = Target::new(TargetKind::Record);
        let dep = dep_arena_insert(DepOwner::Key {
            target: target.id(),
            key: Key::field("name"),
        });
        assert!(dep.is_live());
        assert_eq!(dep.subscriber_count(), 0);
        assert!(dep.computed().is_none());

        assert!(dep_arena_remove(dep).is_some());
        assert!(!dep.is_live());
        assert!(dep_arena_remove(dep).is_none());
        assert_eq!(dep.subscriber_count(), 0);
    }
}
