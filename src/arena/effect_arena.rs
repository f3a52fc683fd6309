// Effect arena - storage for computation metadata
//
// This module defines EffectMetadata, the per-computation record shared by
// plain effects and by the computation behind every Computed value, and the
// thread-local "active computation" context.
//
// DIRTY LEVELS:
// - Clean: last run is current
// - Querying: transient, set while dirty() re-checks upstream computed values
// - ComputedPending: an upstream computed may still be stale after being read
// - ComputedInvalidated: an upstream computed was invalidated, output unknown
// - Dirty: a direct dependency changed, must re-run
//
// Levels only escalate during propagation. run() resets to Clean.

use super::{DepId, next_generation};
use crate::scheduler::Job;
use slab::Slab;
use std::cell::{Cell, RefCell};

/// Escalating invalidation state of a computation.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DirtyLevel {
    /// The last run is current.
    Clean = 0,
    /// Transient state while upstream computed values are being re-checked.
    Querying = 1,
    /// An upstream computed value was read while still stale.
    ComputedPending = 2,
    /// An upstream computed value was invalidated; its output may not differ.
    ComputedInvalidated = 3,
    /// A direct dependency changed.
    Dirty = 4,
}

/// Boxed callback stored in the arena.
pub type Callback = Box<dyn FnMut()>;

/// Which callback slot of a computation to invoke.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    /// The tracked body.
    Body,
    /// The explicit trigger, called synchronously on escalation.
    Trigger,
    /// The scheduler, called once per invalidation window.
    Scheduler,
}

/// Metadata for one computation.
///
/// `deps[..deps_len]` are the dependencies read so far in the current run;
/// entries past `deps_len` are leftovers from the previous run and get trimmed
/// when the run finishes.
pub struct EffectMetadata {
    generation: u32,
    pub(crate) level: DirtyLevel,
    pub(crate) active: bool,
    pub(crate) track_id: u32,
    pub(crate) deps: Vec<DepId>,
    pub(crate) deps_len: usize,
    pub(crate) runnings: u32,
    pub(crate) should_schedule: bool,
    pub(crate) allow_recurse: bool,
    pub(crate) rerun_requested: bool,
    pub(crate) has_scheduler: bool,
    pub(crate) body: Option<Callback>,
    pub(crate) trigger: Option<Callback>,
    pub(crate) scheduler: Option<Callback>,
    pub(crate) on_stop: Option<Box<dyn FnOnce()>>,
    pub(crate) job: Option<Job>,
}

impl EffectMetadata {
    /// New computations start Dirty so that the first `dirty()` query runs them.
    pub fn new(body: Callback) -> Self {
        Self {
            generation: 0,
            level: DirtyLevel::Dirty,
            active: true,
            track_id: 0,
            deps: Vec::new(),
            deps_len: 0,
            runnings: 0,
            should_schedule: false,
            allow_recurse: false,
            rerun_requested: false,
            has_scheduler: false,
            body: Some(body),
            trigger: None,
            scheduler: None,
            on_stop: None,
            job: None,
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut Option<Callback> {
        match slot {
            Slot::Body => &mut self.body,
            Slot::Trigger => &mut self.trigger,
            Slot::Scheduler => &mut self.scheduler,
        }
    }
}

thread_local! {
    static EFFECT_ARENA: RefCell<Slab<EffectMetadata>> = const { RefCell::new(Slab::new()) };
    static ACTIVE_EFFECT: Cell<Option<EffectId>> = const { Cell::new(None) };
    static SHOULD_TRACK: Cell<bool> = const { Cell::new(true) };
}

/// The computation currently running on this thread, if any.
pub fn current_effect() -> Option<EffectId> {
    ACTIVE_EFFECT.get()
}

/// The computation that reads should be recorded against, if tracking is on.
pub fn tracking_effect() -> Option<EffectId> {
    if SHOULD_TRACK.get() {
        ACTIVE_EFFECT.get()
    } else {
        None
    }
}

/// RAII guard that installs a computation as the active one and restores the
/// previous one when dropped, including during unwinding.
pub struct ActiveEffectGuard {
    previous: Option<EffectId>,
}

impl ActiveEffectGuard {
    /// Install `effect` as the active computation.
    pub fn new(effect: Option<EffectId>) -> Self {
        let previous = ACTIVE_EFFECT.replace(effect);
        Self { previous }
    }
}

impl Drop for ActiveEffectGuard {
    fn drop(&mut self) {
        let _ = ACTIVE_EFFECT.try_with(|active| active.set(self.previous));
    }
}

/// RAII guard over the tracking-enabled flag.
pub struct TrackingGuard {
    previous: bool,
}

impl TrackingGuard {
    /// Turn tracking on for the guard's lifetime.
    pub fn enable() -> Self {
        Self::set(true)
    }

    /// Turn tracking off for the guard's lifetime.
    pub fn pause() -> Self {
        Self::set(false)
    }

    fn set(value: bool) -> Self {
        let previous = SHOULD_TRACK.replace(value);
        Self { previous }
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        let _ = SHOULD_TRACK.try_with(|flag| flag.set(self.previous));
    }
}

/// Handle to a computation in the effect arena.
///
/// Accessing a handle whose computation has been dropped returns `None` (or
/// a neutral default) instead of touching the slot's new occupant.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct EffectId {
    slot: u32,
    generation: u32,
}

impl EffectId {
    fn index(self) -> usize {
        self.slot as usize
    }

    /// Read the metadata. `None` once the computation is gone.
    pub fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&EffectMetadata) -> R,
    {
        EFFECT_ARENA
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

    /// Mutate the metadata. `None` once the computation is gone.
    ///
    /// The closure must not call back into the arena.
    pub fn with_mut<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&mut EffectMetadata) -> R,
    {
        EFFECT_ARENA
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

    /// Whether the computation still occupies its slot.
    pub fn is_live(self) -> bool {
        self.with(|_| ()).is_some()
    }

    /// Current dirty level; Clean for a dropped computation.
    pub fn level(self) -> DirtyLevel {
        self.with(|meta| meta.level).unwrap_or(DirtyLevel::Clean)
    }

    /// Overwrite the dirty level.
    pub fn set_level(self, level: DirtyLevel) {
        self.with_mut(|meta| meta.level = level);
    }

    /// Whether the computation has not been stopped.
    pub fn is_active(self) -> bool {
        self.with(|meta| meta.active).unwrap_or(false)
    }

    /// Number of dependencies recorded by the latest run.
    pub fn dep_count(self) -> usize {
        self.with(|meta| meta.deps.len()).unwrap_or(0)
    }

    /// Dependencies recorded by the latest (or current) run, in read order.
    pub fn deps(self) -> Vec<DepId> {
        self.with(|meta| meta.deps[..meta.deps_len.min(meta.deps.len())].to_vec())
            .unwrap_or_default()
    }

    /// Invoke one of the stored callbacks.
    ///
    /// The callback is taken out of the arena while it runs, so it may freely
    /// create, run or drop other computations. A guard puts it back afterwards
    /// even if it panics. Returns false when there was nothing to call, which
    /// includes a computation re-entering its own callback.
    pub fn call(self, slot: Slot) -> bool {
        struct Restore {
            effect: EffectId,
            slot: Slot,
            callback: Option<Callback>,
        }

        impl Drop for Restore {
            fn drop(&mut self) {
                let slot = self.slot;
                let callback = &mut self.callback;
                // The slot may have been refilled or the computation dropped
                // while the callback ran; the taken one is then dropped here,
                // outside the arena borrow.
                self.effect.with_mut(|meta| {
                    let place = meta.slot_mut(slot);
                    if place.is_none() {
                        *place = callback.take();
                    }
                });
            }
        }

        let Some(callback) = self.with_mut(|meta| meta.slot_mut(slot).take()).flatten() else {
            return false;
        };
        let mut restore = Restore {
            effect: self,
            slot,
            callback: Some(callback),
        };
        if let Some(callback) = restore.callback.as_mut() {
            callback();
        }
        true
    }
}

/// Insert computation metadata into the arena and return its handle.
pub fn effect_arena_insert(mut metadata: EffectMetadata) -> EffectId {
    let generation = next_generation();
    metadata.generation = generation;
    EFFECT_ARENA.with_borrow_mut(|arena| {
        let slot = arena.insert(metadata);
        EffectId {
            slot: slot as u32,
            generation,
        }
    })
}

/// Remove a computation from the arena.
///
/// The metadata is handed back so that its callbacks are dropped after the
/// arena borrow has been released.
pub fn effect_arena_remove(id: EffectId) -> Option<EffectMetadata> {
    EFFECT_ARENA
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
    use std::rc::Rc;

    #[test]
    fn stale_handle_never_aliases_new_occupant() {
        let first = effect_arena_insert(EffectMetadata::new(Box::new(|| {})));
        drop(effect_arena_remove(first));

        let second = effect_arena_insert(EffectMetadata::new(Box::new(|| {})));
        assert_eq!(first.index(), second.index());
        assert!(!first.is_live());
        assert!(second.is_live());
        assert_eq!(first.level(), DirtyLevel::Clean);
        assert!(first.with_mut(|meta| meta.level = DirtyLevel::Clean).is_none());
        assert_eq!(second.level(), DirtyLevel::Dirty);

        drop(effect_arena_remove(second));
    }

    #[test]
    fn body_restored_after_panic() {
        let runs = Rc::new(Cell::new(0));
        let runs_in_body = runs.clone();
        let id = effect_arena_insert(EffectMetadata::new(Box::new(move || {
            runs_in_body.set(runs_in_body.get() + 1);
            if runs_in_body.get() == 1 {
                panic!("first run fails");
            }
        })));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| id.call(Slot::Body)));
        assert!(result.is_err());
        assert!(id.with(|meta| meta.body.is_some()).unwrap_or(false));

        assert!(id.call(Slot::Body));
        assert_eq!(runs.get(), 2);

        drop(effect_arena_remove(id));
    }

    #[test]
    fn reentrant_call_is_skipped() {
        let inner_called = Rc::new(Cell::new(None));
        let id_cell: Rc<Cell<Option<EffectId>>> = Rc::new(Cell::new(None));
        let (flag, id_for_body) = (inner_called.clone(), id_cell.clone());
        let id = effect_arena_insert(EffectMetadata::new(Box::new(move || {
            if let Some(me) = id_for_body.get() {
                flag.set(Some(me.call(Slot::Body)));
            }
        })));
        id_cell.set(Some(id));

        assert!(id.call(Slot::Body));
        assert_eq!(inner_called.get(), Some(false));

        drop(effect_arena_remove(id));
    }

    #[test]
    fn active_effect_guard_restores_on_panic() {
        let outer = effect_arena_insert(EffectMetadata::new(Box::new(|| {})));
        let inner = effect_arena_insert(EffectMetadata::new(Box::new(|| {})));

        let _outer_guard = ActiveEffectGuard::new(Some(outer));
        let result = std::panic::catch_unwind(|| {
            let _guard = ActiveEffectGuard::new(Some(inner));
            assert_eq!(current_effect(), Some(inner));
            panic!("test panic");
        });

        assert!(result.is_err());
        assert_eq!(current_effect(), Some(outer));

        {
            let _paused = TrackingGuard::pause();
            assert_eq!(tracking_effect(), None);
            {
                let _enabled = TrackingGuard::enable();
                assert_eq!(tracking_effect(), Some(outer));
            }
            assert_eq!(tracking_effect(), None);
        }
        assert_eq!(tracking_effect(), Some(outer));

        drop(effect_arena_remove(outer));
        drop(effect_arena_remove(inner));
    }
}
