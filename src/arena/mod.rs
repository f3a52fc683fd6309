// Arena-based storage for the reactive graph
//
// This module provides two separate arenas:
// - Effect arena: stores EffectMetadata (computations and computed values)
// - Dep arena: stores DepMetadata (subscribers of one (target, key) pair)
//
// Both arenas are thread-local slabs; the runtime is confined to one thread.
// EffectId and DepId carry a generation so a handle that outlives its slot
// never aliases whatever gets allocated there next.

pub mod dep_arena;
pub mod effect_arena;

use std::cell::Cell;

thread_local! {
    static NEXT_GENERATION: Cell<u32> = const { Cell::new(1) };
}

/// Hand out the generation stamp for a freshly inserted arena slot.
pub(crate) fn next_generation() -> u32 {
    NEXT_GENERATION.with(|generation| {
        let current = generation.get();
        generation.set(current.wrapping_add(1).max(1));
        current
    })
}

pub use dep_arena::{DepId, DepOwner, dep_arena_insert, dep_arena_remove};
pub use effect_arena::{
    ActiveEffectGuard, Callback, DirtyLevel, EffectId, EffectMetadata, Slot, TrackingGuard,
    current_effect, effect_arena_insert, effect_arena_remove, tracking_effect,
};
