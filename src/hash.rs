//! Fixed-seed hashing for the runtime's internal tables.
//!
//! Every table in the runtime is keyed by small integer handles or by keys
//! hashed out of user collections. None of that is attacker controlled, so a
//! zero-sized, deterministic foldhash builder is used instead of `RandomState`.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized BuildHasher that uses foldhash with a fixed seed.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x517cc1b727220a95).build_hasher()
    }
}

pub(crate) type FastHashMap<K, V> = HashMap<K, V, FastHashBuilder>;
pub(crate) type FastIndexMap<K, V> = IndexMap<K, V, FastHashBuilder>;

/// Hash a collection key down to the `u64` used for its dependency slot.
///
/// Two distinct keys may collide; the only consequence is that a mutation of
/// one also re-runs readers of the other.
#[inline]
pub(crate) fn hash_key<T: Hash + ?Sized>(value: &T) -> u64 {
    FastHashBuilder.hash_one(value)
}
