//! Delivering state changes to a render host.
//!
//! A host only understands "set these paths to these values". [`DataSync`]
//! remembers the last snapshot sent and turns each new snapshot into a
//! [`Patch`]; [`bind_host`] wires that to a queued effect, so a burst of
//! writes within one tick reaches the host as one patch.

use crate::diff::{Patch, diff};
use crate::effect::{Effect, untracked};
use crate::observable::ReactiveRecord;
use crate::scheduler::JobOptions;
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

/// The receiving end of patches, typically a `setData`-style call across a
/// process boundary.
pub trait HostBridge {
    /// Apply `patch` to the host's copy of the state. An entry under the
    /// empty path replaces the whole state.
    fn set_data(&mut self, patch: Patch);
}

impl<H: HostBridge + ?Sized> HostBridge for Box<H> {
    fn set_data(&mut self, patch: Patch) {
        (**self).set_data(patch);
    }
}

impl<H: HostBridge + ?Sized> HostBridge for Rc<RefCell<H>> {
    fn set_data(&mut self, patch: Patch) {
        self.borrow_mut().set_data(patch);
    }
}

/// Snapshot memory for one host.
#[derive(Clone, Debug)]
pub struct DataSync {
    previous: Value,
}

impl DataSync {
    /// Start from an empty record: the first sync sends every key.
    pub fn new() -> Self {
        Self::with_previous(Value::record())
    }

    /// Start from a snapshot the host already has.
    pub fn with_previous(previous: Value) -> Self {
        Self { previous }
    }

    /// Diff `current` against the last snapshot and remember it.
    pub fn sync(&mut self, current: Value) -> Patch {
        let patch = diff(&current, &self.previous);
        self.previous = current;
        patch
    }

    /// The last snapshot.
    pub fn previous(&self) -> &Value {
        &self.previous
    }
}

impl Default for DataSync {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep `host` in sync with `state`.
///
/// The returned effect snapshots `state` (tracking every key it visits),
/// diffs it against the previous snapshot and hands non-empty patches to
/// `host`. It runs once right away and then through the job queue with id
/// `job_id`. Stopping or dropping the effect disconnects the host.
///
/// ```ignore
/// let state = ReactiveRecord::from_value(initial);
/// let _binding = bind_host(&state, host, 1);
/// state.set("title", "hello")?;
/// scheduler::tick(); // host receives {"title": "hello"}
/// ```
pub fn bind_host(state: &ReactiveRecord, host: impl HostBridge + 'static, job_id: u64) -> Effect {
    let state = state.clone();
    let mut host = host;
    let mut sync = DataSync::new();
    Effect::builder(move || {
        let patch = sync.sync(state.to_value());
        if patch.is_empty() {
            return;
        }
        trace!(job_id, paths = patch.len(), "delivering patch to host");
        untracked(|| host.set_data(patch));
    })
    .queued(JobOptions {
        id: Some(job_id),
        ..JobOptions::default()
    })
    .build()
}
