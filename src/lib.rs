#![deny(missing_docs)]

//! Fine-grained reactivity for state that is mirrored into a render host.
//!
//! State lives in observable containers. Computations read it, and every read
//! is recorded against the computation that made it. Writes invalidate exactly
//! the computations that read the changed key; those re-run right away, or
//! through a deduplicating job queue flushed once per tick. A bridge turns
//! each new state snapshot into a flat path → value patch for the host.
//!
//! # Quick Start
//!
//! ```ignore
//! use reactive_sync::{Computed, Effect, ReactiveRecord, bind_host, scheduler};
//!
//! let state = ReactiveRecord::new();
//! state.set("count", 1)?;
//!
//! // Memoized, re-evaluated lazily after "count" changes
//! let doubled = Computed::new({
//!     let state = state.clone();
//!     move || state.get_value("count").and_then(|v| v.as_scalar()?.as_f64()).unwrap_or(0.0) * 2.0
//! });
//!
//! // Synchronous effect
//! let _log = Effect::new({
//!     let doubled = doubled.clone();
//!     move || println!("doubled = {}", doubled.get())
//! });
//!
//! // Host sync through the job queue
//! let _binding = bind_host(&state, host, 1);
//!
//! state.set("count", 2)?;  // prints "doubled = 4"
//! scheduler::tick();       // host receives {"count": 2}
//! ```
//!
//! # Core Types
//!
//! - [`Observable<T>`] - A single typed value.
//! - [`ReactiveRecord`] / [`ReactiveList`] - Nested, JSON-shaped state. Nested
//!   containers are wrapped on access.
//! - [`ReactiveMap`] / [`ReactiveSet`] - Keyed collections with per-key tracking.
//! - [`Effect`] - Side-effectful computation. Re-runs when what it read changes.
//! - [`Computed<T>`] - Memoized value. Re-evaluates only when a source really changed.
//!
//! # Scheduling
//!
//! ```ignore
//! let effect = Effect::builder(render)
//!     .queued(JobOptions { id: Some(1), ..JobOptions::default() })
//!     .build();
//!
//! batch(|| { a.set(1); b.set(2); }); // synchronous effects run once
//! scheduler::tick();                 // queued jobs run once, by id
//! untracked(|| state.get("x"));      // read without subscribing
//! ```
//!
//! # Diffing
//!
//! ```ignore
//! let patch = diff(&current, &previous);
//! host.set_data(patch); // {"a.c": 2, "list[1]": 3}
//! ```
//!
//! All reactive state is confined to the thread that created it. Use an
//! [`EventLoop`] to own it on a dedicated thread.

// Internal modules
pub(crate) mod arena;
mod batch;
mod bridge;
mod computed;
mod diff;
mod effect;
mod error;
mod executor;
mod hash;
mod observable;
pub mod scheduler;
mod track;
mod value;

// Core types
pub use arena::{DirtyLevel, EffectId, current_effect};
pub use computed::Computed;
pub use effect::{Effect, EffectBuilder};
pub use error::{Error, Result};
pub use observable::{
    Access, Data, Observable, RawList, RawRecord, Reactive, ReactiveList, ReactiveMap,
    ReactiveRecord, ReactiveSet, reactive, readonly,
};
pub use value::{Scalar, Value};

// Key functions
pub use batch::{batch, is_batching};
pub use effect::untracked;

// Dependency table, for custom observable types
pub use track::{
    Key, Target, TargetId, TargetKind, TrackOp, TriggerOp, subscriber_count, track, trigger,
    trigger_resize,
};

// Job queue
pub use scheduler::{FlushReport, Job, JobOptions, SchedulerConfig, flush_jobs, queue_job, tick};

// Host sync
pub use bridge::{DataSync, HostBridge, bind_host};
pub use diff::{Patch, diff};
pub use executor::{EventLoop, LoopHandle};

#[cfg(test)]
mod tests;
