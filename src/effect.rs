use crate::arena::{
    ActiveEffectGuard, Callback, DirtyLevel, EffectId, EffectMetadata, Slot, TrackingGuard,
    effect_arena_insert, effect_arena_remove,
};
use crate::batch::forget_queued;
use crate::scheduler::{self, Job, JobOptions, queue_job};
use crate::track::{post_cleanup, pre_cleanup};

impl EffectId {
    /// Run the computation now, re-recording its dependencies.
    pub fn run(self) {
        run_effect(self);
    }

    /// Whether the computation has to re-run.
    ///
    /// A computation that was only escalated through an upstream computed
    /// value re-evaluates that value first; if its output did not change the
    /// computation drops back to Clean without running.
    pub fn dirty(self) -> bool {
        is_dirty(self)
    }

    /// Detach the computation from everything it reads.
    pub fn stop(self) {
        stop_effect(self);
    }
}

/// Bookkeeping around one run of a computation body.
///
/// Construction opens a new revision; dropping (also during unwinding) trims
/// the dependencies the run did not read.
struct RunGuard {
    effect: EffectId,
}

impl RunGuard {
    fn new(effect: EffectId) -> Self {
        pre_cleanup(effect);
        effect.with_mut(|meta| meta.runnings += 1);
        Self { effect }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        post_cleanup(self.effect);
        self.effect
            .with_mut(|meta| meta.runnings = meta.runnings.saturating_sub(1));
    }
}

/// Run a computation, repeating while a nested run was requested from inside
/// its own body.
pub(crate) fn run_effect(effect: EffectId) {
    if !run_once(effect) {
        return;
    }
    let limit = scheduler::config().recursion_limit;
    let mut reruns = 0;
    while effect
        .with_mut(|meta| std::mem::take(&mut meta.rerun_requested))
        .unwrap_or(false)
    {
        reruns += 1;
        if reruns > limit {
            tracing::error!(
                ?effect,
                limit,
                "computation keeps re-triggering itself while running, giving up"
            );
            return;
        }
        run_once(effect);
    }
}

/// Returns false when the computation was already running; the request is
/// then recorded and served once the outer run finishes.
fn run_once(effect: EffectId) -> bool {
    // The body is taken out of the arena while it runs, so a missing body
    // means this is a nested run of the same computation.
    let busy = effect.with_mut(|meta| {
        if meta.body.is_none() {
            meta.rerun_requested = true;
            true
        } else {
            meta.level = DirtyLevel::Clean;
            false
        }
    });
    match busy {
        None => return false,
        Some(true) => {
            cov_mark::hit!(nested_run_deferred);
            return false;
        }
        Some(false) => {}
    }

    if !effect.is_active() {
        effect.call(Slot::Body);
        return true;
    }

    // Guards drop in reverse order: trim deps, restore the previous active
    // computation, then the previous tracking flag.
    let _tracking = TrackingGuard::enable();
    let _active = ActiveEffectGuard::new(Some(effect));
    let _run = RunGuard::new(effect);
    effect.call(Slot::Body);
    true
}

pub(crate) fn is_dirty(effect: EffectId) -> bool {
    let level = effect.level();
    if matches!(
        level,
        DirtyLevel::ComputedPending | DirtyLevel::ComputedInvalidated
    ) {
        effect.set_level(DirtyLevel::Querying);
        let _paused = TrackingGuard::pause();
        for dep in effect.deps() {
            let Some(computed) = dep.computed() else {
                continue;
            };
            computed.refresh();
            if effect.level() >= DirtyLevel::Dirty {
                break;
            }
        }
        if effect.level() == DirtyLevel::Querying {
            cov_mark::hit!(upstream_computed_unchanged);
            effect.set_level(DirtyLevel::Clean);
        }
    }
    effect.level() >= DirtyLevel::Dirty
}

pub(crate) fn stop_effect(effect: EffectId) {
    let taken = effect
        .with_mut(|meta| {
            if !meta.active {
                return None;
            }
            meta.active = false;
            Some((meta.on_stop.take(), meta.job.clone()))
        })
        .flatten();
    let Some((on_stop, job)) = taken else {
        return;
    };
    pre_cleanup(effect);
    post_cleanup(effect);
    if let Some(job) = job {
        job.deactivate();
    }
    if let Some(on_stop) = on_stop {
        on_stop();
    }
    tracing::debug!(?effect, "computation stopped");
}

pub(crate) fn run_scheduler(effect: EffectId) {
    if !effect.call(Slot::Scheduler) && effect.is_live() {
        cov_mark::hit!(scheduler_reentered);
        effect.with_mut(|meta| meta.rerun_requested = true);
    }
}

/// Run a closure without tracking dependencies
///
/// Reads inside `f` are not recorded against the running computation, so
/// changes to them never re-run it.
///
/// # Example
/// ```ignore
/// let effect = Effect::new(move || {
///     // Tracked: the effect re-runs when `count` changes
///     let count = count.get();
///
///     // Not tracked: changes to `label` alone don't re-run the effect
///     let label = untracked(|| label.get());
/// });
/// ```
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    // The guard restores the previous flag even if f panics
    let _paused = TrackingGuard::pause();
    f()
}

/// Side-effectful computation that automatically re-runs when what it read changes
///
/// An effect records every observable read made by its body. When one of those
/// sources changes, the effect is escalated and its scheduler is called once
/// for that invalidation window. The default scheduler re-runs the body
/// synchronously when the effect is actually dirty; [`EffectBuilder::queued`]
/// defers the re-run to the job queue instead.
///
/// # Example
/// ```ignore
/// let count = Observable::new(1);
///
/// // Runs immediately and tracks `count`
/// let effect = Effect::new({
///     let count = count.clone();
///     move || println!("count is {}", count.get())
/// });
///
/// count.set(2); // prints "count is 2"
/// count.set(2); // same value, nothing happens
///
/// effect.stop();
/// count.set(3); // stopped, nothing happens
/// ```
///
/// Dropping the effect stops it and frees its arena slot.
pub struct Effect {
    id: EffectId,
}

impl Effect {
    /// Create an effect with the default synchronous scheduler and run it.
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() + 'static,
    {
        Self::builder(f).build()
    }

    /// Start configuring an effect around `f`.
    pub fn builder<F>(f: F) -> EffectBuilder
    where
        F: FnMut() + 'static,
    {
        EffectBuilder {
            body: Box::new(f),
            scheduler: None,
            trigger: None,
            job: None,
            on_stop: None,
            allow_recurse: false,
            lazy: false,
        }
    }

    /// Computation backing a computed value: never run eagerly, no scheduler.
    pub(crate) fn for_computed(body: Callback, trigger: Callback) -> Self {
        let mut metadata = EffectMetadata::new(body);
        metadata.trigger = Some(trigger);
        Self {
            id: effect_arena_insert(metadata),
        }
    }

    /// Run the body now, re-recording its dependencies.
    pub fn run(&self) {
        run_effect(self.id);
    }

    /// Whether the effect has to re-run. See [`EffectId::dirty`].
    pub fn dirty(&self) -> bool {
        is_dirty(self.id)
    }

    /// Current dirty level.
    pub fn level(&self) -> DirtyLevel {
        self.id.level()
    }

    /// Whether the effect has not been stopped.
    pub fn is_active(&self) -> bool {
        self.id.is_active()
    }

    /// Detach from every dependency and run the stop hook.
    ///
    /// Idempotent. A stopped effect can still be run by hand, but it no longer
    /// records dependencies.
    pub fn stop(&self) {
        stop_effect(self.id);
    }

    /// The job a queued effect re-runs through.
    pub fn job(&self) -> Option<Job> {
        self.id.with(|meta| meta.job.clone()).flatten()
    }

    /// Number of dependencies recorded by the latest run.
    pub fn dep_count(&self) -> usize {
        self.id.dep_count()
    }

    /// The effect's arena handle.
    pub fn id(&self) -> EffectId {
        self.id
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        // 1. Unsubscribe and deactivate the job (runs the stop hook)
        stop_effect(self.id);

        // 2. Drop any scheduler call still waiting for the pause to end
        forget_queued(self.id);

        // 3. Deallocate; callbacks are dropped outside the arena borrow
        drop(effect_arena_remove(self.id));
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id)
            .field("level", &self.level())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Builder for [`Effect`].
pub struct EffectBuilder {
    body: Callback,
    scheduler: Option<Box<dyn FnMut(EffectId)>>,
    trigger: Option<Callback>,
    job: Option<JobOptions>,
    on_stop: Option<Box<dyn FnOnce()>>,
    allow_recurse: bool,
    lazy: bool,
}

impl EffectBuilder {
    /// Replace the default scheduler.
    ///
    /// Called once per invalidation window with the effect's handle; it
    /// decides when (and whether) to call [`EffectId::run`].
    pub fn scheduler<S>(mut self, scheduler: S) -> Self
    where
        S: FnMut(EffectId) + 'static,
    {
        self.scheduler = Some(Box::new(scheduler));
        self
    }

    /// Callback invoked synchronously on the first escalation past Clean.
    pub fn trigger<T>(mut self, trigger: T) -> Self
    where
        T: FnMut() + 'static,
    {
        self.trigger = Some(Box::new(trigger));
        self
    }

    /// Re-run through the job queue instead of synchronously.
    ///
    /// The effect gets a [`Job`] built from `options`; invalidations enqueue
    /// it and the next flush re-runs the effect if it is still dirty.
    pub fn queued(mut self, options: JobOptions) -> Self {
        self.job = Some(options);
        self
    }

    /// Hook run once when the effect is stopped or dropped.
    pub fn on_stop<S>(mut self, on_stop: S) -> Self
    where
        S: FnOnce() + 'static,
    {
        self.on_stop = Some(Box::new(on_stop));
        self
    }

    /// Let writes made by the effect's own run schedule it again.
    pub fn allow_recurse(mut self) -> Self {
        self.allow_recurse = true;
        self
    }

    /// Don't run the body on creation.
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Create the effect, running it once unless it is lazy.
    pub fn build(self) -> Effect {
        let mut metadata = EffectMetadata::new(self.body);
        metadata.trigger = self.trigger;
        metadata.on_stop = self.on_stop;
        metadata.allow_recurse = self.allow_recurse;
        metadata.has_scheduler = true;
        let id = effect_arena_insert(metadata);

        let job = self.job.map(|mut options| {
            options.allow_recurse |= self.allow_recurse;
            Job::with_options(options, move || {
                if id.dirty() {
                    id.run();
                }
            })
        });
        let scheduler: Callback = match (self.scheduler, &job) {
            (Some(mut scheduler), _) => Box::new(move || scheduler(id)),
            (None, Some(job)) => {
                let job = job.clone();
                Box::new(move || queue_job(&job))
            }
            (None, None) => Box::new(move || {
                if id.dirty() {
                    id.run();
                }
            }),
        };
        id.with_mut(|meta| {
            meta.scheduler = Some(scheduler);
            meta.job = job;
        });

        let effect = Effect { id };
        if !self.lazy {
            effect.run();
        }
        effect
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Observable;
    use crate::track::{Key, subscriber_count};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn counter() -> Rc<Cell<usize>> {
        Rc::new(Cell::new(0))
    }

    #[test]
    fn effect_runs_on_creation_and_on_change() {
        let source = Observable::new(1);
        let runs = counter();
        let _effect = {
            let (source, runs) = (source.clone(), runs.clone());
            Effect::new(move || {
                source.get();
                runs.set(runs.get() + 1);
            })
        };
        assert_eq!(runs.get(), 1);

        source.set(2);
        assert_eq!(runs.get(), 2);

        // Identical value: no trigger
        source.set(2);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn lazy_effect_waits_for_first_run() {
        let runs = counter();
        let effect = {
            let runs = runs.clone();
            Effect::builder(move || runs.set(runs.get() + 1)).lazy().build()
        };
        assert_eq!(runs.get(), 0);
        assert!(effect.dirty());

        effect.run();
        assert_eq!(runs.get(), 1);
        assert!(!effect.dirty());
    }

    #[test]
    fn custom_scheduler_called_once_per_window() {
        let source = Observable::new(0);
        let scheduled = counter();
        let effect = {
            let source = source.clone();
            let scheduled = scheduled.clone();
            Effect::builder(move || {
                source.get();
            })
            .scheduler(move |_| scheduled.set(scheduled.get() + 1))
            .build()
        };

        source.set(1);
        source.set(2);
        source.set(3);
        assert_eq!(scheduled.get(), 1);
        assert_eq!(effect.level(), DirtyLevel::Dirty);

        // Running re-opens the window
        effect.run();
        source.set(4);
        assert_eq!(scheduled.get(), 2);
    }

    #[test]
    fn trigger_runs_before_scheduler() {
        let source = Observable::new(0);
        let log = Rc::new(RefCell::new(Vec::new()));
        let _effect = {
            let source = source.clone();
            let (trigger_log, scheduler_log) = (log.clone(), log.clone());
            Effect::builder(move || {
                source.get();
            })
            .trigger(move || trigger_log.borrow_mut().push("trigger"))
            .scheduler(move |_| scheduler_log.borrow_mut().push("scheduler"))
            .build()
        };

        source.set(1);
        assert_eq!(*log.borrow(), ["trigger", "scheduler"]);
    }

    #[test]
    fn stop_is_idempotent_and_unsubscribes() {
        let source = Observable::new(0);
        let runs = counter();
        let stops = counter();
        let effect = {
            let (source, runs, stops) = (source.clone(), runs.clone(), stops.clone());
            Effect::builder(move || {
                source.get();
                runs.set(runs.get() + 1);
            })
            .on_stop(move || stops.set(stops.get() + 1))
            .build()
        };
        assert_eq!(subscriber_count(source.target(), &Key::Value), 1);

        effect.stop();
        effect.stop();
        assert_eq!(stops.get(), 1);
        assert!(!effect.is_active());
        assert_eq!(effect.dep_count(), 0);
        assert_eq!(subscriber_count(source.target(), &Key::Value), 0);

        source.set(1);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn dropping_effect_unsubscribes() {
        let source = Observable::new(0);
        let effect = {
            let source = source.clone();
            Effect::new(move || {
                source.get();
            })
        };
        let id = effect.id();
        assert_eq!(subscriber_count(source.target(), &Key::Value), 1);

        drop(effect);
        assert!(!id.is_live());
        assert_eq!(subscriber_count(source.target(), &Key::Value), 0);
    }

    #[test]
    fn branch_switch_drops_unread_dependency() {
        let toggle = Observable::new(true);
        let a = Observable::new(0);
        let b = Observable::new(0);
        let runs = counter();
        let effect = {
            let (toggle, a, b, runs) = (toggle.clone(), a.clone(), b.clone(), runs.clone());
            Effect::new(move || {
                runs.set(runs.get() + 1);
                if toggle.get() {
                    a.get();
                } else {
                    b.get();
                }
            })
        };
        assert_eq!(effect.dep_count(), 2);

        toggle.set(false);
        assert_eq!(runs.get(), 2);
        assert_eq!(subscriber_count(a.target(), &Key::Value), 0);

        // `a` is no longer read
        a.set(1);
        assert_eq!(runs.get(), 2);
        b.set(1);
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn nested_effects_restore_active_computation() {
        let outer_source = Observable::new(0);
        let inner_source = Observable::new(0);
        let outer_runs = counter();
        let inner = Rc::new(RefCell::new(None));
        let outer = {
            let (outer_source, inner_source) = (outer_source.clone(), inner_source.clone());
            let (outer_runs, inner) = (outer_runs.clone(), inner.clone());
            Effect::new(move || {
                outer_runs.set(outer_runs.get() + 1);
                let inner_source = inner_source.clone();
                *inner.borrow_mut() = Some(Effect::new(move || {
                    inner_source.get();
                }));
                // Read after the nested effect finished: recorded on the outer one
                outer_source.get();
            })
        };
        assert_eq!(outer.dep_count(), 1);

        inner_source.set(1);
        assert_eq!(outer_runs.get(), 1);
        outer_source.set(1);
        assert_eq!(outer_runs.get(), 2);
    }

    #[test]
    fn panicking_body_keeps_graph_consistent() {
        let source = Observable::new(0);
        let runs = counter();
        let effect = {
            let (source, runs) = (source.clone(), runs.clone());
            Effect::builder(move || {
                runs.set(runs.get() + 1);
                if source.get() == 1 {
                    panic!("bad value");
                }
            })
            .build()
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| source.set(1)));
        assert!(result.is_err());
        assert_eq!(crate::arena::current_effect(), None);
        assert_eq!(effect.dep_count(), 1);

        source.set(2);
        assert_eq!(runs.get(), 3);
        assert_eq!(subscriber_count(source.target(), &Key::Value), 1);
    }

    #[test]
    fn untracked_reads_are_not_recorded() {
        let tracked = Observable::new(0);
        let hidden = Observable::new(0);
        let runs = counter();
        let effect = {
            let (tracked, hidden, runs) = (tracked.clone(), hidden.clone(), runs.clone());
            Effect::new(move || {
                runs.set(runs.get() + 1);
                tracked.get();
                untracked(|| hidden.get());
            })
        };
        assert_eq!(effect.dep_count(), 1);

        hidden.set(1);
        assert_eq!(runs.get(), 1);
        tracked.set(1);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn self_write_without_recurse_does_not_loop() {
        let source = Observable::new(0);
        let runs = counter();
        let _effect = {
            let (source, runs) = (source.clone(), runs.clone());
            Effect::new(move || {
                runs.set(runs.get() + 1);
                let value = source.get();
                if value < 5 {
                    source.set(value + 1);
                }
            })
        };
        assert_eq!(runs.get(), 1);
        assert_eq!(source.get_untracked(), 1);
    }

    #[test]
    fn self_write_with_recurse_reruns_after_current_run() {
        cov_mark::check!(nested_run_deferred);
        let source = Observable::new(0);
        let runs = counter();
        let _effect = {
            let (source, runs) = (source.clone(), runs.clone());
            Effect::builder(move || {
                runs.set(runs.get() + 1);
                let value = source.get();
                if value < 3 {
                    source.set(value + 1);
                }
            })
            .allow_recurse()
            .build()
        };
        assert_eq!(source.get_untracked(), 3);
        assert_eq!(runs.get(), 4);
    }
}
