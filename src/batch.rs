use crate::arena::EffectId;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

// Nesting depth of scheduling pauses on this thread.
// While > 0, schedulers of escalated computations are queued instead of called.
thread_local! {
    static SCHEDULE_DEPTH: Cell<usize> = const { Cell::new(0) };
    static QUEUED_SCHEDULERS: RefCell<VecDeque<EffectId>> = const { RefCell::new(VecDeque::new()) };
}

/// RAII guard that defers scheduler dispatch until the outermost guard drops.
///
/// Every trigger pass holds one of these, so a single mutation that escalates
/// several computations only calls their schedulers once the whole pass is
/// done. When the last guard is dropped the queued schedulers are drained in
/// the order they were queued.
pub(crate) struct SchedulingPause {
    _private: (),
}

impl SchedulingPause {
    pub(crate) fn new() -> Self {
        SCHEDULE_DEPTH.set(SCHEDULE_DEPTH.get() + 1);
        Self { _private: () }
    }
}

impl Drop for SchedulingPause {
    fn drop(&mut self) {
        let Ok(depth) = SCHEDULE_DEPTH.try_with(|depth| {
            let next = depth.get().saturating_sub(1);
            depth.set(next);
            next
        }) else {
            return;
        };
        if depth > 0 {
            return;
        }
        if std::thread::panicking() {
            // Don't run user code while unwinding. The dropped computations
            // keep their dirty level and get rescheduled by the next trigger.
            let dropped: Vec<EffectId> = QUEUED_SCHEDULERS
                .try_with(|queue| queue.borrow_mut().drain(..).collect())
                .unwrap_or_default();
            for effect in dropped {
                effect.with_mut(|meta| meta.should_schedule = true);
            }
            return;
        }
        drain_schedulers();
    }
}

fn drain_schedulers() {
    loop {
        if SCHEDULE_DEPTH.get() > 0 {
            return;
        }
        let Some(effect) = QUEUED_SCHEDULERS.with_borrow_mut(VecDeque::pop_front) else {
            return;
        };
        crate::effect::run_scheduler(effect);
    }
}

/// Queue the scheduler of `effect`; it runs when scheduling resumes.
pub(crate) fn queue_effect_scheduler(effect: EffectId) {
    QUEUED_SCHEDULERS.with_borrow_mut(|queue| queue.push_back(effect));
}

/// Drop any queued scheduler call for a computation that is going away.
pub(crate) fn forget_queued(effect: EffectId) {
    let _ = QUEUED_SCHEDULERS.try_with(|queue| {
        if let Ok(mut queue) = queue.try_borrow_mut() {
            queue.retain(|queued| *queued != effect);
        }
    });
}

/// Check if scheduler dispatch is currently paused on this thread.
///
/// True inside [`batch`] and while a trigger pass is notifying subscribers.
pub fn is_batching() -> bool {
    SCHEDULE_DEPTH.get() > 0
}

/// Batch several mutations into a single re-run of each affected computation.
///
/// Mutations inside `f` escalate their subscribers as usual, but schedulers
/// (and therefore synchronous re-runs) are held back until the outermost
/// `batch` returns. A computation hit by several of the mutations runs once.
///
/// # Example
/// ```ignore
/// let count = Observable::new(0);
/// let label = Observable::new(String::new());
/// let _effect = Effect::new(move || println!("{} {}", label.get(), count.get()));
///
/// batch(|| {
///     count.set(1);            // effect escalated, not run
///     label.set("items".into());
/// });                          // effect runs once here
/// ```
///
/// The guard is released on unwind as well, so a panicking `f` leaves the
/// thread in a consistent state.
pub fn batch<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _pause = SchedulingPause::new();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Effect, Observable};
    use std::rc::Rc;

    #[test]
    fn batch_nesting_tracks_depth() {
        assert!(!is_batching());
        batch(|| {
            assert!(is_batching());
            batch(|| assert!(is_batching()));
            assert!(is_batching());
        });
        assert!(!is_batching());
    }

    #[test]
    fn batch_returns_value() {
        assert_eq!(batch(|| 42), 42);
    }

    #[test]
    fn batched_writes_run_effect_once() {
        let a = Observable::new(1);
        let b = Observable::new(2);
        let runs = Rc::new(Cell::new(0));
        let seen = Rc::new(Cell::new(0));
        let _effect = {
            let (a, b, runs, seen) = (a.clone(), b.clone(), runs.clone(), seen.clone());
            Effect::new(move || {
                runs.set(runs.get() + 1);
                seen.set(a.get() + b.get());
            })
        };
        assert_eq!(runs.get(), 1);

        batch(|| {
            a.set(10);
            b.set(20);
            assert_eq!(runs.get(), 1);
        });
        assert_eq!(runs.get(), 2);
        assert_eq!(seen.get(), 30);
    }

    #[test]
    fn panic_inside_batch_releases_pause() {
        let value = Observable::new(0);
        let runs = Rc::new(Cell::new(0));
        let _effect = {
            let (value, runs) = (value.clone(), runs.clone());
            Effect::new(move || {
                value.get();
                runs.set(runs.get() + 1);
            })
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            batch(|| {
                value.set(1);
                panic!("inside batch");
            })
        }));
        assert!(result.is_err());
        assert!(!is_batching());
        assert_eq!(runs.get(), 1);

        // The escalation dropped during unwinding is picked up by the next write.
        value.set(2);
        assert_eq!(runs.get(), 2);
    }
}
