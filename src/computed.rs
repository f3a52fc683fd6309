use crate::Effect;
use crate::arena::{DepId, DepOwner, DirtyLevel, dep_arena_insert, tracking_effect};
use crate::error::{Error, Result};
use crate::track::{track_effect, trigger_effects};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// Type-erased view of a computed value, reachable from its dependency.
///
/// Lets a downstream computation re-check an upstream computed value without
/// knowing its type, and lets the dependency table unlink the computed
/// value's dependency once nobody reads it.
pub trait ComputedNode {
    /// Bring the cached value up to date without tracking the read.
    fn refresh(&self);

    /// `dep` lost its last subscriber and is being freed.
    fn release_dep(&self, dep: DepId);
}

type Getter<T> = Box<dyn Fn() -> T>;
type Setter<T> = Box<dyn Fn(T)>;

struct ComputedInner<T> {
    /// Computation re-evaluating the getter.
    /// Owned here so Effect::drop unsubscribes it when the value goes away.
    effect: Effect,
    /// Cached result of the latest evaluation.
    value: RefCell<Option<T>>,
    /// Set by an evaluation whose result differs from the cached one.
    changed: Cell<bool>,
    /// Outward-facing dependency; allocated on the first tracked read.
    dep: Cell<Option<DepId>>,
    this: Weak<ComputedInner<T>>,
    setter: Option<Setter<T>>,
}

impl<T: Clone + PartialEq + 'static> ComputedInner<T> {
    fn evaluate(&self) {
        if self.effect.dirty() {
            self.effect.run();
            if self.changed.take() {
                self.notify(DirtyLevel::Dirty);
            }
        }
    }

    /// Record the active computation as a reader of this value.
    fn track(&self) {
        let Some(reader) = tracking_effect() else {
            return;
        };
        let dep = match self.dep.get().filter(|dep| dep.is_live()) {
            Some(dep) => dep,
            None => {
                let node: Weak<dyn ComputedNode> = self.this.clone();
                let dep = dep_arena_insert(DepOwner::Computed(node));
                self.dep.set(Some(dep));
                dep
            }
        };
        track_effect(reader, dep);
    }

    fn notify(&self, level: DirtyLevel) {
        if let Some(dep) = self.dep.get() {
            trigger_effects(dep, level);
        }
    }

    /// A getter that writes to its own sources leaves the computation dirty
    /// after running; readers are told they may be stale without being
    /// scheduled.
    fn notify_side_effect(&self) {
        if self.effect.level() >= DirtyLevel::ComputedPending {
            cov_mark::hit!(computed_side_effect);
            self.notify(DirtyLevel::ComputedPending);
        }
    }
}

impl<T: Clone + PartialEq + 'static> ComputedNode for ComputedInner<T> {
    fn refresh(&self) {
        self.evaluate();
        self.notify_side_effect();
    }

    fn release_dep(&self, dep: DepId) {
        if self.dep.get() == Some(dep) {
            self.dep.set(None);
        }
    }
}

/// Memoized derived value that re-evaluates lazily when its sources change
///
/// A Computed is a computation that caches its getter's result and is itself
/// an observable source. Reading it from another computation subscribes that
/// computation to the computed value, not to the getter's own sources.
///
/// # How it works
/// - The getter only runs on a read, and only if a source changed since the
///   previous evaluation.
/// - When a source changes, readers are marked as *possibly* stale. Before
///   re-running, a reader re-evaluates the computed value; if the result
///   compares equal to the cached one the reader stays clean.
///
/// # Example
/// ```ignore
/// let voltage = Observable::new(2.0);
/// let current = Observable::new(3.0);
///
/// let power = Computed::new({
///     let (voltage, current) = (voltage.clone(), current.clone());
///     move || voltage.get() * current.get()
/// });
///
/// assert_eq!(power.get(), 6.0); // getter runs
/// assert_eq!(power.get(), 6.0); // cached
///
/// voltage.set(4.0);
/// assert_eq!(power.get(), 12.0); // getter runs again
/// ```
pub struct Computed<T> {
    inner: Rc<ComputedInner<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + PartialEq + 'static> Computed<T> {
    /// Create a read-only computed value. The getter does not run until the
    /// first read.
    pub fn new<F>(getter: F) -> Self
    where
        F: Fn() -> T + 'static,
    {
        Self::new_internal(Box::new(getter), None)
    }

    /// Create a computed value whose writes are forwarded to `setter`.
    ///
    /// The setter is expected to write the sources the getter reads; the
    /// computed value itself is never assigned directly.
    pub fn writable<F, S>(getter: F, setter: S) -> Self
    where
        F: Fn() -> T + 'static,
        S: Fn(T) + 'static,
    {
        Self::new_internal(Box::new(getter), Some(Box::new(setter)))
    }

    fn new_internal(getter: Getter<T>, setter: Option<Setter<T>>) -> Self {
        let inner = Rc::new_cyclic(|this: &Weak<ComputedInner<T>>| {
            let for_body = this.clone();
            let body = Box::new(move || {
                let Some(inner) = for_body.upgrade() else {
                    return;
                };
                // Sources read by the getter are tracked against this
                // computation via the active-computation slot.
                let next = getter();
                let mut cached = inner.value.borrow_mut();
                if cached.as_ref() != Some(&next) {
                    *cached = Some(next);
                    inner.changed.set(true);
                }
            });

            let for_trigger = this.clone();
            let trigger = Box::new(move || {
                let Some(inner) = for_trigger.upgrade() else {
                    return;
                };
                let level = if inner.effect.level() == DirtyLevel::ComputedPending {
                    DirtyLevel::ComputedPending
                } else {
                    DirtyLevel::ComputedInvalidated
                };
                inner.notify(level);
            });

            ComputedInner {
                effect: Effect::for_computed(body, trigger),
                value: RefCell::new(None),
                changed: Cell::new(false),
                dep: Cell::new(None),
                this: this.clone(),
                setter,
            }
        });
        Self { inner }
    }

    /// Get the current value, re-evaluating if a source changed
    ///
    /// Tracks the read against the active computation.
    pub fn get(&self) -> T {
        self.with(T::clone)
    }

    /// Borrow the current value without cloning it.
    ///
    /// # Panics
    ///
    /// If the getter reads its own computed value before that value has
    /// ever been produced. A self-read on a later evaluation sees the
    /// previous value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.evaluate();
        self.inner.track();
        self.inner.notify_side_effect();
        let value = self.inner.value.borrow();
        if value.is_none() {
            tracing::error!("computed value read by its own getter before its first evaluation");
        }
        f(value
            .as_ref()
            .expect("computed value must be evaluated before being read"))
    }

    /// Forward a write to the setter.
    ///
    /// Read-only computed values reject the write with
    /// [`Error::ReadonlyComputed`].
    pub fn set(&self, value: T) -> Result<()> {
        match &self.inner.setter {
            Some(setter) => {
                setter(value);
                Ok(())
            }
            None => {
                tracing::warn!("write operation failed: computed value is readonly");
                Err(Error::ReadonlyComputed)
            }
        }
    }

    /// Whether writes are accepted.
    pub fn is_writable(&self) -> bool {
        self.inner.setter.is_some()
    }

    /// Current dirty level of the backing computation.
    pub fn level(&self) -> DirtyLevel {
        self.inner.effect.level()
    }

    /// Number of computations currently reading this value.
    pub fn subscriber_count(&self) -> usize {
        self.inner.dep.get().map_or(0, DepId::subscriber_count)
    }
}

impl<T: fmt::Debug> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("value", &self.inner.value.try_borrow().ok())
            .field("level", &self.inner.effect.level())
            .finish()
    }
}
