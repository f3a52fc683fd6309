use crate::track::{Key, Target, TargetKind, TrackOp, TriggerOp, track, trigger};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

struct CellInner<T> {
    target: Target,
    value: RefCell<T>,
}

/// A single observable value
///
/// The typed counterpart of [`ReactiveRecord`](crate::ReactiveRecord) for
/// one value: [`get`](Self::get) tracks, [`set`](Self::set) triggers when
/// the new value differs. Cloning shares the cell.
///
/// Change detection uses `PartialEq`, so a float cell holding `NaN`
/// triggers on every `NaN` write; wrap the value in [`Scalar`](crate::Scalar)
/// for same-value semantics.
///
/// # Example
/// ```ignore
/// let count = Observable::new(0);
/// let doubled = Computed::new({
///     let count = count.clone();
///     move || count.get() * 2
/// });
///
/// count.set(21);
/// assert_eq!(doubled.get(), 42);
/// ```
pub struct Observable<T> {
    inner: Rc<CellInner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Observable<T> {
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(CellInner {
                target: Target::new(TargetKind::Cell),
                value: RefCell::new(value),
            }),
        }
    }

    /// The cell's identity in the dependency table.
    pub fn target(&self) -> Target {
        self.inner.target
    }

    /// Borrow the value, tracking the read.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        track(self.inner.target, TrackOp::Get, Key::Value);
        f(&self.inner.value.borrow())
    }

    /// Get a copy of the value, tracking the read.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Get a copy of the value without tracking.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.borrow().clone()
    }

    /// Replace the value; triggers readers only if it changed.
    ///
    /// Returns whether it changed.
    pub fn set(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        let previous = {
            let mut current = self.inner.value.borrow_mut();
            if *current == value {
                return false;
            }
            std::mem::replace(&mut *current, value)
        };
        trigger(self.inner.target, TriggerOp::Set, Some(&Key::Value));
        drop(previous);
        true
    }

    /// Mutate the value in place and trigger readers unconditionally.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.inner.value.borrow_mut());
        trigger(self.inner.target, TriggerOp::Set, Some(&Key::Value));
        result
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("target", &self.inner.target.id())
            .field("value", &self.inner.value.try_borrow().ok())
            .finish()
    }
}
