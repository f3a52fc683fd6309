use super::{Access, Data, Reactive, readonly_violation, to_value};
use crate::error::{Error, Result};
use crate::track::{Key, Target, TargetKind, TrackOp, TriggerOp, track, trigger, trigger_resize};
use crate::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

struct ListInner {
    target: Target,
    items: RefCell<Vec<Data>>,
}

/// A shared, ordered list of raw data.
///
/// Cloning shares the list. Equality is identity.
#[derive(Clone)]
pub struct RawList {
    inner: Rc<ListInner>,
}

impl RawList {
    /// An empty list.
    pub fn new() -> Self {
        Self::from_data(Vec::new())
    }

    pub(crate) fn from_data(items: Vec<Data>) -> Self {
        Self {
            inner: Rc::new(ListInner {
                target: Target::new(TargetKind::List),
                items: RefCell::new(items),
            }),
        }
    }

    /// The list's identity in the dependency table.
    pub fn target(&self) -> Target {
        self.inner.target
    }

    /// Copy of the items, without tracking.
    pub fn items(&self) -> Vec<Data> {
        self.inner.items.borrow().clone()
    }

    /// Read an item without tracking.
    pub fn get(&self, index: usize) -> Option<Data> {
        self.inner.items.borrow().get(index).cloned()
    }

    /// Number of items, without tracking.
    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RawList {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for RawList {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RawList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawList")
            .field("target", &self.inner.target.id())
            .field("len", &self.len())
            .finish()
    }
}

/// Reactive handle over a [`RawList`]
///
/// Index reads are tracked per index, length reads under the length key.
/// Mutations trigger exactly the indices whose content changed, plus the
/// length when it changed. Searches track every index they look at.
#[derive(Clone, PartialEq)]
pub struct ReactiveList {
    raw: RawList,
    access: Access,
}

impl ReactiveList {
    /// A fresh, empty, mutable list.
    pub fn new() -> Self {
        Self::wrap(RawList::new(), Access::Mutable)
    }

    /// A mutable list holding a copy of `items`.
    pub fn from_values(items: &[Value]) -> Self {
        Self::wrap(
            RawList::from_data(items.iter().map(Data::from_value).collect()),
            Access::Mutable,
        )
    }

    /// Wrap an existing raw list.
    pub fn wrap(raw: RawList, access: Access) -> Self {
        Self { raw, access }
    }

    /// The raw list behind the handle.
    pub fn raw(&self) -> &RawList {
        &self.raw
    }

    /// The list's identity in the dependency table.
    pub fn target(&self) -> Target {
        self.raw.target()
    }

    /// Whether writes are rejected.
    pub fn is_readonly(&self) -> bool {
        self.access == Access::Readonly
    }

    /// A readonly handle over the same list.
    pub fn readonly(&self) -> Self {
        Self::wrap(self.raw.clone(), Access::Readonly)
    }

    /// Read an item; nested containers come back wrapped.
    pub fn get(&self, index: usize) -> Option<Reactive> {
        track(self.target(), TrackOp::Get, Key::Index(index));
        self.raw
            .get(index)
            .map(|data| Reactive::wrap(data, self.access))
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        track(self.target(), TrackOp::Get, Key::Length);
        self.raw.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every item, wrapped.
    pub fn to_vec(&self) -> Vec<Reactive> {
        let target = self.target();
        track(target, TrackOp::Iterate, Key::Length);
        self.raw
            .items()
            .into_iter()
            .enumerate()
            .map(|(index, data)| {
                track(target, TrackOp::Get, Key::Index(index));
                Reactive::wrap(data, self.access)
            })
            .collect()
    }

    /// Position of the first item identical to `needle`.
    pub fn index_of(&self, needle: impl Into<Data>) -> Option<usize> {
        let needle = needle.into();
        let target = self.target();
        track(target, TrackOp::Get, Key::Length);
        let items = self.raw.items();
        for (index, item) in items.iter().enumerate() {
            track(target, TrackOp::Get, Key::Index(index));
            if item.is_same(&needle) {
                return Some(index);
            }
        }
        None
    }

    /// Whether an item identical to `needle` is present.
    pub fn contains(&self, needle: impl Into<Data>) -> bool {
        self.index_of(needle).is_some()
    }

    fn check_writable(&self, key: Key) -> Result<()> {
        if self.is_readonly() {
            return Err(readonly_violation(self.target(), &key));
        }
        Ok(())
    }

    /// Overwrite the item at `index`. Writing at the length appends.
    ///
    /// Lists never have holes: an index past the length is rejected with
    /// [`Error::IndexOutOfBounds`](crate::Error::IndexOutOfBounds).
    pub fn set(&self, index: usize, value: impl Into<Data>) -> Result<()> {
        self.check_writable(Key::Index(index))?;
        let value = value.into();
        let op = {
            let mut items = self.raw.inner.items.borrow_mut();
            let len = items.len();
            match items.get_mut(index) {
                Some(old) if old.is_same(&value) => None,
                Some(old) => {
                    *old = value;
                    Some(TriggerOp::Set)
                }
                None if index == len => {
                    items.push(value);
                    Some(TriggerOp::Add)
                }
                None => return Err(Error::IndexOutOfBounds { index, len }),
            }
        };
        if let Some(op) = op {
            trigger(self.target(), op, Some(&Key::Index(index)));
        }
        Ok(())
    }

    /// Append an item.
    pub fn push(&self, value: impl Into<Data>) -> Result<()> {
        self.check_writable(Key::Length)?;
        let index = {
            let mut items = self.raw.inner.items.borrow_mut();
            items.push(value.into());
            items.len() - 1
        };
        trigger(self.target(), TriggerOp::Add, Some(&Key::Index(index)));
        Ok(())
    }

    /// Remove and return the last item.
    pub fn pop(&self) -> Result<Option<Data>> {
        self.check_writable(Key::Length)?;
        let (popped, len) = {
            let mut items = self.raw.inner.items.borrow_mut();
            let popped = items.pop();
            (popped, items.len())
        };
        if popped.is_some() {
            trigger_resize(self.target(), len);
        }
        Ok(popped)
    }

    /// Insert an item at `index`, shifting later items.
    ///
    /// `index` is clamped to the length.
    pub fn insert(&self, index: usize, value: impl Into<Data>) -> Result<()> {
        self.check_writable(Key::Index(index))?;
        let (changed, old_len) = {
            let mut items = self.raw.inner.items.borrow_mut();
            let old_len = items.len();
            let index = index.min(old_len);
            items.insert(index, value.into());
            (shifted_indices(&items, index, old_len, 1), old_len)
        };
        let target = self.target();
        for index in changed {
            trigger(target, TriggerOp::Set, Some(&Key::Index(index)));
        }
        trigger(target, TriggerOp::Add, Some(&Key::Index(old_len)));
        Ok(())
    }

    /// Remove the item at `index`, shifting later items.
    pub fn remove(&self, index: usize) -> Result<Option<Data>> {
        self.check_writable(Key::Index(index))?;
        let (removed, changed, new_len) = {
            let mut items = self.raw.inner.items.borrow_mut();
            if index >= items.len() {
                return Ok(None);
            }
            let removed = items.remove(index);
            let new_len = items.len();
            let changed = shifted_back_indices(&items, &removed, index, new_len);
            (removed, changed, new_len)
        };
        let target = self.target();
        for index in changed {
            trigger(target, TriggerOp::Set, Some(&Key::Index(index)));
        }
        trigger_resize(target, new_len);
        Ok(Some(removed))
    }

    /// Shorten the list to `len` items. No-op if it is not longer.
    pub fn truncate(&self, len: usize) -> Result<()> {
        self.check_writable(Key::Length)?;
        let truncated: Vec<Data> = {
            let mut items = self.raw.inner.items.borrow_mut();
            if len >= items.len() {
                return Ok(());
            }
            items.drain(len..).collect()
        };
        trigger_resize(self.target(), len);
        drop(truncated);
        Ok(())
    }

    /// Remove every item.
    pub fn clear(&self) -> Result<()> {
        self.truncate(0)
    }

    /// Deep snapshot, tracking every index it visits.
    pub fn to_value(&self) -> Value {
        to_value(&Data::List(self.raw.clone()), &mut Vec::new())
    }
}

/// Indices in `from..old_len` whose item changed after an insertion of
/// `count` items at `from`.
fn shifted_indices(items: &[Data], from: usize, old_len: usize, count: usize) -> Vec<usize> {
    (from..old_len)
        .filter(|&index| !items[index].is_same(&items[index + count]))
        .collect()
}

/// Indices in `from..new_len` whose item changed after the item at `from`
/// was removed.
fn shifted_back_indices(items: &[Data], removed: &Data, from: usize, new_len: usize) -> Vec<usize> {
    (from..new_len)
        .filter(|&index| {
            let before = if index == from { removed } else { &items[index - 1] };
            !items[index].is_same(before)
        })
        .collect()
}

impl Default for ReactiveList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReactiveList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveList")
            .field("raw", &self.raw)
            .field("access", &self.access)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Effect;
    use std::cell::Cell;

    fn counter() -> Rc<Cell<usize>> {
        Rc::new(Cell::new(0))
    }

    fn list_of(values: &[i32]) -> ReactiveList {
        let list = ReactiveList::new();
        for value in values {
            list.push(*value).unwrap();
        }
        list
    }

    fn watch_index(list: &ReactiveList, index: usize) -> (Effect, Rc<Cell<usize>>) {
        let runs = counter();
        let (list, runs_in_body) = (list.clone(), runs.clone());
        let effect = Effect::new(move || {
            list.get(index);
            runs_in_body.set(runs_in_body.get() + 1);
        });
        (effect, runs)
    }

    fn watch_len(list: &ReactiveList) -> (Effect, Rc<Cell<usize>>) {
        let runs = counter();
        let (list, runs_in_body) = (list.clone(), runs.clone());
        let effect = Effect::new(move || {
            list.len();
            runs_in_body.set(runs_in_body.get() + 1);
        });
        (effect, runs)
    }

    #[test]
    fn push_triggers_length_not_existing_indices() {
        let list = list_of(&[1, 2]);
        let (_first_effect, first) = watch_index(&list, 0);
        let (_len_effect, len) = watch_len(&list);

        list.push(3).unwrap();
        assert_eq!((first.get(), len.get()), (1, 2));
    }

    #[test]
    fn pop_triggers_length_and_removed_index() {
        let list = list_of(&[1, 2, 3]);
        let (_first_effect, first) = watch_index(&list, 0);
        let (_last_effect, last) = watch_index(&list, 2);
        let (_len_effect, len) = watch_len(&list);

        assert_eq!(list.pop().unwrap(), Some(Data::from(3)));
        assert_eq!((first.get(), last.get(), len.get()), (1, 2, 2));
    }

    #[test]
    fn insert_triggers_only_shifted_changes() {
        let list = list_of(&[1, 2, 2]);
        let (_first_effect, first) = watch_index(&list, 0);
        let (_second_effect, second) = watch_index(&list, 1);
        let (_third_effect, third) = watch_index(&list, 2);

        // [1, 2, 2] -> [1, 2, 2, 2]: nothing before the new tail changed
        list.insert(1, 2).unwrap();
        assert_eq!((first.get(), second.get(), third.get()), (1, 1, 1));

        // [1, 2, 2, 2] -> [0, 1, 2, 2, 2]
        list.insert(0, 0).unwrap();
        assert_eq!((first.get(), second.get(), third.get()), (2, 2, 1));
    }

    #[test]
    fn remove_shifts_and_resizes() {
        let list = list_of(&[1, 2, 3]);
        let (_first_effect, first) = watch_index(&list, 0);
        let (_second_effect, second) = watch_index(&list, 1);
        let (_last_effect, last) = watch_index(&list, 2);

        assert_eq!(list.remove(1).unwrap(), Some(Data::from(2)));
        assert_eq!((first.get(), second.get(), last.get()), (1, 2, 2));
        assert_eq!(list.remove(9).unwrap(), None);
    }

    #[test]
    fn set_same_value_is_silent_and_set_at_length_appends() {
        let list = list_of(&[1]);
        let (_first_effect, first) = watch_index(&list, 0);
        let (_second_effect, second) = watch_index(&list, 1);
        let (_len_effect, len) = watch_len(&list);

        list.set(0, 1).unwrap();
        assert_eq!(first.get(), 1);

        list.set(1, 5).unwrap();
        assert_eq!((second.get(), len.get()), (2, 2));
        assert_eq!(list.raw().get(1), Some(Data::from(5)));
    }

    #[test]
    fn set_past_length_is_rejected_without_trigger() {
        let list = list_of(&[1]);
        let (_gap_effect, gap) = watch_index(&list, 1);
        let (_len_effect, len) = watch_len(&list);

        let result = list.set(3, 5);
        assert!(matches!(result, Err(Error::IndexOutOfBounds { index: 3, len: 1 })));
        assert!(matches!(
            list.set(usize::MAX, 5),
            Err(Error::IndexOutOfBounds { .. })
        ));
        assert_eq!((gap.get(), len.get()), (1, 1));
        assert_eq!(list.raw().len(), 1);
    }

    #[test]
    fn search_tracks_scanned_indices() {
        let list = list_of(&[1, 2, 3]);
        let runs = counter();
        let found = Rc::new(Cell::new(None));
        let _effect = {
            let (list, runs, found) = (list.clone(), runs.clone(), found.clone());
            Effect::new(move || {
                runs.set(runs.get() + 1);
                found.set(list.index_of(3));
            })
        };
        assert_eq!(found.get(), Some(2));

        list.set(0, 3).unwrap();
        assert_eq!(found.get(), Some(0));
        assert_eq!(runs.get(), 2);

        // Index 2 is no longer scanned
        list.set(2, 9).unwrap();
        assert_eq!(runs.get(), 2);
        assert!(list.contains(3));
    }

    #[test]
    fn clear_resizes_to_zero() {
        let list = list_of(&[1, 2]);
        let (_len_effect, len) = watch_len(&list);
        list.clear().unwrap();
        list.clear().unwrap();
        assert_eq!(len.get(), 2);
        assert!(list.raw().is_empty());
    }

    #[test]
    fn readonly_list_rejects_push() {
        let list = list_of(&[1]);
        assert!(list.readonly().push(2).is_err());
        assert_eq!(list.raw().len(), 1);
    }
}
