use super::{Access, Data, Reactive, readonly_violation, to_value};
use crate::error::Result;
use crate::track::{Key, Target, TargetKind, TrackOp, TriggerOp, track, trigger};
use crate::value::Value;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

struct RecordInner {
    target: Target,
    fields: RefCell<IndexMap<String, Data>>,
}

/// A shared, string-keyed record of raw data.
///
/// Cloning shares the record. Equality is identity.
#[derive(Clone)]
pub struct RawRecord {
    inner: Rc<RecordInner>,
}

impl RawRecord {
    /// An empty record.
    pub fn new() -> Self {
        Self::from_data(IndexMap::new())
    }

    pub(crate) fn from_data(fields: IndexMap<String, Data>) -> Self {
        Self {
            inner: Rc::new(RecordInner {
                target: Target::new(TargetKind::Record),
                fields: RefCell::new(fields),
            }),
        }
    }

    /// The record's identity in the dependency table.
    pub fn target(&self) -> Target {
        self.inner.target
    }

    /// Copy of the fields, without tracking.
    pub fn entries(&self) -> Vec<(String, Data)> {
        self.inner
            .fields
            .borrow()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Read a field without tracking.
    pub fn get(&self, key: &str) -> Option<Data> {
        self.inner.fields.borrow().get(key).cloned()
    }

    /// Number of fields, without tracking.
    pub fn len(&self) -> usize {
        self.inner.fields.borrow().len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RawRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for RawRecord {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RawRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Fields are left out: a record may contain itself.
        f.debug_struct("RawRecord")
            .field("target", &self.inner.target.id())
            .field("len", &self.len())
            .finish()
    }
}

/// Reactive handle over a [`RawRecord`]
///
/// Field reads are tracked under the field's key, enumeration under the
/// record's iterate key. Writes compare old and new with [`Data::is_same`]
/// and only trigger on a change: a new key as an add (re-running
/// enumerations), an existing key as a set.
///
/// # Example
/// ```ignore
/// let user = ReactiveRecord::new();
/// user.set("name", "Ada")?;
///
/// let _effect = Effect::new({
///     let user = user.clone();
///     move || println!("{:?}", user.get("name"))
/// });
///
/// user.set("name", "Grace")?; // re-runs the effect
/// user.set("age", 36)?;       // doesn't: the effect never read "age"
/// ```
#[derive(Clone, PartialEq)]
pub struct ReactiveRecord {
    raw: RawRecord,
    access: Access,
}

impl ReactiveRecord {
    /// A fresh, empty, mutable record.
    pub fn new() -> Self {
        Self::wrap(RawRecord::new(), Access::Mutable)
    }

    /// A mutable record holding a copy of `fields`.
    pub fn from_value(fields: IndexMap<String, Value>) -> Self {
        let fields = fields
            .iter()
            .map(|(key, value)| (key.clone(), Data::from_value(value)))
            .collect();
        Self::wrap(RawRecord::from_data(fields), Access::Mutable)
    }

    /// Wrap an existing raw record.
    pub fn wrap(raw: RawRecord, access: Access) -> Self {
        Self { raw, access }
    }

    /// The raw record behind the handle.
    pub fn raw(&self) -> &RawRecord {
        &self.raw
    }

    /// The record's identity in the dependency table.
    pub fn target(&self) -> Target {
        self.raw.target()
    }

    /// Whether writes are rejected.
    pub fn is_readonly(&self) -> bool {
        self.access == Access::Readonly
    }

    /// A readonly handle over the same record.
    pub fn readonly(&self) -> Self {
        Self::wrap(self.raw.clone(), Access::Readonly)
    }

    /// Read a field; nested containers come back wrapped.
    pub fn get(&self, key: &str) -> Option<Reactive> {
        track(self.target(), TrackOp::Get, Key::field(key));
        self.raw
            .get(key)
            .map(|data| Reactive::wrap(data, self.access))
    }

    /// Deep snapshot of one field.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        track(self.target(), TrackOp::Get, Key::field(key));
        self.raw
            .get(key)
            .map(|data| to_value(&data, &mut vec![self.target().id()]))
    }

    /// Whether the field exists.
    pub fn contains_key(&self, key: &str) -> bool {
        track(self.target(), TrackOp::Has, Key::field(key));
        self.raw.inner.fields.borrow().contains_key(key)
    }

    /// The field names, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        track(self.target(), TrackOp::Iterate, Key::Iterate);
        self.raw.inner.fields.borrow().keys().cloned().collect()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        track(self.target(), TrackOp::Iterate, Key::Iterate);
        self.raw.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a field.
    pub fn set(&self, key: &str, value: impl Into<Data>) -> Result<()> {
        let target = self.target();
        if self.is_readonly() {
            return Err(readonly_violation(target, &Key::field(key)));
        }
        let value = value.into();
        let op = {
            let mut fields = self.raw.inner.fields.borrow_mut();
            match fields.get_mut(key) {
                Some(old) if old.is_same(&value) => None,
                Some(old) => {
                    // The previous value is dropped after the borrow ends.
                    Some((TriggerOp::Set, Some(std::mem::replace(old, value))))
                }
                None => {
                    fields.insert(key.to_owned(), value);
                    Some((TriggerOp::Add, None))
                }
            }
        };
        if let Some((op, previous)) = op {
            trigger(target, op, Some(&Key::field(key)));
            drop(previous);
        }
        Ok(())
    }

    /// Delete a field, returning its raw value.
    pub fn remove(&self, key: &str) -> Result<Option<Data>> {
        let target = self.target();
        if self.is_readonly() {
            return Err(readonly_violation(target, &Key::field(key)));
        }
        let removed = self.raw.inner.fields.borrow_mut().shift_remove(key);
        if removed.is_some() {
            trigger(target, TriggerOp::Delete, Some(&Key::field(key)));
        }
        Ok(removed)
    }

    /// Deep snapshot, tracking every key it visits.
    pub fn to_value(&self) -> Value {
        to_value(&Data::Record(self.raw.clone()), &mut Vec::new())
    }
}

impl Default for ReactiveRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReactiveRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveRecord")
            .field("raw", &self.raw)
            .field("access", &self.access)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Effect;
    use crate::track::subscriber_count;
    use std::cell::Cell;

    fn counter() -> Rc<Cell<usize>> {
        Rc::new(Cell::new(0))
    }

    #[test]
    fn field_write_reruns_field_reader_once() {
        let record = ReactiveRecord::new();
        record.set("a", 1).unwrap();
        let runs = counter();
        let _effect = {
            let (record, runs) = (record.clone(), runs.clone());
            Effect::new(move || {
                record.get("a");
                runs.set(runs.get() + 1);
            })
        };

        record.set("a", 2).unwrap();
        assert_eq!(runs.get(), 2);
        record.set("a", 2).unwrap();
        assert_eq!(runs.get(), 2);
        record.set("b", 1).unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn add_and_delete_rerun_enumeration() {
        let record = ReactiveRecord::new();
        record.set("a", 1).unwrap();
        let keys = Rc::new(RefCell::new(Vec::new()));
        let _effect = {
            let (record, keys) = (record.clone(), keys.clone());
            Effect::new(move || *keys.borrow_mut() = record.keys())
        };
        assert_eq!(*keys.borrow(), ["a"]);

        record.set("b", 2).unwrap();
        assert_eq!(*keys.borrow(), ["a", "b"]);

        // Existing key: enumeration unaffected
        record.set("a", 5).unwrap();
        assert_eq!(*keys.borrow(), ["a", "b"]);

        record.remove("a").unwrap();
        assert_eq!(*keys.borrow(), ["b"]);
    }

    #[test]
    fn deleting_missing_key_triggers_nothing() {
        let record = ReactiveRecord::new();
        let runs = counter();
        let _effect = {
            let (record, runs) = (record.clone(), runs.clone());
            Effect::new(move || {
                record.contains_key("ghost");
                runs.set(runs.get() + 1);
            })
        };
        assert_eq!(record.remove("ghost").unwrap(), None);
        assert_eq!(runs.get(), 1);

        record.set("ghost", true).unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn nan_write_over_nan_is_not_a_change() {
        let record = ReactiveRecord::new();
        record.set("x", f64::NAN).unwrap();
        let runs = counter();
        let _effect = {
            let (record, runs) = (record.clone(), runs.clone());
            Effect::new(move || {
                record.get("x");
                runs.set(runs.get() + 1);
            })
        };
        record.set("x", f64::NAN).unwrap();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn dependency_unlinked_when_last_reader_stops() {
        let record = ReactiveRecord::new();
        let effect = {
            let record = record.clone();
            Effect::new(move || {
                record.get("a");
            })
        };
        assert_eq!(subscriber_count(record.target(), &Key::field("a")), 1);
        effect.stop();
        assert_eq!(subscriber_count(record.target(), &Key::field("a")), 0);
    }

    #[test]
    fn readonly_remove_is_rejected() {
        let record = ReactiveRecord::new();
        record.set("a", 1).unwrap();
        assert!(record.readonly().remove("a").is_err());
        assert_eq!(record.raw().len(), 1);
    }
}
