//! Observable wrappers.
//!
//! Plain state lives in *raw* containers ([`RawRecord`], [`RawList`]) that
//! carry their own [`Target`] identity. A reactive handle pairs a raw
//! container with an [`Access`] mode: reads through it are tracked against
//! the running computation, writes through it trigger the computations that
//! read the changed key. Wrapping is idempotent; two handles over the same
//! raw container compare equal and share every dependency.
//!
//! Nested containers are wrapped on access: reading a record field that
//! holds a list hands back a [`ReactiveList`] with the parent's access mode.
//!
//! Containers are reference counted. A container that (directly or
//! indirectly) holds itself is never freed; snapshots render the repeated
//! occurrence as `null`.

mod cell;
mod collection;
mod list;
mod record;

pub use cell::Observable;
pub use collection::{ReactiveMap, ReactiveSet};
pub use list::{RawList, ReactiveList};
pub use record::{RawRecord, ReactiveRecord};

use crate::error::Error;
use crate::track::{Key, Target, TargetId, TrackOp, track};
use crate::value::{Scalar, Value};
use std::fmt;

/// Whether a reactive handle accepts writes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Access {
    /// Reads are tracked, writes trigger.
    #[default]
    Mutable,
    /// Reads are tracked, writes are rejected with a warning.
    Readonly,
}

/// Raw (unwrapped) state: a leaf or a shared container.
#[derive(Clone, Debug)]
pub enum Data {
    /// A leaf.
    Scalar(Scalar),
    /// A shared record.
    Record(RawRecord),
    /// A shared list.
    List(RawList),
}

impl Data {
    /// Identity comparison: leaves by same-value, containers by identity.
    pub fn is_same(&self, other: &Data) -> bool {
        match (self, other) {
            (Data::Scalar(a), Data::Scalar(b)) => a.same_value(b),
            (Data::Record(a), Data::Record(b)) => a == b,
            (Data::List(a), Data::List(b)) => a == b,
            _ => false,
        }
    }

    /// Build fresh containers holding a copy of `value`.
    pub fn from_value(value: &Value) -> Data {
        match value {
            Value::Scalar(scalar) => Data::Scalar(scalar.clone()),
            Value::Sequence(items) => Data::List(RawList::from_data(items.iter().map(Data::from_value).collect())),
            Value::Record(fields) => Data::Record(RawRecord::from_data(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), Data::from_value(value)))
                    .collect(),
            )),
        }
    }

    /// Plain snapshot, without tracking.
    pub fn snapshot(&self) -> Value {
        crate::effect::untracked(|| to_value(self, &mut Vec::new()))
    }

    /// The container's target, if this is a container.
    pub fn target(&self) -> Option<Target> {
        match self {
            Data::Scalar(_) => None,
            Data::Record(record) => Some(record.target()),
            Data::List(list) => Some(list.target()),
        }
    }

    /// The leaf, if this is one.
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Data::Scalar(scalar) => Some(scalar),
            _ => None,
        }
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        self.is_same(other)
    }
}

impl From<Value> for Data {
    fn from(value: Value) -> Self {
        Data::from_value(&value)
    }
}

impl From<&Value> for Data {
    fn from(value: &Value) -> Self {
        Data::from_value(value)
    }
}

impl From<Scalar> for Data {
    fn from(scalar: Scalar) -> Self {
        Data::Scalar(scalar)
    }
}

macro_rules! scalar_data_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Data {
                fn from(value: $ty) -> Self {
                    Data::Scalar(value.into())
                }
            }
        )*
    };
}

scalar_data_from!(bool, f64, i32, i64, &str, String);

impl From<RawRecord> for Data {
    fn from(record: RawRecord) -> Self {
        Data::Record(record)
    }
}

impl From<RawList> for Data {
    fn from(list: RawList) -> Self {
        Data::List(list)
    }
}

// Storing a reactive handle stores the raw container behind it.
impl From<ReactiveRecord> for Data {
    fn from(record: ReactiveRecord) -> Self {
        Data::Record(record.raw().clone())
    }
}

impl From<ReactiveList> for Data {
    fn from(list: ReactiveList) -> Self {
        Data::List(list.raw().clone())
    }
}

impl From<Reactive> for Data {
    fn from(reactive: Reactive) -> Self {
        match reactive {
            Reactive::Scalar(scalar) => Data::Scalar(scalar),
            Reactive::Record(record) => record.into(),
            Reactive::List(list) => list.into(),
        }
    }
}

/// A value read through a reactive handle.
#[derive(Clone, Debug, PartialEq)]
pub enum Reactive {
    /// A leaf, copied out.
    Scalar(Scalar),
    /// A nested record, wrapped.
    Record(ReactiveRecord),
    /// A nested list, wrapped.
    List(ReactiveList),
}

impl Reactive {
    pub(crate) fn wrap(data: Data, access: Access) -> Self {
        match data {
            Data::Scalar(scalar) => Reactive::Scalar(scalar),
            Data::Record(raw) => Reactive::Record(ReactiveRecord::wrap(raw, access)),
            Data::List(raw) => Reactive::List(ReactiveList::wrap(raw, access)),
        }
    }

    /// The leaf, if this is one.
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Reactive::Scalar(scalar) => Some(scalar),
            _ => None,
        }
    }

    /// The record handle, if this is a record.
    pub fn as_record(&self) -> Option<&ReactiveRecord> {
        match self {
            Reactive::Record(record) => Some(record),
            _ => None,
        }
    }

    /// The list handle, if this is a list.
    pub fn as_list(&self) -> Option<&ReactiveList> {
        match self {
            Reactive::List(list) => Some(list),
            _ => None,
        }
    }

    /// Whether writes through this handle are rejected. Leaves are never
    /// readonly.
    pub fn is_readonly(&self) -> bool {
        match self {
            Reactive::Scalar(_) => false,
            Reactive::Record(record) => record.is_readonly(),
            Reactive::List(list) => list.is_readonly(),
        }
    }

    /// Deep snapshot, tracking every key it visits.
    pub fn to_value(&self) -> Value {
        match self {
            Reactive::Scalar(scalar) => Value::Scalar(scalar.clone()),
            Reactive::Record(record) => record.to_value(),
            Reactive::List(list) => list.to_value(),
        }
    }
}

/// Wrap `data` for tracked reads and triggering writes.
///
/// Wrapping an already wrapped container returns an equal handle.
pub fn reactive(data: impl Into<Data>) -> Reactive {
    Reactive::wrap(data.into(), Access::Mutable)
}

/// Wrap `data` for tracked reads; writes through the handle are rejected.
///
/// Writes through a mutable handle over the same container still trigger
/// readers of the readonly handle.
pub fn readonly(data: impl Into<Data>) -> Reactive {
    Reactive::wrap(data.into(), Access::Readonly)
}

/// Log a rejected write and build the error returned to the caller.
pub(crate) fn readonly_violation(target: Target, key: &Key) -> Error {
    tracing::warn!(
        target_id = target.id().get(),
        %key,
        "set operation on key failed: target is readonly"
    );
    Error::ReadonlyTarget {
        key: key.to_string(),
    }
}

/// Deep snapshot of `data`, tracking every container key it visits.
///
/// `ancestors` holds the containers on the current path; a container that
/// contains itself is rendered as `null` on its second visit.
pub(crate) fn to_value(data: &Data, ancestors: &mut Vec<TargetId>) -> Value {
    let Some(target) = data.target() else {
        return match data {
            Data::Scalar(scalar) => Value::Scalar(scalar.clone()),
            _ => Value::null(),
        };
    };
    if ancestors.contains(&target.id()) {
        cov_mark::hit!(cyclic_snapshot);
        return Value::null();
    }
    ancestors.push(target.id());
    let value = match data {
        Data::Record(record) => {
            track(target, TrackOp::Iterate, Key::Iterate);
            let fields = record.entries();
            fields
                .into_iter()
                .map(|(key, child)| {
                    track(target, TrackOp::Get, Key::field(&key));
                    let child = to_value(&child, ancestors);
                    (key, child)
                })
                .collect()
        }
        Data::List(list) => {
            track(target, TrackOp::Get, Key::Length);
            let items = list.items();
            Value::Sequence(
                items
                    .iter()
                    .enumerate()
                    .map(|(index, child)| {
                        track(target, TrackOp::Get, Key::Index(index));
                        to_value(child, ancestors)
                    })
                    .collect(),
            )
        }
        Data::Scalar(_) => Value::null(),
    };
    ancestors.pop();
    value
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Mutable => f.write_str("mutable"),
            Access::Readonly => f.write_str("readonly"),
        }
    }
}
