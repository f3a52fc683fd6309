/// End-to-end scenarios: mutation → dependency table → scheduler → diff → host
use crate::{
    Computed, DataSync, Effect, Error, HostBridge, JobOptions, Observable, Patch, ReactiveList,
    ReactiveRecord, Value, batch, bind_host, diff, scheduler, subscriber_count,
};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn counter() -> Rc<Cell<usize>> {
    Rc::new(Cell::new(0))
}

fn queued(id: u64) -> JobOptions {
    JobOptions {
        id: Some(id),
        ..JobOptions::default()
    }
}

fn record(json: serde_json::Value) -> ReactiveRecord {
    match Value::from(json) {
        Value::Record(fields) => ReactiveRecord::from_value(fields),
        other => panic!("not a record: {other:?}"),
    }
}

// Host fixture collecting every patch it receives
#[derive(Default)]
struct TestHost {
    patches: Vec<serde_json::Value>,
}

impl HostBridge for TestHost {
    fn set_data(&mut self, patch: Patch) {
        self.patches.push(patch.to_json());
    }
}

#[test]
fn queued_effect_reruns_once_per_change() {
    let state = record(json!({"a": 1}));
    let runs = counter();
    let _effect = {
        let (state, runs) = (state.clone(), runs.clone());
        Effect::builder(move || {
            state.get("a");
            runs.set(runs.get() + 1);
        })
        .queued(queued(1))
        .build()
    };
    assert_eq!(runs.get(), 1);

    state.set("a", 2).unwrap();
    // Nothing runs before the flush
    assert_eq!(runs.get(), 1);
    scheduler::tick();
    assert_eq!(runs.get(), 2);

    // Identical value: no trigger, nothing queued
    state.set("a", 2).unwrap();
    assert!(!scheduler::is_flush_pending());
    scheduler::tick();
    assert_eq!(runs.get(), 2);
}

#[test]
fn writes_to_two_sources_run_job_once() {
    let first = Observable::new(0);
    let second = Observable::new(0);
    let runs = counter();
    let effect = {
        let (first, second, runs) = (first.clone(), second.clone(), runs.clone());
        Effect::builder(move || {
            first.get();
            second.get();
            runs.set(runs.get() + 1);
        })
        .queued(queued(1))
        .build()
    };

    first.set(1);
    second.set(1);
    let job = effect.job().unwrap();
    assert!(scheduler::is_pending(&job));

    let report = scheduler::tick();
    assert_eq!(report.jobs_run, 1);
    assert_eq!(runs.get(), 2);
}

#[test]
fn queued_effects_run_in_id_order() {
    let source = Observable::new(0);
    let order = Rc::new(RefCell::new(Vec::new()));
    let _effects: Vec<Effect> = [3, 1, 2]
        .into_iter()
        .map(|id| {
            let (source, order) = (source.clone(), order.clone());
            Effect::builder(move || {
                source.get();
                order.borrow_mut().push(id);
            })
            .queued(queued(id))
            .build()
        })
        .collect();
    order.borrow_mut().clear();

    source.set(1);
    scheduler::tick();
    assert_eq!(*order.borrow(), [1, 2, 3]);
}

#[test]
fn computed_evaluates_once_for_many_readers() {
    let source = Observable::new(1);
    let evaluations = counter();
    let doubled = {
        let (source, evaluations) = (source.clone(), evaluations.clone());
        Computed::new(move || {
            evaluations.set(evaluations.get() + 1);
            source.get() * 2
        })
    };
    let seen = Rc::new(RefCell::new(Vec::new()));
    let _readers: Vec<Effect> = (1..=2)
        .map(|id| {
            let (doubled, seen) = (doubled.clone(), seen.clone());
            Effect::builder(move || seen.borrow_mut().push(doubled.get()))
                .queued(queued(id))
                .build()
        })
        .collect();
    assert_eq!(evaluations.get(), 1);

    source.set(5);
    scheduler::tick();
    assert_eq!(evaluations.get(), 2);
    assert_eq!(*seen.borrow(), [2, 2, 10, 10]);
}

#[test]
fn computed_with_same_output_skips_readers() {
    let source = Observable::new(2);
    let parity = {
        let source = source.clone();
        Computed::new(move || source.get() % 2)
    };
    let runs = counter();
    let _reader = {
        let (parity, runs) = (parity.clone(), runs.clone());
        Effect::builder(move || {
            parity.get();
            runs.set(runs.get() + 1);
        })
        .queued(queued(1))
        .build()
    };

    // Queued on suspicion, but the check finds the output unchanged
    source.set(4);
    scheduler::tick();
    assert_eq!(runs.get(), 1);

    source.set(5);
    scheduler::tick();
    assert_eq!(runs.get(), 2);
}

#[test]
fn batch_coalesces_synchronous_effect() {
    let state = record(json!({"a": 1, "b": 1}));
    let runs = counter();
    let _effect = {
        let (state, runs) = (state.clone(), runs.clone());
        Effect::new(move || {
            state.get("a");
            state.get("b");
            runs.set(runs.get() + 1);
        })
    };

    batch(|| {
        state.set("a", 2).unwrap();
        state.set("b", 2).unwrap();
        assert_eq!(runs.get(), 1);
    });
    assert_eq!(runs.get(), 2);
}

#[test]
fn stopped_effect_never_reruns() {
    let state = record(json!({"a": 1}));
    let runs = counter();
    let effect = {
        let (state, runs) = (state.clone(), runs.clone());
        Effect::new(move || {
            state.get("a");
            runs.set(runs.get() + 1);
        })
    };
    assert_eq!(subscriber_count(state.target(), &crate::Key::field("a")), 1);

    effect.stop();
    assert_eq!(subscriber_count(state.target(), &crate::Key::field("a")), 0);
    state.set("a", 2).unwrap();
    scheduler::tick();
    assert_eq!(runs.get(), 1);
}

#[test]
fn self_feeding_effect_hits_recursion_limit() {
    let count = Observable::new(0);
    let runs = counter();
    let _effect = {
        let (count, runs) = (count.clone(), runs.clone());
        Effect::builder(move || {
            runs.set(runs.get() + 1);
            let n = count.get();
            count.set(n + 1);
        })
        .queued(queued(1))
        .allow_recurse()
        .build()
    };

    let report = scheduler::tick();
    // One run on creation, then every re-entry the limit allows
    assert_eq!(runs.get(), 1 + scheduler::DEFAULT_RECURSION_LIMIT + 1);
    assert!(matches!(report.errors.as_slice(), [Error::RecursionLimit { .. }]));
}

#[test]
fn snapshots_diff_into_minimal_patch() {
    let state = record(json!({"a": {"b": 1, "c": 1}, "list": [1, 2, 3]}));
    let before = state.to_value();
    assert!(diff(&state.to_value(), &before).is_empty());

    let a = state.get("a").and_then(|a| a.as_record().cloned()).unwrap();
    a.set("c", 2).unwrap();
    assert_eq!(diff(&state.to_value(), &before).to_json(), json!({"a.c": 2.0}));

    let list = state.get("list").and_then(|list| list.as_list().cloned()).unwrap();
    list.pop().unwrap();
    let patch = diff(&state.to_value(), &before);
    assert_eq!(patch.get("list"), Some(&Value::from(json!([1, 2]))));
}

#[test]
fn host_follows_state_through_ticks() {
    let host = Rc::new(RefCell::new(TestHost::default()));
    let state = record(json!({"title": "draft", "items": []}));
    let _binding = bind_host(&state, host.clone(), 10);

    let items = state.get("items").and_then(|items| items.as_list().cloned()).unwrap();
    items.push("x").unwrap();
    items.push("y").unwrap();
    state.set("title", "final").unwrap();
    scheduler::tick();

    items.remove(0).unwrap();
    scheduler::tick();

    let host = host.borrow();
    assert_eq!(
        host.patches,
        [
            json!({"title": "draft", "items": []}),
            json!({"title": "final", "items[0]": "x", "items[1]": "y"}),
            json!({"items": ["y"]}),
        ]
    );
}

#[test]
fn data_sync_sends_only_what_changed() {
    let state = ReactiveList::from_values(&[Value::from(1), Value::from(2)]);
    let mut sync = DataSync::new();
    let root = Value::from_iter([("list".to_owned(), state.to_value())]);
    assert_eq!(sync.sync(root).to_json(), json!({"list": [1.0, 2.0]}));
    state.set(1, 3).unwrap();
    let root = Value::from_iter([("list".to_owned(), state.to_value())]);
    assert_eq!(sync.sync(root).to_json(), json!({"list[1]": 3.0}));
}
