//! Scenario tests for dependency tracking and batched propagation.

use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use ftui_reactive::{
    BatchMode, Notification, ObservableMap, ObservableValue, Observation, ObservationOptions,
    ReactiveError, Runtime, RuntimeConfig,
};

// ── Helpers ──────────────────────────────────────────────────────────

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default())
}

fn counter() -> Rc<Cell<u32>> {
    Rc::new(Cell::new(0))
}

fn bump(c: &Rc<Cell<u32>>) {
    c.set(c.get() + 1);
}

struct Family {
    root_a: ObservableValue<String>,
    root_b: ObservableValue<String>,
    child_a: Observation<String>,
    grand_child: Observation<String>,
}

/// `grand_child` reads `child_a` only while `root_b` is not `"b"`.
fn family(rt: &Runtime) -> Family {
    let root_a = ObservableValue::new_in(rt, "a".to_string());
    let root_b = ObservableValue::new_in(rt, "b".to_string());
    let ra = root_a.clone();
    let child_a = Observation::new_in(
        rt,
        move || format!("childA{}", ra.get()),
        ObservationOptions::default(),
    );
    let (rb, ca) = (root_b.clone(), child_a.clone());
    let grand_child = Observation::new_in(
        rt,
        move || {
            if rb.get() == "b" {
                "grandChild->b".to_string()
            } else {
                format!("grandChild->{}", ca.get())
            }
        },
        ObservationOptions::default(),
    );
    Family {
        root_a,
        root_b,
        child_a,
        grand_child,
    }
}

// ═════════════════════════════════════════════════════════════════════════
// Branch short-circuit and late binding
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn short_circuited_branch_is_not_a_dependency() {
    let rt = runtime();
    let f = family(&rt);

    let grand_changes = counter();
    let child_changes = counter();
    let (g, c) = (Rc::clone(&grand_changes), Rc::clone(&child_changes));
    let _gs = f.grand_child.subscribe(move |_| bump(&g));
    let _cs = f.child_a.subscribe(move |_| bump(&c));

    assert_eq!(f.grand_child.get(), "grandChild->b");
    let deps = f.grand_child.dependencies().unwrap();
    assert!(!deps.contains_source(f.child_a.id()));
    assert!(deps.contains(f.root_b.id(), None));

    rt.batch(|| f.root_b.set("B".to_string())).unwrap();

    assert_eq!(f.grand_child.get(), "grandChild->childAa");
    assert_eq!(grand_changes.get(), 1);
    assert_eq!(child_changes.get(), 0);
    let deps = f.grand_child.dependencies().unwrap();
    assert!(deps.contains(f.child_a.id(), None));
}

#[test]
fn late_binding_sees_values_set_earlier_in_the_batch() {
    let rt = runtime();
    let f = family(&rt);
    let _gs = f.grand_child.subscribe(|_| {});
    assert!(!f.child_a.is_bound());

    rt.batch(|| {
        f.root_a.set("A".to_string());
        f.root_b.set("B".to_string());
    })
    .unwrap();

    assert_eq!(f.grand_child.get(), "grandChild->childAA");
    assert!(f.child_a.is_bound());
}

// ═════════════════════════════════════════════════════════════════════════
// Glitch freedom and at-most-once recomputation
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn dependents_never_see_stale_intermediates() {
    let rt = runtime();
    let a = ObservableValue::new_in(&rt, 1);
    let a1 = a.clone();
    let b = Observation::new_in(&rt, move || a1.get() * 2, ObservationOptions::default());
    let (a2, b2) = (a.clone(), b.clone());
    let c = Observation::new_in(&rt, move || a2.get() + b2.get(), ObservationOptions::default());

    let seen = Rc::new(RefCell::new(Vec::new()));
    let s = Rc::clone(&seen);
    let _sub = c.on_change(move |change| s.borrow_mut().push(*change.new_value));
    assert_eq!(c.get(), 3);

    a.set(2);
    a.set(5);
    assert_eq!(*seen.borrow(), vec![6, 15]);
    assert!(c.depth() > b.depth());
}

#[test]
fn chain_notifies_once_per_batch() {
    let rt = runtime();
    let a = ObservableValue::new_in(&rt, 0);
    let a1 = a.clone();
    let b = Observation::new_in(&rt, move || a1.get() + 1, ObservationOptions::default());
    let b1 = b.clone();
    let c = Observation::new_in(&rt, move || b1.get() * 10, ObservationOptions::default());

    let notified = counter();
    let n = Rc::clone(&notified);
    let _sub = c.on_change(move |change| {
        bump(&n);
        assert_eq!(*change.new_value, 40);
    });

    rt.batch(|| {
        a.set(1);
        a.set(2);
        a.set(3);
    })
    .unwrap();
    assert_eq!(notified.get(), 1);
    assert_eq!(c.get(), 40);
}

#[test]
fn two_leaves_one_recompute() {
    let rt = runtime();
    let x = ObservableValue::new_in(&rt, 1);
    let y = ObservableValue::new_in(&rt, 2);
    let runs = counter();
    let (x1, y1, r) = (x.clone(), y.clone(), Rc::clone(&runs));
    let sum = Observation::new_in(
        &rt,
        move || {
            bump(&r);
            x1.get() + y1.get()
        },
        ObservationOptions::default(),
    );
    let notified = counter();
    let n = Rc::clone(&notified);
    let _sub = sum.subscribe(move |_| bump(&n));
    assert_eq!(runs.get(), 1);

    rt.batch(|| {
        x.set(10);
        y.set(20);
    })
    .unwrap();
    assert_eq!(runs.get(), 2);
    assert_eq!(notified.get(), 1);
    assert_eq!(sum.get(), 30);
}

#[test]
fn notifications_carry_the_batch_number() {
    let rt = runtime();
    let x = ObservableValue::new_in(&rt, 0);
    let x1 = x.clone();
    let obs = Observation::new_in(&rt, move || x1.get(), ObservationOptions::default());
    let batches = Rc::new(RefCell::new(Vec::new()));
    let b = Rc::clone(&batches);
    let _sub = obs.subscribe(move |n: &Notification| b.borrow_mut().push(n.batch));

    x.set(1);
    x.set(2);
    let batches = batches.borrow();
    assert_eq!(batches.len(), 2);
    assert!(batches[1] > batches[0]);
    assert_eq!(obs.last_batch(), Some(batches[1]));
}

// ═════════════════════════════════════════════════════════════════════════
// Dependency-set exactness
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn branch_switch_moves_keyed_subscriptions() {
    let rt = runtime();
    let flag = ObservableValue::new_in(&rt, true);
    let map: ObservableMap<i32> = ObservableMap::new_in(&rt);
    map.set("left", 1);
    map.set("right", 2);

    let runs = counter();
    let (f, m, r) = (flag.clone(), map.clone(), Rc::clone(&runs));
    let pick = Observation::new_in(
        &rt,
        move || {
            bump(&r);
            let key = if f.get() { "left" } else { "right" };
            m.get(key).unwrap_or_default()
        },
        ObservationOptions::default(),
    );
    let _sub = pick.subscribe(|_| {});
    assert_eq!(map.subscriber_count(Some("left")), 1);
    assert_eq!(map.subscriber_count(Some("right")), 0);

    map.set("right", 20);
    assert_eq!(runs.get(), 1);

    flag.set(false);
    assert_eq!(pick.get(), 20);
    assert_eq!(map.subscriber_count(Some("left")), 0);
    assert_eq!(map.subscriber_count(Some("right")), 1);
    let deps = pick.dependencies().unwrap();
    assert_eq!(
        deps.keys_of(map.id()).map(|k| k.len()),
        Some(1),
        "only the branch taken is tracked"
    );

    let before = runs.get();
    map.set("left", 100);
    assert_eq!(runs.get(), before);
    map.set("right", 21);
    assert_eq!(pick.get(), 21);
}

#[test]
fn nested_traps_replay_into_outer_frame() {
    let rt = runtime();
    let a = ObservableValue::new_in(&rt, 1);
    let b = ObservableValue::new_in(&rt, 2);
    let c = ObservableValue::new_in(&rt, 3);

    let (_, deps) = rt.recorder().record(|| {
        let outer = rt.trap();
        let inner = rt.trap();
        a.get();
        b.get();
        let trapped = inner.restore();
        c.get();
        let outer_reads = outer.restore();

        assert_eq!(trapped.len(), 2);
        assert_eq!(trapped[0].id(), a.id());
        assert_eq!(trapped[1].id(), b.id());
        assert_eq!(outer_reads.len(), 1);
        rt.recorder().record_reads(trapped);
    });

    assert_eq!(deps.len(), 2);
    assert!(deps.contains(a.id(), None));
    assert!(deps.contains(b.id(), None));
    assert!(!deps.contains(c.id(), None));
}

// ═════════════════════════════════════════════════════════════════════════
// Binding lifecycle
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn resubscribing_the_same_handler_restores_updates() {
    let rt = runtime();
    let x = ObservableValue::new_in(&rt, 1);
    let x1 = x.clone();
    let obs = Observation::new_in(&rt, move || x1.get() + 100, ObservationOptions::default());

    let hits = counter();
    let h = Rc::clone(&hits);
    let handler = Rc::new(move |_: &Notification| bump(&h));

    for round in 0..3 {
        let hh = Rc::clone(&handler);
        let sub = obs.subscribe(move |n| hh(n));
        assert!(obs.is_bound());
        x.set(round * 10 + 5);
        assert_eq!(hits.get(), round as u32 + 1);
        drop(sub);
        assert!(!obs.is_bound());
        assert_eq!(x.subscriber_count(), 0);
    }
}

#[test]
fn cold_reads_never_subscribe() {
    let rt = runtime();
    let x = ObservableValue::new_in(&rt, 4);
    let runs = counter();
    let (x1, r) = (x.clone(), Rc::clone(&runs));
    let sq = Observation::new_in(
        &rt,
        move || {
            bump(&r);
            x1.get() * x1.get()
        },
        ObservationOptions::default(),
    );
    assert_eq!(sq.get(), 16);
    x.set(5);
    assert_eq!(sq.get(), 25);
    assert_eq!(runs.get(), 2);
    assert_eq!(x.subscriber_count(), 0);
    assert_eq!(sq.has_dependencies(), None);
}

#[test]
fn bind_panic_leaves_observation_unbound() {
    let rt = runtime();
    let obs: Observation<i32> = Observation::new_in(
        &rt,
        || panic!("bind failed"),
        ObservationOptions::default(),
    );
    let result = catch_unwind(AssertUnwindSafe(|| obs.subscribe(|_| {})));
    assert!(result.is_err());
    assert!(!obs.is_bound());
    assert_eq!(obs.handler_count(), 0);
    assert_eq!(rt.recorder().frames(), 0);
}

// ═════════════════════════════════════════════════════════════════════════
// Scheduling
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn lower_priority_band_drains_first() {
    let rt = runtime();
    let x = ObservableValue::new_in(&rt, 0);
    let order = Rc::new(RefCell::new(Vec::new()));

    let make = |name: &'static str, priority: u32| {
        let (x1, o) = (x.clone(), Rc::clone(&order));
        Observation::new_in(
            &rt,
            move || {
                o.borrow_mut().push(name);
                x1.get()
            },
            ObservationOptions::default().with_priority(priority),
        )
    };
    let late = make("late", 2);
    let early = make("early", 1);
    let _s1 = late.subscribe(|_| {});
    let _s2 = early.subscribe(|_| {});
    order.borrow_mut().clear();

    x.set(1);
    assert_eq!(*order.borrow(), vec!["early", "late"]);
}

#[test]
fn mutation_during_drain_folds_into_same_batch() {
    let rt = runtime();
    let x = ObservableValue::new_in(&rt, 0);
    let y = ObservableValue::new_in(&rt, 0);
    let x1 = x.clone();
    let first = Observation::new_in(&rt, move || x1.get(), ObservationOptions::default());
    let y1 = y.clone();
    let second = Observation::new_in(&rt, move || y1.get(), ObservationOptions::default());

    let y2 = y.clone();
    let _s1 = first.on_change(move |c| y2.set(*c.new_value * 2));
    let batches = Rc::new(RefCell::new(Vec::new()));
    let b = Rc::clone(&batches);
    let _s2 = second.subscribe(move |n| b.borrow_mut().push(n.batch));

    let opened = Rc::new(Cell::new(None));
    let o = Rc::clone(&opened);
    let handle = rt.clone();
    rt.batch(|| {
        o.set(handle.scheduler().current_batch());
        x.set(7);
    })
    .unwrap();

    assert_eq!(second.get(), 14);
    assert_eq!(*batches.borrow(), vec![opened.get().unwrap()]);
}

#[test]
fn after_drain_sees_settled_values() {
    let rt = runtime();
    let x = ObservableValue::new_in(&rt, 1);
    let x1 = x.clone();
    let obs = Observation::new_in(&rt, move || x1.get() * 3, ObservationOptions::default());
    let _sub = obs.subscribe(|_| {});

    let seen = Rc::new(Cell::new(0));
    let (s, o) = (Rc::clone(&seen), obs.clone());
    let r = rt.clone();
    rt.batch(|| {
        x.set(2);
        r.after_drain(move || s.set(o.get()));
    })
    .unwrap();
    assert_eq!(seen.get(), 6);
}

#[test]
fn after_drain_mutation_opens_fresh_batch() {
    let rt = runtime();
    let x = ObservableValue::new_in(&rt, 0);
    let batches = Rc::new(RefCell::new(Vec::new()));
    let b = Rc::clone(&batches);
    let _sub = x.subscribe(move |n| b.borrow_mut().push(n.batch));

    let (r, x1) = (rt.clone(), x.clone());
    rt.batch(|| {
        x.set(1);
        r.after_drain(move || x1.set(2));
    })
    .unwrap();

    let batches = batches.borrow();
    assert_eq!(batches.len(), 2);
    assert!(batches[1] > batches[0]);
    assert!(rt.is_idle());
}

#[test]
fn deferred_mode_coalesces_until_flush() {
    let rt = Runtime::new(RuntimeConfig::default().with_batch_mode(BatchMode::Deferred));
    let x = ObservableValue::new_in(&rt, 0);
    let runs = counter();
    let (x1, r) = (x.clone(), Rc::clone(&runs));
    let obs = Observation::new_in(
        &rt,
        move || {
            bump(&r);
            x1.get()
        },
        ObservationOptions::default(),
    );
    let _sub = obs.subscribe(|_| {});

    x.set(1);
    x.set(2);
    x.set(3);
    assert_eq!(runs.get(), 1);
    rt.flush().unwrap();
    assert_eq!(runs.get(), 2);
    assert_eq!(obs.get(), 3);
}

// ═════════════════════════════════════════════════════════════════════════
// Failure handling
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn self_feeding_cycle_hits_drain_limit() {
    let rt = Runtime::new(RuntimeConfig::default().with_max_drain_steps(Some(50)));
    let n = ObservableValue::new_in(&rt, 0u64);
    let n1 = n.clone();
    let looping = Observation::new_in(
        &rt,
        move || {
            let v = n1.get();
            n1.set(v + 1);
            v
        },
        ObservationOptions::default(),
    );
    let sub = looping.subscribe(|_| {});

    let err = rt.batch(|| n.set(1_000)).unwrap_err();
    assert!(matches!(err, ReactiveError::DrainLimitExceeded { steps: 50, .. }));
    assert!(!rt.scheduler().has_dirty());
    assert!(rt.is_idle());

    drop(sub);
    assert!(!looping.is_bound());
}

#[test]
fn recompute_panic_propagates_and_runtime_recovers() {
    let rt = runtime();
    let x = ObservableValue::new_in(&rt, 1);
    let x1 = x.clone();
    let obs = Observation::new_in(
        &rt,
        move || {
            let v = x1.get();
            assert_ne!(v, 13, "unlucky input");
            v
        },
        ObservationOptions::default(),
    );
    let _sub = obs.subscribe(|_| {});

    let result = catch_unwind(AssertUnwindSafe(|| rt.batch(|| x.set(13))));
    assert!(result.is_err());
    assert!(!rt.scheduler().is_draining());
    assert_eq!(rt.recorder().frames(), 0);
    assert_eq!(obs.get(), 1, "previous value is kept");

    x.set(2);
    assert_eq!(obs.get(), 2);
}

#[test]
fn batch_abandoned_by_panic_does_not_leak_its_number() {
    let rt = runtime();
    let n = ObservableValue::new_in(&rt, 0u32);
    let n1 = n.clone();
    let doubled = Observation::new_in(&rt, move || n1.get() * 2, ObservationOptions::default());
    let _bound = doubled.subscribe(|_| {});
    let seen: Rc<RefCell<Vec<u64>>> = Rc::default();
    let s = Rc::clone(&seen);
    let _sub = n.subscribe(move |note| s.borrow_mut().push(note.batch.get()));

    n.set(1);
    let result = catch_unwind(AssertUnwindSafe(|| {
        rt.batch(|| {
            n.set(2);
            if rt.scheduler().nesting() == 1 {
                panic!("mutation failed");
            }
        })
    }));
    assert!(result.is_err());
    assert!(rt.is_idle());
    assert_eq!(rt.scheduler().current_batch(), None);
    assert_eq!(seen.borrow().len(), 1);
    let first = seen.borrow()[0];
    let abandoned = rt.scheduler().last_batch().get();
    assert!(abandoned > first);

    // The stranded change rides along with the next transaction, under its number.
    n.set(3);
    {
        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        assert!(seen[1] > abandoned);
        assert_eq!(seen[1], seen[2]);
    }
    assert_eq!(doubled.get(), 6);

    n.set(4);
    {
        let seen = seen.borrow();
        assert_eq!(seen.len(), 4);
        assert!(seen[3] > seen[2]);
    }
    assert_eq!(doubled.get(), 8);
}
