//! E2E integration test: a counter model observed by a view-like host.
//!
//! Validates:
//! 1. No tracking, no subscription.
//! 2. Single subscription, single notification.
//! 3. Discharge-on-notify (no second fire without re-tracking).
//! 4. Property and object isolation.
//! 5. Computed-property transitivity.
//! 6. A failed mutation is a no-op for observation.
//! 7. The host re-render loop: re-tracking after each notification keeps the
//!    view current.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ftui_observation::{
    ChangeEvent, NestedTracking, Observable, ObservationRegistrar, RegistrarConfig, batch,
    observable, untracked,
};

observable! {
    /// The counter model from the scenario.
    pub struct Model {
        pub count: i64 = 0,
        pub title: String = String::from("Counter"),
    }
}

impl Model {
    fn update_count(&self, value: i64) {
        self.count.set(value);
    }

    /// Computed property: reads `count` but is not itself stored.
    fn is_even(&self) -> bool {
        self.count.get() % 2 == 0
    }

    fn render(&self) -> String {
        format!("count is {}", self.count.get())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn notification_counter() -> (Arc<AtomicUsize>, impl FnOnce(&ChangeEvent) + Send + 'static) {
    let notifications = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&notifications);
    (notifications, move |_: &ChangeEvent| {
        sink.fetch_add(1, Ordering::SeqCst);
    })
}

// ═════════════════════════════════════════════════════════════════════════
// Scenario
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn e2e_count_42_then_7_notifies_once() {
    let registrar = ObservationRegistrar::new();
    let model = Model::new(&registrar);
    let (notifications, on_change) = notification_counter();

    let handle = registrar.begin_tracking();
    let text = model.render();
    let observation = registrar.end_tracking(handle, on_change).unwrap();
    assert_eq!(text, "count is 0");
    assert!(observation.is_active());

    model.update_count(42);
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
    assert_eq!(model.count.get(), 42);

    model.update_count(7);
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
    assert_eq!(model.count.get(), 7);
    assert!(observation.has_fired());
}

#[test]
fn e2e_read_without_tracking_never_notifies() {
    let registrar = ObservationRegistrar::new();
    let model = Model::new(&registrar);
    let _ = model.render();
    assert!(!registrar.is_subscribed(model.object_id(), "count"));

    model.update_count(1);
    let stats = registrar.stats();
    assert_eq!(stats.discharged, 0);
    assert_eq!(stats.observers, 0);
}

#[test]
fn e2e_property_and_object_isolation() {
    let registrar = ObservationRegistrar::new();
    let model = Model::new(&registrar);
    let other = Model::new(&registrar);
    let (notifications, on_change) = notification_counter();

    let _ = registrar.track(|| model.count.get(), on_change).unwrap();

    model.title.set("Renamed".into());
    other.count.set(99);
    assert_eq!(notifications.load(Ordering::SeqCst), 0);

    model.count.set(1);
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
}

#[test]
fn e2e_computed_property_subscribes_to_its_inputs() {
    let registrar = ObservationRegistrar::new();
    let model = Model::new(&registrar);
    let (notifications, on_change) = notification_counter();

    let (even, _observation) = registrar.track(|| model.is_even(), on_change).unwrap();
    assert!(even);
    assert!(registrar.is_subscribed(model.object_id(), "count"));
    assert!(!registrar.is_subscribed(model.object_id(), "is_even"));
    assert_eq!(registrar.stats().subscriptions, 1);

    model.count.set(3);
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
}

#[test]
fn e2e_failed_mutation_keeps_value_and_subscription() {
    let registrar = ObservationRegistrar::new();
    let model = Model::new(&registrar);
    model.count.set(10);
    let (notifications, on_change) = notification_counter();
    let (_, observation) = registrar.track(|| model.render(), on_change).unwrap();

    let result: Result<(), &str> = model.count.try_update(|count| {
        *count = -1;
        Err("negative counts are rejected")
    });
    assert_eq!(result, Err("negative counts are rejected"));
    assert_eq!(model.count.get(), 10);
    assert_eq!(notifications.load(Ordering::SeqCst), 0);
    assert!(observation.is_active());
}

// ═════════════════════════════════════════════════════════════════════════
// Host re-render loop
// ═════════════════════════════════════════════════════════════════════════

/// Minimal host: re-renders when dirty, re-tracking on every render.
struct View {
    registrar: ObservationRegistrar,
    dirty: Arc<AtomicBool>,
    frames: Vec<String>,
}

impl View {
    fn new(registrar: &ObservationRegistrar) -> Self {
        Self {
            registrar: registrar.clone(),
            dirty: Arc::new(AtomicBool::new(true)),
            frames: Vec::new(),
        }
    }

    fn render_if_dirty(&mut self, model: &Model) {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let flag = Arc::clone(&self.dirty);
        let (frame, _observation) = self
            .registrar
            .track(
                || format!("{}: {}", model.title.get(), model.count.get()),
                move |_| flag.store(true, Ordering::SeqCst),
            )
            .unwrap();
        self.frames.push(frame);
    }
}

#[test]
fn e2e_host_loop_rerenders_after_each_change() {
    let registrar = ObservationRegistrar::new();
    let model = Model::new(&registrar);
    let mut view = View::new(&registrar);

    view.render_if_dirty(&model);
    view.render_if_dirty(&model);
    assert_eq!(view.frames, vec!["Counter: 0"]);

    model.update_count(42);
    view.render_if_dirty(&model);
    model.title.set("Total".into());
    view.render_if_dirty(&model);
    view.render_if_dirty(&model);

    assert_eq!(view.frames, vec!["Counter: 0", "Counter: 42", "Total: 42"]);
}

#[test]
fn e2e_batched_updates_render_once() {
    let registrar = ObservationRegistrar::new();
    let model = Model::new(&registrar);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _ = registrar
        .track(
            || model.render() + &model.title.get(),
            move |event: &ChangeEvent| sink.lock().unwrap().push(event.paths().len()),
        )
        .unwrap();

    batch(|| {
        model.count.set(1);
        model.count.set(2);
        model.title.set("Batched".into());
    });
    assert_eq!(*events.lock().unwrap(), vec![2]);
}

#[test]
fn e2e_untracked_read_inside_render() {
    let registrar = ObservationRegistrar::new();
    let model = Model::new(&registrar);
    let (notifications, on_change) = notification_counter();
    let _ = registrar
        .track(
            || format!("{} ({})", model.render(), untracked(|| model.title.get())),
            on_change,
        )
        .unwrap();

    model.title.set("Ignored".into());
    assert_eq!(notifications.load(Ordering::SeqCst), 0);
    model.count.set(5);
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
}

#[test]
fn e2e_nested_child_view_under_both_policies() {
    for (policy, parent_fires) in [(NestedTracking::Propagate, 1), (NestedTracking::Innermost, 0)] {
        let registrar = ObservationRegistrar::with_config(RegistrarConfig::default().with_nested(policy));
        let model = Model::new(&registrar);
        let (parent, parent_cb) = notification_counter();
        let (child, child_cb) = notification_counter();

        let parent_handle = registrar.begin_tracking();
        let _ = model.title.get();
        let _ = registrar.track(|| model.count.get(), child_cb).unwrap();
        let _ = registrar.end_tracking(parent_handle, parent_cb).unwrap();

        model.count.set(1);
        assert_eq!(child.load(Ordering::SeqCst), 1, "{policy:?}");
        assert_eq!(parent.load(Ordering::SeqCst), parent_fires, "{policy:?}");
    }
}
