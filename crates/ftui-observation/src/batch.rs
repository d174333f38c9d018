#![forbid(unsafe_code)]

//! Coalescing of notifications across several mutations.
//!
//! Inside [`batch`], `did_set` only queues the mutated path on the current
//! thread. When the outermost batch returns, every queued path is discharged
//! at once, and each affected observer fires a single time with all of its
//! triggering paths in [`ChangeEvent::paths`].
//!
//! Batching is per thread: mutations made by other threads during a batch
//! notify immediately.
//!
//! # Failure Modes
//!
//! - **Batch body panics**: mutations committed before the panic are still
//!   flushed while the outermost batch unwinds, with a warning. A callback
//!   that panics during that flush is caught and logged so it cannot abort
//!   the process.
//!
//! [`ChangeEvent::paths`]: crate::ChangeEvent::paths

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use ahash::AHashMap;

use crate::id::PropertyPath;
use crate::observer::{self, Pending};
use crate::registrar::RegistrarShared;

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
    static QUEUE: RefCell<Vec<(Arc<RegistrarShared>, PropertyPath)>> = const { RefCell::new(Vec::new()) };
}

/// Run `f`, deferring notifications until the outermost batch returns.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    struct Exit;

    impl Drop for Exit {
        fn drop(&mut self) {
            let depth = DEPTH.get().saturating_sub(1);
            DEPTH.set(depth);
            if depth == 0 && std::thread::panicking() {
                let queued = QUEUE.take();
                if queued.is_empty() {
                    return;
                }
                tracing::warn!(message = "observation.batch.unwound", paths = queued.len());
                // A second panic here would abort.
                if panic::catch_unwind(AssertUnwindSafe(|| flush_queue(queued))).is_err() {
                    tracing::error!(message = "observation.batch.callback_panicked");
                }
            }
        }
    }

    DEPTH.set(DEPTH.get() + 1);
    let exit = Exit;
    let value = f();
    drop(exit);
    if DEPTH.get() == 0 {
        flush();
    }
    value
}

/// Whether the current thread is inside [`batch`].
#[must_use]
pub fn in_batch() -> bool {
    DEPTH.get() > 0
}

/// Queue a mutation if a batch is open. Returns `false` otherwise.
pub(crate) fn defer(registrar: &Arc<RegistrarShared>, path: PropertyPath) -> bool {
    if !in_batch() {
        return false;
    }
    QUEUE.with_borrow_mut(|queue| queue.push((Arc::clone(registrar), path)));
    true
}

fn flush() {
    flush_queue(QUEUE.take());
}

fn flush_queue(queued: Vec<(Arc<RegistrarShared>, PropertyPath)>) {
    if queued.is_empty() {
        return;
    }
    let mutations = queued.len();

    let mut groups: Vec<(Arc<RegistrarShared>, Vec<PropertyPath>)> = Vec::new();
    for (registrar, path) in queued {
        match groups.iter_mut().find(|(r, _)| r.id() == registrar.id()) {
            Some((_, paths)) => {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
            None => groups.push((registrar, vec![path])),
        }
    }

    // An observer may be subscribed through several registrars.
    let mut merged: Vec<Pending> = Vec::new();
    let mut index = AHashMap::new();
    for (registrar, paths) in groups {
        for pending in registrar.discharge(&paths) {
            match index.get(&pending.cell.id()) {
                Some(&slot) => {
                    let entry: &mut Pending = &mut merged[slot];
                    entry.paths.extend(pending.paths);
                }
                None => {
                    index.insert(pending.cell.id(), merged.len());
                    merged.push(pending);
                }
            }
        }
    }

    tracing::debug!(
        message = "observation.batch.flush",
        mutations,
        observers = merged.len()
    );
    observer::deliver(merged);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ObjectId;
    use crate::registrar::ObservationRegistrar;
    use crate::ChangeEvent;
    use std::sync::Mutex;

    type Events = Arc<Mutex<Vec<Vec<PropertyPath>>>>;

    fn recorder() -> (Events, impl FnOnce(&ChangeEvent) + Send + 'static) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |event: &ChangeEvent| {
            sink.lock().unwrap().push(event.paths().to_vec());
        })
    }

    #[test]
    fn batch_coalesces_into_one_notification() {
        let registrar = ObservationRegistrar::new();
        let obj = ObjectId::next();
        let (events, on_change) = recorder();
        let _ = registrar
            .track(
                || {
                    registrar.access(obj, "a");
                    registrar.access(obj, "b");
                },
                on_change,
            )
            .unwrap();

        batch(|| {
            registrar.with_mutation(obj, "a", || ());
            registrar.with_mutation(obj, "b", || ());
            assert!(in_batch());
            assert!(events.lock().unwrap().is_empty());
        });
        assert!(!in_batch());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            vec![PropertyPath::new(obj, "a"), PropertyPath::new(obj, "b")]
        );
    }

    #[test]
    fn nested_batches_flush_once_at_outermost() {
        let registrar = ObservationRegistrar::new();
        let obj = ObjectId::next();
        let (events, on_change) = recorder();
        let _ = registrar
            .track(|| registrar.access(obj, "a"), on_change)
            .unwrap();

        batch(|| {
            batch(|| registrar.with_mutation(obj, "a", || ()));
            assert!(events.lock().unwrap().is_empty());
            registrar.with_mutation(obj, "a", || ());
        });
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], vec![PropertyPath::new(obj, "a")]);
    }

    #[test]
    fn batch_merges_observers_across_registrars() {
        let a = ObservationRegistrar::new();
        let b = ObservationRegistrar::new();
        let obj_a = ObjectId::next();
        let obj_b = ObjectId::next();
        let (events, on_change) = recorder();
        let _ = a
            .track(
                || {
                    a.access(obj_a, "x");
                    b.access(obj_b, "y");
                },
                on_change,
            )
            .unwrap();

        batch(|| {
            a.with_mutation(obj_a, "x", || ());
            b.with_mutation(obj_b, "y", || ());
        });
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].len(), 2);
    }

    #[test]
    fn panicking_batch_still_notifies_committed_mutations() {
        let registrar = ObservationRegistrar::new();
        let obj = ObjectId::next();
        let (events, on_change) = recorder();
        let _ = registrar
            .track(|| registrar.access(obj, "a"), on_change)
            .unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            batch(|| {
                registrar.with_mutation(obj, "a", || ());
                panic!("batch body failed");
            })
        }));
        assert!(result.is_err());
        assert!(!in_batch());
        assert_eq!(*events.lock().unwrap(), vec![vec![PropertyPath::new(obj, "a")]]);
        assert!(!registrar.is_subscribed(obj, "a"));

        // The queue is empty afterwards; a later batch flushes only its own.
        batch(|| registrar.with_mutation(obj, "a", || ()));
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn panicking_callback_during_unwound_flush_is_contained() {
        let registrar = ObservationRegistrar::new();
        let obj = ObjectId::next();
        let _ = registrar
            .track(
                || registrar.access(obj, "a"),
                |_: &ChangeEvent| panic!("callback failed"),
            )
            .unwrap();
        let (events, on_change) = recorder();
        let _ = registrar
            .track(|| registrar.access(obj, "b"), on_change)
            .unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            batch(|| {
                registrar.with_mutation(obj, "b", || ());
                registrar.with_mutation(obj, "a", || ());
                panic!("batch body failed");
            })
        }));
        assert!(result.is_err());
        assert!(!in_batch());
        assert_eq!(registrar.stats().observers, 0);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn batch_returns_value() {
        assert_eq!(batch(|| 7), 7);
    }

    // ── Log capture ──────────────────────────────────────────────────

    use tracing::Subscriber;
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::{Context, SubscriberExt};

    struct BatchTraceCapture {
        messages: Arc<Mutex<Vec<String>>>,
    }

    impl<S> Layer<S> for BatchTraceCapture
    where
        S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
    {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            struct Msg {
                message: Option<String>,
            }
            impl tracing::field::Visit for Msg {
                fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                    if field.name() == "message" {
                        self.message = Some(value.to_string());
                    }
                }

                fn record_debug(
                    &mut self,
                    field: &tracing::field::Field,
                    value: &dyn std::fmt::Debug,
                ) {
                    if field.name() == "message" {
                        self.message = Some(format!("{value:?}").trim_matches('"').to_string());
                    }
                }
            }
            let mut msg = Msg { message: None };
            event.record(&mut msg);
            if let Some(message) = msg.message {
                self.messages.lock().expect("batch trace lock").push(message);
            }
        }
    }

    #[test]
    fn flush_and_unwind_events_emitted() {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(BatchTraceCapture {
            messages: Arc::clone(&messages),
        });
        let _guard = tracing::subscriber::set_default(subscriber);

        let registrar = ObservationRegistrar::new();
        let obj = ObjectId::next();
        let (_, on_change) = recorder();
        let _ = registrar
            .track(|| registrar.access(obj, "a"), on_change)
            .unwrap();
        batch(|| registrar.with_mutation(obj, "a", || ()));

        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            batch(|| {
                registrar.with_mutation(obj, "b", || ());
                panic!("batch body failed");
            })
        }));

        let messages = messages.lock().expect("batch trace lock");
        assert!(messages.iter().any(|m| m == "observation.batch.flush"));
        assert!(messages.iter().any(|m| m == "observation.notify"));
        assert!(messages.iter().any(|m| m == "observation.batch.unwound"));
    }
}
