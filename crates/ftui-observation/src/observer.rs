#![forbid(unsafe_code)]

//! Single-fire observers and the change events they receive.
//!
//! # Design
//!
//! An observer is committed by `end_tracking` and shared (`Arc`) between
//! every registrar whose properties it read. Its callback sits behind a
//! one-way state transition: `Active -> Fired` or `Active -> Cancelled`.
//! Whichever registrar wins the transition delivers the callback. The others
//! drop their stale entries.
//!
//! # Failure Modes
//!
//! - **Panicking callback**: the panic propagates out of the mutation that
//!   triggered it. Observers later in the same delivery pass were already
//!   discharged and do not fire.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use web_time::Instant;

use crate::id::{ObjectId, ObserverId, PropertyKey, PropertyPath};
use crate::registrar::RegistrarShared;

pub(crate) type ChangeCallback = Box<dyn FnOnce(&ChangeEvent) + Send + 'static>;

const ACTIVE: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Total number of observer callbacks delivered, process-wide.
static NOTIFICATIONS_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Read the total notification count (for diagnostics/telemetry).
#[must_use]
pub fn notifications_total() -> u64 {
    NOTIFICATIONS_TOTAL.load(Ordering::Relaxed)
}

// ─── ObserverCell ────────────────────────────────────────────────────────────

pub(crate) struct ObserverCell {
    id: ObserverId,
    state: AtomicU8,
    callback: Mutex<Option<ChangeCallback>>,
    /// Registrars holding subscriptions for this observer.
    registrars: Vec<Weak<RegistrarShared>>,
}

impl ObserverCell {
    pub(crate) fn new(callback: ChangeCallback, registrars: Vec<Weak<RegistrarShared>>) -> Arc<Self> {
        Arc::new(Self {
            id: ObserverId::next(),
            state: AtomicU8::new(ACTIVE),
            callback: Mutex::new(Some(callback)),
            registrars,
        })
    }

    pub(crate) fn id(&self) -> ObserverId {
        self.id
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    /// Leave the active state. Only the first caller gets the callback.
    fn transition(&self, to: u8) -> Option<ChangeCallback> {
        self.state
            .compare_exchange(ACTIVE, to, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Remove this observer's subscriptions from every registrar.
    fn retire(&self) {
        for registrar in self.registrars.iter().filter_map(Weak::upgrade) {
            registrar.remove_observer(self.id);
        }
    }
}

/// An observer discharged by a mutation, with the paths that hit it.
pub(crate) struct Pending {
    pub(crate) cell: Arc<ObserverCell>,
    pub(crate) paths: Vec<PropertyPath>,
}

/// Fire every pending observer that has not fired or been cancelled yet.
///
/// Must be called without holding any registrar lock.
pub(crate) fn deliver(pending: Vec<Pending>) -> usize {
    let mut fired = 0;
    for Pending { cell, paths } in pending {
        let Some(callback) = cell.transition(FIRED) else {
            continue;
        };
        cell.retire();
        NOTIFICATIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            message = "observation.notify",
            observer = cell.id.raw(),
            paths = paths.len()
        );
        let event = ChangeEvent {
            observer: cell.id,
            paths,
            at: Instant::now(),
        };
        callback(&event);
        fired += 1;
    }
    fired
}

// ─── ChangeEvent ─────────────────────────────────────────────────────────────

/// Passed to an observer's `on_change` callback when it fires.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    observer: ObserverId,
    paths: Vec<PropertyPath>,
    at: Instant,
}

impl ChangeEvent {
    /// The observer being notified.
    #[must_use]
    pub fn observer(&self) -> ObserverId {
        self.observer
    }

    /// Subscribed paths whose mutation triggered this notification.
    ///
    /// Holds a single path unless the mutations were batched.
    #[must_use]
    pub fn paths(&self) -> &[PropertyPath] {
        &self.paths
    }

    /// Whether `object.key` is among the triggering paths.
    #[must_use]
    pub fn contains(&self, object: ObjectId, key: impl Into<PropertyKey>) -> bool {
        let path = PropertyPath::new(object, key);
        self.paths.contains(&path)
    }

    /// When the notification was delivered.
    #[must_use]
    pub fn at(&self) -> Instant {
        self.at
    }
}

// ─── Observation ─────────────────────────────────────────────────────────────

/// Handle to a committed observer, returned by `end_tracking`.
///
/// Dropping the handle does **not** cancel the observer: it stays subscribed
/// until the next relevant mutation fires it, or until [`cancel`] is called.
/// An observation created from a context that read nothing is *inert*: it
/// never fires and owns no subscription.
///
/// [`cancel`]: Observation::cancel
pub struct Observation {
    cell: Option<Arc<ObserverCell>>,
}

impl Observation {
    pub(crate) fn new(cell: Arc<ObserverCell>) -> Self {
        Self { cell: Some(cell) }
    }

    pub(crate) fn inert() -> Self {
        Self { cell: None }
    }

    /// Observer id, or `None` for an inert observation.
    #[must_use]
    pub fn id(&self) -> Option<ObserverId> {
        self.cell.as_ref().map(|cell| cell.id)
    }

    /// Whether the tracking context read nothing.
    #[must_use]
    pub fn is_inert(&self) -> bool {
        self.cell.is_none()
    }

    /// Whether the observer is still waiting for a mutation.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.cell.as_ref().is_some_and(|cell| cell.is_active())
    }

    /// Whether the observer's callback has been invoked.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.cell
            .as_ref()
            .is_some_and(|cell| cell.state.load(Ordering::Acquire) == FIRED)
    }

    /// Cancel the observer and drop its subscriptions.
    ///
    /// Returns `false` if it already fired, was already cancelled, or is
    /// inert.
    pub fn cancel(&self) -> bool {
        let Some(cell) = &self.cell else {
            return false;
        };
        let Some(callback) = cell.transition(CANCELLED) else {
            return false;
        };
        drop(callback);
        cell.retire();
        tracing::debug!(message = "observation.cancel", observer = cell.id.raw());
        true
    }
}

impl fmt::Debug for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observation")
            .field("id", &self.id())
            .field("active", &self.is_active())
            .field("fired", &self.has_fired())
            .finish()
    }
}
