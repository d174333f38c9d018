#![forbid(unsafe_code)]

//! The observation registrar.
//!
//! # Design
//!
//! [`ObservationRegistrar`] is a cheap `Arc` handle to shared bookkeeping:
//! for every tracked [`PropertyPath`], the set of observers currently
//! interested in it. Observable objects route reads through
//! [`access`](ObservationRegistrar::access) and writes through
//! [`with_mutation`](ObservationRegistrar::with_mutation). Hosts wrap each
//! recomputation in [`begin_tracking`](ObservationRegistrar::begin_tracking) /
//! [`end_tracking`](ObservationRegistrar::end_tracking).
//!
//! Dependencies are discovered dynamically: whatever tracked properties a
//! computation reads while a context is open become its subscriptions.
//! Computed values therefore need no dependency graph.
//!
//! # Invariants
//!
//! 1. Reads outside a tracking context never create a subscription.
//! 2. An observer fires at most once; it must re-track to observe again.
//! 3. A mutation of `object.key` only fires observers that read exactly that
//!    path. Object identity is compared, never values.
//! 4. Callbacks run outside the registrar lock, so they may read, mutate, and
//!    track again.
//! 5. Notification order across observers is unspecified.
//! 6. A mutation that lands between a read and the commit of its context is
//!    never lost: `end_tracking` compares the mutation epoch recorded at the
//!    read with the current one and fires the observer at once if it moved.
//!
//! # Performance
//!
//! | Operation        | Complexity                                  |
//! |------------------|---------------------------------------------|
//! | `access()`       | O(D) where D = open tracking contexts; one lock per first read of a path in a context |
//! | `did_set()`      | O(S·P) where S = subscribers, P = their paths |
//! | `end_tracking()` | O(R) where R = recorded reads               |
//!
//! # Failure Modes
//!
//! - **Unhooked access**: a property read or written without going through
//!   the registrar is invisible to observation. Views go stale silently.
//! - **Commit race**: a mutation on another thread between a read and the
//!   commit in `end_tracking` fires the observer during the commit instead
//!   of subscribing it. The callback then runs on the committing thread.
//! - **Panicking mutation**: the `will_set` bracket is closed while unwinding
//!   and `did_set` does not run, so subscribers are not notified.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use ahash::{AHashMap, AHashSet};

use crate::batch;
use crate::config::RegistrarConfig;
use crate::error::{ObservationError, Result};
use crate::id::{ObjectId, ObserverId, PropertyKey, PropertyPath, RegistrarId};
use crate::observer::{self, ChangeEvent, Observation, ObserverCell, Pending};
use crate::tracking::{self, RecordedReads, TrackingHandle};

// ─── Shared state ────────────────────────────────────────────────────────────

pub(crate) struct RegistrarShared {
    id: RegistrarId,
    config: RegistrarConfig,
    state: Mutex<RegistrarState>,
    counters: Counters,
}

#[derive(Default)]
struct Counters {
    accesses: AtomicU64,
    recorded_accesses: AtomicU64,
    mutations: AtomicU64,
    aborted_mutations: AtomicU64,
    discharged: AtomicU64,
}

#[derive(Default)]
struct RegistrarState {
    observers: AHashMap<ObserverId, ObserverEntry>,
    /// Subscription sets.
    lookups: AHashMap<PropertyPath, AHashSet<ObserverId>>,
    /// Open `will_set` brackets per path; maintained only with contract checks.
    in_flight: AHashMap<PropertyPath, u32>,
    /// Mutation epochs of paths read by contexts that have not committed yet.
    watched: AHashMap<PropertyPath, Watch>,
}

struct Watch {
    /// Recordings holding this entry alive.
    readers: u32,
    /// Bumped by every `did_set` of the path.
    epoch: u64,
}

struct ObserverEntry {
    cell: Arc<ObserverCell>,
    /// Paths of this registrar the observer is subscribed to.
    paths: AHashSet<PropertyPath>,
}

impl RegistrarState {
    fn subscribe(&mut self, cell: &Arc<ObserverCell>, paths: AHashSet<PropertyPath>) {
        let id = cell.id();
        for path in &paths {
            self.lookups.entry(*path).or_default().insert(id);
        }
        self.observers.insert(
            id,
            ObserverEntry {
                cell: Arc::clone(cell),
                paths,
            },
        );
    }

    fn remove_observer(&mut self, id: ObserverId) -> Option<ObserverEntry> {
        let entry = self.observers.remove(&id)?;
        for path in &entry.paths {
            if let Some(set) = self.lookups.get_mut(path) {
                set.remove(&id);
                if set.is_empty() {
                    self.lookups.remove(path);
                }
            }
        }
        Some(entry)
    }

    /// Remove every observer subscribed to any of `paths`.
    ///
    /// Each observer is returned once, with every one of `paths` it was
    /// subscribed to.
    fn discharge(&mut self, paths: &[PropertyPath]) -> Vec<Pending> {
        let mut order = Vec::new();
        let mut hits: AHashMap<ObserverId, Vec<PropertyPath>> = AHashMap::new();
        for path in paths {
            let Some(ids) = self.lookups.get(path) else {
                continue;
            };
            for id in ids {
                hits.entry(*id)
                    .or_insert_with(|| {
                        order.push(*id);
                        Vec::new()
                    })
                    .push(*path);
            }
        }

        order
            .into_iter()
            .filter_map(|id| {
                let entry = self.remove_observer(id)?;
                Some(Pending {
                    cell: entry.cell,
                    paths: hits.remove(&id).unwrap_or_default(),
                })
            })
            .collect()
    }
}

impl RegistrarShared {
    pub(crate) fn id(&self) -> RegistrarId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, RegistrarState> {
        // Callbacks never run under this lock, so the state is consistent
        // even if a previous holder panicked.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn label(&self) -> &str {
        self.config.label.as_deref().unwrap_or("")
    }

    /// Start holding the mutation epoch of `path` for a tracking context.
    pub(crate) fn watch(&self, path: PropertyPath) -> u64 {
        let mut state = self.lock();
        let watch = state.watched.entry(path).or_insert(Watch {
            readers: 0,
            epoch: 0,
        });
        watch.readers += 1;
        watch.epoch
    }

    /// Release epochs taken by [`watch`](Self::watch).
    pub(crate) fn unwatch<'a>(&self, paths: impl Iterator<Item = &'a PropertyPath>) {
        let mut state = self.lock();
        for path in paths {
            if let Some(watch) = state.watched.get_mut(path) {
                watch.readers = watch.readers.saturating_sub(1);
                if watch.readers == 0 {
                    state.watched.remove(path);
                }
            }
        }
    }

    fn bump_epoch(&self, path: &PropertyPath) {
        if let Some(watch) = self.lock().watched.get_mut(path) {
            watch.epoch += 1;
        }
    }

    /// Subscribe `cell` to the recorded paths.
    ///
    /// Returns the paths mutated since they were read instead, without
    /// subscribing, if there are any.
    fn subscribe(&self, cell: &Arc<ObserverCell>, reads: &RecordedReads) -> Vec<PropertyPath> {
        let mut state = self.lock();
        let stale: Vec<PropertyPath> = reads
            .paths
            .iter()
            .filter(|(path, epoch)| state.watched.get(*path).is_some_and(|w| w.epoch != **epoch))
            .map(|(path, _)| *path)
            .collect();
        // A mutation on another thread may already have fired the observer
        // through a registrar committed earlier.
        if stale.is_empty() && cell.is_active() {
            state.subscribe(cell, reads.paths.keys().copied().collect());
        }
        stale
    }

    pub(crate) fn remove_observer(&self, id: ObserverId) {
        self.lock().remove_observer(id);
    }

    pub(crate) fn discharge(&self, paths: &[PropertyPath]) -> Vec<Pending> {
        let pending = self.lock().discharge(paths);
        if !pending.is_empty() {
            self.counters
                .discharged
                .fetch_add(pending.len() as u64, Ordering::Relaxed);
            tracing::debug!(
                message = "observation.discharge",
                registrar_id = self.id.raw(),
                label = self.label(),
                paths = paths.len(),
                observers = pending.len()
            );
        }
        pending
    }

    fn open_bracket(&self, path: PropertyPath) {
        if self.config.contract_checks {
            *self.lock().in_flight.entry(path).or_default() += 1;
        }
    }

    /// Close a `will_set` bracket. Returns `false` if none was open.
    fn close_bracket(&self, path: &PropertyPath) -> bool {
        if !self.config.contract_checks {
            return true;
        }
        let mut state = self.lock();
        let Some(open) = state.in_flight.get_mut(path) else {
            return false;
        };
        *open -= 1;
        if *open == 0 {
            state.in_flight.remove(path);
        }
        true
    }
}

/// Closes a `will_set` bracket if the mutation unwinds before `did_set`.
struct Bracket<'a> {
    shared: &'a RegistrarShared,
    path: PropertyPath,
    armed: bool,
}

impl<'a> Bracket<'a> {
    fn new(shared: &'a RegistrarShared, path: PropertyPath) -> Self {
        Self {
            shared,
            path,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Bracket<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.close_bracket(&self.path);
            tracing::debug!(
                message = "observation.mutation.unwound",
                registrar_id = self.shared.id.raw(),
                object = self.path.object.raw(),
                key = self.path.key.name()
            );
        }
    }
}

// ─── Stats ───────────────────────────────────────────────────────────────────

/// Snapshot of a registrar's counters and live bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistrarStats {
    /// `access` calls.
    pub accesses: u64,
    /// `access` calls that were recorded by a tracking context.
    pub recorded_accesses: u64,
    /// `did_set` calls.
    pub mutations: u64,
    /// `try_with_mutation` calls whose mutation failed.
    pub aborted_mutations: u64,
    /// Observers discharged by mutations of this registrar's properties.
    pub discharged: u64,
    /// Observers currently subscribed.
    pub observers: usize,
    /// (path, observer) subscription entries currently held.
    pub subscriptions: usize,
    /// Paths read by tracking contexts that have not been ended yet.
    pub watched_paths: usize,
    /// `will_set` brackets not yet closed; counted only with contract checks.
    pub open_brackets: usize,
}

// ─── ObservationRegistrar ────────────────────────────────────────────────────

/// Shared authority mapping tracked properties to interested observers.
///
/// Cloning creates a new handle to the **same** registrar.
#[derive(Clone)]
pub struct ObservationRegistrar {
    shared: Arc<RegistrarShared>,
}

impl Default for ObservationRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObservationRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ObservationRegistrar")
            .field("id", &self.shared.id)
            .field("label", &self.shared.config.label)
            .field("observers", &state.observers.len())
            .field("tracked_paths", &state.lookups.len())
            .finish()
    }
}

impl ObservationRegistrar {
    /// Create a registrar with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistrarConfig::default())
    }

    /// Create a registrar with an explicit configuration.
    #[must_use]
    pub fn with_config(config: RegistrarConfig) -> Self {
        Self {
            shared: Arc::new(RegistrarShared {
                id: RegistrarId::next(),
                config,
                state: Mutex::new(RegistrarState::default()),
                counters: Counters::default(),
            }),
        }
    }

    /// The process-wide registrar, configured from the environment on first
    /// use.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<ObservationRegistrar> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::with_config(RegistrarConfig::from_env()))
    }

    /// Unique identifier of this registrar.
    #[inline]
    #[must_use]
    pub fn id(&self) -> RegistrarId {
        self.shared.id
    }

    /// The configuration this registrar was built with.
    #[must_use]
    pub fn config(&self) -> &RegistrarConfig {
        &self.shared.config
    }

    pub(crate) fn shared(&self) -> &Arc<RegistrarShared> {
        &self.shared
    }

    // ── Tracking ─────────────────────────────────────────────────────

    /// Open a tracking context on the current thread.
    ///
    /// Every tracked-property read on this thread is recorded until the
    /// returned handle is passed to [`end_tracking`](Self::end_tracking).
    pub fn begin_tracking(&self) -> TrackingHandle {
        let handle = tracking::open(self.shared.id, self.shared.config.nested);
        tracing::trace!(
            message = "observation.track.begin",
            registrar_id = self.shared.id.raw(),
            handle = handle.id().raw(),
            depth = tracking::depth()
        );
        handle
    }

    /// Close a tracking context and commit its reads as subscriptions.
    ///
    /// `on_change` is invoked exactly once, on the first later mutation of
    /// any property read inside the context. If nothing was read, the
    /// returned [`Observation`] is inert and `on_change` is dropped unused.
    ///
    /// # Errors
    ///
    /// - [`ObservationError::ForeignRegistrar`] if `handle` was opened by
    ///   another registrar.
    /// - [`ObservationError::ContextClosed`] if the context was discarded
    ///   because an enclosing context ended first.
    ///
    /// In both cases the context is dropped without subscribing.
    pub fn end_tracking<F>(&self, handle: TrackingHandle, on_change: F) -> Result<Observation>
    where
        F: FnOnce(&ChangeEvent) + Send + 'static,
    {
        if handle.registrar_id() != self.shared.id {
            let err = ObservationError::ForeignRegistrar {
                handle: handle.id(),
                opened_by: handle.registrar_id(),
                ended_by: self.shared.id,
            };
            tracing::warn!(message = "observation.track.foreign", error = %err);
            return Err(err);
        }

        let handle_id = handle.finish();
        let Some(closed) = tracking::close(handle_id) else {
            let err = ObservationError::ContextClosed { handle: handle_id };
            tracing::warn!(message = "observation.track.closed", error = %err);
            return Err(err);
        };
        if closed.discarded > 0 {
            tracing::warn!(
                message = "observation.track.discarded",
                handle = handle_id.raw(),
                discarded = closed.discarded
            );
        }

        let targets: Vec<_> = closed
            .reads
            .into_iter()
            .filter(|reads| !reads.paths.is_empty())
            .filter_map(|reads| reads.registrar.upgrade().map(|r| (r, reads)))
            .collect();
        if targets.is_empty() {
            tracing::debug!(message = "observation.track.empty", handle = handle_id.raw());
            return Ok(Observation::inert());
        }

        let cell = ObserverCell::new(
            Box::new(on_change),
            targets.iter().map(|(r, _)| Arc::downgrade(r)).collect(),
        );
        let mut path_count = 0;
        let mut stale = Vec::new();
        for (registrar, reads) in &targets {
            path_count += reads.paths.len();
            if stale.is_empty() {
                stale = registrar.subscribe(&cell, reads);
            }
        }
        // Release the recorded epochs.
        drop(targets);

        if !stale.is_empty() {
            tracing::debug!(
                message = "observation.track.stale",
                registrar_id = self.shared.id.raw(),
                handle = handle_id.raw(),
                observer = cell.id().raw(),
                paths = stale.len()
            );
            observer::deliver(vec![Pending {
                cell: Arc::clone(&cell),
                paths: stale,
            }]);
            return Ok(Observation::new(cell));
        }
        tracing::debug!(
            message = "observation.track.commit",
            registrar_id = self.shared.id.raw(),
            handle = handle_id.raw(),
            observer = cell.id().raw(),
            paths = path_count
        );
        Ok(Observation::new(cell))
    }

    /// Run `apply` inside a tracking context and commit its reads.
    ///
    /// Equivalent to `begin_tracking`, `apply()`, `end_tracking(on_change)`.
    /// If `apply` panics, the context is abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`ObservationError::ContextClosed`] if `apply` ended an
    /// enclosing context of its own tracking context.
    pub fn track<R, F>(&self, apply: impl FnOnce() -> R, on_change: F) -> Result<(R, Observation)>
    where
        F: FnOnce(&ChangeEvent) + Send + 'static,
    {
        let handle = self.begin_tracking();
        let value = apply();
        let observation = self.end_tracking(handle, on_change)?;
        Ok((value, observation))
    }

    // ── Property hooks ───────────────────────────────────────────────

    /// Record a read of `object.key`.
    ///
    /// Outside a tracking context this only bumps the access counter.
    pub fn access(&self, object: ObjectId, key: impl Into<PropertyKey>) {
        let path = PropertyPath::new(object, key);
        self.shared.counters.accesses.fetch_add(1, Ordering::Relaxed);
        if tracking::record(&self.shared, path) {
            self.shared
                .counters
                .recorded_accesses
                .fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                message = "observation.access",
                registrar_id = self.shared.id.raw(),
                object = object.raw(),
                key = path.key.name()
            );
        }
    }

    /// Announce an upcoming mutation of `object.key`.
    ///
    /// No notification happens here. With contract checks enabled the
    /// bracket is counted so an unmatched [`did_set`](Self::did_set) can be
    /// reported.
    pub fn will_set(&self, object: ObjectId, key: impl Into<PropertyKey>) {
        let path = PropertyPath::new(object, key);
        self.shared.open_bracket(path);
        tracing::trace!(
            message = "observation.will_set",
            registrar_id = self.shared.id.raw(),
            object = object.raw(),
            key = path.key.name()
        );
    }

    /// Notify and discharge every observer subscribed to `object.key`.
    ///
    /// Inside [`batch`](crate::batch::batch) the notification is deferred to
    /// the end of the outermost batch. A `did_set` without a matching
    /// `will_set` is still a normal trigger.
    pub fn did_set(&self, object: ObjectId, key: impl Into<PropertyKey>) {
        let path = PropertyPath::new(object, key);
        self.shared.counters.mutations.fetch_add(1, Ordering::Relaxed);
        if !self.shared.close_bracket(&path) {
            tracing::debug!(
                message = "observation.did_set.unmatched",
                registrar_id = self.shared.id.raw(),
                object = object.raw(),
                key = path.key.name()
            );
        }
        self.shared.bump_epoch(&path);
        if batch::defer(&self.shared, path) {
            return;
        }
        let pending = self.shared.discharge(&[path]);
        observer::deliver(pending);
    }

    /// Run `mutation` bracketed by [`will_set`](Self::will_set) and
    /// [`did_set`](Self::did_set), returning its result.
    ///
    /// If `mutation` panics, the bracket is closed and `did_set` does not
    /// run.
    pub fn with_mutation<R>(
        &self,
        object: ObjectId,
        key: impl Into<PropertyKey>,
        mutation: impl FnOnce() -> R,
    ) -> R {
        let key = key.into();
        self.will_set(object, key);
        let bracket = Bracket::new(&self.shared, PropertyPath::new(object, key));
        let value = mutation();
        bracket.disarm();
        self.did_set(object, key);
        value
    }

    /// Like [`with_mutation`](Self::with_mutation) for fallible mutations.
    ///
    /// An `Err` means the observable value did not change: subscribers are
    /// not notified and the error is returned unchanged.
    pub fn try_with_mutation<R, E>(
        &self,
        object: ObjectId,
        key: impl Into<PropertyKey>,
        mutation: impl FnOnce() -> std::result::Result<R, E>,
    ) -> std::result::Result<R, E> {
        let key = key.into();
        self.will_set(object, key);
        let bracket = Bracket::new(&self.shared, PropertyPath::new(object, key));
        let outcome = mutation();
        bracket.disarm();
        match outcome {
            Ok(value) => {
                self.did_set(object, key);
                Ok(value)
            }
            Err(err) => {
                let path = PropertyPath::new(object, key);
                self.shared.close_bracket(&path);
                self.shared
                    .counters
                    .aborted_mutations
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    message = "observation.mutation.aborted",
                    registrar_id = self.shared.id.raw(),
                    object = object.raw(),
                    key = key.name()
                );
                Err(err)
            }
        }
    }

    // ── Introspection ────────────────────────────────────────────────

    /// Whether any active observer is subscribed to `object.key`.
    #[must_use]
    pub fn is_subscribed(&self, object: ObjectId, key: impl Into<PropertyKey>) -> bool {
        let path = PropertyPath::new(object, key);
        self.shared.lock().lookups.contains_key(&path)
    }

    /// Snapshot of counters and live bookkeeping.
    #[must_use]
    pub fn stats(&self) -> RegistrarStats {
        let counters = &self.shared.counters;
        let state = self.shared.lock();
        RegistrarStats {
            accesses: counters.accesses.load(Ordering::Relaxed),
            recorded_accesses: counters.recorded_accesses.load(Ordering::Relaxed),
            mutations: counters.mutations.load(Ordering::Relaxed),
            aborted_mutations: counters.aborted_mutations.load(Ordering::Relaxed),
            discharged: counters.discharged.load(Ordering::Relaxed),
            observers: state.observers.len(),
            subscriptions: state.lookups.values().map(|set| set.len()).sum(),
            watched_paths: state.watched.len(),
            open_brackets: state.in_flight.values().map(|open| *open as usize).sum(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
