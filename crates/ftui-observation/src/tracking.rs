#![forbid(unsafe_code)]

//! Thread-local tracking contexts.
//!
//! A tracking context is a frame on the current thread's tracking stack.
//! While a frame is open, every tracked-property read made on this thread is
//! recorded into it, whichever registrar owns the property. Frames nest: the
//! innermost frame always records, and enclosing frames record too when the
//! registrar that opened them uses [`NestedTracking::Propagate`].
//!
//! # Invariants
//!
//! 1. A frame records only reads made on the thread that opened it.
//! 2. Closing a frame also discards every frame opened above it.
//! 3. Reads inside [`untracked`] are not recorded by frames opened before the
//!    `untracked` call.
//! 4. Each recorded path carries the registrar's mutation epoch for that path
//!    as of its first read in the frame. The registrar keeps the epoch alive
//!    until the recording is dropped.
//!
//! # Failure Modes
//!
//! - **Handle dropped without ending**: the frame is abandoned and nothing
//!   subscribes.
//! - **Ending an outer handle first**: inner frames are discarded; ending
//!   them later returns [`ObservationError::ContextClosed`].
//!
//! [`ObservationError::ContextClosed`]: crate::ObservationError::ContextClosed

use std::cell::{Cell, RefCell};
use std::collections::hash_map::Entry;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use ahash::AHashMap;

use crate::config::NestedTracking;
use crate::id::{PropertyPath, RegistrarId, TrackingId};
use crate::registrar::RegistrarShared;

/// Reads recorded against one registrar.
pub(crate) struct RecordedReads {
    pub(crate) registrar: Weak<RegistrarShared>,
    /// Path -> mutation epoch observed at the first read.
    pub(crate) paths: AHashMap<PropertyPath, u64>,
}

impl Drop for RecordedReads {
    fn drop(&mut self) {
        if let Some(registrar) = self.registrar.upgrade() {
            registrar.unwatch(self.paths.keys());
        }
    }
}

struct Frame {
    id: TrackingId,
    /// Whether reads made inside nested frames are recorded here as well.
    collects_nested: bool,
    reads: AHashMap<RegistrarId, RecordedReads>,
}

impl Frame {
    fn record(&mut self, registrar: &Arc<RegistrarShared>, path: PropertyPath) {
        let reads = self
            .reads
            .entry(registrar.id())
            .or_insert_with(|| RecordedReads {
                registrar: Arc::downgrade(registrar),
                paths: AHashMap::new(),
            })
            .paths
            .entry(path);
        if let Entry::Vacant(slot) = reads {
            slot.insert(registrar.watch(path));
        }
    }
}

thread_local! {
    static STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
    /// Frames below this depth do not record (see [`untracked`]).
    static FLOOR: Cell<usize> = const { Cell::new(0) };
}

// ─── TrackingHandle ──────────────────────────────────────────────────────────

/// An open tracking context.
///
/// Returned by [`ObservationRegistrar::begin_tracking`] and consumed by
/// [`ObservationRegistrar::end_tracking`]. The handle is tied to the thread
/// that opened it. Dropping it without ending abandons the context.
///
/// [`ObservationRegistrar::begin_tracking`]: crate::ObservationRegistrar::begin_tracking
/// [`ObservationRegistrar::end_tracking`]: crate::ObservationRegistrar::end_tracking
#[must_use = "reads are only subscribed once the context is ended"]
pub struct TrackingHandle {
    id: TrackingId,
    opened_by: RegistrarId,
    finished: bool,
    _not_send: PhantomData<*const ()>,
}

impl TrackingHandle {
    /// Identity of this tracking context.
    #[must_use]
    pub fn id(&self) -> TrackingId {
        self.id
    }

    /// The registrar that opened this context.
    #[must_use]
    pub fn registrar_id(&self) -> RegistrarId {
        self.opened_by
    }

    /// Mark the handle as ended so dropping it does not abandon the frame.
    pub(crate) fn finish(mut self) -> TrackingId {
        self.finished = true;
        self.id
    }
}

impl fmt::Debug for TrackingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingHandle")
            .field("id", &self.id)
            .field("opened_by", &self.opened_by)
            .finish()
    }
}

impl Drop for TrackingHandle {
    fn drop(&mut self) {
        if !self.finished {
            abandon(self.id);
        }
    }
}

// ─── Frame operations ────────────────────────────────────────────────────────

/// A frame removed from the stack by [`close`].
pub(crate) struct Closed {
    pub(crate) reads: Vec<RecordedReads>,
    /// Inner frames discarded because they were still open.
    pub(crate) discarded: usize,
}

pub(crate) fn open(opened_by: RegistrarId, nested: NestedTracking) -> TrackingHandle {
    let id = TrackingId::next();
    STACK.with_borrow_mut(|stack| {
        stack.push(Frame {
            id,
            collects_nested: nested == NestedTracking::Propagate,
            reads: AHashMap::new(),
        });
    });
    TrackingHandle {
        id,
        opened_by,
        finished: false,
        _not_send: PhantomData,
    }
}

/// Record a read into the active frames. Returns whether any frame recorded.
pub(crate) fn record(registrar: &Arc<RegistrarShared>, path: PropertyPath) -> bool {
    let floor = FLOOR.get();
    STACK.with_borrow_mut(|stack| {
        let Some(active) = stack.get_mut(floor..) else {
            return false;
        };
        let Some((innermost, enclosing)) = active.split_last_mut() else {
            return false;
        };
        innermost.record(registrar, path);
        for frame in enclosing.iter_mut().filter(|frame| frame.collects_nested) {
            frame.record(registrar, path);
        }
        true
    })
}

pub(crate) fn close(id: TrackingId) -> Option<Closed> {
    STACK.with_borrow_mut(|stack| {
        let pos = stack.iter().rposition(|frame| frame.id == id)?;
        let discarded = stack.len() - pos - 1;
        stack.truncate(pos + 1);
        let frame = stack.pop()?;
        Some(Closed {
            reads: frame.reads.into_values().collect(),
            discarded,
        })
    })
}

fn abandon(id: TrackingId) {
    // The stack may already be torn down during thread exit.
    let _ = STACK.try_with(|stack| {
        if let Ok(mut stack) = stack.try_borrow_mut()
            && let Some(pos) = stack.iter().rposition(|frame| frame.id == id)
        {
            stack.truncate(pos);
            tracing::trace!(message = "observation.track.abandon", handle = id.raw());
        }
    });
}

// ─── Public queries ──────────────────────────────────────────────────────────

/// Whether a read on this thread would currently be recorded.
#[must_use]
pub fn is_tracking() -> bool {
    STACK.with_borrow(Vec::len) > FLOOR.get()
}

/// Number of open tracking contexts on this thread.
#[must_use]
pub fn depth() -> usize {
    STACK.with_borrow(Vec::len)
}

/// Run `f` without recording its reads into the currently open contexts.
///
/// Contexts opened inside `f` record normally.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    struct Restore(usize);

    impl Drop for Restore {
        fn drop(&mut self) {
            FLOOR.set(self.0);
        }
    }

    let depth = depth();
    let _restore = Restore(FLOOR.replace(depth));
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ObjectId;
    use crate::registrar::ObservationRegistrar;

    fn path(key: &'static str) -> PropertyPath {
        PropertyPath::new(ObjectId::from_raw(1), key)
    }

    #[test]
    fn record_without_frame_is_noop() {
        let registrar = ObservationRegistrar::new();
        assert!(!is_tracking());
        assert!(!record(registrar.shared(), path("a")));
    }

    #[test]
    fn innermost_only_policy_keeps_reads_local() {
        let registrar = ObservationRegistrar::new();
        let outer = open(registrar.id(), NestedTracking::Innermost);
        let inner = open(registrar.id(), NestedTracking::Innermost);
        assert_eq!(depth(), 2);
        assert!(record(registrar.shared(), path("a")));

        let inner_closed = close(inner.finish()).expect("inner frame");
        let outer_closed = close(outer.finish()).expect("outer frame");
        assert_eq!(inner_closed.reads.len(), 1);
        assert!(outer_closed.reads.is_empty());
    }

    #[test]
    fn propagate_policy_records_into_enclosing() {
        let registrar = ObservationRegistrar::new();
        let outer = open(registrar.id(), NestedTracking::Propagate);
        let inner = open(registrar.id(), NestedTracking::Innermost);
        assert!(record(registrar.shared(), path("a")));

        let inner_closed = close(inner.finish()).expect("inner frame");
        let outer_closed = close(outer.finish()).expect("outer frame");
        assert_eq!(inner_closed.reads[0].paths.len(), 1);
        assert_eq!(outer_closed.reads[0].paths.len(), 1);
    }

    #[test]
    fn closing_outer_discards_inner() {
        let registrar = ObservationRegistrar::new();
        let outer = open(registrar.id(), NestedTracking::Propagate);
        let inner = open(registrar.id(), NestedTracking::Propagate);
        let inner_id = inner.id();

        let closed = close(outer.finish()).expect("outer frame");
        assert_eq!(closed.discarded, 1);
        assert_eq!(depth(), 0);
        assert!(close(inner.finish()).is_none());
        assert!(close(inner_id).is_none());
    }

    #[test]
    fn dropped_handle_abandons_frame() {
        let registrar = ObservationRegistrar::new();
        {
            let _handle = open(registrar.id(), NestedTracking::Propagate);
            assert_eq!(depth(), 1);
        }
        assert_eq!(depth(), 0);
    }

    #[test]
    fn untracked_suspends_enclosing_frames() {
        let registrar = ObservationRegistrar::new();
        let handle = open(registrar.id(), NestedTracking::Propagate);
        let recorded = untracked(|| {
            assert!(!is_tracking());
            record(registrar.shared(), path("hidden"))
        });
        assert!(!recorded);
        assert!(is_tracking());
        assert!(record(registrar.shared(), path("seen")));

        let closed = close(handle.finish()).expect("frame");
        let paths = &closed.reads[0].paths;
        assert!(paths.contains_key(&path("seen")));
        assert!(!paths.contains_key(&path("hidden")));
    }

    #[test]
    fn frames_opened_inside_untracked_still_record() {
        let registrar = ObservationRegistrar::new();
        let outer = open(registrar.id(), NestedTracking::Propagate);
        let inner_reads = untracked(|| {
            let inner = open(registrar.id(), NestedTracking::Propagate);
            assert!(record(registrar.shared(), path("inner")));
            close(inner.finish()).expect("inner frame").reads.len()
        });
        assert_eq!(inner_reads, 1);
        let outer_closed = close(outer.finish()).expect("outer frame");
        assert!(outer_closed.reads.is_empty());
    }
}
