#![forbid(unsafe_code)]

//! Identity keys for observed objects, their properties, and observers.
//!
//! Subscriptions are keyed by identity, never by value: two objects whose
//! fields compare equal are still distinct tracking subjects because they
//! carry different [`ObjectId`]s.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ─── ID generation ───────────────────────────────────────────────────────────

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TRACKING_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_REGISTRAR_ID: AtomicU64 = AtomicU64::new(1);

// ─── ObjectId ────────────────────────────────────────────────────────────────

/// Stable identity of an observable object.
///
/// Allocate one per object with [`ObjectId::next`]. Hosts that already own a
/// stable handle (an arena index, an entity id) can wrap it with
/// [`ObjectId::from_raw`] instead; such raw ids must not be mixed with ids
/// from `next()` on the same registrar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Allocate a fresh, process-unique object id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap an externally managed identity key.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

// ─── PropertyKey ─────────────────────────────────────────────────────────────

/// Name of a tracked property within its owning object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyKey(&'static str);

impl PropertyKey {
    /// Create a key from a static property name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The property name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        self.0
    }
}

impl From<&'static str> for PropertyKey {
    fn from(name: &'static str) -> Self {
        Self(name)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

// ─── PropertyPath ────────────────────────────────────────────────────────────

/// A tracked property: owning object identity plus property key.
///
/// This is the lookup key of every subscription set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyPath {
    /// Owning object.
    pub object: ObjectId,
    /// Property within the object.
    pub key: PropertyKey,
}

impl PropertyPath {
    /// Create a path from its parts.
    #[must_use]
    pub fn new(object: ObjectId, key: impl Into<PropertyKey>) -> Self {
        Self {
            object,
            key: key.into(),
        }
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.object, self.key)
    }
}

// ─── Observer / tracking / registrar ids ─────────────────────────────────────

/// Identity of a committed observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    pub(crate) fn next() -> Self {
        Self(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

/// Identity of an open (or formerly open) tracking context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackingId(u64);

impl TrackingId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TRACKING_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tracking#{}", self.0)
    }
}

/// Identity of an [`ObservationRegistrar`](crate::ObservationRegistrar).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrarId(u64);

impl RegistrarId {
    pub(crate) fn next() -> Self {
        Self(NEXT_REGISTRAR_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registrar#{}", self.0)
    }
}
