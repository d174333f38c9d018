#![forbid(unsafe_code)]

//! Tracked properties: the proxy layer between observable objects and the
//! registrar.
//!
//! # Design
//!
//! [`Tracked<T>`] owns a stored value and its [`PropertyPath`]. Every read
//! goes through [`ObservationRegistrar::access`], and every write through
//! [`ObservationRegistrar::with_mutation`], so objects built from `Tracked`
//! fields cannot bypass observation by accident. [`ObjectScope`] allocates
//! the object identity and hands out properties. The [`observable!`] macro
//! generates both for a plain struct declaration.
//!
//! # Invariants
//!
//! 1. `version()` increments by exactly 1 per committed mutation.
//! 2. A failed [`try_update`](Tracked::try_update) leaves the stored value
//!    untouched and notifies nobody.
//! 3. The value lock is released before observers are notified.
//!
//! # Performance
//!
//! | Operation          | Complexity                     |
//! |--------------------|--------------------------------|
//! | `get()` / `with()` | O(1) + registrar `access()`    |
//! | `set()`            | O(1) + registrar `did_set()`   |
//! | `try_update()`     | O(clone of T) + `did_set()`    |

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::id::{ObjectId, PropertyKey, PropertyPath};
use crate::registrar::ObservationRegistrar;

// ─── Observable ──────────────────────────────────────────────────────────────

/// An entity exposing tracked properties.
pub trait Observable {
    /// Stable identity used to key subscriptions.
    fn object_id(&self) -> ObjectId;

    /// The registrar the object's properties report to.
    fn registrar(&self) -> &ObservationRegistrar;

    /// Record a read of `key` on this object.
    ///
    /// Use for hand-written properties that do not go through [`Tracked`].
    fn access(&self, key: impl Into<PropertyKey>)
    where
        Self: Sized,
    {
        self.registrar().access(self.object_id(), key);
    }

    /// Run a mutation of `key` on this object through the registrar.
    fn with_mutation<R>(&self, key: impl Into<PropertyKey>, mutation: impl FnOnce() -> R) -> R
    where
        Self: Sized,
    {
        self.registrar()
            .with_mutation(self.object_id(), key, mutation)
    }
}

// ─── ObjectScope ─────────────────────────────────────────────────────────────

/// Identity of one observable object plus the registrar it reports to.
///
/// Acts as a builder for the object's [`Tracked`] properties.
#[derive(Debug, Clone)]
pub struct ObjectScope {
    registrar: ObservationRegistrar,
    id: ObjectId,
}

impl ObjectScope {
    /// Allocate a fresh object identity on `registrar`.
    #[must_use]
    pub fn new(registrar: &ObservationRegistrar) -> Self {
        Self::with_id(registrar, ObjectId::next())
    }

    /// Use an externally managed identity.
    #[must_use]
    pub fn with_id(registrar: &ObservationRegistrar, id: ObjectId) -> Self {
        Self {
            registrar: registrar.clone(),
            id,
        }
    }

    /// Create a tracked property named `key` holding `value`.
    #[must_use]
    pub fn property<T>(&self, key: &'static str, value: T) -> Tracked<T> {
        Tracked {
            registrar: self.registrar.clone(),
            path: PropertyPath::new(self.id, key),
            value: RwLock::new(value),
            version: AtomicU64::new(0),
        }
    }
}

impl Observable for ObjectScope {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn registrar(&self) -> &ObservationRegistrar {
        &self.registrar
    }
}

// ─── Tracked ─────────────────────────────────────────────────────────────────

/// A stored value whose reads and writes are routed through the registrar.
pub struct Tracked<T> {
    registrar: ObservationRegistrar,
    path: PropertyPath,
    value: RwLock<T>,
    version: AtomicU64,
}

impl<T: fmt::Debug> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("path", &self.path)
            .field("value", &*self.read())
            .field("version", &self.version())
            .finish()
    }
}

impl<T> Tracked<T> {
    /// The property's path (object identity + key).
    #[must_use]
    pub fn path(&self) -> PropertyPath {
        self.path
    }

    /// Number of committed mutations so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Read the value by reference, recording the access.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.registrar.access(self.path.object, self.path.key);
        f(&self.read())
    }

    /// Read the value by reference without recording the access.
    pub fn with_untracked<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.read())
    }

    /// Replace the value and notify observers.
    pub fn set(&self, value: T) {
        self.replace(value);
    }

    /// Replace the value, returning the previous one, and notify observers.
    pub fn replace(&self, value: T) -> T {
        self.mutate(|slot| std::mem::replace(slot, value))
    }

    /// Modify the value in place and notify observers.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.mutate(f)
    }

    /// Set the value only if it differs from the current one.
    ///
    /// Returns whether a mutation (and notification) happened.
    pub fn set_if_changed(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        self.registrar
            .try_with_mutation(self.path.object, self.path.key, || {
                let mut slot = self.write();
                if *slot == value {
                    return Err(());
                }
                *slot = value;
                self.version.fetch_add(1, Ordering::AcqRel);
                Ok(())
            })
            .is_ok()
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.registrar
            .with_mutation(self.path.object, self.path.key, || {
                let result = f(&mut self.write());
                self.version.fetch_add(1, Ordering::AcqRel);
                result
            })
    }

    fn read(&self) -> RwLockReadGuard<'_, T> {
        self.value.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.value.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Tracked<T> {
    /// Get a clone of the value, recording the access.
    #[must_use]
    pub fn get(&self) -> T {
        self.with(T::clone)
    }

    /// Get a clone of the value without recording the access.
    #[must_use]
    pub fn get_untracked(&self) -> T {
        self.read().clone()
    }

    /// Apply a fallible modification.
    ///
    /// `f` works on a copy of the value. On `Ok` the copy is committed and
    /// observers are notified; on `Err` the stored value is left unchanged,
    /// nobody is notified, and the error is returned as is.
    pub fn try_update<R, E>(&self, f: impl FnOnce(&mut T) -> Result<R, E>) -> Result<R, E> {
        self.registrar
            .try_with_mutation(self.path.object, self.path.key, || {
                // Writers stay excluded until the draft is committed.
                let mut slot = self.write();
                let mut draft = slot.clone();
                let result = f(&mut draft)?;
                *slot = draft;
                self.version.fetch_add(1, Ordering::AcqRel);
                Ok(result)
            })
    }
}

// ─── observable! ─────────────────────────────────────────────────────────────

/// Declare a struct whose fields are [`Tracked`] properties.
///
/// Each field is written as `name: Type = initial`. The macro generates the
/// struct with `Tracked<Type>` fields, a `new(&ObservationRegistrar)`
/// constructor that allocates a fresh object identity, and an
/// [`Observable`] impl.
///
/// ```
/// use ftui_observation::{observable, ObservationRegistrar};
///
/// observable! {
///     pub struct Model {
///         pub count: i64 = 0,
///     }
/// }
///
/// let registrar = ObservationRegistrar::new();
/// let model = Model::new(&registrar);
/// model.count.set(42);
/// assert_eq!(model.count.get(), 42);
/// ```
#[macro_export]
macro_rules! observable {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field_vis:vis $field:ident : $ty:ty = $init:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            __observation_scope: $crate::ObjectScope,
            $(
                $(#[$field_meta])*
                $field_vis $field: $crate::Tracked<$ty>,
            )*
        }

        impl $name {
            /// Create an instance whose properties report to `registrar`.
            #[allow(clippy::new_without_default)]
            $vis fn new(registrar: &$crate::ObservationRegistrar) -> Self {
                let scope = $crate::ObjectScope::new(registrar);
                Self {
                    $( $field: scope.property(stringify!($field), $init), )*
                    __observation_scope: scope,
                }
            }
        }

        impl $crate::Observable for $name {
            fn object_id(&self) -> $crate::ObjectId {
                $crate::Observable::object_id(&self.__observation_scope)
            }

            fn registrar(&self) -> &$crate::ObservationRegistrar {
                $crate::Observable::registrar(&self.__observation_scope)
            }
        }
    };
}
