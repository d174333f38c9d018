#![forbid(unsafe_code)]

//! Fine-grained property observation for reactive state.
//!
//! Observable objects report every read of a tracked property to an
//! [`ObservationRegistrar`]. A host that wants to know when a computation
//! becomes stale wraps it in a tracking context; the registrar records what
//! the computation read and, on the first later mutation of any of those
//! properties, fires the host's `on_change` callback exactly once.
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use ftui_observation::{observable, ObservationRegistrar};
//!
//! observable! {
//!     pub struct Model {
//!         pub count: i64 = 0,
//!     }
//! }
//!
//! let registrar = ObservationRegistrar::new();
//! let model = Model::new(&registrar);
//!
//! let dirty = Arc::new(AtomicBool::new(false));
//! let flag = Arc::clone(&dirty);
//! let (text, _observation) = registrar
//!     .track(|| format!("count: {}", model.count.get()), move |_| {
//!         flag.store(true, Ordering::SeqCst);
//!     })
//!     .unwrap();
//! assert_eq!(text, "count: 0");
//!
//! model.count.set(42);
//! assert!(dirty.load(Ordering::SeqCst));
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod id;
pub mod observer;
pub mod property;
pub mod registrar;
pub mod tracking;

pub use batch::{batch, in_batch};
pub use config::{ENV_CONTRACT_CHECKS, ENV_NESTED, NestedTracking, RegistrarConfig};
pub use error::{ObservationError, Result};
pub use id::{ObjectId, ObserverId, PropertyKey, PropertyPath, RegistrarId, TrackingId};
pub use observer::{ChangeEvent, Observation, notifications_total};
pub use property::{ObjectScope, Observable, Tracked};
pub use registrar::{ObservationRegistrar, RegistrarStats};
pub use tracking::{TrackingHandle, is_tracking, untracked};
