//! # DUALSTATE Core
//!
//! Safe sharing of one native resource between two independently managed
//! lifetimes:
//! - the **native** side, where an owner's release deterministically tears
//!   down everything registered to it
//! - the **managed** side, where code closes, adopts or simply drops its
//!   reference at a time nobody can predict
//!
//! ## Guarantees
//!
//! 1. **Exactly-once release** - whichever side lets go first releases, the
//!    other side's teardown is a no-op
//! 2. **No use after release** - every access checks liveness and fails with
//!    an invalid-state error
//! 3. **Capability-gated adoption** - handing a resource back to native code
//!    requires the [`Key`] the handle was stamped with
//!
//! ## Example
//!
//! ```rust,ignore
//! use dualstate_core::{sim::SimNative, ContextId, DualHandle, Key, OwnerId};
//!
//! let sim = SimNative::new();
//! let key = Key::mint();
//! let resource = sim.park(ContextId(1), b"bytes");
//! let handle = DualHandle::new(&key, &sim.env(), OwnerId(1), ContextId(1), resource, ());
//!
//! sim.release_owner(OwnerId(1));      // native side wins
//! assert!(!handle.release_managed()); // managed side is a no-op
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod error;
pub mod handle;
pub mod key;
pub mod native;
pub mod sim;

pub use error::{ErrorClass, HandleError, HandleResult};
pub use handle::{
    DualHandle, HandleGuard, HandleProbe, HandleView, Payload, Phase, ReleaseContext,
};
pub use key::Key;
pub use native::{
    native_lock, Chunk, ContextId, Materialized, NativeBackend, NativeEnv, OwnerCallback, OwnerId,
    OwnerRegistry, Registration, ReleaseCause, ResourceAddr, SnapshotId, WriteRegion,
};
