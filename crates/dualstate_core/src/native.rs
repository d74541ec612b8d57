//! # Native Collaborators
//!
//! The narrow interfaces the core needs from the native side: opaque
//! identifiers, the calls that materialize, relocate, extend and free a
//! resource, and the owner registry whose release tears everything down.
//!
//! ## Native Access Lock
//!
//! The native side assumes a single caller at a time. Every call through
//! [`NativeBackend`] is made while holding [`native_lock`]. The lock is
//! never held while waiting on a verifier.

use std::fmt;
use std::sync::Arc;

use parking_lot::{const_mutex, Mutex, MutexGuard};

use crate::error::HandleResult;

/// Immutable, shareable run of bytes.
pub type Chunk = Arc<[u8]>;

/// Opaque native address of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceAddr(pub u64);

impl fmt::LowerHex for ResourceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Opaque native owner whose release invalidates everything registered to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

/// Opaque native allocation context (arena) a resource lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

/// Opaque consistency snapshot keeping a parked resource fetchable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(pub u64);

/// Which trigger ended the managed view of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReleaseCause {
    /// Managed code closed or freed the resource. The handle deallocates it.
    ManagedClose,
    /// The last managed reference was dropped while still live.
    Reclaimed,
    /// The registry declared the owner released. Native teardown is in progress.
    OwnerReleased,
    /// Ownership was handed back to native code; nothing is deallocated.
    Adopted,
}

impl ReleaseCause {
    /// True when this side of the handle performs the deallocation itself.
    #[must_use]
    pub const fn deallocates(self) -> bool {
        matches!(self, Self::ManagedClose | Self::Reclaimed)
    }

    /// True when this cause ends the native side's validity rather than the managed one.
    #[must_use]
    pub const fn is_native_side(self) -> bool {
        matches!(self, Self::OwnerReleased)
    }
}

/// Result of materializing a parked resource.
#[derive(Clone, Debug)]
pub struct Materialized {
    /// Address of the materialized copy. The parked original has been freed.
    pub resource: ResourceAddr,
    /// Fully realized content.
    pub content: Chunk,
}

/// A writable native region handed out to a writer.
///
/// Bytes are appended until [`remaining`](Self::remaining) reaches zero.
/// Once [`freeze`](Self::freeze)d the content can no longer be mutated.
#[derive(Clone, Debug, Default)]
pub struct WriteRegion {
    buf: Vec<u8>,
    capacity: usize,
}

impl WriteRegion {
    /// Creates an empty region able to hold `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Total capacity in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Free space in bytes.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Copies as much of `src` as fits, returning the count copied.
    pub fn put(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.buf.extend_from_slice(&src[..n]);
        n
    }

    /// Ends writing into this region.
    #[must_use]
    pub fn freeze(self) -> Chunk {
        Arc::from(self.buf)
    }
}

impl fmt::Display for WriteRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region[pos={} cap={}]", self.buf.len(), self.capacity)
    }
}

/// Calls into the native side.
///
/// Implementations may assume [`native_lock`] is held for the duration of
/// each call.
pub trait NativeBackend: Send + Sync {
    /// Fully realizes a parked resource in `context`, freeing the original.
    ///
    /// When `snapshot` is given it is unregistered from `owner` before
    /// returning; callers rely on that and drop their reference to it.
    fn materialize(
        &self,
        resource: ResourceAddr,
        context: ContextId,
        snapshot: Option<SnapshotId>,
        owner: OwnerId,
    ) -> HandleResult<Materialized>;

    /// Relocates a resource into `context` without decoding it, freeing the original.
    fn fetch_only(&self, resource: ResourceAddr, context: ContextId) -> HandleResult<ResourceAddr>;

    /// Commits `filled` at `offset` and returns the next writable region.
    ///
    /// `desired_capacity` is a hint; zero means writing is finished and the
    /// returned region is empty.
    fn allocate_next_region(
        &self,
        resource: ResourceAddr,
        offset: usize,
        filled: &[u8],
        desired_capacity: usize,
    ) -> HandleResult<WriteRegion>;

    /// Detaches a snapshot from its owner ahead of the owner's own teardown.
    fn unregister_snapshot(&self, snapshot: SnapshotId, owner: OwnerId);

    /// Final notification for a resource. Called exactly once per handle.
    ///
    /// For causes where [`ReleaseCause::deallocates`] is true the backend
    /// frees the context; otherwise the native side already owns it.
    fn release(&self, resource: ResourceAddr, context: ContextId, cause: ReleaseCause);
}

/// Callback run once when an owner is released.
pub type OwnerCallback = Box<dyn FnOnce() + Send>;

/// Token identifying one owner registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Registration(pub u64);

/// Native construct grouping resources by owner.
pub trait OwnerRegistry: Send + Sync {
    /// Registers `on_release` to run once when `owner` is released.
    ///
    /// The callback may run on a different thread than the one registering.
    fn register(&self, owner: OwnerId, on_release: OwnerCallback) -> Registration;

    /// Drops a registration that has not fired yet. Unknown tokens are ignored.
    fn unregister(&self, registration: Registration);
}

/// The two collaborators a handle is bound to.
#[derive(Clone)]
pub struct NativeEnv {
    /// Native calls.
    pub backend: Arc<dyn NativeBackend>,
    /// Owner registrations.
    pub registry: Arc<dyn OwnerRegistry>,
}

impl NativeEnv {
    /// Bundles a backend and a registry.
    #[must_use]
    pub fn new(backend: Arc<dyn NativeBackend>, registry: Arc<dyn OwnerRegistry>) -> Self {
        Self { backend, registry }
    }
}

impl fmt::Debug for NativeEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEnv").finish_non_exhaustive()
    }
}

static NATIVE_LOCK: Mutex<()> = const_mutex(());

/// Acquires the process-wide native-access lock.
pub fn native_lock() -> MutexGuard<'static, ()> {
    NATIVE_LOCK.lock()
}
