//! # Dual-Lifetime Handle
//!
//! Tracks one native resource that two independent lifetimes can end:
//! managed code closing or adopting it, and the native owner being torn
//! down. Whichever trigger arrives first performs the release; the other
//! side's later trigger is a no-op.
//!
//! ## State Machine
//!
//! ```text
//!            managed close / adopt / reclaim
//!   ┌──────┐ ─────────────────────────────► ┌───────────┐      ┌──────────┐
//!   │ Live │                                │ Releasing │ ───► │ Released │
//!   └──────┘ ─────────────────────────────► └───────────┘      └──────────┘
//!              owner released (registry)
//! ```
//!
//! ## Thread Safety
//!
//! Every state change happens under one mutex per handle, including the
//! owner-release callback, so racing triggers are serialized rather than
//! interleaved. The native-access lock is always taken after the handle
//! lock, never before. A lock-free phase mirror lets verifier threads probe
//! liveness without contending for the handle lock.
//!
//! Dropping the last managed reference to a live handle releases it as a
//! last-resort safety net and logs a warning. Callers are expected to close.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{HandleError, HandleResult};
use crate::key::{Key, Stamp};
use crate::native::{
    native_lock, ContextId, NativeBackend, NativeEnv, OwnerId, OwnerRegistry, Registration,
    ReleaseCause, ResourceAddr,
};

const LIVE: u8 = 0;
const RELEASING: u8 = 1;
const RELEASED: u8 = 2;

/// Lifecycle phase of a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Both sides still hold the resource.
    Live,
    /// The first release is in progress.
    Releasing,
    /// The resource has been released; nothing may touch it.
    Released,
}

impl Phase {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            LIVE => Self::Live,
            RELEASING => Self::Releasing,
            _ => Self::Released,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Live => "live",
            Self::Releasing => "releasing",
            Self::Released => "released",
        })
    }
}

/// Lock-free mirror of the phase, shared with probes.
#[derive(Debug, Default)]
struct PhaseCell(AtomicU8);

impl PhaseCell {
    fn get(&self) -> Phase {
        Phase::from_raw(self.0.load(Ordering::Acquire))
    }

    fn set(&self, raw: u8) {
        self.0.store(raw, Ordering::Release);
    }
}

/// What a release hook may do while the resource is being let go.
pub struct ReleaseContext<'a> {
    backend: &'a dyn NativeBackend,
    owner: OwnerId,
    resource: ResourceAddr,
}

impl ReleaseContext<'_> {
    /// Native calls, usable because the native lock is held.
    #[must_use]
    pub fn backend(&self) -> &dyn NativeBackend {
        self.backend
    }

    /// The owner the handle is registered with.
    #[must_use]
    pub const fn owner(&self) -> OwnerId {
        self.owner
    }

    /// The resource being released.
    #[must_use]
    pub const fn resource(&self) -> ResourceAddr {
        self.resource
    }
}

/// Per-handle state guarded by the handle lock alongside the liveness flags.
///
/// [`on_release`](Payload::on_release) runs exactly once, on whichever
/// trigger wins, with both the handle lock and the native lock held.
pub trait Payload: Send + 'static {
    /// Drops anything that must not outlive the resource.
    fn on_release(&mut self, cause: ReleaseCause, ctx: &ReleaseContext<'_>);
}

impl Payload for () {
    fn on_release(&mut self, _cause: ReleaseCause, _ctx: &ReleaseContext<'_>) {}
}

/// Immutable part of the handle.
struct Core {
    stamp: Stamp,
    owner: OwnerId,
    context: ContextId,
    backend: Arc<dyn NativeBackend>,
    registry: Arc<dyn OwnerRegistry>,
    phase: Arc<PhaseCell>,
}

/// Mutable part of the handle, behind the handle lock.
struct Slot<P> {
    resource: ResourceAddr,
    native_valid: bool,
    managed_valid: bool,
    registration: Option<Registration>,
    released_by: Option<ReleaseCause>,
    payload: P,
}

struct Shared<P: Payload> {
    core: Core,
    slot: Mutex<Slot<P>>,
}

impl<P: Payload> Shared<P> {
    fn owner_released(&self) {
        let mut slot = self.slot.lock();
        tracing::debug!(owner = self.core.owner.0, "owner release callback");
        release_slot(&self.core, &mut slot, ReleaseCause::OwnerReleased);
    }
}

impl<P: Payload> Drop for Shared<P> {
    fn drop(&mut self) {
        let slot = self.slot.get_mut();
        if self.core.phase.get() == Phase::Live {
            tracing::warn!(
                resource = slot.resource.0,
                "live handle dropped without close, reclaiming"
            );
            release_slot(&self.core, slot, ReleaseCause::Reclaimed);
        }
    }
}

/// The single release transition. Returns true if this call performed it.
fn release_slot<P: Payload>(core: &Core, slot: &mut Slot<P>, cause: ReleaseCause) -> bool {
    if cause.is_native_side() {
        slot.native_valid = false;
    } else {
        slot.managed_valid = false;
    }
    if core.phase.get() != Phase::Live {
        return false;
    }
    core.phase.set(RELEASING);
    {
        let _native = native_lock();
        let ctx = ReleaseContext {
            backend: core.backend.as_ref(),
            owner: core.owner,
            resource: slot.resource,
        };
        slot.payload.on_release(cause, &ctx);
        core.backend.release(slot.resource, core.context, cause);
    }
    let registration = slot.registration.take();
    if !cause.is_native_side() {
        if let Some(registration) = registration {
            core.registry.unregister(registration);
        }
    }
    slot.released_by = Some(cause);
    core.phase.set(RELEASED);
    tracing::debug!(
        resource = slot.resource.0,
        ?cause,
        "handle released"
    );
    true
}

/// A native resource shared between managed code and its native owner.
///
/// Cloning yields another reference to the same handle.
pub struct DualHandle<P: Payload = ()> {
    shared: Arc<Shared<P>>,
}

impl<P: Payload> Clone for DualHandle<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Payload> DualHandle<P> {
    /// Wraps `resource` and registers for the release of `owner`.
    ///
    /// The handle is stamped with `key`; only that key can adopt it.
    pub fn new(
        key: &Key,
        env: &NativeEnv,
        owner: OwnerId,
        context: ContextId,
        resource: ResourceAddr,
        payload: P,
    ) -> Self {
        let shared = Arc::new(Shared {
            core: Core {
                stamp: key.stamp(),
                owner,
                context,
                backend: Arc::clone(&env.backend),
                registry: Arc::clone(&env.registry),
                phase: Arc::new(PhaseCell::default()),
            },
            slot: Mutex::new(Slot {
                resource,
                native_valid: true,
                managed_valid: true,
                registration: None,
                released_by: None,
                payload,
            }),
        });

        let weak = Arc::downgrade(&shared);
        let registration = env.registry.register(
            owner,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.owner_released();
                }
            }),
        );

        {
            let mut slot = shared.slot.lock();
            // The owner may already have gone in the meantime.
            if shared.core.phase.get() == Phase::Live {
                slot.registration = Some(registration);
            }
        }

        Self { shared }
    }

    /// Takes the handle lock.
    pub fn lock(&self) -> HandleGuard<'_, P> {
        HandleGuard {
            core: &self.shared.core,
            slot: self.shared.slot.lock(),
        }
    }

    /// Releases from the managed side. Returns true if this call performed the release.
    pub fn release_managed(&self) -> bool {
        self.lock().release_managed()
    }

    /// Fails with an invalid-state error once either side has released.
    pub fn assert_valid(&self) -> HandleResult<()> {
        self.lock().assert_valid()
    }

    /// Current phase, read without taking the lock.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.core.phase.get()
    }

    /// True while neither side has released.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.phase() == Phase::Live
    }

    /// The trigger that won the release, if any.
    #[must_use]
    pub fn released_by(&self) -> Option<ReleaseCause> {
        self.shared.slot.lock().released_by
    }

    /// Liveness flags as `(native_valid, managed_valid)`.
    #[must_use]
    pub fn validity(&self) -> (bool, bool) {
        let slot = self.shared.slot.lock();
        (slot.native_valid, slot.managed_valid)
    }

    /// Owner this handle is registered with.
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.shared.core.owner
    }

    /// Allocation context of the resource.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.shared.core.context
    }

    /// A read-only view, safe to hand to code that does not hold the key.
    #[must_use]
    pub fn view(&self) -> HandleView<P> {
        HandleView {
            handle: self.clone(),
        }
    }

    /// A weak liveness probe that does not keep the handle alive.
    #[must_use]
    pub fn probe(&self) -> HandleProbe {
        HandleProbe {
            phase: Arc::downgrade(&self.shared.core.phase),
        }
    }

    /// Diagnostic description prefixed with `label`.
    #[must_use]
    pub fn describe(&self, label: &str) -> String {
        let slot = self.shared.slot.lock();
        let core = &self.shared.core;
        format!(
            "{label} key:#{} owner:{} ctx:{} resource:{:x} {}",
            core.stamp.serial(),
            core.owner.0,
            core.context.0,
            slot.resource,
            core.phase.get(),
        )
    }
}

impl<P: Payload> fmt::Display for DualHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe("DualHandle"))
    }
}

impl<P: Payload> fmt::Debug for DualHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe("DualHandle"))
    }
}

/// Read-only view of a [`DualHandle`].
///
/// Exposes state and diagnostics. It cannot lock the handle, so it cannot
/// touch the resource address, the native side, or trigger a release.
pub struct HandleView<P: Payload = ()> {
    handle: DualHandle<P>,
}

impl<P: Payload> Clone for HandleView<P> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
        }
    }
}

impl<P: Payload> HandleView<P> {
    /// Fails with an invalid-state error once either side has released.
    pub fn assert_valid(&self) -> HandleResult<()> {
        self.handle.assert_valid()
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.handle.phase()
    }

    /// True while neither side has released.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.handle.is_live()
    }

    /// The trigger that won the release, if any.
    #[must_use]
    pub fn released_by(&self) -> Option<ReleaseCause> {
        self.handle.released_by()
    }

    /// Liveness flags as `(native_valid, managed_valid)`.
    #[must_use]
    pub fn validity(&self) -> (bool, bool) {
        self.handle.validity()
    }

    /// Current resource address.
    #[must_use]
    pub fn resource(&self) -> ResourceAddr {
        self.handle.shared.slot.lock().resource
    }

    /// Owner this handle is registered with.
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.handle.owner()
    }

    /// Allocation context of the resource.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.handle.context()
    }

    /// A weak liveness probe.
    #[must_use]
    pub fn probe(&self) -> HandleProbe {
        self.handle.probe()
    }

    /// Diagnostic description prefixed with `label`.
    #[must_use]
    pub fn describe(&self, label: &str) -> String {
        self.handle.describe(label)
    }
}

impl<P: Payload> fmt::Debug for HandleView<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.handle.describe("HandleView"))
    }
}

/// Exclusive access to a handle's state.
pub struct HandleGuard<'a, P: Payload> {
    core: &'a Core,
    slot: MutexGuard<'a, Slot<P>>,
}

impl<P: Payload> HandleGuard<'_, P> {
    /// Fails with an invalid-state error once either side has released.
    pub fn assert_valid(&self) -> HandleResult<()> {
        match self.slot.released_by {
            None if self.core.phase.get() == Phase::Live => Ok(()),
            Some(cause) => Err(HandleError::invalid_state(format!(
                "native resource already released ({cause:?})"
            ))),
            None => Err(HandleError::invalid_state("native resource is being released")),
        }
    }

    /// Fails with [`HandleError::CapabilityMismatch`] unless `key` stamped this handle.
    pub fn check_key(&self, key: &Key) -> HandleResult<()> {
        self.core.stamp.check(key)
    }

    /// Current resource address.
    #[must_use]
    pub fn resource(&self) -> ResourceAddr {
        self.slot.resource
    }

    /// Points the handle at a relocated copy of the resource.
    pub fn set_resource(&mut self, resource: ResourceAddr) {
        self.slot.resource = resource;
    }

    /// Owner this handle is registered with.
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.core.owner
    }

    /// Allocation context of the resource.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.core.context
    }

    /// Native calls. Take [`native_lock`] around each one.
    #[must_use]
    pub fn backend(&self) -> &dyn NativeBackend {
        self.core.backend.as_ref()
    }

    /// Shared view of the payload.
    #[must_use]
    pub fn payload(&self) -> &P {
        &self.slot.payload
    }

    /// Mutable view of the payload.
    pub fn payload_mut(&mut self) -> &mut P {
        &mut self.slot.payload
    }

    /// Releases from the managed side unless the other side already did.
    ///
    /// Owner release only arrives through the registry callback, and
    /// adoption only through [`adopt`](Self::adopt).
    pub fn release_managed(&mut self) -> bool {
        release_slot(self.core, &mut self.slot, ReleaseCause::ManagedClose)
    }

    /// Hands the resource back to native code.
    ///
    /// The key is checked before anything else, so a mismatch fails
    /// regardless of handle state.
    pub fn adopt(&mut self, key: &Key) -> HandleResult<ResourceAddr> {
        self.check_key(key)?;
        self.assert_valid()?;
        let resource = self.slot.resource;
        release_slot(self.core, &mut self.slot, ReleaseCause::Adopted);
        Ok(resource)
    }
}

/// Lock-free check of whether a handle is still live.
///
/// Holds only a weak reference: a dropped handle reads as released.
#[derive(Clone, Debug)]
pub struct HandleProbe {
    phase: Weak<PhaseCell>,
}

impl HandleProbe {
    /// True while the handle exists and neither side has released.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.phase
            .upgrade()
            .is_some_and(|phase| phase.get() == Phase::Live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimEvent, SimNative};
    use std::sync::atomic::AtomicUsize;

    fn handle_with(sim: &Arc<SimNative>, key: &Key) -> (DualHandle, ResourceAddr) {
        let resource = sim.park(ContextId(1), b"payload");
        let handle = DualHandle::new(key, &sim.env(), OwnerId(7), ContextId(1), resource, ());
        (handle, resource)
    }

    #[test]
    fn test_managed_release_first() {
        let sim = SimNative::new();
        let key = Key::mint();
        let (handle, resource) = handle_with(&sim, &key);

        assert!(handle.release_managed());
        assert!(!handle.release_managed());
        sim.release_owner(OwnerId(7));

        assert_eq!(sim.release_count(resource), 1);
        assert_eq!(handle.released_by(), Some(ReleaseCause::ManagedClose));
        assert_eq!(handle.validity(), (true, false));
        assert_eq!(sim.registrations(OwnerId(7)), 0);
    }

    #[test]
    fn test_owner_release_first() {
        let sim = SimNative::new();
        let key = Key::mint();
        let (handle, resource) = handle_with(&sim, &key);

        sim.release_owner(OwnerId(7));
        assert!(!handle.release_managed());

        assert_eq!(sim.release_count(resource), 1);
        assert_eq!(handle.released_by(), Some(ReleaseCause::OwnerReleased));
        assert_eq!(handle.validity(), (false, false));
    }

    #[test]
    fn test_assert_valid_after_release() {
        let sim = SimNative::new();
        let key = Key::mint();
        let (handle, _) = handle_with(&sim, &key);

        assert!(handle.assert_valid().is_ok());
        handle.release_managed();
        let err = handle.assert_valid().unwrap_err();
        assert!(matches!(err, HandleError::InvalidState(_)));
    }

    #[test]
    fn test_adopt_returns_resource_without_freeing() {
        let sim = SimNative::new();
        let key = Key::mint();
        let (handle, resource) = handle_with(&sim, &key);

        let adopted = handle.lock().adopt(&key).unwrap();
        assert_eq!(adopted, resource);
        assert!(sim.is_allocated(resource));
        assert_eq!(handle.released_by(), Some(ReleaseCause::Adopted));
        assert!(!handle.release_managed());
        assert_eq!(sim.release_count(resource), 1);
    }

    #[test]
    fn test_adopt_with_wrong_key_fails_in_any_state() {
        let sim = SimNative::new();
        let key = Key::mint();
        let stranger = Key::mint();
        let (handle, _) = handle_with(&sim, &key);

        assert_eq!(handle.lock().adopt(&stranger), Err(HandleError::CapabilityMismatch));
        handle.release_managed();
        assert_eq!(handle.lock().adopt(&stranger), Err(HandleError::CapabilityMismatch));
    }

    #[test]
    fn test_drop_reclaims_live_handle() {
        let sim = SimNative::new();
        let key = Key::mint();
        let (handle, resource) = handle_with(&sim, &key);
        let probe = handle.probe();

        assert!(probe.is_live());
        drop(handle);
        assert!(!probe.is_live());
        assert!(sim
            .events()
            .contains(&SimEvent::Released { resource, cause: ReleaseCause::Reclaimed }));
    }

    struct Counting(Arc<AtomicUsize>);

    impl Payload for Counting {
        fn on_release(&mut self, _cause: ReleaseCause, _ctx: &ReleaseContext<'_>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_payload_hook_runs_once() {
        let sim = SimNative::new();
        let key = Key::mint();
        let hits = Arc::new(AtomicUsize::new(0));
        let resource = sim.park(ContextId(2), b"x");
        let handle = DualHandle::new(
            &key,
            &sim.env(),
            OwnerId(3),
            ContextId(2),
            resource,
            Counting(Arc::clone(&hits)),
        );

        sim.release_owner(OwnerId(3));
        handle.release_managed();
        drop(handle);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_view_observes_managed_release() {
        let sim = SimNative::new();
        let key = Key::mint();
        let (handle, resource) = handle_with(&sim, &key);
        let view = handle.view();

        assert_eq!(view.resource(), resource);
        assert!(view.assert_valid().is_ok());
        // Managed-side release through the guard can only ever be a close.
        assert!(handle.lock().release_managed());
        assert_eq!(view.released_by(), Some(ReleaseCause::ManagedClose));
        assert_eq!(view.validity(), (true, false));
        assert_eq!(sim.registrations(OwnerId(7)), 0);
        assert_eq!(sim.release_count(resource), 1);
        assert!(view.assert_valid().is_err());
    }

    #[test]
    fn test_describe_mentions_state() {
        let sim = SimNative::new();
        let key = Key::mint();
        let (handle, _) = handle_with(&sim, &key);
        let text = handle.describe("DH");
        assert!(text.starts_with("DH key:#"));
        assert!(text.ends_with("live"));
        handle.release_managed();
        assert!(handle.to_string().ends_with("released"));
    }
}
