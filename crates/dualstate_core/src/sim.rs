//! # Simulated Native Side
//!
//! An in-memory stand-in for the native allocator and its owner registry.
//! Implements both [`NativeBackend`] and [`OwnerRegistry`], counts every
//! call, and keeps an ordered event log so tests can assert not just what
//! happened but in which order.
//!
//! ```rust,ignore
//! let sim = SimNative::with_region_limit(10);
//! let env = sim.env();
//! let (resource, region) = sim.allocate(ContextId(1), 10);
//! // ... hand `env`, `resource` and `region` to a writer ...
//! sim.release_owner(OwnerId(1));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{HandleError, HandleResult};
use crate::native::{
    ContextId, Materialized, NativeBackend, NativeEnv, OwnerCallback, OwnerId, OwnerRegistry,
    Registration, ReleaseCause, ResourceAddr, SnapshotId, WriteRegion,
};

/// Number of calls made through each collaborator entry point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimCalls {
    /// `materialize` calls.
    pub materialize: usize,
    /// `fetch_only` calls.
    pub fetch_only: usize,
    /// `allocate_next_region` calls.
    pub allocate_next_region: usize,
    /// `unregister_snapshot` calls, including those made by `materialize`.
    pub unregister_snapshot: usize,
    /// `release` calls.
    pub release: usize,
}

/// Something observable the native side did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimEvent {
    /// A parked resource was materialized into a new address.
    Materialized {
        /// Parked original, now freed.
        from: ResourceAddr,
        /// Materialized copy.
        to: ResourceAddr,
    },
    /// A resource was relocated without decoding.
    Fetched {
        /// Original, now freed.
        from: ResourceAddr,
        /// Relocated copy.
        to: ResourceAddr,
    },
    /// A filled write region was committed.
    RegionCommitted {
        /// Resource written to.
        resource: ResourceAddr,
        /// Offset of the committed bytes.
        offset: usize,
        /// Number of bytes committed.
        len: usize,
    },
    /// A snapshot was detached from its owner.
    SnapshotUnregistered {
        /// The snapshot.
        snapshot: SnapshotId,
        /// Its owner.
        owner: OwnerId,
    },
    /// A handle let go of a resource.
    Released {
        /// The resource.
        resource: ResourceAddr,
        /// The winning trigger.
        cause: ReleaseCause,
    },
    /// An owner finished its own teardown, after all callbacks ran.
    OwnerFinalized(OwnerId),
}

#[derive(Debug)]
struct SimResource {
    context: ContextId,
    data: Vec<u8>,
}

#[derive(Default)]
struct SimState {
    next_addr: u64,
    next_registration: u64,
    resources: HashMap<ResourceAddr, SimResource>,
    registrations: BTreeMap<u64, (OwnerId, OwnerCallback)>,
    releases: HashMap<ResourceAddr, usize>,
    calls: SimCalls,
    events: Vec<SimEvent>,
}

impl SimState {
    fn insert(&mut self, context: ContextId, data: Vec<u8>) -> ResourceAddr {
        self.next_addr += 0x10;
        let addr = ResourceAddr(0x1000 + self.next_addr);
        self.resources.insert(addr, SimResource { context, data });
        addr
    }

    fn missing(resource: ResourceAddr) -> HandleError {
        HandleError::Native(format!("no resource at {resource:x}"))
    }
}

/// In-memory native side.
pub struct SimNative {
    state: Mutex<SimState>,
    region_limit: usize,
}

impl SimNative {
    /// Creates a native side whose regions are sized exactly to the hint.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_region_limit(usize::MAX)
    }

    /// Creates a native side that never hands out regions larger than `limit`.
    #[must_use]
    pub fn with_region_limit(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState::default()),
            region_limit: limit.max(1),
        })
    }

    /// This simulator as both collaborators.
    #[must_use]
    pub fn env(self: &Arc<Self>) -> NativeEnv {
        NativeEnv::new(Arc::clone(self) as Arc<dyn NativeBackend>, Arc::clone(self) as Arc<dyn OwnerRegistry>)
    }

    /// Stores `bytes` as a parked resource in `context`.
    pub fn park(&self, context: ContextId, bytes: &[u8]) -> ResourceAddr {
        self.state.lock().insert(context, bytes.to_vec())
    }

    /// Creates an empty resource for writing, with its first region.
    pub fn allocate(&self, context: ContextId, initial_capacity: usize) -> (ResourceAddr, WriteRegion) {
        let addr = self.state.lock().insert(context, Vec::new());
        (addr, WriteRegion::with_capacity(initial_capacity.min(self.region_limit)))
    }

    /// Committed content of a resource, if still allocated.
    #[must_use]
    pub fn contents(&self, resource: ResourceAddr) -> Option<Vec<u8>> {
        self.state.lock().resources.get(&resource).map(|r| r.data.clone())
    }

    /// True while `resource` has not been freed.
    #[must_use]
    pub fn is_allocated(&self, resource: ResourceAddr) -> bool {
        self.state.lock().resources.contains_key(&resource)
    }

    /// How many times `release` was called for `resource`.
    #[must_use]
    pub fn release_count(&self, resource: ResourceAddr) -> usize {
        self.state.lock().releases.get(&resource).copied().unwrap_or(0)
    }

    /// Call counters so far.
    #[must_use]
    pub fn calls(&self) -> SimCalls {
        self.state.lock().calls
    }

    /// Event log so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<SimEvent> {
        self.state.lock().events.clone()
    }

    /// Pending registrations for `owner`.
    #[must_use]
    pub fn registrations(&self, owner: OwnerId) -> usize {
        self.state
            .lock()
            .registrations
            .values()
            .filter(|(o, _)| *o == owner)
            .count()
    }

    /// Releases `owner`: runs every registered callback, then finalizes.
    ///
    /// Callbacks run without the simulator's lock held, on the calling thread.
    pub fn release_owner(&self, owner: OwnerId) {
        let callbacks: Vec<OwnerCallback> = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state
                .registrations
                .iter()
                .filter(|(_, (o, _))| *o == owner)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.registrations.remove(&id))
                .map(|(_, callback)| callback)
                .collect()
        };
        for callback in callbacks {
            callback();
        }
        self.state.lock().events.push(SimEvent::OwnerFinalized(owner));
    }
}

impl NativeBackend for SimNative {
    fn materialize(
        &self,
        resource: ResourceAddr,
        context: ContextId,
        snapshot: Option<SnapshotId>,
        owner: OwnerId,
    ) -> HandleResult<Materialized> {
        let mut state = self.state.lock();
        state.calls.materialize += 1;
        let parked = state.resources.remove(&resource).ok_or_else(|| SimState::missing(resource))?;
        let content: Arc<[u8]> = Arc::from(parked.data.as_slice());
        let to = state.insert(context, parked.data);
        state.events.push(SimEvent::Materialized { from: resource, to });
        if let Some(snapshot) = snapshot {
            state.calls.unregister_snapshot += 1;
            state.events.push(SimEvent::SnapshotUnregistered { snapshot, owner });
        }
        Ok(Materialized { resource: to, content })
    }

    fn fetch_only(&self, resource: ResourceAddr, context: ContextId) -> HandleResult<ResourceAddr> {
        let mut state = self.state.lock();
        state.calls.fetch_only += 1;
        let parked = state.resources.remove(&resource).ok_or_else(|| SimState::missing(resource))?;
        let to = state.insert(context, parked.data);
        state.events.push(SimEvent::Fetched { from: resource, to });
        Ok(to)
    }

    fn allocate_next_region(
        &self,
        resource: ResourceAddr,
        offset: usize,
        filled: &[u8],
        desired_capacity: usize,
    ) -> HandleResult<WriteRegion> {
        let mut state = self.state.lock();
        state.calls.allocate_next_region += 1;
        let target = state.resources.get_mut(&resource).ok_or_else(|| SimState::missing(resource))?;
        if target.data.len() != offset {
            return Err(HandleError::Native(format!(
                "commit at offset {offset} but {resource:x} holds {} bytes",
                target.data.len()
            )));
        }
        target.data.extend_from_slice(filled);
        state.events.push(SimEvent::RegionCommitted { resource, offset, len: filled.len() });
        let capacity = if desired_capacity == 0 { 0 } else { desired_capacity.min(self.region_limit) };
        Ok(WriteRegion::with_capacity(capacity))
    }

    fn unregister_snapshot(&self, snapshot: SnapshotId, owner: OwnerId) {
        let mut state = self.state.lock();
        state.calls.unregister_snapshot += 1;
        state.events.push(SimEvent::SnapshotUnregistered { snapshot, owner });
    }

    fn release(&self, resource: ResourceAddr, context: ContextId, cause: ReleaseCause) {
        let mut state = self.state.lock();
        state.calls.release += 1;
        *state.releases.entry(resource).or_insert(0) += 1;
        if cause != ReleaseCause::Adopted {
            // Freeing the context frees everything allocated in it.
            state.resources.retain(|_, r| r.context != context);
        }
        state.events.push(SimEvent::Released { resource, cause });
    }
}

impl OwnerRegistry for SimNative {
    fn register(&self, owner: OwnerId, on_release: OwnerCallback) -> Registration {
        let mut state = self.state.lock();
        state.next_registration += 1;
        let id = state.next_registration;
        state.registrations.insert(id, (owner, on_release));
        Registration(id)
    }

    fn unregister(&self, registration: Registration) {
        self.state.lock().registrations.remove(&registration.0);
    }
}
