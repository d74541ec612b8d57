//! # DUALSTATE
//!
//! One native resource, two lifetimes, exactly one release.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          DUALSTATE                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │   ┌────────────────┐          ┌────────────────────────┐     │
//! │   │  stream        │─updates─>│  verify                │     │
//! │   │                │          │                        │     │
//! │   │  • Reader      │          │  • Verifier / NoOp     │     │
//! │   │  • Writer      │          │  • ChunkInput          │     │
//! │   └───────┬────────┘          │  • WorkerPool          │     │
//! │           │                   └────────────────────────┘     │
//! │           v                                                  │
//! │   ┌────────────────────────────────────────────────────┐     │
//! │   │  core                                              │     │
//! │   │  • DualHandle (managed vs native release)          │     │
//! │   │  • Key (adoption capability)                       │     │
//! │   │  • NativeBackend / OwnerRegistry / native lock     │     │
//! │   └────────────────────────────────────────────────────┘     │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```

// Re-export the layers
pub use dualstate_core as core;
pub use dualstate_stream as stream;
pub use dualstate_verify as verify;

// Re-export commonly used types
pub use dualstate_core::{
    ContextId, DualHandle, ErrorClass, HandleError, HandleView, Key, NativeEnv, OwnerId,
    ReleaseCause, ResourceAddr, SnapshotId, WriteRegion,
};
pub use dualstate_stream::{Placement, StreamError, StreamReader, StreamWriter};
pub use dualstate_verify::{
    AcceptAll, MarkRead, PoolConfig, Range, Validate, Verifier, VerifierState, VerifyError,
    WorkerPool,
};
