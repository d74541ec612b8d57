//! # DUALSTATE Stream
//!
//! Byte streams over native resources whose lifetime is shared with native
//! code.
//!
//! - [`StreamReader`] reads a possibly parked resource, materializing it on
//!   first use
//! - [`StreamWriter`] writes region by region, feeding every completed
//!   region to a [`Verifier`](dualstate_verify::Verifier) in order
//!
//! Both end in one of two ways: closed from the managed side, or adopted by
//! native code with the [`Key`](dualstate_core::Key) the stream was created
//! with. If the native owner goes first, every later access fails with an
//! invalid-state error.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod reader;
pub mod writer;

use dualstate_core::{ContextId, OwnerId, ResourceAddr};

pub use error::{StreamError, StreamResult};
pub use reader::{ReaderState, StreamReader};
pub use writer::{StreamWriter, WriterState};

/// Where a stream's resource lives on the native side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    /// Owner whose release ends the resource's native lifetime.
    pub owner: OwnerId,
    /// Allocation context freed along with the resource.
    pub context: ContextId,
    /// The resource itself.
    pub resource: ResourceAddr,
}

impl Placement {
    /// Creates a placement.
    #[must_use]
    pub const fn new(owner: OwnerId, context: ContextId, resource: ResourceAddr) -> Self {
        Self { owner, context, resource }
    }
}
