//! # DUALSTATE Verify
//!
//! Background verification of content written into native resources.
//!
//! A writer hands each completed byte range to a [`Verifier`] as soon as it
//! is filled. A validation routine reads those ranges, in order, as one
//! stream on a pool thread, and the writer collects the verdict when it
//! closes. The routine never calls into the native side.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dualstate_verify::{Verifier, VerifyError, MarkRead};
//! use std::io::Read;
//!
//! let verifier = Verifier::new(|input: &mut dyn MarkRead| -> Result<(), VerifyError> {
//!     let mut text = String::new();
//!     input.read_to_string(&mut text)?;
//!     Ok(())
//! });
//! verifier.schedule()?;
//! verifier.update(b"hello".as_slice().into())?;
//! verifier.end_of_input()?;
//! verifier.finish()?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod input;
pub mod pool;
pub mod verifier;

pub use config::PoolConfig;
pub use error::{VerifyError, VerifyResult};
pub use input::{ChunkInput, MarkRead, Range, RangeGuard};
pub use pool::{PoolStats, TaskHandle, WorkerPool};
pub use verifier::{AcceptAll, Pipeline, Validate, Verifier, VerifierState};
