//! # Stream Writer
//!
//! Writes into a native resource one region at a time. Each filled region
//! is committed to the native side and handed to the writer's [`Verifier`]
//! before the next one is requested, so the verifier sees the content in
//! exactly the order it was written.
//!
//! ```text
//!  write ──► region 0 ──full──► commit ──► verifier.update(r0)
//!        ──► region 1 ──full──► commit ──► verifier.update(r1)
//!  close ──► region 2 ───────► commit ──► verifier.update(r2), end_of_input
//!        ──► (handle lock dropped) verifier.finish()
//! ```
//!
//! A closed writer is either adopted by native code or [`free`](StreamWriter::free)d.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use dualstate_core::{
    native_lock, DualHandle, HandleError, HandleGuard, HandleProbe, HandleView, Key, NativeEnv,
    Payload, ReleaseCause, ReleaseContext, ResourceAddr, WriteRegion,
};
use dualstate_verify::{Range, Verifier, VerifyError};
use tracing::trace;

use crate::error::{StreamError, StreamResult};
use crate::Placement;

/// Writer state that lives under the handle lock.
#[derive(Debug, Default)]
pub struct WriterState {
    region: Option<WriteRegion>,
    verifier: Option<Verifier>,
    committed: usize,
}

impl Payload for WriterState {
    fn on_release(&mut self, _cause: ReleaseCause, _ctx: &ReleaseContext<'_>) {
        self.region = None;
        // Never fails, and must not mask the release.
        if let Some(verifier) = &self.verifier {
            verifier.cancel();
        }
    }
}

/// Sequential writer over a native resource.
pub struct StreamWriter {
    handle: DualHandle<WriterState>,
    probe: HandleProbe,
    open: bool,
    /// Failure returned by the verifier when closing.
    rejected: Option<VerifyError>,
}

impl StreamWriter {
    /// A writer over `at`, starting with `region`.
    ///
    /// Nothing can be written until [`set_verifier`](Self::set_verifier) is called.
    pub fn new(key: &Key, env: &NativeEnv, at: Placement, region: WriteRegion) -> Self {
        let state = WriterState {
            region: Some(region),
            verifier: None,
            committed: 0,
        };
        let handle = DualHandle::new(key, env, at.owner, at.context, at.resource, state);
        let probe = handle.probe();
        Self {
            handle,
            probe,
            open: true,
            rejected: None,
        }
    }

    /// Attaches the verifier and schedules it. Only allowed once.
    pub fn set_verifier(&mut self, verifier: Verifier) -> StreamResult<()> {
        if !self.open {
            return Err(StreamError::Closed);
        }
        let mut guard = self.handle.lock();
        if guard.payload().verifier.is_some() {
            return Err(StreamError::VerifierAlreadySet);
        }
        verifier.schedule()?;
        guard.payload_mut().verifier = Some(verifier);
        Ok(())
    }

    /// Makes room for `desired_capacity` more bytes.
    ///
    /// Zero means writing is finished: the last region is flushed and the
    /// verifier is told no more input follows.
    pub fn request_buffer(&mut self, desired_capacity: usize) -> StreamResult<()> {
        if !self.open {
            return Err(StreamError::Closed);
        }
        let mut guard = self.handle.lock();
        Self::advance(&mut guard, &self.probe, desired_capacity)
    }

    fn advance(
        guard: &mut HandleGuard<'_, WriterState>,
        probe: &HandleProbe,
        desired_capacity: usize,
    ) -> StreamResult<()> {
        guard.assert_valid()?;
        let verifier = guard
            .payload()
            .verifier
            .clone()
            .ok_or(StreamError::VerifierMissing)?;
        let has_room = guard.payload().region.as_ref().is_some_and(|r| r.remaining() > 0);
        if has_room && desired_capacity > 0 {
            return Ok(());
        }

        let state = guard.payload_mut();
        let filled = state.region.take().unwrap_or_default().freeze();
        let offset = state.committed;
        let next = {
            let _native = native_lock();
            guard
                .backend()
                .allocate_next_region(guard.resource(), offset, &filled, desired_capacity)?
        };
        trace!(
            resource = guard.resource().0,
            offset,
            len = filled.len(),
            desired_capacity,
            granted = next.capacity(),
            "region committed"
        );

        let state = guard.payload_mut();
        state.committed += filled.len();
        state.region = Some(next);

        verifier.update(Range::guarded(filled, Arc::new(probe.clone())))?;
        if desired_capacity == 0 {
            verifier.end_of_input()?;
        }
        Ok(())
    }

    /// Writes all of `src`, requesting new regions as needed.
    pub fn write_bytes(&mut self, mut src: &[u8]) -> StreamResult<()> {
        if !self.open {
            return Err(StreamError::Closed);
        }
        let mut guard = self.handle.lock();
        if guard.payload().verifier.is_none() {
            return Err(StreamError::VerifierMissing);
        }
        while !src.is_empty() {
            Self::advance(&mut guard, &self.probe, src.len())?;
            let copied = guard
                .payload_mut()
                .region
                .as_mut()
                .map_or(0, |region| region.put(src));
            if copied == 0 {
                return Err(HandleError::Native("native side granted an empty region".to_string()).into());
            }
            src = &src[copied..];
        }
        Ok(())
    }

    /// Writes one byte.
    pub fn write_byte(&mut self, byte: u8) -> StreamResult<()> {
        self.write_bytes(&[byte])
    }

    /// Finishes writing and waits for the verdict. Idempotent.
    ///
    /// A verification failure is returned here, and only from the first call.
    pub fn close(&mut self) -> StreamResult<()> {
        if !self.open {
            return Ok(());
        }
        let verifier = {
            let mut guard = self.handle.lock();
            Self::advance(&mut guard, &self.probe, 0)?;
            self.open = false;
            guard.payload().verifier.clone()
        };

        // The handle lock is released; the verifier may need it to finish.
        let verdict = verifier.map_or(Ok(()), |v| v.finish());
        if let Err(e) = verdict {
            self.rejected = Some(e.clone());
            return Err(e.into());
        }
        Ok(())
    }

    /// Closes, then releases the resource for good.
    ///
    /// For content native code will never adopt. The release happens even
    /// if closing failed, and the close failure is returned.
    pub fn free(&mut self) -> StreamResult<()> {
        let closed = self.close();
        self.handle.release_managed();
        closed
    }

    /// Hands the finished resource to native code.
    pub fn adopt(&mut self, key: &Key) -> StreamResult<ResourceAddr> {
        let mut guard = self.handle.lock();
        guard.check_key(key)?;
        if self.open {
            return Err(StreamError::WriteIncomplete);
        }
        if let Some(e) = &self.rejected {
            return Err(StreamError::Verification(e.clone()));
        }
        Ok(guard.adopt(key)?)
    }

    /// True until closed.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// Read-only view of the underlying handle.
    #[must_use]
    pub fn handle(&self) -> HandleView<WriterState> {
        self.handle.view()
    }

    /// Diagnostic description prefixed with `label`.
    #[must_use]
    pub fn describe(&self, label: &str) -> String {
        let (committed, region) = {
            let guard = self.handle.lock();
            let state = guard.payload();
            let region = state
                .region
                .as_ref()
                .map_or_else(|| "region[none]".to_string(), ToString::to_string);
            (state.committed, region)
        };
        format!(
            "{} committed:{committed} {region} {}",
            self.handle.describe(label),
            if self.open { "open" } else { "closed" }
        )
    }
}

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Display for StreamWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe("StreamWriter"))
    }
}

impl fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe("StreamWriter"))
    }
}
