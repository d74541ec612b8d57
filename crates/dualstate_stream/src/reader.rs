//! # Stream Reader
//!
//! Reads a native resource that may still be parked (stored compressed or
//! out of line, possibly protected only by a snapshot). Nothing is decoded
//! until the first read; from then on the content is an immutable buffer.
//!
//! ```text
//!  parked ──buffer()──► materialized ──close()/owner released──► released
//!    │                                         ▲
//!    └────────────adopt(key)───────────────────┘
//! ```

use std::fmt;
use std::io::{self, Read};

use dualstate_core::{
    native_lock, Chunk, DualHandle, HandleView, Key, NativeEnv, Payload, ReleaseCause,
    ReleaseContext, ResourceAddr, SnapshotId,
};
use dualstate_verify::{MarkRead, Validate};
use tracing::debug;

use crate::error::{StreamError, StreamResult};
use crate::Placement;

/// Reader state that lives under the handle lock.
#[derive(Debug, Default)]
pub struct ReaderState {
    content: Option<Chunk>,
    snapshot: Option<SnapshotId>,
}

impl Payload for ReaderState {
    fn on_release(&mut self, _cause: ReleaseCause, ctx: &ReleaseContext<'_>) {
        // Must happen before the owner finishes its own teardown.
        if let Some(snapshot) = self.snapshot.take() {
            ctx.backend().unregister_snapshot(snapshot, ctx.owner());
        }
        self.content = None;
    }
}

/// Sequential reader over a native resource.
pub struct StreamReader {
    handle: DualHandle<ReaderState>,
    parked_size: usize,
    position: usize,
    mark: Option<usize>,
    open: bool,
}

impl StreamReader {
    /// A reader over a parked resource of `parked_size` bytes.
    ///
    /// `snapshot` is held until the content is materialized, adopted or
    /// released, whichever comes first.
    pub fn parked(
        key: &Key,
        env: &NativeEnv,
        at: Placement,
        parked_size: usize,
        snapshot: Option<SnapshotId>,
    ) -> Self {
        let state = ReaderState { content: None, snapshot };
        Self::build(key, env, at, parked_size, state)
    }

    /// A reader over content that is already addressable.
    pub fn materialized(key: &Key, env: &NativeEnv, at: Placement, content: Chunk) -> Self {
        let parked_size = content.len();
        let state = ReaderState { content: Some(content), snapshot: None };
        Self::build(key, env, at, parked_size, state)
    }

    fn build(key: &Key, env: &NativeEnv, at: Placement, parked_size: usize, state: ReaderState) -> Self {
        Self {
            handle: DualHandle::new(key, env, at.owner, at.context, at.resource, state),
            parked_size,
            position: 0,
            mark: None,
            open: true,
        }
    }

    /// The content, materializing it on first use.
    pub fn buffer(&self) -> StreamResult<Chunk> {
        if !self.open {
            return Err(StreamError::Closed);
        }
        let mut guard = self.handle.lock();
        guard.assert_valid()?;
        if let Some(content) = &guard.payload().content {
            return Ok(Chunk::clone(content));
        }

        let snapshot = guard.payload().snapshot;
        let parked = guard.resource();
        let materialized = {
            let _native = native_lock();
            guard
                .backend()
                .materialize(parked, guard.context(), snapshot, guard.owner())?
        };
        debug!(
            from = parked.0,
            to = materialized.resource.0,
            len = materialized.content.len(),
            "materialized"
        );

        guard.set_resource(materialized.resource);
        let state = guard.payload_mut();
        // Unregistered by materialize.
        state.snapshot = None;
        state.content = Some(Chunk::clone(&materialized.content));
        Ok(materialized.content)
    }

    /// Reads one byte, or `None` at the end.
    pub fn read_byte(&mut self) -> StreamResult<Option<u8>> {
        let content = self.buffer()?;
        let byte = content.get(self.position).copied();
        if byte.is_some() {
            self.position += 1;
        }
        Ok(byte)
    }

    /// Bytes consumed so far.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Runs `routine` over the whole content.
    ///
    /// The reader must not have been read from, and the routine must read
    /// all of it.
    pub fn verify(&mut self, routine: &dyn Validate) -> StreamResult<()> {
        let content = self.buffer()?;
        if self.position != 0 {
            return Err(StreamError::Format(
                "content to be verified not positioned at start".to_string(),
            ));
        }
        routine.validate(self)?;
        if self.position != content.len() {
            return Err(StreamError::Format(format!(
                "verifier finished prematurely ({} of {} bytes read)",
                self.position,
                content.len()
            )));
        }
        Ok(())
    }

    /// Releases the resource from the managed side. Idempotent.
    pub fn close(&mut self) {
        if self.open {
            self.open = false;
            self.handle.release_managed();
        }
    }

    /// Hands the resource to native code. Only possible while open.
    ///
    /// A resource still depending on a snapshot is fetched first so it
    /// survives the snapshot.
    pub fn adopt(&mut self, key: &Key) -> StreamResult<ResourceAddr> {
        let mut guard = self.handle.lock();
        guard.check_key(key)?;
        if !self.open {
            return Err(StreamError::Closed);
        }
        guard.assert_valid()?;
        if guard.payload().snapshot.is_some() {
            let fetched = {
                let _native = native_lock();
                guard.backend().fetch_only(guard.resource(), guard.context())?
            };
            guard.set_resource(fetched);
        }
        let resource = guard.adopt(key)?;
        self.open = false;
        Ok(resource)
    }

    /// True until closed or adopted.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// Read-only view of the underlying handle.
    #[must_use]
    pub fn handle(&self) -> HandleView<ReaderState> {
        self.handle.view()
    }

    /// Diagnostic description prefixed with `label`.
    #[must_use]
    pub fn describe(&self, label: &str) -> String {
        let (snapshot, buffered) = {
            let guard = self.handle.lock();
            let state = guard.payload();
            (state.snapshot.map_or(0, |s| s.0), state.content.as_ref().map_or(0, |c| c.len()))
        };
        format!(
            "{} snap:{snapshot:x} parked:{} buffer:{buffered} pos:{} {}",
            self.handle.describe(label),
            self.parked_size,
            self.position,
            if self.open { "open" } else { "closed" }
        )
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let content = self.buffer()?;
        let rest = content.get(self.position..).unwrap_or_default();
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.position += n;
        Ok(n)
    }
}

impl MarkRead for StreamReader {
    fn mark(&mut self, _read_limit: usize) {
        // Content is fully buffered, so a mark never expires.
        self.mark = Some(self.position);
    }

    fn reset(&mut self) -> io::Result<()> {
        self.position = self
            .mark
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "reset without mark"))?;
        Ok(())
    }

    fn ranges_seen(&self) -> usize {
        1
    }
}

impl fmt::Display for StreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe("StreamReader"))
    }
}

impl fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe("StreamReader"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dualstate_core::sim::{SimEvent, SimNative};
    use dualstate_core::{ContextId, ErrorClass, OwnerId};
    use dualstate_verify::{AcceptAll, VerifyError};

    fn parked(sim: &std::sync::Arc<SimNative>, key: &Key, bytes: &[u8], snapshot: Option<SnapshotId>) -> StreamReader {
        let resource = sim.park(ContextId(1), bytes);
        let at = Placement::new(OwnerId(1), ContextId(1), resource);
        StreamReader::parked(key, &sim.env(), at, bytes.len(), snapshot)
    }

    #[test]
    fn test_materializes_once() {
        let sim = SimNative::new();
        let key = Key::mint();
        let reader = parked(&sim, &key, b"payload", Some(SnapshotId(7)));

        let first = reader.buffer().unwrap();
        let second = reader.buffer().unwrap();
        assert_eq!(&*first, b"payload");
        assert_eq!(first, second);
        assert_eq!(sim.calls().materialize, 1);
        // The snapshot went away with materialization and is not unregistered twice.
        assert_eq!(sim.calls().unregister_snapshot, 1);
    }

    #[test]
    fn test_read_primitives() {
        let sim = SimNative::new();
        let key = Key::mint();
        let mut reader = parked(&sim, &key, b"abc", None);

        assert_eq!(reader.read_byte().unwrap(), Some(b'a'));
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"bc");
        assert_eq!(reader.read_byte().unwrap(), None);
    }

    #[test]
    fn test_read_after_close_fails() {
        let sim = SimNative::new();
        let key = Key::mint();
        let mut reader = parked(&sim, &key, b"abc", None);
        reader.close();
        reader.close();
        assert!(matches!(reader.buffer(), Err(StreamError::Closed)));
        assert_eq!(sim.calls().release, 1);
    }

    #[test]
    fn test_read_after_owner_release_is_invalid_state() {
        let sim = SimNative::new();
        let key = Key::mint();
        let mut reader = parked(&sim, &key, b"abc", None);
        sim.release_owner(OwnerId(1));
        let err = reader.read_byte().unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvalidState);
    }

    #[test]
    fn test_verify_requires_full_consumption() {
        let sim = SimNative::new();
        let key = Key::mint();

        let mut reader = parked(&sim, &key, b"abcdef", None);
        reader.verify(&AcceptAll).unwrap();

        let mut reader = parked(&sim, &key, b"abcdef", None);
        let head = |input: &mut dyn MarkRead| -> Result<(), VerifyError> {
            input.read_exact(&mut [0u8; 2])?;
            Ok(())
        };
        assert!(matches!(reader.verify(&head), Err(StreamError::Format(_))));

        let mut reader = parked(&sim, &key, b"abcdef", None);
        reader.read_byte().unwrap();
        assert!(matches!(reader.verify(&AcceptAll), Err(StreamError::Format(_))));
    }

    #[test]
    fn test_adopt_fetches_before_snapshot_goes() {
        let sim = SimNative::new();
        let key = Key::mint();
        let mut reader = parked(&sim, &key, b"keep", Some(SnapshotId(3)));

        let adopted = reader.adopt(&key).unwrap();
        assert_eq!(sim.calls().fetch_only, 1);
        assert_eq!(sim.calls().materialize, 0);
        assert_eq!(sim.contents(adopted).unwrap(), b"keep");
        assert!(sim.events().contains(&SimEvent::SnapshotUnregistered {
            snapshot: SnapshotId(3),
            owner: OwnerId(1)
        }));
        assert!(!reader.is_open());
        assert!(matches!(reader.adopt(&key), Err(StreamError::Closed)));
    }

    #[test]
    fn test_adopt_after_materialize_skips_fetch() {
        let sim = SimNative::new();
        let key = Key::mint();
        let mut reader = parked(&sim, &key, b"keep", Some(SnapshotId(3)));
        reader.buffer().unwrap();
        let adopted = reader.adopt(&key).unwrap();
        assert_eq!(sim.calls().fetch_only, 0);
        assert_eq!(sim.contents(adopted).unwrap(), b"keep");
    }

    #[test]
    fn test_premade_content_never_materializes() {
        let sim = SimNative::new();
        let key = Key::mint();
        let resource = sim.park(ContextId(2), b"ready");
        let at = Placement::new(OwnerId(2), ContextId(2), resource);
        let reader = StreamReader::materialized(&key, &sim.env(), at, Chunk::from(b"ready".as_slice()));

        assert_eq!(&*reader.buffer().unwrap(), b"ready");
        assert_eq!(sim.calls().materialize, 0);
    }

    #[test]
    fn test_describe_layers() {
        let sim = SimNative::new();
        let key = Key::mint();
        let mut reader = parked(&sim, &key, b"abcd", Some(SnapshotId(0x2a)));
        let text = reader.to_string();
        assert!(text.starts_with("StreamReader key:#"), "{text}");
        assert!(text.contains("snap:2a parked:4 buffer:0"), "{text}");
        assert!(text.ends_with("open"), "{text}");

        reader.read_byte().unwrap();
        reader.close();
        let text = reader.to_string();
        assert!(text.contains("snap:0 parked:4 buffer:0 pos:1"), "{text}");
        assert!(text.ends_with("closed"), "{text}");
    }
}
