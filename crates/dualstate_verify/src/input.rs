//! # Verifier Input
//!
//! The producer side of a verifier submits byte ranges in order; the
//! validation routine sees them as one continuous, markable byte stream.
//!
//! ```text
//!   update(r0) update(r1) update(r2) end_of_input()
//!       │          │          │          │
//!       ▼          ▼          ▼          ▼
//!   ┌──────────────────────────────────────────┐
//!   │ r0 bytes | r1 bytes | r2 bytes |  EOF    │  ChunkInput
//!   └──────────────────────────────────────────┘
//! ```
//!
//! A read that runs past the last submitted range blocks until the next
//! range, the end-of-input marker, or cancellation arrives.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use crossbeam_channel::{select, Receiver};
use dualstate_core::{Chunk, HandleProbe};

/// Liveness check attached to a range.
///
/// A range's bytes belong to a native resource. Once that resource is gone
/// the range must not be read, even though the bytes are still in memory.
pub trait RangeGuard: Send + Sync {
    /// Fails if the backing resource has been released.
    fn check(&self) -> io::Result<()>;
}

impl RangeGuard for HandleProbe {
    fn check(&self) -> io::Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                "range read after its native resource was released",
            ))
        }
    }
}

/// One contiguous run of bytes handed to a verifier.
#[derive(Clone)]
pub struct Range {
    bytes: Chunk,
    guard: Option<Arc<dyn RangeGuard>>,
}

impl Range {
    /// A range that stays readable for as long as it exists.
    #[must_use]
    pub fn new(bytes: Chunk) -> Self {
        Self { bytes, guard: None }
    }

    /// A range that becomes unreadable when `guard` says so.
    #[must_use]
    pub fn guarded(bytes: Chunk, guard: Arc<dyn RangeGuard>) -> Self {
        Self { bytes, guard: Some(guard) }
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-length range.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn check(&self) -> io::Result<()> {
        match &self.guard {
            Some(guard) => guard.check(),
            None => Ok(()),
        }
    }
}

impl From<&[u8]> for Range {
    fn from(bytes: &[u8]) -> Self {
        Self::new(Arc::from(bytes))
    }
}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Range")
            .field("len", &self.bytes.len())
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

/// What travels down a verifier's queue.
#[derive(Debug)]
pub(crate) enum Feed {
    Range(Range),
    NoMore,
}

/// A byte stream that can return to a marked position.
pub trait MarkRead: Read {
    /// Remembers the current position.
    ///
    /// The mark stays valid for at least `read_limit` further bytes.
    /// Reading past that may invalidate it.
    fn mark(&mut self, read_limit: usize);

    /// Returns to the last marked position.
    ///
    /// Fails with [`io::ErrorKind::InvalidInput`] if there is no valid mark.
    fn reset(&mut self) -> io::Result<()>;

    /// Number of distinct ranges the stream has delivered so far.
    fn ranges_seen(&self) -> usize;
}

/// Marked position. Always in the first retained range.
#[derive(Clone, Copy, Debug)]
struct Mark {
    offset: usize,
    limit: usize,
    read: usize,
}

/// The stream a validation routine reads.
///
/// Only ranges from the mark onward are retained; without a mark, a range
/// is dropped as soon as reading moves past it. A mark read past its limit
/// is forgotten, so the window shrinks back on the next range.
pub struct ChunkInput {
    rx: Receiver<Feed>,
    cancel: Receiver<()>,
    window: VecDeque<Range>,
    index: usize,
    offset: usize,
    mark: Option<Mark>,
    ranges_seen: usize,
    ended: bool,
    cancelled: bool,
}

impl ChunkInput {
    pub(crate) fn new(rx: Receiver<Feed>, cancel: Receiver<()>) -> Self {
        Self {
            rx,
            cancel,
            window: VecDeque::new(),
            index: 0,
            offset: 0,
            mark: None,
            ranges_seen: 0,
            ended: false,
            cancelled: false,
        }
    }

    /// True if a read ever observed cancellation.
    pub(crate) fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// True if already-delivered bytes remain unread.
    pub(crate) fn has_unread(&self) -> bool {
        let mut rest = self.window.iter().skip(self.index);
        match rest.next() {
            Some(current) if self.offset < current.len() => true,
            Some(_) => rest.any(|r| !r.is_empty()),
            None => false,
        }
    }

    fn push(&mut self, range: Range) {
        if self.mark.is_none() {
            self.window.clear();
        }
        self.window.push_back(range);
        self.index = self.window.len() - 1;
        self.offset = 0;
        self.ranges_seen += 1;
    }

    fn next_feed(&mut self) -> io::Result<Option<Range>> {
        // Cancellation is signalled by dropping the sender.
        let next = select! {
            recv(self.rx) -> msg => Some(msg),
            recv(self.cancel) -> _ => None,
        };
        match next {
            Some(Ok(Feed::Range(range))) => Ok(Some(range)),
            Some(Ok(Feed::NoMore)) => Ok(None),
            Some(Err(_)) => Err(self.interrupted("verifier input abandoned")),
            None => Err(self.interrupted("verification cancelled")),
        }
    }

    fn advance_mark(&mut self, n: usize) {
        if let Some(mark) = &mut self.mark {
            mark.read += n;
            if mark.read > mark.limit {
                self.mark = None;
            }
        }
    }

    fn interrupted(&mut self, message: &str) -> io::Error {
        // Not `Interrupted`: std read loops retry that kind forever.
        self.cancelled = true;
        io::Error::new(io::ErrorKind::Other, message)
    }
}

impl Read for ChunkInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(range) = self.window.get(self.index) {
                if let Err(e) = range.check() {
                    // The writer is gone; nothing more will arrive.
                    self.cancelled = true;
                    return Err(e);
                }
                let bytes = &range.bytes[self.offset..];
                if !bytes.is_empty() {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    self.offset += n;
                    self.advance_mark(n);
                    return Ok(n);
                }
                if self.index + 1 < self.window.len() {
                    self.index += 1;
                    self.offset = 0;
                    continue;
                }
            }
            if self.ended {
                return Ok(0);
            }
            match self.next_feed()? {
                Some(range) => self.push(range),
                None => {
                    self.ended = true;
                    return Ok(0);
                }
            }
        }
    }
}

impl MarkRead for ChunkInput {
    fn mark(&mut self, read_limit: usize) {
        self.window.drain(..self.index);
        self.index = 0;
        self.mark = Some(Mark {
            offset: self.offset,
            limit: read_limit,
            read: 0,
        });
    }

    fn reset(&mut self) -> io::Result<()> {
        let mark = self
            .mark
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "reset without a valid mark"))?;
        mark.read = 0;
        self.index = 0;
        self.offset = mark.offset;
        Ok(())
    }

    fn ranges_seen(&self) -> usize {
        self.ranges_seen
    }
}

impl fmt::Debug for ChunkInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkInput")
            .field("retained", &self.window.len())
            .field("ranges_seen", &self.ranges_seen)
            .field("ended", &self.ended)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}
