//! Fixed-capacity byte arena shared between the source and every fragment.
//!
//! Positions are absolute and only ever grow; the physical offset of a
//! position is `position % capacity`. The [`RingWriter`] owns the write cursor
//! and the release ledger, fragments only read through lease-protected ranges.

use super::error::BufferError;
use super::fragment::Fragment;
use super::queue::{Dequeued, WaitingQueue};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::trace;

/// Absolute byte range `[start, end)` handed back once nothing references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasedSpan {
    pub start: u64,
    pub end: u64,
}

impl ReleasedSpan {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

pub type ReleaseQueue = WaitingQueue<ReleasedSpan>;

pub struct RingBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
}

// SAFETY: the allocation is plain bytes. Writes happen only through the single
// `RingWriter` into ranges no live fragment references, reads only through
// fragments whose ranges are pinned by leases.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    fn allocate(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity { capacity });
        }
        let storage: Box<[u8]> = vec![0u8; capacity].into_boxed_slice();
        let raw = Box::into_raw(storage).cast::<u8>();
        let ptr = NonNull::new(raw).ok_or(BufferError::InvalidCapacity { capacity })?;
        Ok(Self { ptr, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Physical slice `[offset, offset + len)`.
    ///
    /// # Safety
    /// The range must lie inside the arena and must not be written while the
    /// returned slice is alive, i.e. it has to be covered by a live lease.
    pub(super) unsafe fn region(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.capacity);
        // SAFETY: upheld by the caller.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.capacity);
        // SAFETY: produced by `Box::into_raw` in `allocate` with this exact length.
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Release lifetime of one raw read range. Every fragment derived from the
/// range holds an `Arc<Lease>`; dropping the last one posts the range on the
/// release queue.
pub struct Lease {
    span: ReleasedSpan,
    releases: Arc<ReleaseQueue>,
}

impl Lease {
    pub fn span(&self) -> ReleasedSpan {
        self.span
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // The queue is only completed once the writer is gone, nobody is left
        // to account for the range then.
        let _ = self.releases.enqueue(self.span);
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Lease").field(&self.span).finish()
    }
}

/// Sole writer of a [`RingBuffer`]. Tracks the absolute write cursor, the
/// oldest unreleased byte and the out-of-order release ledger.
pub struct RingWriter {
    ring: Arc<RingBuffer>,
    releases: Arc<ReleaseQueue>,
    written: u64,
    tail: u64,
    // start -> end of released spans that are not yet contiguous with `tail`
    ledger: BTreeMap<u64, u64>,
}

impl RingWriter {
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        Ok(Self {
            ring: Arc::new(RingBuffer::allocate(capacity)?),
            releases: Arc::new(ReleaseQueue::new()),
            written: 0,
            tail: 0,
            ledger: BTreeMap::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn release_queue(&self) -> &Arc<ReleaseQueue> {
        &self.releases
    }

    /// Absolute write position.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Absolute position of the oldest byte still referenced by a fragment.
    pub fn oldest_unreleased(&self) -> u64 {
        self.tail
    }

    pub fn in_flight(&self) -> usize {
        (self.written - self.tail) as usize
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.in_flight()
    }

    /// Free bytes writable without wrapping: bounded by the oldest unreleased
    /// byte and by the physical end of the arena.
    pub fn free_contiguous(&self) -> usize {
        let offset = self.physical(self.written);
        self.free().min(self.capacity() - offset)
    }

    /// Mutable view of the next free contiguous region, at most `max_len` bytes.
    pub fn writable(&mut self, max_len: usize) -> &mut [u8] {
        let len = self.free_contiguous().min(max_len);
        let offset = self.physical(self.written);
        // SAFETY: `[written, written + len)` is beyond every published range
        // and below `tail + capacity`, so no fragment can observe it, and the
        // `&mut self` borrow keeps this the only mutable view.
        unsafe { std::slice::from_raw_parts_mut(self.ring.as_mut_ptr().add(offset), len) }
    }

    /// Publishes the next `len` bytes written through [`writable`](Self::writable)
    /// as a raw fragment carrying a fresh lease.
    pub fn publish(&mut self, len: usize) -> Result<Fragment, BufferError> {
        if len == 0 {
            return Ok(Fragment::empty());
        }
        let end = self.written + len as u64;
        if end - self.tail > self.capacity() as u64 || len > self.free_contiguous() {
            return Err(BufferError::RingOverrun {
                written: end,
                tail: self.tail,
                capacity: self.capacity(),
            });
        }

        let lease = Arc::new(Lease {
            span: ReleasedSpan {
                start: self.written,
                end,
            },
            releases: self.releases.clone(),
        });
        let fragment = Fragment::from_ring(self.ring.clone(), self.written, len, lease);
        self.written = end;
        Ok(fragment)
    }

    /// Records a released span and advances the tail over the contiguous
    /// released prefix.
    pub fn release(&mut self, span: ReleasedSpan) -> Result<(), BufferError> {
        if span.is_empty() || span.start < self.tail || span.end > self.written {
            return Err(BufferError::UnknownRelease {
                start: span.start,
                end: span.end,
            });
        }
        if self.ledger.insert(span.start, span.end).is_some() {
            return Err(BufferError::UnknownRelease {
                start: span.start,
                end: span.end,
            });
        }
        while let Some(end) = self.ledger.remove(&self.tail) {
            self.tail = end;
        }
        trace!(tail = self.tail, pending = self.ledger.len(), "Ring release");
        Ok(())
    }

    /// Applies every release already queued without suspending.
    pub fn drain_releases(&mut self) -> Result<usize, BufferError> {
        let mut drained = 0;
        while let Some(span) = self.releases.try_dequeue() {
            self.release(span)?;
            drained += 1;
        }
        Ok(drained)
    }

    /// Suspends until at least one release arrives, then applies it and every
    /// other release already queued.
    pub async fn wait_for_release(&mut self) -> Result<usize, BufferError> {
        match self.releases.dequeue().await {
            Dequeued::Item(span) => {
                self.release(span)?;
                Ok(1 + self.drain_releases()?)
            }
            Dequeued::Completed => Err(BufferError::QueueCompleted),
        }
    }

    fn physical(&self, position: u64) -> usize {
        (position % self.capacity() as u64) as usize
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        self.releases.complete();
    }
}

impl std::fmt::Debug for RingWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingWriter")
            .field("capacity", &self.capacity())
            .field("written", &self.written)
            .field("tail", &self.tail)
            .field("pending_releases", &self.ledger.len())
            .finish()
    }
}
