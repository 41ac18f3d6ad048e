//! Transfer buffers and the per-FIFO buffer pool.
//!
//! A FIFO owns a pool of equally sized [`Mbuf`]s split over two queues: `free` (empty buffers a
//! producer may fill) and `used` (filled buffers waiting for a consumer). For a receive FIFO the
//! driver produces into `used` and `read()` consumes; for a transmit FIFO `write()` produces and the
//! driver consumes. A buffer taken off a queue is owned by whoever took it until it is queued
//! again, so the private lock can be dropped while user memory is copied.

use std::collections::VecDeque;

/// One transfer buffer.
#[derive(Debug)]
pub struct Mbuf {
    storage: Box<[u8]>,
    /// Caller-supplied payload from [`crate::UsbFifo::put_data_buffer`], dropped on reset.
    external: Option<Box<[u8]>>,
    offset: usize,
    len: usize,
    last_packet: bool,
    generation: u64,
}

impl Mbuf {
    fn new(capacity: usize, generation: u64) -> Self {
        Self {
            storage: vec![0; capacity].into_boxed_slice(),
            external: None,
            offset: 0,
            len: capacity,
            last_packet: false,
            generation,
        }
    }

    /// Capacity of the buffer.
    pub fn max_len(&self) -> usize {
        self.storage.len()
    }

    /// Bytes currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this buffer ends a producer-marked frame.
    pub fn is_last_packet(&self) -> bool {
        self.last_packet
    }

    pub fn data(&self) -> &[u8] {
        let backing = self.external.as_deref().unwrap_or(&self.storage[..]);
        &backing[self.offset..self.offset + self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let (offset, len) = (self.offset, self.len);
        let backing = match self.external.as_deref_mut() {
            Some(ext) => ext,
            None => &mut self.storage[..],
        };
        &mut backing[offset..offset + len]
    }

    /// Shrinks the held data, e.g. from a filter callback that strips a trailer.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Rewinds to an empty-at-front buffer spanning the whole capacity.
    pub(crate) fn reset(&mut self) {
        self.external = None;
        self.offset = 0;
        self.len = self.storage.len();
        self.last_packet = false;
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(self.offset + len <= self.storage.len());
        self.len = len;
    }

    /// Consumes `n` bytes from the front.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.offset += n;
        self.len -= n;
    }

    pub(crate) fn set_last_packet(&mut self) {
        self.last_packet = true;
    }

    /// Room after the held data, used when appending a write fragment.
    pub(crate) fn spare(&self) -> usize {
        self.storage.len() - (self.offset + self.len)
    }

    /// Extends the held data by `n` bytes and returns the newly covered region.
    pub(crate) fn extend(&mut self, n: usize) -> &mut [u8] {
        debug_assert!(self.external.is_none());
        debug_assert!(n <= self.spare());
        let start = self.offset + self.len;
        self.len += n;
        &mut self.storage[start..start + n]
    }

    pub(crate) fn attach_external(&mut self, payload: Box<[u8]>) {
        self.offset = 0;
        self.len = payload.len();
        self.last_packet = false;
        self.external = Some(payload);
    }
}

/// Free and used queues of one FIFO.
#[derive(Debug, Default)]
pub(crate) struct MbufPool {
    free: VecDeque<Mbuf>,
    used: VecDeque<Mbuf>,
    generation: u64,
    allocated: bool,
}

impl MbufPool {
    /// Replaces the pool with `nbuf` buffers of `bufsize` bytes, all on the free queue.
    pub(crate) fn alloc(&mut self, bufsize: usize, nbuf: u16) {
        self.release();
        for _ in 0..nbuf {
            self.free.push_back(Mbuf::new(bufsize, self.generation));
        }
        self.allocated = bufsize != 0 && nbuf != 0;
    }

    /// Drops every buffer. Buffers of this pool still held by a caller are discarded when they
    /// come back.
    pub(crate) fn release(&mut self) {
        self.free.clear();
        self.used.clear();
        self.allocated = false;
        self.generation += 1;
    }

    pub(crate) fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub(crate) fn dequeue_free(&mut self) -> Option<Mbuf> {
        self.free.pop_front()
    }

    pub(crate) fn dequeue_used(&mut self) -> Option<Mbuf> {
        self.used.pop_front()
    }

    pub(crate) fn poll_free(&self) -> Option<&Mbuf> {
        self.free.front()
    }

    pub(crate) fn poll_used(&self) -> Option<&Mbuf> {
        self.used.front()
    }

    pub(crate) fn enqueue_free(&mut self, m: Mbuf) {
        if self.owns(&m) {
            self.free.push_back(m);
        }
    }

    pub(crate) fn enqueue_used(&mut self, m: Mbuf) {
        if self.owns(&m) {
            self.used.push_back(m);
        }
    }

    pub(crate) fn prepend_free(&mut self, m: Mbuf) {
        if self.owns(&m) {
            self.free.push_front(m);
        }
    }

    pub(crate) fn prepend_used(&mut self, m: Mbuf) {
        if self.owns(&m) {
            self.used.push_front(m);
        }
    }

    /// Moves every used buffer back to the free queue.
    pub(crate) fn reset(&mut self) {
        while let Some(m) = self.used.pop_front() {
            self.free.push_back(m);
        }
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn used_len(&self) -> usize {
        self.used.len()
    }

    fn owns(&self, m: &Mbuf) -> bool {
        if m.generation != self.generation {
            tracing::trace!(
                buffer_generation = m.generation,
                pool_generation = self.generation,
                "dropping buffer from a released pool"
            );
            return false;
        }
        true
    }
}
