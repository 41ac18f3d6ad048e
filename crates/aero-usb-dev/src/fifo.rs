//! FIFO endpoint objects.
//!
//! A [`UsbFifo`] is one direction of one channel: the control endpoint, a bulk/interrupt endpoint
//! opened through a generic node, or a virtual channel registered by a driver. Its queues and
//! flags live behind a private mutex; its owner and reference count belong to the registry's
//! reference lock and are only written while that lock is held.
//!
//! Lock order: the private lock may be held while taking the reference lock, never the reverse.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bitflags::bitflags;

use crate::device::DeviceKey;
use crate::error::{Result, UsbDevError};
use crate::location::FifoDirection;
use crate::mbuf::{Mbuf, MbufPool};
use crate::methods::{FifoMethods, PageCache};
use crate::process::ProcessContext;
use crate::symlink::AliasId;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FifoFlags: u32 {
        /// A thread is blocked on the I/O condition.
        const SLEEPING = 1 << 0;
        /// Sticky transport failure; set on removal.
        const ERROR = 1 << 1;
        /// usbfs completion pending.
        const COMPLETE = 1 << 2;
        /// An event watcher is armed.
        const SELECT = 1 << 3;
        /// TX close is waiting for queued data to drain.
        const FLUSHING = 1 << 4;
        /// Send a zero-length packet when flushing finds the queue empty.
        const SHORT = 1 << 5;
        /// Only queue write buffers once full.
        const WRITE_DEFRAG = 1 << 6;
        /// The first free buffer holds a partial write.
        const HAVE_FRAGMENT = 1 << 7;
    }
}

/// Receiver of readiness notifications (kqueue knote equivalent).
///
/// Called with the FIFO's private lock held; implementations must only record the event.
pub trait EventWatcher: Send + Sync {
    fn notify(&self);
}

pub(crate) struct FifoState {
    pub(crate) flags: FifoFlags,
    pub(crate) pool: MbufPool,
    pub(crate) async_target: Option<Arc<dyn ProcessContext>>,
    pub(crate) watchers: Vec<(u64, Arc<dyn EventWatcher>)>,
    wake_seq: u64,
}

pub struct UsbFifo {
    slot: usize,
    device: DeviceKey,
    dev_ep_index: Option<u8>,
    iface_index: u8,
    methods: Arc<dyn FifoMethods>,
    softc: Option<Arc<dyn Any + Send + Sync>>,
    state: Mutex<FifoState>,
    cv_io: Condvar,
    signal_poll: Duration,
    // Written only with the reference lock held.
    refcount: AtomicU32,
    owner: AtomicU64,
    /// Non-zero while the usbfs bulk interface owns this FIFO. Read with the reference lock held.
    fs_ep_max: AtomicU8,
    pub(crate) aliases: Mutex<[Option<AliasId>; 2]>,
}

impl fmt::Debug for UsbFifo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbFifo")
            .field("slot", &self.slot)
            .field("device", &self.device)
            .field("dev_ep_index", &self.dev_ep_index)
            .field("iface_index", &self.iface_index)
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pub(crate) struct FifoParams {
    pub(crate) slot: usize,
    pub(crate) device: DeviceKey,
    pub(crate) dev_ep_index: Option<u8>,
    pub(crate) iface_index: u8,
    pub(crate) methods: Arc<dyn FifoMethods>,
    pub(crate) softc: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) signal_poll: Duration,
}

impl UsbFifo {
    /// New FIFO holding its creation reference.
    pub(crate) fn new(params: FifoParams) -> Self {
        Self {
            slot: params.slot,
            device: params.device,
            dev_ep_index: params.dev_ep_index,
            iface_index: params.iface_index,
            methods: params.methods,
            softc: params.softc,
            state: Mutex::new(FifoState {
                flags: FifoFlags::empty(),
                pool: MbufPool::default(),
                async_target: None,
                watchers: Vec::new(),
                wake_seq: 0,
            }),
            cv_io: Condvar::new(),
            signal_poll: params.signal_poll,
            refcount: AtomicU32::new(1),
            owner: AtomicU64::new(0),
            fs_ep_max: AtomicU8::new(0),
            aliases: Mutex::new([None, None]),
        }
    }

    /// Slot index in the device's FIFO table.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn direction(&self) -> FifoDirection {
        FifoDirection::of_slot(self.slot)
    }

    pub fn device_key(&self) -> DeviceKey {
        self.device
    }

    /// Endpoint index served by an on-demand FIFO, `None` for driver-registered FIFOs.
    pub fn dev_ep_index(&self) -> Option<u8> {
        self.dev_ep_index
    }

    pub fn iface_index(&self) -> u8 {
        self.iface_index
    }

    pub(crate) fn methods(&self) -> &Arc<dyn FifoMethods> {
        &self.methods
    }

    /// Driver-private data registered with the FIFO.
    pub fn softc<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.softc.as_deref()?.downcast_ref::<T>()
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.owner() != 0
    }

    /// Whether the usbfs bulk interface has taken over this FIFO.
    pub fn is_usbfs(&self) -> bool {
        self.fs_ep_max.load(Ordering::Acquire) != 0
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    pub(crate) fn set_owner_locked(&self, owner: u64) {
        self.owner.store(owner, Ordering::Release);
    }

    pub(crate) fn ref_inc_locked(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the new count.
    pub(crate) fn ref_dec_locked(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "fifo refcount underflow");
        prev - 1
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, FifoState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` with the private lock held.
    pub fn with_io<R>(&self, f: impl FnOnce(&mut FifoIo<'_>) -> R) -> R {
        let mut state = self.lock_state();
        f(&mut FifoIo::new(self, &mut state))
    }

    pub fn flags(&self) -> FifoFlags {
        self.lock_state().flags
    }

    pub fn put_data<P: PageCache + ?Sized>(&self, pc: &P, offset: usize, len: usize, last: bool) {
        self.with_io(|io| io.put_data(pc, offset, len, last));
    }

    pub fn put_data_linear(&self, data: &[u8], last: bool) {
        self.with_io(|io| io.put_data_linear(data, last));
    }

    pub fn put_data_buffer(&self, payload: Box<[u8]>) -> bool {
        self.with_io(|io| io.put_data_buffer(payload))
    }

    pub fn put_data_error(&self) {
        self.with_io(|io| io.put_data_error());
    }

    pub fn put_bytes_max(&self) -> usize {
        self.with_io(|io| io.put_bytes_max())
    }

    pub fn get_data<P: PageCache + ?Sized>(
        &self,
        pc: &mut P,
        offset: usize,
        len: usize,
        one: bool,
    ) -> (usize, bool) {
        self.with_io(|io| io.get_data(pc, offset, len, one))
    }

    pub fn get_data_linear(&self, dst: &mut [u8], one: bool) -> (usize, bool) {
        self.with_io(|io| io.get_data_linear(dst, one))
    }

    /// Length of the next queued buffer without dequeuing it.
    pub fn get_data_buffer(&self) -> Option<usize> {
        self.with_io(|io| io.get_data_buffer().map(<[u8]>::len))
    }

    pub fn get_data_error(&self) {
        self.with_io(|io| io.get_data_error());
    }

    pub fn alloc_buffer(&self, bufsize: usize, nbuf: u16) {
        self.with_io(|io| io.alloc_buffer(bufsize, nbuf));
    }

    pub fn free_buffer(&self) {
        self.with_io(|io| io.free_buffer());
    }

    pub fn reset(&self) {
        self.with_io(|io| io.reset());
    }

    pub fn set_close_zlp(&self, on: bool) {
        self.with_io(|io| io.set_close_zlp(on));
    }

    pub fn set_write_defrag(&self, on: bool) {
        self.with_io(|io| io.set_write_defrag(on));
    }

    pub fn wakeup(&self) {
        self.with_io(|io| io.wakeup());
    }

    /// Releases I/O waiters. Private lock held.
    pub(crate) fn signal_locked(&self, state: &mut FifoState) {
        if state.flags.contains(FifoFlags::SLEEPING) {
            state.flags.remove(FifoFlags::SLEEPING);
            state.wake_seq = state.wake_seq.wrapping_add(1);
            self.cv_io.notify_all();
        }
    }

    pub(crate) fn notify_watchers_locked(&self, state: &FifoState) {
        for (_, watcher) in &state.watchers {
            watcher.notify();
        }
    }

    pub(crate) fn wakeup_locked(&self, state: &mut FifoState) {
        self.signal_locked(state);
        self.notify_watchers_locked(state);
        if let Some(target) = &state.async_target {
            target.post_sigio();
        }
    }

    /// Blocks until the next wakeup. Private lock held on entry and return.
    ///
    /// Fails with `Io` when the FIFO is (or becomes) in error, and with `Interrupted` when the
    /// caller has a signal pending.
    pub(crate) fn wait<'a>(
        &'a self,
        state: MutexGuard<'a, FifoState>,
        proc: Option<&dyn ProcessContext>,
    ) -> (MutexGuard<'a, FifoState>, Result<()>) {
        if state.flags.contains(FifoFlags::ERROR) {
            return (state, Err(UsbDevError::Io));
        }
        let (state, res) = self.sleep(state, proc);
        if res.is_err() {
            return (state, res);
        }
        if state.flags.contains(FifoFlags::ERROR) {
            return (state, Err(UsbDevError::Io));
        }
        (state, Ok(()))
    }

    /// Sets `SLEEPING` and waits for one wakeup or a signal.
    pub(crate) fn sleep<'a>(
        &'a self,
        mut state: MutexGuard<'a, FifoState>,
        proc: Option<&dyn ProcessContext>,
    ) -> (MutexGuard<'a, FifoState>, Result<()>) {
        state.flags.insert(FifoFlags::SLEEPING);
        let seq = state.wake_seq;
        while state.wake_seq == seq {
            if proc.is_some_and(|p| p.signal_pending()) {
                return (state, Err(UsbDevError::Interrupted));
            }
            let (guard, _) = self
                .cv_io
                .wait_timeout(state, self.signal_poll)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
        (state, Ok(()))
    }
}

/// Queue access for a FIFO whose private lock is held.
///
/// Drivers get one in their start/stop/filter callbacks, or through [`UsbFifo::with_io`] from a
/// transfer completion context.
pub struct FifoIo<'a> {
    fifo: &'a UsbFifo,
    state: &'a mut FifoState,
}

impl<'a> FifoIo<'a> {
    pub(crate) fn new(fifo: &'a UsbFifo, state: &'a mut FifoState) -> Self {
        Self { fifo, state }
    }

    pub fn fifo(&self) -> &UsbFifo {
        self.fifo
    }

    pub fn flags(&self) -> FifoFlags {
        self.state.flags
    }

    pub fn is_flushing(&self) -> bool {
        self.state.flags.contains(FifoFlags::FLUSHING)
    }

    pub fn clear_flushing(&mut self) {
        self.state.flags.remove(FifoFlags::FLUSHING);
    }

    pub fn is_error(&self) -> bool {
        self.state.flags.contains(FifoFlags::ERROR)
    }

    /// Marks a usbfs completion and wakes pollers.
    pub fn set_complete(&mut self) {
        self.state.flags.insert(FifoFlags::COMPLETE);
        self.wakeup();
    }

    pub fn clear_complete(&mut self) {
        self.state.flags.remove(FifoFlags::COMPLETE);
    }

    /// Switches the FIFO into (non-zero) or out of (zero) usbfs mode.
    pub fn set_usbfs_endpoints(&mut self, ep_max: u8) {
        self.fifo.fs_ep_max.store(ep_max, Ordering::Release);
    }

    pub fn has_buffers(&self) -> bool {
        self.state.pool.is_allocated()
    }

    pub fn used_len(&self) -> usize {
        self.state.pool.used_len()
    }

    pub fn free_len(&self) -> usize {
        self.state.pool.free_len()
    }

    pub fn wakeup(&mut self) {
        self.fifo.wakeup_locked(self.state);
    }

    /// Replaces the buffer pool; the previous one is released first.
    pub fn alloc_buffer(&mut self, bufsize: usize, nbuf: u16) {
        self.state.pool.alloc(bufsize, nbuf);
    }

    /// Releases the buffer pool. Safe to call repeatedly.
    pub fn free_buffer(&mut self) {
        self.state.pool.release();
    }

    /// Returns every queued buffer to the free queue and forgets any partial write.
    pub fn reset(&mut self) {
        self.state.pool.reset();
        self.state.flags.remove(FifoFlags::HAVE_FRAGMENT);
    }

    pub fn set_close_zlp(&mut self, on: bool) {
        self.state.flags.set(FifoFlags::SHORT, on);
    }

    pub fn set_write_defrag(&mut self, on: bool) {
        self.state.flags.set(FifoFlags::WRITE_DEFRAG, on);
        self.state.flags.remove(FifoFlags::HAVE_FRAGMENT);
    }

    /// Capacity of the next free buffer, 0 when none is free.
    pub fn put_bytes_max(&self) -> usize {
        self.state.pool.poll_free().map_or(0, Mbuf::max_len)
    }

    /// Queues `len` bytes of `pc` starting at `offset` for the reader. The range is clamped to
    /// the cache.
    ///
    /// With `last` set only one buffer is filled and it is flagged as the end of a frame; a
    /// zero-length `len` then produces an empty end-of-frame packet. Data that finds no free buffer
    /// is dropped.
    pub fn put_data<P: PageCache + ?Sized>(
        &mut self,
        pc: &P,
        mut offset: usize,
        len: usize,
        last: bool,
    ) {
        let mut len = len.min(pc.len().saturating_sub(offset));
        while len != 0 || last {
            let Some(mut m) = self.state.pool.dequeue_free() else {
                break;
            };
            m.reset();
            let io_len = len.min(m.len());
            pc.copy_out(offset, &mut m.data_mut()[..io_len]);
            m.set_len(io_len);
            offset += io_len;
            len -= io_len;
            if len == 0 && last {
                m.set_last_packet();
            }
            self.state.pool.enqueue_used(m);
            self.wakeup();
            if len == 0 || last {
                break;
            }
        }
    }

    pub fn put_data_linear(&mut self, data: &[u8], last: bool) {
        self.put_data(data, 0, data.len(), last);
    }

    /// Queues `payload` as one packet without copying it into pool storage.
    pub fn put_data_buffer(&mut self, payload: Box<[u8]>) -> bool {
        let Some(mut m) = self.state.pool.dequeue_free() else {
            return false;
        };
        m.attach_external(payload);
        self.state.pool.enqueue_used(m);
        self.wakeup();
        true
    }

    pub fn put_data_error(&mut self) {
        self.state.flags.insert(FifoFlags::ERROR);
        self.wakeup();
    }

    /// Pulls up to `len` queued bytes into `pc` at `offset`, clamped to the cache.
    ///
    /// Returns the number of bytes moved and whether a packet was produced. With `one` set at most
    /// one buffer is consumed, and any of it that did not fit is discarded. An empty queue while
    /// flushing produces the owed zero-length packet, or finishes the flush.
    pub fn get_data<P: PageCache + ?Sized>(
        &mut self,
        pc: &mut P,
        mut offset: usize,
        len: usize,
        one: bool,
    ) -> (usize, bool) {
        let mut len = len.min(pc.len().saturating_sub(offset));
        let mut actlen = 0;
        let mut tr_data = false;
        loop {
            if let Some(mut m) = self.state.pool.dequeue_used() {
                tr_data = true;
                let io_len = len.min(m.len());
                pc.copy_in(offset, &m.data()[..io_len]);
                len -= io_len;
                offset += io_len;
                actlen += io_len;
                m.advance(io_len);
                if m.is_empty() || one {
                    self.state.pool.enqueue_free(m);
                    self.wakeup();
                    if one {
                        break;
                    }
                } else {
                    self.state.pool.prepend_used(m);
                    self.wakeup();
                }
            } else {
                if tr_data {
                    break;
                }
                if self.state.flags.contains(FifoFlags::FLUSHING) {
                    if self.state.flags.contains(FifoFlags::SHORT) {
                        self.state.flags.remove(FifoFlags::SHORT);
                        tr_data = true;
                        break;
                    }
                    self.state.flags.remove(FifoFlags::FLUSHING);
                    self.wakeup();
                }
                break;
            }
            if len == 0 {
                break;
            }
        }
        (actlen, tr_data)
    }

    pub fn get_data_linear(&mut self, dst: &mut [u8], one: bool) -> (usize, bool) {
        let len = dst.len();
        self.get_data(dst, 0, len, one)
    }

    /// Peeks at the next queued packet.
    pub fn get_data_buffer(&self) -> Option<&[u8]> {
        self.state.pool.poll_used().map(Mbuf::data)
    }

    pub fn get_data_error(&mut self) {
        self.state.flags.insert(FifoFlags::ERROR);
        self.wakeup();
    }
}
