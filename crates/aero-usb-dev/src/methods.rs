//! Driver-facing capability set of a FIFO.

use std::sync::Arc;

use crate::error::{Result, UsbDevError};
use crate::fifo::{FifoIo, UsbFifo};
use crate::location::AccessMode;
use crate::mbuf::Mbuf;

/// Callbacks a driver provides for the FIFOs it owns.
///
/// Every method has a permissive default: `open` succeeds, `close` does nothing, both ioctl hooks
/// report [`UsbDevError::Unhandled`], and start/stop clear the flushing flag so a close never
/// waits on a driver that does not transmit.
///
/// `open`, `close` and the ioctl hooks run without the FIFO's private lock. The start/stop and
/// filter hooks run with it held and get a [`FifoIo`] for queue access; they must not block.
pub trait FifoMethods: Send + Sync {
    fn open(&self, fifo: &Arc<UsbFifo>, access: AccessMode) -> Result<()> {
        let _ = (fifo, access);
        Ok(())
    }

    fn close(&self, fifo: &Arc<UsbFifo>, access: AccessMode) {
        let _ = (fifo, access);
    }

    /// First-chance ioctl hook, called with only a FIFO reference held.
    fn ioctl(
        &self,
        fifo: &Arc<UsbFifo>,
        cmd: u64,
        data: &mut [u8],
        access: AccessMode,
    ) -> Result<()> {
        let _ = (fifo, cmd, data, access);
        Err(UsbDevError::Unhandled)
    }

    /// Last-chance ioctl hook, called with the device reference and enumeration lock held.
    fn ioctl_post(
        &self,
        fifo: &Arc<UsbFifo>,
        cmd: u64,
        data: &mut [u8],
        access: AccessMode,
    ) -> Result<()> {
        let _ = (fifo, cmd, data, access);
        Err(UsbDevError::Unhandled)
    }

    fn start_read(&self, io: &mut FifoIo<'_>) {
        io.clear_flushing();
    }

    fn stop_read(&self, io: &mut FifoIo<'_>) {
        io.clear_flushing();
    }

    fn start_write(&self, io: &mut FifoIo<'_>) {
        io.clear_flushing();
    }

    fn stop_write(&self, io: &mut FifoIo<'_>) {
        io.clear_flushing();
    }

    /// Runs on a received buffer just before it is copied to the reader.
    fn filter_read(&self, io: &mut FifoIo<'_>, m: &mut Mbuf) {
        let _ = (io, m);
    }

    /// Runs on a filled buffer just before it is queued for transmission.
    fn filter_write(&self, io: &mut FifoIo<'_>, m: &mut Mbuf) {
        let _ = (io, m);
    }
}

/// Driver with no behaviour of its own. Used for endpoints of devices that register no generic
/// driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMethods;

impl FifoMethods for NullMethods {}

/// DMA-style buffer the transfer engine copies frames through.
pub trait PageCache {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies up to `dst.len()` bytes starting at `offset` out of the cache. Bytes past the end
    /// of the cache are left untouched in `dst`.
    fn copy_out(&self, offset: usize, dst: &mut [u8]);

    /// Copies `src` into the cache at `offset`. Bytes that would land past the end are dropped.
    fn copy_in(&mut self, offset: usize, src: &[u8]);
}

impl PageCache for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        let src = self.get(offset..).unwrap_or_default();
        let n = dst.len().min(src.len());
        dst[..n].copy_from_slice(&src[..n]);
    }

    fn copy_in(&mut self, offset: usize, src: &[u8]) {
        let dst = self.get_mut(offset..).unwrap_or_default();
        let n = dst.len().min(src.len());
        dst[..n].copy_from_slice(&src[..n]);
    }
}

impl PageCache for Vec<u8> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        self.as_slice().copy_out(offset, dst);
    }

    fn copy_in(&mut self, offset: usize, src: &[u8]) {
        self.as_mut_slice().copy_in(offset, src);
    }
}
