//! File-handle entry points: open, read, write, ioctl, event registration and teardown.

use std::sync::{Arc, Weak};
use std::thread;

use tracing::{debug, trace, warn};

use crate::broker::{RefCore, RefLevel, RefSnapshot};
use crate::device::ReEnumState;
use crate::error::{Result, UsbDevError};
use crate::fifo::{EventWatcher, FifoFlags, FifoIo, UsbFifo};
use crate::location::{AccessMode, DevNode, IoFlags};
use crate::process::ProcessContext;
use crate::session::Session;
use crate::uio::Uio;

/// Get descriptor type.
pub const FIODTYPE: u64 = 0x4004_667a;
/// Set/clear non-blocking I/O. Accepted; the mode is passed per call through [`IoFlags`].
pub const FIONBIO: u64 = 0x8004_667e;
/// Set/clear SIGIO delivery to the calling process.
pub const FIOASYNC: u64 = 0x8004_667d;
/// Check the SIGIO target's process group.
pub const TIOCSPGRP: u64 = 0x8004_7476;

fn int_arg(data: &[u8]) -> Result<i32> {
    let bytes = data.get(..4).ok_or(UsbDevError::InvalidArgument)?;
    Ok(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn set_int_arg(data: &mut [u8], value: i32) -> Result<()> {
    let bytes = data.get_mut(..4).ok_or(UsbDevError::InvalidArgument)?;
    bytes.copy_from_slice(&value.to_ne_bytes());
    Ok(())
}

/// Turns an error that interrupted a partly done transfer into a short count.
fn partial(res: Result<()>, moved: usize) -> Result<usize> {
    match res {
        Ok(()) => Ok(moved),
        Err(err) if moved != 0 && err.keeps_partial() => {
            trace!(%err, moved, "short transfer");
            Ok(moved)
        }
        Err(err) => Err(err),
    }
}

pub(crate) fn open(
    core: &Arc<RefCore>,
    node: &DevNode,
    access: AccessMode,
    proc: &Arc<dyn ProcessContext>,
) -> Result<UsbDevFile> {
    let access = access & (AccessMode::READ | AccessMode::WRITE);
    if access.is_empty() {
        return Err(UsbDevError::InvalidArgument);
    }
    if !node.permitted.contains(access) {
        return Err(UsbDevError::PermissionDenied);
    }

    let mut session = Session::new(core.next_session_id(), node.location);
    let mut snap = core.acquire(&session, RefLevel::Device)?;
    session.set_access(access);

    let res = open_fifos(core, &mut session, &mut snap, proc);
    core.release(&mut snap);
    res?;

    debug!(
        node = %node.name,
        session = session.id(),
        pid = proc.pid(),
        ?access,
        "opened"
    );
    Ok(UsbDevFile {
        core: Arc::clone(core),
        session: Some(Arc::new(session)),
    })
}

fn open_fifos(
    core: &RefCore,
    session: &mut Session,
    snap: &mut RefSnapshot,
    proc: &Arc<dyn ProcessContext>,
) -> Result<()> {
    core.fifo_create(session, snap)?;
    if let Some(tx) = &snap.txfifo {
        core.fifo_open(tx, session.id())?;
    }
    if let Some(rx) = &snap.rxfifo {
        if let Err(err) = core.fifo_open(rx, session.id()) {
            if let Some(tx) = &snap.txfifo {
                core.fifo_close(tx, Some(proc.as_ref()));
            }
            return Err(err);
        }
    }
    Ok(())
}

/// An open USB character device.
///
/// Closing happens exactly once, either through [`UsbDevFile::close`] or when the handle is
/// dropped. A TX close waits for written data to reach the driver.
pub struct UsbDevFile {
    core: Arc<RefCore>,
    session: Option<Arc<Session>>,
}

impl std::fmt::Debug for UsbDevFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbDevFile")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl UsbDevFile {
    fn session(&self) -> Result<&Arc<Session>> {
        self.session.as_ref().ok_or(UsbDevError::NoSuchDevice)
    }

    pub fn session_id(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.id())
    }

    /// Location as resolved by open, including the chosen FIFO pair.
    pub fn location(&self) -> Option<crate::location::DevLocation> {
        self.session.as_ref().map(|s| s.location())
    }

    pub fn access(&self) -> AccessMode {
        self.session
            .as_ref()
            .map_or(AccessMode::empty(), |s| s.access())
    }

    /// Closes the handle. `proc` lets a pending signal cut the TX flush short.
    pub fn close(mut self, proc: &dyn ProcessContext) {
        self.teardown(Some(proc));
    }

    fn teardown(&mut self, proc: Option<&dyn ProcessContext>) {
        let Some(session) = self.session.take() else {
            return;
        };
        match self.core.acquire(&session, RefLevel::AnyState) {
            Ok(mut snap) => {
                if let Some(rx) = &snap.rxfifo {
                    self.core.fifo_close(rx, proc);
                }
                if let Some(tx) = &snap.txfifo {
                    self.core.fifo_close(tx, proc);
                }
                self.core.release(&mut snap);
            }
            Err(err) => {
                warn!(session = session.id(), %err, "could not reference device on close");
            }
        }
        debug!(session = session.id(), "closed");
    }

    /// Reads into `uio`, returning the number of bytes moved.
    ///
    /// A packet the producer marked as the end of a frame ends the read, so a read never spans
    /// two frames. Blocks for data unless `flags` has `NONBLOCK`.
    pub fn read(
        &self,
        uio: &mut dyn Uio,
        flags: IoFlags,
        proc: &Arc<dyn ProcessContext>,
    ) -> Result<usize> {
        let session = self.session()?;
        let mut snap = self.core.acquire(session, RefLevel::Fifo)?;
        let start = uio.resid();
        let res = read_locked(&snap, uio, flags, proc.as_ref());
        self.core.release(&mut snap);
        partial(res, start - uio.resid())
    }

    /// Writes from `uio`, returning the number of bytes queued.
    ///
    /// A zero-length write queues one empty packet. Blocks for a free buffer unless `flags` has
    /// `NONBLOCK`.
    pub fn write(
        &self,
        uio: &mut dyn Uio,
        flags: IoFlags,
        proc: &Arc<dyn ProcessContext>,
    ) -> Result<usize> {
        let session = self.session()?;
        let mut snap = self.core.acquire(session, RefLevel::Fifo)?;
        let start = uio.resid();
        let res = write_locked(&snap, uio, flags, proc.as_ref());
        self.core.release(&mut snap);
        partial(res, start - uio.resid())
    }

    pub fn ioctl(&self, cmd: u64, data: &mut [u8], proc: &Arc<dyn ProcessContext>) -> Result<()> {
        let session = self.session()?;
        let mut snap = self.core.acquire(session, RefLevel::Fifo)?;
        let res = self.ioctl_locked(session, &mut snap, cmd, data, proc);
        self.core.release(&mut snap);
        res
    }

    fn ioctl_locked(
        &self,
        session: &Session,
        snap: &mut RefSnapshot,
        cmd: u64,
        data: &mut [u8],
        proc: &Arc<dyn ProcessContext>,
    ) -> Result<()> {
        let access = session.access();
        let mut fifo = None;
        let mut res = Err(UsbDevError::Unhandled);

        if access.contains(AccessMode::WRITE) {
            if let Some(tx) = &snap.txfifo {
                res = file_ioctl(tx, cmd, data, proc);
                fifo = Some(Arc::clone(tx));
            }
        }
        if access.contains(AccessMode::READ) {
            if let Some(rx) = &snap.rxfifo {
                res = file_ioctl(rx, cmd, data, proc);
                fifo = Some(Arc::clone(rx));
            }
        }
        let fifo = fifo.ok_or(UsbDevError::NoSuchFifo)?;
        if res != Err(UsbDevError::Unhandled) {
            return res;
        }

        res = fifo.methods().ioctl(&fifo, cmd, data, access);
        if res != Err(UsbDevError::Unhandled) {
            return res;
        }

        if self.core.upgrade(session, snap).is_err() {
            return Err(UsbDevError::NoSuchDevice);
        }
        match fifo.methods().ioctl_post(&fifo, cmd, data, access) {
            Err(UsbDevError::Unhandled) => return Err(UsbDevError::NotSupported),
            Err(err) => return Err(err),
            Ok(()) => {}
        }

        // Wait for a re-enumeration the ioctl may have started.
        loop {
            let Some(device) = snap.device.clone() else {
                return Err(UsbDevError::NoSuchDevice);
            };
            if device.re_enumerate_state() == ReEnumState::Done {
                return Ok(());
            }
            self.core.release(snap);
            thread::sleep(self.core.config.reenum_poll_interval);
            *snap = self
                .core
                .acquire(session, RefLevel::Device)
                .map_err(|_| UsbDevError::NoSuchDevice)?;
        }
    }

    /// Arms `watcher` for readiness of the given direction.
    pub fn register_event(
        &self,
        filter: EventFilter,
        watcher: Arc<dyn EventWatcher>,
    ) -> Result<EventRegistration> {
        let session = self.session()?;
        let need = filter.access();
        if !session.access().contains(need) {
            return Err(UsbDevError::NotSupported);
        }
        let mut snap = self.core.acquire(session, RefLevel::Fifo)?;
        let id = self.core.next_watch_id();
        if let Some(fifo) = filter.fifo(&snap) {
            let mut state = fifo.lock_state();
            state.flags.insert(FifoFlags::SELECT);
            state.watchers.push((id, watcher));
        }
        self.core.release(&mut snap);
        Ok(EventRegistration {
            id,
            filter,
            session: Arc::downgrade(session),
            core: Arc::clone(&self.core),
        })
    }
}

impl Drop for UsbDevFile {
    fn drop(&mut self) {
        self.teardown(None);
    }
}

/// File-layer ioctls every FIFO understands.
fn file_ioctl(
    fifo: &Arc<UsbFifo>,
    cmd: u64,
    data: &mut [u8],
    proc: &Arc<dyn ProcessContext>,
) -> Result<()> {
    match cmd {
        FIODTYPE => set_int_arg(data, 0),
        FIONBIO => Ok(()),
        FIOASYNC => {
            let mut state = fifo.lock_state();
            if int_arg(data)? != 0 {
                if state.async_target.is_some() {
                    return Err(UsbDevError::Busy);
                }
                state.async_target = Some(Arc::clone(proc));
            } else {
                state.async_target = None;
            }
            Ok(())
        }
        TIOCSPGRP => {
            let pgid = int_arg(data)?;
            let state = fifo.lock_state();
            match &state.async_target {
                None => Err(UsbDevError::InvalidArgument),
                Some(target) if target.pgid() != pgid => Err(UsbDevError::PermissionDenied),
                Some(_) => Ok(()),
            }
        }
        _ => Err(UsbDevError::Unhandled),
    }
}

fn read_locked(
    snap: &RefSnapshot,
    uio: &mut dyn Uio,
    flags: IoFlags,
    proc: &dyn ProcessContext,
) -> Result<()> {
    let Some(fifo) = snap.rxfifo.as_ref() else {
        return Err(UsbDevError::PermissionDenied);
    };
    let mut state = fifo.lock_state();
    if state.flags.contains(FifoFlags::ERROR) {
        return Err(UsbDevError::Io);
    }
    if snap.is_usbfs {
        return Err(UsbDevError::InvalidArgument);
    }

    let mut tr_data = false;
    while uio.resid() > 0 {
        let Some(mut m) = state.pool.dequeue_used() else {
            fifo.methods().start_read(&mut FifoIo::new(fifo, &mut state));
            if flags.contains(IoFlags::NONBLOCK) {
                if tr_data {
                    break;
                }
                return Err(UsbDevError::WouldBlock);
            }
            trace!(slot = fifo.slot(), "reader sleeping");
            let (guard, res) = fifo.wait(state, Some(proc));
            state = guard;
            res?;
            continue;
        };

        fifo.methods().filter_read(&mut FifoIo::new(fifo, &mut state), &mut m);
        tr_data = true;

        let io_len = m.len().min(uio.resid());
        drop(state);
        let res = uio.copy_out(&m.data()[..io_len]);
        state = fifo.lock_state();
        if res.is_ok() {
            m.advance(io_len);
        }

        if m.is_empty() {
            let last = m.is_last_packet();
            state.pool.enqueue_free(m);
            res?;
            if last {
                break;
            }
        } else {
            state.pool.prepend_used(m);
            fifo.wakeup_locked(&mut state);
            res?;
        }
    }
    Ok(())
}

fn write_locked(
    snap: &RefSnapshot,
    uio: &mut dyn Uio,
    flags: IoFlags,
    proc: &dyn ProcessContext,
) -> Result<()> {
    let Some(fifo) = snap.txfifo.as_ref() else {
        return Err(UsbDevError::PermissionDenied);
    };
    let mut state = fifo.lock_state();
    if state.flags.contains(FifoFlags::ERROR) {
        return Err(UsbDevError::Io);
    }
    if snap.is_usbfs {
        return Err(UsbDevError::InvalidArgument);
    }
    if !state.pool.is_allocated() {
        fifo.methods().start_write(&mut FifoIo::new(fifo, &mut state));
    }

    let mut tr_data = false;
    loop {
        let Some(mut m) = state.pool.dequeue_free() else {
            if flags.contains(IoFlags::NONBLOCK) {
                if tr_data {
                    break;
                }
                return Err(UsbDevError::WouldBlock);
            }
            trace!(slot = fifo.slot(), "writer sleeping");
            let (guard, res) = fifo.wait(state, Some(proc));
            state = guard;
            res?;
            if uio.resid() == 0 {
                break;
            }
            continue;
        };
        tr_data = true;

        let have_fragment = state.flags.contains(FifoFlags::HAVE_FRAGMENT);
        drop(state);
        let res = if have_fragment {
            let io_len = m.spare().min(uio.resid());
            uio.copy_in(m.extend(io_len))
        } else {
            m.reset();
            let io_len = m.len().min(uio.resid());
            m.set_len(io_len);
            uio.copy_in(m.data_mut())
        };
        state = fifo.lock_state();

        if let Err(err) = res {
            state.flags.remove(FifoFlags::HAVE_FRAGMENT);
            state.pool.enqueue_free(m);
            return Err(err);
        }

        if !state.flags.contains(FifoFlags::WRITE_DEFRAG) || m.len() == m.max_len() {
            state.flags.remove(FifoFlags::HAVE_FRAGMENT);
            fifo.methods().filter_write(&mut FifoIo::new(fifo, &mut state), &mut m);
            state.pool.enqueue_used(m);
            fifo.methods().start_write(&mut FifoIo::new(fifo, &mut state));
        } else {
            state.flags.insert(FifoFlags::HAVE_FRAGMENT);
            state.pool.prepend_free(m);
        }

        if uio.resid() == 0 {
            break;
        }
    }
    Ok(())
}

/// Direction an event registration watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Read,
    Write,
}

impl EventFilter {
    fn access(self) -> AccessMode {
        match self {
            EventFilter::Read => AccessMode::READ,
            EventFilter::Write => AccessMode::WRITE,
        }
    }

    fn fifo(self, snap: &RefSnapshot) -> Option<&Arc<UsbFifo>> {
        match self {
            EventFilter::Read => snap.rxfifo.as_ref(),
            EventFilter::Write => snap.txfifo.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventStatus {
    pub ready: bool,
    /// The handle is gone or the device failed; no further events will arrive.
    pub error: bool,
}

impl EventStatus {
    const GONE: EventStatus = EventStatus {
        ready: false,
        error: true,
    };
}

/// A watcher armed through [`UsbDevFile::register_event`]. Dropping it disarms the watcher.
pub struct EventRegistration {
    id: u64,
    filter: EventFilter,
    session: Weak<Session>,
    core: Arc<RefCore>,
}

impl std::fmt::Debug for EventRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistration")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

impl EventRegistration {
    pub fn filter(&self) -> EventFilter {
        self.filter
    }

    /// Current readiness. Polling a read registration starts the read transfer, and a write
    /// registration starts the write transfer when no buffers exist yet.
    pub fn poll(&self) -> EventStatus {
        let Some(session) = self.session.upgrade() else {
            return EventStatus::GONE;
        };
        let Ok(mut snap) = self.core.acquire(&session, RefLevel::Fifo) else {
            return EventStatus::GONE;
        };
        let status = match self.filter.fifo(&snap) {
            None => EventStatus::GONE,
            Some(fifo) => {
                let mut state = fifo.lock_state();
                if snap.is_usbfs {
                    EventStatus {
                        ready: state.flags.contains(FifoFlags::COMPLETE),
                        error: false,
                    }
                } else if state.flags.contains(FifoFlags::ERROR) {
                    EventStatus {
                        ready: true,
                        error: true,
                    }
                } else {
                    let ready = match self.filter {
                        EventFilter::Read => {
                            fifo.methods().start_read(&mut FifoIo::new(fifo, &mut state));
                            state.pool.used_len() != 0
                        }
                        EventFilter::Write => {
                            if !state.pool.is_allocated() {
                                fifo.methods().start_write(&mut FifoIo::new(fifo, &mut state));
                            }
                            state.pool.free_len() != 0
                        }
                    };
                    EventStatus {
                        ready,
                        error: false,
                    }
                }
            }
        };
        self.core.release(&mut snap);
        status
    }

    /// Disarms the watcher now.
    pub fn detach(self) {}

    fn disarm(&self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let Ok(mut snap) = self.core.acquire(&session, RefLevel::Fifo) else {
            return;
        };
        if let Some(fifo) = self.filter.fifo(&snap) {
            let mut state = fifo.lock_state();
            state.watchers.retain(|(id, _)| *id != self.id);
            state.flags.remove(FifoFlags::SELECT);
        }
        self.core.release(&mut snap);
    }
}

impl Drop for EventRegistration {
    fn drop(&mut self) {
        self.disarm();
    }
}
