//! Reference/ownership broker.
//!
//! Every entry point pins what it touches through a [`RefSnapshot`]: optionally the device (with
//! its enumeration lock) and the RX/TX FIFOs named by the session. Acquisition is all-or-nothing
//! and every successful acquire is paired with exactly one [`RefCore::release`].
//!
//! The global reference lock protects the device table, the FIFO slot tables, FIFO owners and all
//! reference counts. It is only held for short sections that never block on anything but itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use crate::config::UsbDevConfig;
use crate::device::{DeviceKey, UsbDevice};
use crate::error::{Result, UsbDevError};
use crate::fifo::{FifoFlags, FifoIo, FifoParams, UsbFifo};
use crate::location::{AccessMode, FifoDirection, FIFO_RX, FIFO_TX};
use crate::process::ProcessContext;
use crate::session::Session;
use crate::symlink::SymlinkRegistry;

pub(crate) struct DeviceEntry {
    pub(crate) device: Arc<UsbDevice>,
    /// Starts at 1 for the attach itself.
    pub(crate) refcount: u32,
    pub(crate) detached: bool,
    pub(crate) fifos: Vec<Option<Arc<UsbFifo>>>,
}

impl DeviceEntry {
    pub(crate) fn fifo(&self, slot: usize) -> Option<&Arc<UsbFifo>> {
        self.fifos.get(slot)?.as_ref()
    }
}

pub(crate) struct RefTable {
    buses: Vec<Vec<Option<DeviceEntry>>>,
}

impl RefTable {
    fn new(config: &UsbDevConfig) -> Self {
        let buses = (0..config.max_buses)
            .map(|_| (0..config.max_devices).map(|_| None).collect())
            .collect();
        Self { buses }
    }

    fn slot_mut(&mut self, key: DeviceKey) -> Option<&mut Option<DeviceEntry>> {
        self.buses
            .get_mut(usize::from(key.bus))?
            .get_mut(usize::from(key.dev))
    }

    pub(crate) fn entry(&self, key: DeviceKey) -> Option<&DeviceEntry> {
        self.buses
            .get(usize::from(key.bus))?
            .get(usize::from(key.dev))?
            .as_ref()
    }

    pub(crate) fn entry_mut(&mut self, key: DeviceKey) -> Option<&mut DeviceEntry> {
        self.slot_mut(key)?.as_mut()
    }
}

/// How much an acquisition pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefLevel {
    /// FIFO references only.
    Fifo,
    /// Device reference and enumeration lock as well.
    Device,
    /// As `Device`, but also succeeds on a detached device. Used by teardown.
    AnyState,
}

#[derive(Debug, Default)]
pub(crate) struct RefSnapshot {
    pub(crate) device: Option<Arc<UsbDevice>>,
    pub(crate) rxfifo: Option<Arc<UsbFifo>>,
    pub(crate) txfifo: Option<Arc<UsbFifo>>,
    pub(crate) is_uref: bool,
    pub(crate) is_read: bool,
    pub(crate) is_write: bool,
    pub(crate) is_usbfs: bool,
    pub(crate) do_unlock: bool,
}

pub(crate) struct RefCore {
    pub(crate) config: UsbDevConfig,
    table: Mutex<RefTable>,
    /// Signalled when a device reference count reaches zero.
    dev_drain: Condvar,
    /// Signalled when a FIFO reference count reaches zero.
    fifo_drain: Condvar,
    pub(crate) symlinks: SymlinkRegistry,
    next_session: AtomicU64,
    next_watch: AtomicU64,
}

impl RefCore {
    pub(crate) fn new(config: UsbDevConfig) -> Self {
        Self {
            table: Mutex::new(RefTable::new(&config)),
            config,
            dev_drain: Condvar::new(),
            fifo_drain: Condvar::new(),
            symlinks: SymlinkRegistry::default(),
            next_session: AtomicU64::new(1),
            next_watch: AtomicU64::new(1),
        }
    }

    pub(crate) fn lock_table(&self) -> MutexGuard<'_, RefTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_watch_id(&self) -> u64 {
        self.next_watch.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn signal_poll(&self) -> std::time::Duration {
        self.config.signal_poll_interval
    }

    /// Adds a device to the table. The entry holds one reference for the attach itself.
    pub(crate) fn insert_device(&self, device: Arc<UsbDevice>) -> Result<()> {
        let key = device.key();
        let fifo_max = self.config.fifo_max;
        let mut table = self.lock_table();
        let slot = table.slot_mut(key).ok_or(UsbDevError::InvalidArgument)?;
        if slot.is_some() {
            return Err(UsbDevError::Busy);
        }
        *slot = Some(DeviceEntry {
            device,
            refcount: 1,
            detached: false,
            fifos: vec![None; fifo_max],
        });
        debug!(bus = key.bus, dev = key.dev, "device attached");
        Ok(())
    }

    /// Marks a device detached so only `AnyState` acquisitions still find it.
    pub(crate) fn mark_detached(&self, key: DeviceKey) -> Result<Arc<UsbDevice>> {
        let mut table = self.lock_table();
        match table.entry_mut(key) {
            Some(entry) if !entry.detached => {
                entry.detached = true;
                Ok(Arc::clone(&entry.device))
            }
            _ => Err(UsbDevError::NoSuchDevice),
        }
    }

    pub(crate) fn linked_fifos(&self, key: DeviceKey) -> Vec<Arc<UsbFifo>> {
        let table = self.lock_table();
        table
            .entry(key)
            .map(|entry| entry.fifos.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops the attach reference, waits for every other device reference to go away and removes
    /// the entry under the same lock hold.
    pub(crate) fn drain_and_remove(&self, key: DeviceKey) {
        let mut table = self.lock_table();
        if let Some(entry) = table.entry_mut(key) {
            entry.refcount -= 1;
        }
        loop {
            let remaining = table.entry(key).map_or(0, |entry| entry.refcount);
            if remaining == 0 {
                break;
            }
            trace!(refcount = remaining, "waiting for device references");
            table = self
                .dev_drain
                .wait(table)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if let Some(slot) = table.slot_mut(key) {
            *slot = None;
        }
        debug!(bus = key.bus, dev = key.dev, "device removed");
    }

    pub(crate) fn device_refcount(&self, key: DeviceKey) -> Option<u32> {
        self.lock_table().entry(key).map(|entry| entry.refcount)
    }

    pub(crate) fn device(&self, key: DeviceKey) -> Option<Arc<UsbDevice>> {
        self.lock_table()
            .entry(key)
            .map(|entry| Arc::clone(&entry.device))
    }

    pub(crate) fn fifo(&self, key: DeviceKey, slot: usize) -> Option<Arc<UsbFifo>> {
        self.lock_table().entry(key)?.fifo(slot).cloned()
    }

    /// Links `fifo` into its device's slot table.
    pub(crate) fn link_fifo(&self, fifo: &Arc<UsbFifo>) -> Result<()> {
        let mut table = self.lock_table();
        let entry = table
            .entry_mut(fifo.device_key())
            .ok_or(UsbDevError::NoSuchDevice)?;
        let slot = entry
            .fifos
            .get_mut(fifo.slot())
            .ok_or(UsbDevError::InvalidArgument)?;
        if slot.is_some() {
            return Err(UsbDevError::Busy);
        }
        *slot = Some(Arc::clone(fifo));
        Ok(())
    }

    pub(crate) fn acquire(&self, session: &Session, level: RefLevel) -> Result<RefSnapshot> {
        let key = session.device_key();
        trace!(session = session.id(), ?level, "acquire");

        let mut table = self.lock_table();
        let entry = match table.entry_mut(key) {
            Some(entry) if !entry.detached || level == RefLevel::AnyState => entry,
            _ => {
                trace!(bus = key.bus, dev = key.dev, "no device");
                return Err(UsbDevError::NoSuchDevice);
            }
        };
        let device = Arc::clone(&entry.device);
        let mut snap = RefSnapshot::default();

        if level != RefLevel::Fifo {
            if entry.refcount == self.config.dev_ref_max {
                debug!(bus = key.bus, dev = key.dev, "device reference limit reached");
                return Err(UsbDevError::RefLimitExceeded);
            }
            entry.refcount += 1;
            drop(table);
            snap.do_unlock = device.enum_lock().lock();
            table = self.lock_table();
            snap.is_uref = true;
        }
        snap.device = Some(device);

        if let Err(err) = self.resolve_fifos(&table, session, &mut snap) {
            trace!(session = session.id(), %err, "acquire failed");
            self.unwind(table, &mut snap);
            return Err(err);
        }
        if let Some(rx) = &snap.rxfifo {
            rx.ref_inc_locked();
            snap.is_read = true;
        }
        if let Some(tx) = &snap.txfifo {
            tx.ref_inc_locked();
            snap.is_write = true;
        }
        Ok(snap)
    }

    /// Checks every FIFO the session's access mode names. Counts are not touched.
    fn resolve_fifos(
        &self,
        table: &RefTable,
        session: &Session,
        snap: &mut RefSnapshot,
    ) -> Result<()> {
        let access = session.access();
        if access.is_empty() {
            return Ok(());
        }
        let entry = table
            .entry(session.device_key())
            .ok_or(UsbDevError::NoSuchDevice)?;
        let location = session.location();
        if access.contains(AccessMode::WRITE) {
            let tx = self.check_fifo(entry, location.slot(FifoDirection::Tx), session)?;
            snap.is_usbfs |= tx.is_usbfs();
            snap.txfifo = Some(tx);
        }
        if access.contains(AccessMode::READ) {
            let rx = self.check_fifo(entry, location.slot(FifoDirection::Rx), session)?;
            snap.is_usbfs |= rx.is_usbfs();
            snap.rxfifo = Some(rx);
        }
        Ok(())
    }

    fn check_fifo(
        &self,
        entry: &DeviceEntry,
        slot: usize,
        session: &Session,
    ) -> Result<Arc<UsbFifo>> {
        let fifo = entry.fifo(slot).ok_or_else(|| {
            trace!(slot, "no fifo");
            UsbDevError::NoSuchFifo
        })?;
        if fifo.refcount() == self.config.fifo_ref_max {
            debug!(slot, "fifo reference limit reached");
            return Err(UsbDevError::RefLimitExceeded);
        }
        if fifo.owner() != session.id() {
            trace!(slot, "fifo not owned by session");
            return Err(UsbDevError::NotOwner);
        }
        Ok(Arc::clone(fifo))
    }

    /// Undoes a partial device-level acquisition.
    fn unwind(&self, mut table: MutexGuard<'_, RefTable>, snap: &mut RefSnapshot) {
        if let Some(device) = &snap.device {
            if snap.do_unlock {
                device.enum_lock().unlock();
            }
            if snap.is_uref {
                if let Some(entry) = table.entry_mut(device.key()) {
                    entry.refcount -= 1;
                    if entry.refcount == 0 {
                        self.dev_drain.notify_all();
                    }
                }
            }
        }
        drop(table);
        *snap = RefSnapshot::default();
    }

    /// Raises a FIFO-level snapshot to device level.
    pub(crate) fn upgrade(&self, session: &Session, snap: &mut RefSnapshot) -> Result<()> {
        if snap.is_uref {
            return Ok(());
        }
        self.release(snap);
        *snap = self.acquire(session, RefLevel::Device)?;
        Ok(())
    }

    /// Drops whatever `snap` holds. Releasing twice is harmless.
    pub(crate) fn release(&self, snap: &mut RefSnapshot) {
        if snap.do_unlock {
            if let Some(device) = &snap.device {
                debug_assert!(device.enum_lock().is_owned());
                device.enum_lock().unlock();
            }
            snap.do_unlock = false;
        }

        let mut table = self.lock_table();
        if snap.is_read {
            if let Some(rx) = &snap.rxfifo {
                if rx.ref_dec_locked() == 0 {
                    self.fifo_drain.notify_all();
                }
            }
            snap.is_read = false;
        }
        if snap.is_write {
            if let Some(tx) = &snap.txfifo {
                if tx.ref_dec_locked() == 0 {
                    self.fifo_drain.notify_all();
                }
            }
            snap.is_write = false;
        }
        if snap.is_uref {
            if let Some(device) = &snap.device {
                if let Some(entry) = table.entry_mut(device.key()) {
                    entry.refcount -= 1;
                    if entry.refcount == 0 {
                        self.dev_drain.notify_all();
                    }
                }
            }
            snap.is_uref = false;
        }
        snap.is_usbfs = false;
    }

    /// Resolves, creating on demand, the FIFO pair a session opens.
    ///
    /// Requires a device-level snapshot. On success the chosen pair becomes the session's
    /// `fifo_index` and the snapshot names the FIFOs without holding references on them.
    pub(crate) fn fifo_create(&self, session: &mut Session, snap: &mut RefSnapshot) -> Result<()> {
        let device = snap.device.clone().ok_or(UsbDevError::NoSuchDevice)?;
        let key = device.key();
        let location = session.location();
        let access = session.access();
        let is_tx = access.contains(AccessMode::WRITE);
        let is_rx = access.contains(AccessMode::READ);

        let Some(ep) = location.ep_addr else {
            let table = self.lock_table();
            let entry = table.entry(key).ok_or(UsbDevError::NoSuchDevice)?;
            if is_tx {
                let tx = entry.fifo(location.slot(FifoDirection::Tx));
                snap.txfifo = Some(Arc::clone(tx.ok_or(UsbDevError::InvalidArgument)?));
            }
            if is_rx {
                let rx = entry.fifo(location.slot(FifoDirection::Rx));
                snap.rxfifo = Some(Arc::clone(rx.ok_or(UsbDevError::InvalidArgument)?));
            }
            return Ok(());
        };

        let (n, is_busy, second_pass) = {
            let table = self.lock_table();
            let entry = table.entry(key).ok_or(UsbDevError::NoSuchDevice)?;
            search_slot_pair(entry, self.config.fifo_max, ep, is_tx, is_rx)?
        };

        if second_pass && ep >= self.config.ep_max / 2 {
            return Err(if is_busy {
                UsbDevError::Busy
            } else {
                UsbDevError::InvalidArgument
            });
        }
        if ep != 0 && is_busy {
            return Err(UsbDevError::Busy);
        }

        if is_tx {
            self.create_endpoint_fifo(&device, n + FIFO_TX, ep)?;
        }
        if is_rx {
            self.create_endpoint_fifo(&device, n + FIFO_RX, ep)?;
        }

        let table = self.lock_table();
        let entry = table.entry(key).ok_or(UsbDevError::NoSuchDevice)?;
        if is_tx {
            snap.txfifo = entry.fifo(n + FIFO_TX).cloned();
        }
        if is_rx {
            snap.rxfifo = entry.fifo(n + FIFO_RX).cloned();
        }
        drop(table);

        session.set_fifo_index(n as u8);
        Ok(())
    }

    fn create_endpoint_fifo(&self, device: &Arc<UsbDevice>, slot: usize, ep: u8) -> Result<()> {
        let key = device.key();
        if self.fifo(key, slot).is_some() {
            return Ok(());
        }
        let dir = FifoDirection::of_slot(slot);
        let Some(endpoint) = device.get_ep(ep, dir) else {
            debug!(ep, ?dir, "no endpoint");
            return Err(UsbDevError::InvalidArgument);
        };
        let fifo = Arc::new(UsbFifo::new(FifoParams {
            slot,
            device: key,
            dev_ep_index: Some(ep),
            iface_index: endpoint.iface_index,
            methods: Arc::clone(device.generic_methods()),
            softc: Some(Arc::new(endpoint)),
            signal_poll: self.signal_poll(),
        }));
        self.link_fifo(&fifo)?;
        debug!(slot, ep, ?dir, "created on-demand fifo");
        Ok(())
    }

    /// Binds an unowned FIFO to `session_id` and resets it for a fresh user.
    ///
    /// Fails with `NoSuchFifo`, after undoing the driver open, when the FIFO was freed meanwhile.
    pub(crate) fn fifo_open(&self, fifo: &Arc<UsbFifo>, session_id: u64) -> Result<()> {
        let access = fifo.direction().access();
        if fifo.is_open() {
            debug!(slot = fifo.slot(), "fifo is busy");
            return Err(UsbDevError::Busy);
        }
        fifo.set_close_zlp(false);

        fifo.methods().open(fifo, access)?;

        let mut state = fifo.lock_state();
        state.flags.remove(
            FifoFlags::SLEEPING
                | FifoFlags::ERROR
                | FifoFlags::COMPLETE
                | FifoFlags::SELECT
                | FifoFlags::FLUSHING,
        );
        state.async_target = None;
        state.watchers.clear();
        let linked = {
            let table = self.lock_table();
            let linked = table
                .entry(fifo.device_key())
                .and_then(|entry| entry.fifo(fifo.slot()))
                .is_some_and(|linked| Arc::ptr_eq(linked, fifo));
            if linked {
                fifo.set_owner_locked(session_id);
            }
            linked
        };
        if !linked {
            drop(state);
            debug!(slot = fifo.slot(), "fifo freed during open");
            fifo.methods().close(fifo, access);
            return Err(UsbDevError::NoSuchFifo);
        }
        FifoIo::new(fifo, &mut state).reset();
        debug!(slot = fifo.slot(), session = session_id, "fifo opened");
        Ok(())
    }

    /// Unbinds the owner. A TX FIFO first drains what was written unless it is in error; a
    /// pending signal stops that wait early.
    pub(crate) fn fifo_close(&self, fifo: &Arc<UsbFifo>, proc: Option<&dyn ProcessContext>) {
        if !fifo.is_open() {
            return;
        }
        let dir = fifo.direction();

        let mut state = fifo.lock_state();
        {
            let _table = self.lock_table();
            fifo.set_owner_locked(0);
        }
        if state.flags.contains(FifoFlags::SELECT) {
            fifo.notify_watchers_locked(&state);
            state.flags.remove(FifoFlags::SELECT);
        }
        if let Some(target) = state.async_target.take() {
            target.post_sigio();
        }

        match dir {
            FifoDirection::Tx => {
                if !state.flags.contains(FifoFlags::ERROR) {
                    state.flags.insert(FifoFlags::FLUSHING);
                    if state.flags.contains(FifoFlags::HAVE_FRAGMENT) {
                        state.flags.remove(FifoFlags::HAVE_FRAGMENT);
                        if let Some(m) = state.pool.dequeue_free() {
                            state.pool.enqueue_used(m);
                        }
                    }
                    fifo.methods().start_write(&mut FifoIo::new(fifo, &mut state));

                    while state.flags.contains(FifoFlags::FLUSHING)
                        && !state.flags.contains(FifoFlags::ERROR)
                    {
                        let (guard, res) = fifo.sleep(state, proc);
                        state = guard;
                        if res.is_err() {
                            debug!(slot = fifo.slot(), "signal received while flushing");
                            break;
                        }
                    }
                }
                fifo.methods().stop_write(&mut FifoIo::new(fifo, &mut state));
            }
            FifoDirection::Rx => {
                fifo.methods().stop_read(&mut FifoIo::new(fifo, &mut state));
            }
        }

        if state.flags.contains(FifoFlags::SLEEPING) {
            warn!(slot = fifo.slot(), "sleeping on fifo at close");
        }
        drop(state);

        fifo.methods().close(fifo, dir.access());
        debug!(slot = fifo.slot(), "fifo closed");
    }

    /// Unlinks `fifo` and waits until nobody else references it, then closes it.
    pub(crate) fn fifo_free(&self, fifo: &Arc<UsbFifo>) {
        let aliases = std::mem::take(
            &mut *fifo
                .aliases
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for id in aliases.into_iter().flatten() {
            self.symlinks.free(id);
        }

        let mut table = self.lock_table();
        if fifo.refcount() == 0 {
            trace!(slot = fifo.slot(), "fifo already freed");
            return;
        }
        let slot = table
            .entry_mut(fifo.device_key())
            .and_then(|entry| entry.fifos.get_mut(fifo.slot()));
        match slot {
            Some(slot) if slot.as_ref().is_some_and(|linked| Arc::ptr_eq(linked, fifo)) => {
                *slot = None;
            }
            _ => warn!(slot = fifo.slot(), "fifo has not been linked"),
        }

        if fifo.ref_dec_locked() != 0 {
            loop {
                drop(table);
                {
                    let mut state = fifo.lock_state();
                    state.flags.insert(FifoFlags::ERROR);
                    fifo.signal_locked(&mut state);
                }
                table = self.lock_table();
                if fifo.refcount() == 0 {
                    break;
                }
                trace!(refcount = fifo.refcount(), "waiting for fifo references");
                table = self
                    .fifo_drain
                    .wait(table)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if fifo.refcount() == 0 {
                    break;
                }
            }
        }
        drop(table);

        self.fifo_close(fifo, None);
        debug!(slot = fifo.slot(), "fifo freed");
    }
}

/// Two-pass search for a slot pair serving endpoint `ep`.
///
/// Pass one only takes pairs whose FIFOs already serve `ep`; pass two also takes empty slots.
/// Returns the pair index, whether an owned matching FIFO was seen, and whether pass two won.
fn search_slot_pair(
    entry: &DeviceEntry,
    fifo_max: usize,
    ep: u8,
    is_tx: bool,
    is_rx: bool,
) -> Result<(usize, bool, bool)> {
    let mut no_null = true;
    let mut is_busy = false;
    let mut n = 0;
    loop {
        if n >= fifo_max {
            if no_null {
                no_null = false;
                n = 0;
            } else {
                debug!(ep, "out of fifos");
                return Err(UsbDevError::OutOfFifos);
            }
        }
        let fits = |slot: usize, is_busy: &mut bool| match entry.fifo(slot) {
            Some(fifo) if fifo.dev_ep_index() != Some(ep) => false,
            Some(fifo) if fifo.is_open() => {
                *is_busy = true;
                false
            }
            Some(_) => true,
            None => !no_null,
        };
        if is_tx && !fits(n + FIFO_TX, &mut is_busy) {
            n += 2;
            continue;
        }
        if is_rx && !fits(n + FIFO_RX, &mut is_busy) {
            n += 2;
            continue;
        }
        return Ok((n, is_busy, !no_null));
    }
}
