//! Per-device state shared by every FIFO of a USB device.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::location::FifoDirection;
use crate::methods::{FifoMethods, NullMethods};

/// Endpoint address direction bit.
pub const UE_DIR_IN: u8 = 0x80;
pub const UE_DIR_OUT: u8 = 0x00;

/// Arena key of a device: its bus and its index on that bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub bus: u8,
    pub dev: u8,
}

/// Which side of the link this stack plays for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UsbMode {
    #[default]
    Host,
    Device,
}

/// An endpoint described by the device's active configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Address including the direction bit.
    pub address: u8,
    pub iface_index: u8,
}

impl Endpoint {
    /// The default control endpoint.
    pub const CONTROL: Endpoint = Endpoint {
        address: 0,
        iface_index: 0,
    };
}

/// Re-enumeration progress. Ioctls that trigger one wait for `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ReEnumState {
    #[default]
    Done = 0,
    Start = 1,
    PowerOff = 2,
    SetConfig = 3,
}

impl ReEnumState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ReEnumState::Start,
            2 => ReEnumState::PowerOff,
            3 => ReEnumState::SetConfig,
            _ => ReEnumState::Done,
        }
    }
}

/// What the enumeration code knows about a device when it is attached.
#[derive(Clone)]
pub struct UsbDeviceDesc {
    pub mode: UsbMode,
    /// Non-control endpoints of the active configuration.
    pub endpoints: Vec<Endpoint>,
    /// Driver behind FIFOs created on demand for this device's endpoints.
    pub generic_methods: Arc<dyn FifoMethods>,
}

impl Default for UsbDeviceDesc {
    fn default() -> Self {
        Self {
            mode: UsbMode::Host,
            endpoints: Vec::new(),
            generic_methods: Arc::new(NullMethods),
        }
    }
}

impl fmt::Debug for UsbDeviceDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbDeviceDesc")
            .field("mode", &self.mode)
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

pub struct UsbDevice {
    key: DeviceKey,
    mode: UsbMode,
    endpoints: Vec<Endpoint>,
    generic_methods: Arc<dyn FifoMethods>,
    enum_lock: EnumLock,
    re_enumerate: AtomicU8,
}

impl fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbDevice")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("endpoints", &self.endpoints)
            .field("re_enumerate", &self.re_enumerate_state())
            .finish_non_exhaustive()
    }
}

impl UsbDevice {
    pub(crate) fn new(key: DeviceKey, desc: UsbDeviceDesc) -> Self {
        Self {
            key,
            mode: desc.mode,
            endpoints: desc.endpoints,
            generic_methods: desc.generic_methods,
            enum_lock: EnumLock::default(),
            re_enumerate: AtomicU8::new(ReEnumState::Done as u8),
        }
    }

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    pub fn mode(&self) -> UsbMode {
        self.mode
    }

    pub(crate) fn generic_methods(&self) -> &Arc<dyn FifoMethods> {
        &self.generic_methods
    }

    pub(crate) fn enum_lock(&self) -> &EnumLock {
        &self.enum_lock
    }

    /// Holds the enumeration lock until the guard drops, as enumeration code does while it
    /// reconfigures the device.
    pub fn lock_enumeration(&self) -> EnumGuard<'_> {
        let do_unlock = self.enum_lock.lock();
        EnumGuard {
            lock: &self.enum_lock,
            do_unlock,
        }
    }

    pub fn re_enumerate_state(&self) -> ReEnumState {
        ReEnumState::from_u8(self.re_enumerate.load(Ordering::Acquire))
    }

    pub fn set_re_enumerate_state(&self, state: ReEnumState) {
        self.re_enumerate.store(state as u8, Ordering::Release);
    }

    pub fn endpoint_by_addr(&self, address: u8) -> Option<Endpoint> {
        if address == 0 {
            return Some(Endpoint::CONTROL);
        }
        self.endpoints.iter().copied().find(|ep| ep.address == address)
    }

    /// Endpoint backing an on-demand FIFO of direction `dir` on endpoint index `ep_index`.
    ///
    /// RX maps to IN in host mode and to OUT in device mode; TX is the opposite.
    pub fn get_ep(&self, ep_index: u8, dir: FifoDirection) -> Option<Endpoint> {
        if ep_index == 0 {
            return Some(Endpoint::CONTROL);
        }
        let ep_dir = match (dir, self.mode) {
            (FifoDirection::Rx, UsbMode::Host) | (FifoDirection::Tx, UsbMode::Device) => UE_DIR_IN,
            (FifoDirection::Rx, UsbMode::Device) | (FifoDirection::Tx, UsbMode::Host) => UE_DIR_OUT,
        };
        self.endpoint_by_addr(ep_index | ep_dir)
    }
}

/// Sleepable, recursion-aware exclusive lock serialising enumeration against opens and ioctls.
///
/// Lock and unlock are separate calls because a reference snapshot keeps the lock across calls on
/// one thread.
#[derive(Debug, Default)]
pub(crate) struct EnumLock {
    owner: Mutex<Option<ThreadId>>,
    cv: Condvar,
}

impl EnumLock {
    /// Returns `false` when the calling thread already holds the lock.
    pub(crate) fn lock(&self) -> bool {
        let me = thread::current().id();
        let mut owner = self
            .owner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *owner == Some(me) {
            return false;
        }
        while owner.is_some() {
            owner = self
                .cv
                .wait(owner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *owner = Some(me);
        true
    }

    pub(crate) fn unlock(&self) {
        let mut owner = self
            .owner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        debug_assert_eq!(*owner, Some(thread::current().id()));
        *owner = None;
        self.cv.notify_all();
    }

    pub(crate) fn is_owned(&self) -> bool {
        let owner = self
            .owner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *owner == Some(thread::current().id())
    }
}

pub struct EnumGuard<'a> {
    lock: &'a EnumLock,
    do_unlock: bool,
}

impl Drop for EnumGuard<'_> {
    fn drop(&mut self) {
        if self.do_unlock {
            self.lock.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn device(mode: UsbMode) -> UsbDevice {
        UsbDevice::new(
            DeviceKey { bus: 0, dev: 2 },
            UsbDeviceDesc {
                mode,
                endpoints: vec![
                    Endpoint {
                        address: 0x81,
                        iface_index: 0,
                    },
                    Endpoint {
                        address: 0x02,
                        iface_index: 1,
                    },
                ],
                ..UsbDeviceDesc::default()
            },
        )
    }

    #[test]
    fn host_mode_reads_from_in_endpoints() {
        let dev = device(UsbMode::Host);
        assert_eq!(dev.get_ep(1, FifoDirection::Rx).unwrap().address, 0x81);
        assert!(dev.get_ep(1, FifoDirection::Tx).is_none());
        assert_eq!(dev.get_ep(2, FifoDirection::Tx).unwrap().iface_index, 1);
        assert_eq!(dev.get_ep(0, FifoDirection::Tx), Some(Endpoint::CONTROL));
    }

    #[test]
    fn device_mode_flips_directions() {
        let dev = device(UsbMode::Device);
        assert_eq!(dev.get_ep(1, FifoDirection::Tx).unwrap().address, 0x81);
        assert_eq!(dev.get_ep(2, FifoDirection::Rx).unwrap().address, 0x02);
        assert!(dev.get_ep(3, FifoDirection::Rx).is_none());
    }

    #[test]
    fn enum_lock_is_recursion_aware() {
        let lock = EnumLock::default();
        assert!(lock.lock());
        assert!(!lock.lock());
        assert!(lock.is_owned());
        lock.unlock();
        assert!(!lock.is_owned());
    }

    #[test]
    fn enum_lock_excludes_other_threads() {
        let dev = Arc::new(device(UsbMode::Host));
        let guard = dev.lock_enumeration();
        let entered = Arc::new(AtomicBool::new(false));
        let t = {
            let dev = Arc::clone(&dev);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _g = dev.lock_enumeration();
                entered.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!entered.load(Ordering::SeqCst));
        drop(guard);
        t.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn re_enumerate_state_round_trips() {
        let dev = device(UsbMode::Host);
        assert_eq!(dev.re_enumerate_state(), ReEnumState::Done);
        dev.set_re_enumerate_state(ReEnumState::PowerOff);
        assert_eq!(dev.re_enumerate_state(), ReEnumState::PowerOff);
    }
}
