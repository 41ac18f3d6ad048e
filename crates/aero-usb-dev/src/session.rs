//! Per-open state of a handle.

use crate::device::DeviceKey;
use crate::location::{AccessMode, DevLocation};

/// Created when a node is opened and destroyed by the handle's teardown.
///
/// The location and access mode are fixed once open returns, so they are read without locks. The
/// id doubles as the owner identity stored in FIFOs.
#[derive(Debug)]
pub struct Session {
    id: u64,
    location: DevLocation,
    access: AccessMode,
}

impl Session {
    pub(crate) fn new(id: u64, location: DevLocation) -> Self {
        Self {
            id,
            location,
            access: AccessMode::empty(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn location(&self) -> DevLocation {
        self.location
    }

    /// Directions this handle was opened for. Empty while open is still resolving FIFOs.
    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn device_key(&self) -> DeviceKey {
        DeviceKey {
            bus: self.location.bus_index,
            dev: self.location.dev_index,
        }
    }

    pub(crate) fn set_access(&mut self, access: AccessMode) {
        self.access = access;
    }

    pub(crate) fn set_fifo_index(&mut self, fifo_index: u8) {
        self.location.fifo_index = fifo_index;
    }
}
