//! Addressing for USB character devices.
//!
//! A [`DevLocation`] is the stable key a device node carries: it names the bus, the device on that
//! bus and either an endpoint address (on-demand FIFOs) or a preallocated FIFO slot pair
//! (driver-registered FIFOs). Lookups through a location never hold a reference on their own.

use bitflags::bitflags;

bitflags! {
    /// Directions a handle is opened for, or a node permits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessMode: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
    }
}

bitflags! {
    /// Per-call I/O flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IoFlags: u32 {
        /// Return `WouldBlock` (or a short count) instead of sleeping.
        const NONBLOCK = 0x4;
    }
}

/// Offset of the transmit FIFO within a slot pair.
pub const FIFO_TX: usize = 0;
/// Offset of the receive FIFO within a slot pair.
pub const FIFO_RX: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FifoDirection {
    Tx,
    Rx,
}

impl FifoDirection {
    pub fn of_slot(slot: usize) -> Self {
        if slot & 1 == FIFO_TX {
            FifoDirection::Tx
        } else {
            FifoDirection::Rx
        }
    }

    pub fn slot_offset(self) -> usize {
        match self {
            FifoDirection::Tx => FIFO_TX,
            FifoDirection::Rx => FIFO_RX,
        }
    }

    /// Access mode a handle needs to use a FIFO of this direction.
    pub fn access(self) -> AccessMode {
        match self {
            FifoDirection::Tx => AccessMode::WRITE,
            FifoDirection::Rx => AccessMode::READ,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevLocation {
    pub bus_index: u8,
    pub dev_index: u8,
    /// Endpoint index for on-demand FIFOs, `None` for a preallocated slot pair.
    pub ep_addr: Option<u8>,
    /// First slot of the FIFO pair. Rewritten by the on-demand slot search during open.
    pub fifo_index: u8,
}

impl DevLocation {
    pub fn endpoint(bus_index: u8, dev_index: u8, ep_addr: u8) -> Self {
        Self {
            bus_index,
            dev_index,
            ep_addr: Some(ep_addr),
            fifo_index: 0,
        }
    }

    pub fn preallocated(bus_index: u8, dev_index: u8, fifo_index: u8) -> Self {
        Self {
            bus_index,
            dev_index,
            ep_addr: None,
            fifo_index,
        }
    }

    pub fn slot(&self, dir: FifoDirection) -> usize {
        usize::from(self.fifo_index) + dir.slot_offset()
    }
}

/// Ownership and permission bits of a published node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeOwnership {
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
}

impl Default for NodeOwnership {
    fn default() -> Self {
        // root:operator 0660
        Self {
            uid: 0,
            gid: 5,
            mode: 0o660,
        }
    }
}

/// A device node handed to [`crate::UsbDevRegistry::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevNode {
    pub name: String,
    pub location: DevLocation,
    /// Directions this node may be opened for.
    pub permitted: AccessMode,
    pub ownership: NodeOwnership,
}

impl DevNode {
    /// Generic node for one endpoint of a device, e.g. `ugen0.2.1`.
    pub fn for_endpoint(bus_index: u8, dev_index: u8, ep_addr: u8, permitted: AccessMode) -> Self {
        Self {
            name: format!("ugen{bus_index}.{dev_index}.{ep_addr}"),
            location: DevLocation::endpoint(bus_index, dev_index, ep_addr),
            permitted,
            ownership: NodeOwnership::default(),
        }
    }
}
