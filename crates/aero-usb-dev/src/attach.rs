//! Driver-registered duplex FIFOs.
//!
//! A class driver (printer, HID, serial, ...) registers a TX/RX pair with its own
//! [`FifoMethods`] and gets device nodes named after its unit, e.g. `ulpt0` or `uhid1.2`. The
//! names are also published as aliases in the control node's directory listing.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::broker::RefCore;
use crate::device::{DeviceKey, UsbDevice};
use crate::error::{Result, UsbDevError};
use crate::fifo::{FifoParams, UsbFifo};
use crate::location::{AccessMode, DevLocation, DevNode, NodeOwnership, FIFO_RX, FIFO_TX};
use crate::methods::FifoMethods;
use crate::symlink::truncate_name;

/// Number of `(basename, postfix)` name pairs a driver may publish.
pub const FIFO_NAMES_MAX: usize = 4;

/// Naming for one published node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FifoName {
    pub basename: String,
    pub postfix: String,
}

impl FifoName {
    pub fn new(basename: impl Into<String>) -> Self {
        Self {
            basename: basename.into(),
            postfix: String::new(),
        }
    }

    pub fn with_postfix(basename: impl Into<String>, postfix: impl Into<String>) -> Self {
        Self {
            basename: basename.into(),
            postfix: postfix.into(),
        }
    }
}

pub struct FifoAttachRequest {
    pub methods: Arc<dyn FifoMethods>,
    pub softc: Option<Arc<dyn Any + Send + Sync>>,
    /// Entry `n` publishes an alias owned by TX (even `n`) or RX (odd `n`). Empty entries are
    /// skipped.
    pub names: [Option<FifoName>; FIFO_NAMES_MAX],
    pub unit: u16,
    pub subunit: Option<u16>,
    pub iface_index: u8,
    pub ownership: NodeOwnership,
}

impl FifoAttachRequest {
    pub fn new(methods: Arc<dyn FifoMethods>, name: FifoName, unit: u16) -> Self {
        Self {
            methods,
            softc: None,
            names: [Some(name), None, None, None],
            unit,
            subunit: None,
            iface_index: 0,
            ownership: NodeOwnership::default(),
        }
    }

    fn node_name(&self, name: &FifoName) -> String {
        let full = match self.subunit {
            None => format!("{}{}{}", name.basename, self.unit, name.postfix),
            Some(subunit) => format!(
                "{}{}.{}{}",
                name.basename, self.unit, subunit, name.postfix
            ),
        };
        truncate_name(&full)
    }
}

impl fmt::Debug for FifoAttachRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoAttachRequest")
            .field("names", &self.names)
            .field("unit", &self.unit)
            .field("subunit", &self.subunit)
            .field("iface_index", &self.iface_index)
            .field("ownership", &self.ownership)
            .finish_non_exhaustive()
    }
}

/// What a driver keeps after [`crate::UsbDevRegistry::fifo_attach`]; hand it back to detach.
#[derive(Debug)]
pub struct FifoSc {
    tx: Arc<UsbFifo>,
    rx: Arc<UsbFifo>,
    nodes: Vec<DevNode>,
}

impl FifoSc {
    pub fn tx(&self) -> &Arc<UsbFifo> {
        &self.tx
    }

    pub fn rx(&self) -> &Arc<UsbFifo> {
        &self.rx
    }

    /// Device nodes created for the pair, one per published name.
    pub fn nodes(&self) -> &[DevNode] {
        &self.nodes
    }
}

impl RefCore {
    /// Runs under the device's enumeration lock, serialized against opens.
    pub(crate) fn fifo_attach(&self, key: DeviceKey, req: FifoAttachRequest) -> Result<FifoSc> {
        let device = self.device(key).ok_or(UsbDevError::NoSuchDevice)?;
        let _enum = device.lock_enumeration();
        let signal_poll = self.signal_poll();
        let make = |slot: usize| {
            Arc::new(UsbFifo::new(FifoParams {
                slot,
                device: key,
                dev_ep_index: None,
                iface_index: req.iface_index,
                methods: Arc::clone(&req.methods),
                softc: req.softc.clone(),
                signal_poll,
            }))
        };

        let (n, tx, rx) = {
            let mut table = self.lock_table();
            let entry = match table.entry_mut(key) {
                Some(entry) if !entry.detached => entry,
                _ => return Err(UsbDevError::NoSuchDevice),
            };
            let n = (0..self.config.fifo_max)
                .step_by(2)
                .find(|&n| {
                    entry.fifos[n + FIFO_TX].is_none() && entry.fifos[n + FIFO_RX].is_none()
                })
                .ok_or(UsbDevError::OutOfFifos)?;
            let tx = make(n + FIFO_TX);
            let rx = make(n + FIFO_RX);
            entry.fifos[n + FIFO_TX] = Some(Arc::clone(&tx));
            entry.fifos[n + FIFO_RX] = Some(Arc::clone(&rx));
            (n, tx, rx)
        };

        let mut nodes = Vec::new();
        for (i, name) in req.names.iter().enumerate() {
            let Some(name) = name else {
                continue;
            };
            let node_name = req.node_name(name);
            let alias = self.symlinks.alloc(&node_name);
            let owner = if i & 1 == 1 { &rx } else { &tx };
            owner
                .aliases
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())[i / 2] = Some(alias);

            nodes.push(DevNode {
                name: node_name,
                location: DevLocation::preallocated(key.bus, key.dev, n as u8),
                permitted: AccessMode::READ | AccessMode::WRITE,
                ownership: req.ownership,
            });
        }

        debug!(
            bus = key.bus,
            dev = key.dev,
            tx = tx.slot(),
            rx = rx.slot(),
            "attached fifo pair"
        );
        Ok(FifoSc { tx, rx, nodes })
    }

    /// Frees both FIFOs under the device's enumeration lock, so no open is half way through
    /// binding them. A device that is already gone freed them itself.
    pub(crate) fn fifo_detach(&self, sc: FifoSc) {
        let device = self.device(sc.tx.device_key());
        let _enum = device.as_deref().map(UsbDevice::lock_enumeration);
        self.fifo_free(&sc.tx);
        self.fifo_free(&sc.rx);
        debug!(tx = sc.tx.slot(), rx = sc.rx.slot(), "detached fifo pair");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UsbDevConfig;
    use crate::device::UsbDeviceDesc;
    use crate::methods::NullMethods;

    fn core() -> RefCore {
        let core = RefCore::new(UsbDevConfig {
            max_buses: 1,
            max_devices: 2,
            fifo_max: 4,
            ..UsbDevConfig::default()
        });
        let key = DeviceKey { bus: 0, dev: 1 };
        core.insert_device(Arc::new(UsbDevice::new(key, UsbDeviceDesc::default())))
            .unwrap();
        core
    }

    #[test]
    fn names_follow_unit_and_subunit() {
        let core = core();
        let mut req = FifoAttachRequest::new(Arc::new(NullMethods), FifoName::new("uhid"), 1);
        req.subunit = Some(2);
        req.names[1] = Some(FifoName::with_postfix("uhid", ".ctl"));
        let sc = core.fifo_attach(DeviceKey { bus: 0, dev: 1 }, req).unwrap();
        let names: Vec<_> = sc.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["uhid1.2", "uhid1.2.ctl"]);
        assert_eq!(core.symlinks.names(), ["uhid1.2", "uhid1.2.ctl"]);
        assert_eq!(sc.nodes()[0].location.ep_addr, None);
        assert_eq!(sc.tx().dev_ep_index(), None);

        core.fifo_detach(sc);
        assert!(core.symlinks.names().is_empty());
    }

    #[test]
    fn pairs_are_allocated_until_exhausted() {
        let core = core();
        let key = DeviceKey { bus: 0, dev: 1 };
        let attach = || {
            core.fifo_attach(
                key,
                FifoAttachRequest::new(Arc::new(NullMethods), FifoName::new("ulpt"), 0),
            )
        };
        let first = attach().unwrap();
        let second = attach().unwrap();
        assert_eq!((first.tx().slot(), first.rx().slot()), (0, 1));
        assert_eq!(second.nodes()[0].location.fifo_index, 2);
        assert_eq!(attach().unwrap_err(), UsbDevError::OutOfFifos);

        core.fifo_detach(first);
        assert_eq!(attach().unwrap().tx().slot(), 0);
    }
}
