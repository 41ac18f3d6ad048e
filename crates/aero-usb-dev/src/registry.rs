use std::sync::Arc;

use tracing::debug;

use crate::attach::{FifoAttachRequest, FifoSc};
use crate::broker::RefCore;
use crate::cdev::{self, UsbDevFile};
use crate::config::UsbDevConfig;
use crate::control::UsbControl;
use crate::device::{DeviceKey, UsbDevice, UsbDeviceDesc};
use crate::error::Result;
use crate::fifo::UsbFifo;
use crate::location::{AccessMode, DevNode};
use crate::process::ProcessContext;

/// Owner of the device table and entry point for everything above the USB stack.
///
/// Enumeration code attaches and detaches devices; class drivers attach FIFO pairs; the file layer
/// opens nodes and gets [`UsbDevFile`] handles back.
pub struct UsbDevRegistry {
    core: Arc<RefCore>,
    control: UsbControl,
}

impl std::fmt::Debug for UsbDevRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbDevRegistry")
            .field("config", &self.core.config)
            .finish_non_exhaustive()
    }
}

impl UsbDevRegistry {
    pub fn new(config: UsbDevConfig) -> Result<Self> {
        config.validate()?;
        let core = Arc::new(RefCore::new(config));
        Ok(Self {
            control: UsbControl::new(Arc::clone(&core)),
            core,
        })
    }

    pub fn config(&self) -> &UsbDevConfig {
        &self.core.config
    }

    pub fn attach_device(&self, bus: u8, dev: u8, desc: UsbDeviceDesc) -> Result<Arc<UsbDevice>> {
        let device = Arc::new(UsbDevice::new(DeviceKey { bus, dev }, desc));
        self.core.insert_device(Arc::clone(&device))?;
        Ok(device)
    }

    /// Removes a device.
    ///
    /// Every FIFO still linked is freed, which fails blocked I/O with `Io`. Returns once no
    /// reference to the device remains; from then on any acquisition fails with `NoSuchDevice`.
    pub fn detach_device(&self, bus: u8, dev: u8) -> Result<()> {
        let key = DeviceKey { bus, dev };
        let device = self.core.mark_detached(key)?;
        {
            let _enum = device.lock_enumeration();
            for fifo in self.core.linked_fifos(key) {
                self.core.fifo_free(&fifo);
            }
        }
        self.core.drain_and_remove(key);
        debug!(bus, dev, "device detached");
        Ok(())
    }

    pub fn device(&self, bus: u8, dev: u8) -> Option<Arc<UsbDevice>> {
        self.core.device(DeviceKey { bus, dev })
    }

    /// References currently held on a device, including the one held by the attach.
    pub fn device_refcount(&self, bus: u8, dev: u8) -> Option<u32> {
        self.core.device_refcount(DeviceKey { bus, dev })
    }

    pub fn fifo(&self, bus: u8, dev: u8, slot: usize) -> Option<Arc<UsbFifo>> {
        self.core.fifo(DeviceKey { bus, dev }, slot)
    }

    pub fn open(
        &self,
        node: &DevNode,
        access: AccessMode,
        proc: &Arc<dyn ProcessContext>,
    ) -> Result<UsbDevFile> {
        cdev::open(&self.core, node, access, proc)
    }

    /// Registers a driver FIFO pair on an attached device and publishes its names.
    pub fn fifo_attach(&self, device: &UsbDevice, req: FifoAttachRequest) -> Result<FifoSc> {
        self.core.fifo_attach(device.key(), req)
    }

    pub fn fifo_detach(&self, sc: FifoSc) {
        self.core.fifo_detach(sc);
    }

    pub fn control(&self) -> &UsbControl {
        &self.control
    }

    /// Currently published alias names.
    pub fn symlinks(&self) -> Vec<String> {
        self.core.symlinks.names()
    }
}
