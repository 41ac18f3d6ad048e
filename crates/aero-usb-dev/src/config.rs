use std::time::Duration;

use crate::error::{Result, UsbDevError};

/// Number of FIFO slots per device. Even slots are TX, odd slots are RX.
pub const DEFAULT_FIFO_MAX: usize = 128;
/// Endpoint address space (16 addresses, two directions).
pub const DEFAULT_EP_MAX: u8 = 32;
pub const DEFAULT_DEV_REF_MAX: u32 = 255;
pub const DEFAULT_FIFO_REF_MAX: u32 = u32::MAX;
pub const DEFAULT_MAX_BUSES: usize = 16;
pub const DEFAULT_MAX_DEVICES: usize = 128;

/// Tunables for a [`crate::UsbDevRegistry`].
#[derive(Debug, Clone)]
pub struct UsbDevConfig {
    /// Bus indices accepted by [`crate::UsbDevRegistry::attach_device`].
    pub max_buses: usize,
    /// Device indices accepted per bus.
    pub max_devices: usize,
    /// FIFO slots per device. Must be even and non-zero.
    pub fifo_max: usize,
    /// Endpoint address space. On-demand FIFOs are only created for endpoints below half of it.
    pub ep_max: u8,
    /// Saturation point of the per-device reference count.
    pub dev_ref_max: u32,
    /// Saturation point of the per-FIFO reference count.
    pub fifo_ref_max: u32,
    /// Sleep between re-enumeration checks in the ioctl path.
    pub reenum_poll_interval: Duration,
    /// Upper bound on a single condition wait before the caller's signal state is rechecked.
    pub signal_poll_interval: Duration,
}

impl Default for UsbDevConfig {
    fn default() -> Self {
        Self {
            max_buses: DEFAULT_MAX_BUSES,
            max_devices: DEFAULT_MAX_DEVICES,
            fifo_max: DEFAULT_FIFO_MAX,
            ep_max: DEFAULT_EP_MAX,
            dev_ref_max: DEFAULT_DEV_REF_MAX,
            fifo_ref_max: DEFAULT_FIFO_REF_MAX,
            // hz / 128
            reenum_poll_interval: Duration::from_micros(7_812),
            signal_poll_interval: Duration::from_millis(10),
        }
    }
}

impl UsbDevConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fifo_max == 0 || self.fifo_max % 2 != 0 {
            return Err(UsbDevError::InvalidConfig("fifo_max must be even and non-zero"));
        }
        if self.fifo_max > usize::from(u8::MAX) + 1 {
            return Err(UsbDevError::InvalidConfig("fifo_max must fit a u8 slot index"));
        }
        if self.max_buses == 0 || self.max_devices == 0 {
            return Err(UsbDevError::InvalidConfig("bus and device limits must be non-zero"));
        }
        if self.ep_max < 2 {
            return Err(UsbDevError::InvalidConfig("ep_max must cover the control endpoint"));
        }
        if self.dev_ref_max == 0 || self.fifo_ref_max < 2 {
            return Err(UsbDevError::InvalidConfig("reference limits are too small"));
        }
        if self.signal_poll_interval.is_zero() {
            return Err(UsbDevError::InvalidConfig("signal_poll_interval must be non-zero"));
        }
        Ok(())
    }
}
