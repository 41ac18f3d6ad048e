//! USB character-device FIFO layer.
//!
//! Bridges file handles to USB endpoint transfer queues:
//!
//! - [`UsbDevRegistry`]: device table, node open, driver FIFO registration and device removal
//! - [`UsbDevFile`]: an open handle with blocking/non-blocking `read`, `write`, `ioctl` and event
//!   registration; closing runs exactly once
//! - [`UsbFifo`]: one direction of a channel, with its buffer pool and the producer/consumer calls
//!   a transfer engine uses ([`UsbFifo::put_data`], [`UsbFifo::get_data`], ...)
//! - [`FifoMethods`]: the driver callbacks behind a FIFO
//! - [`UsbControl`]: the static control node (alias listing, template, quirk pass-through)
//!
//! Concurrency: a global reference lock guards the device table, FIFO owners and reference
//! counts; each FIFO has a private lock for its queues and flags. Device removal flags every FIFO
//! in error, wakes all waiters and waits for outstanding references before returning.

mod attach;
mod broker;
mod cdev;
mod config;
mod control;
mod device;
mod error;
mod fifo;
mod location;
mod mbuf;
mod methods;
mod process;
mod registry;
mod session;
mod symlink;
mod uio;

pub use attach::{FifoAttachRequest, FifoName, FifoSc, FIFO_NAMES_MAX};
pub use cdev::{
    EventFilter, EventRegistration, EventStatus, UsbDevFile, FIOASYNC, FIODTYPE, FIONBIO,
    TIOCSPGRP,
};
pub use config::{
    UsbDevConfig, DEFAULT_DEV_REF_MAX, DEFAULT_EP_MAX, DEFAULT_FIFO_MAX, DEFAULT_FIFO_REF_MAX,
    DEFAULT_MAX_BUSES, DEFAULT_MAX_DEVICES,
};
pub use control::{ControlRequest, QuirkHandler, QuirkOp, UsbControl};
pub use device::{
    DeviceKey, EnumGuard, Endpoint, ReEnumState, UsbDevice, UsbDeviceDesc, UsbMode, UE_DIR_IN,
    UE_DIR_OUT,
};
pub use error::{Result, UsbDevError};
pub use fifo::{EventWatcher, FifoFlags, FifoIo, UsbFifo};
pub use location::{
    AccessMode, DevLocation, DevNode, FifoDirection, IoFlags, NodeOwnership, FIFO_RX, FIFO_TX,
};
pub use mbuf::Mbuf;
pub use methods::{FifoMethods, NullMethods, PageCache};
pub use process::ProcessContext;
pub use registry::UsbDevRegistry;
pub use symlink::{AliasId, SymlinkRegistry, SYMLINK_NAME_MAX};
pub use uio::{ReadUio, Uio, WriteUio};

#[cfg(all(test, not(target_arch = "wasm32")))]
mod proptests;
