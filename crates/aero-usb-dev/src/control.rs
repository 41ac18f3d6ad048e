//! The static control node.
//!
//! Unlike the per-device nodes it has no FIFOs behind it: it lists published aliases, holds the
//! global device-side template selector and forwards quirk table requests.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::broker::RefCore;
use crate::error::{Result, UsbDevError};
use crate::process::ProcessContext;
use crate::uio::Uio;

/// Quirk table requests passed through to a [`QuirkHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuirkOp {
    DevQuirkGet,
    QuirkNameGet,
    DevQuirkAdd,
    DevQuirkRemove,
}

/// Owner of the quirk table. Checks privilege for mutating requests itself.
pub trait QuirkHandler: Send + Sync {
    fn quirk_ioctl(&self, op: QuirkOp, data: &mut [u8], proc: &dyn ProcessContext) -> Result<()>;
}

/// A request to the control node.
pub enum ControlRequest<'a> {
    ReadDir {
        start_entry: u32,
        uio: &'a mut dyn Uio,
    },
    GetTemplate(&'a mut i32),
    SetTemplate(i32),
    Quirk {
        op: QuirkOp,
        data: &'a mut [u8],
    },
    /// Any other command code.
    Other(u64),
}

pub struct UsbControl {
    core: Arc<RefCore>,
    template: AtomicI32,
    quirks: RwLock<Option<Arc<dyn QuirkHandler>>>,
}

impl fmt::Debug for UsbControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbControl")
            .field("template", &self.template())
            .finish_non_exhaustive()
    }
}

impl UsbControl {
    pub(crate) fn new(core: Arc<RefCore>) -> Self {
        Self {
            core,
            template: AtomicI32::new(0),
            quirks: RwLock::new(None),
        }
    }

    pub fn ioctl(&self, req: ControlRequest<'_>, proc: &dyn ProcessContext) -> Result<()> {
        match req {
            ControlRequest::ReadDir { start_entry, uio } => self.read_dir(start_entry, uio),
            ControlRequest::GetTemplate(out) => {
                *out = self.template();
                Ok(())
            }
            ControlRequest::SetTemplate(value) => self.set_template(value, proc),
            ControlRequest::Quirk { op, data } => self.quirk(op, data, proc),
            ControlRequest::Other(cmd) => {
                debug!(cmd, "unknown control request");
                Err(UsbDevError::NotSupported)
            }
        }
    }

    /// Lists published aliases; see [`crate::SymlinkRegistry::read_dir`] for the format.
    pub fn read_dir(&self, start_entry: u32, uio: &mut dyn Uio) -> Result<()> {
        self.core.symlinks.read_dir(start_entry, uio)
    }

    pub fn template(&self) -> i32 {
        self.template.load(Ordering::Relaxed)
    }

    pub fn set_template(&self, value: i32, proc: &dyn ProcessContext) -> Result<()> {
        if !proc.is_privileged() {
            return Err(UsbDevError::PermissionDenied);
        }
        self.template.store(value, Ordering::Relaxed);
        debug!(value, pid = proc.pid(), "template changed");
        Ok(())
    }

    pub fn set_quirk_handler(&self, handler: Option<Arc<dyn QuirkHandler>>) {
        *self
            .quirks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = handler;
    }

    pub fn quirk(&self, op: QuirkOp, data: &mut [u8], proc: &dyn ProcessContext) -> Result<()> {
        let handler = self
            .quirks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match handler {
            Some(handler) => handler.quirk_ioctl(op, data, proc),
            None => Err(UsbDevError::NotSupported),
        }
    }
}
