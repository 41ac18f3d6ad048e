use thiserror::Error;

pub type Result<T> = std::result::Result<T, UsbDevError>;

/// Errors surfaced by the USB character-device layer.
///
/// Every variant maps onto a classic errno value via [`UsbDevError::errno`] so a file-handle layer
/// sitting on top of this crate can report failures the way userland tooling expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UsbDevError {
    #[error("no such device")]
    NoSuchDevice,

    #[error("no such fifo")]
    NoSuchFifo,

    #[error("fifo is owned by another session")]
    NotOwner,

    #[error("resource busy")]
    Busy,

    #[error("reference count limit reached")]
    RefLimitExceeded,

    #[error("operation would block")]
    WouldBlock,

    #[error("interrupted by signal")]
    Interrupted,

    /// Permanent transport failure, typically device removal. Sticky until the handle is reopened.
    #[error("i/o error")]
    Io,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("permission denied")]
    PermissionDenied,

    /// A driver did not recognise an ioctl; the next handler in the chain gets a turn.
    #[error("ioctl not handled")]
    Unhandled,

    #[error("operation not supported")]
    NotSupported,

    #[error("out of fifo slots")]
    OutOfFifos,

    #[error("bad address")]
    Fault,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl UsbDevError {
    /// Errno value reported to userland for this error.
    pub fn errno(&self) -> i32 {
        match self {
            UsbDevError::NoSuchDevice | UsbDevError::NoSuchFifo | UsbDevError::NotOwner => ENXIO,
            UsbDevError::Busy => EBUSY,
            UsbDevError::RefLimitExceeded => EAGAIN,
            UsbDevError::WouldBlock => EAGAIN,
            UsbDevError::Interrupted => EINTR,
            UsbDevError::Io => EIO,
            UsbDevError::InvalidArgument | UsbDevError::InvalidConfig(_) => EINVAL,
            UsbDevError::PermissionDenied => EPERM,
            UsbDevError::Unhandled => ENOIOCTL,
            UsbDevError::NotSupported => ENOTTY,
            UsbDevError::OutOfFifos => ENOMEM,
            UsbDevError::Fault => EFAULT,
        }
    }

    /// Whether bytes already moved by a read/write survive this error as a short count.
    pub(crate) fn keeps_partial(&self) -> bool {
        matches!(
            self,
            UsbDevError::Interrupted | UsbDevError::WouldBlock | UsbDevError::Fault
        )
    }
}

pub const EPERM: i32 = 1;
pub const EINTR: i32 = 4;
pub const EIO: i32 = 5;
pub const ENXIO: i32 = 6;
pub const EAGAIN: i32 = 35;
pub const ENOMEM: i32 = 12;
pub const EFAULT: i32 = 14;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const ENOTTY: i32 = 25;
/// Kernel-internal "ioctl not handled here" marker.
pub const ENOIOCTL: i32 = -3;
