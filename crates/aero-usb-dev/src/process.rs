//! What this layer needs to know about the calling process.

use std::fmt;

/// Contract of the process issuing a call.
///
/// Blocking waits poll [`ProcessContext::signal_pending`] so a signal aborts them with
/// `Interrupted`. A process registered through `FIOASYNC` receives SIGIO on every FIFO wakeup.
pub trait ProcessContext: Send + Sync + fmt::Debug {
    fn pid(&self) -> u32;

    /// Process group id, checked by `TIOCSPGRP`.
    fn pgid(&self) -> i32;

    fn signal_pending(&self) -> bool {
        false
    }

    /// Delivers SIGIO. Must not block or call back into this crate.
    fn post_sigio(&self) {}

    /// Whether the process may change global settings.
    fn is_privileged(&self) -> bool {
        false
    }
}
