//! PTY device (C6): forks a command under a pseudo-terminal and puts the
//! session's controlling terminal into raw mode for the duration.
//!
//! The old multi-backend split (local process vs. SSH tunnel) this crate
//! started from doesn't apply here: there's exactly one way a filter
//! attaches to a child, so [`PtyDevice`] is the only entry point.

mod device;
mod errors;
mod size;
mod termios;

pub use crate::device::{PtyDevice, READ_BUFFER_SIZE};
pub use crate::errors::PtyError;
pub use crate::size::PtySize;
pub use crate::termios::TermiosBackup;
