//! PTY session multiplexer (C7/C8): an event loop that owns the
//! controlling TTY, one or more child PTYs, routes input to a focused
//! child, and delivers output through the escape-sequence parser
//! pipeline from [`ptyfilter_vte`].
//!
//! [`Process`] binds one [`ptyfilter_pty::PtyDevice`] to an input parser
//! and an output parser; [`Session`] owns the main process plus any
//! subordinates and drives the `select()` loop.

mod error;
mod esc_timer;
mod process;
mod session;

pub use error::{Error, Result};
pub use esc_timer::{EscTimer, DEFAULT_ESC_TIMEOUT};
pub use process::{BoxObserver, Process};
pub use session::{Session, SessionConfig};

pub use ptyfilter_pty as pty;
pub use ptyfilter_vte as vte;
