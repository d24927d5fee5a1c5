use std::io;

use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("error from *nix bindings")]
    Nix(#[from] Errno),

    #[error("error from pty I/O")]
    Io(#[from] io::Error),

    #[error("failed to resize pty")]
    Resize(io::Error),
}
