use std::io;

use thiserror::Error;

use ptyfilter_pty::PtyError;

/// Errors surfaced by the process wrapper and session multiplexer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("pty device error: {0}")]
    Pty(#[from] PtyError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("select() error: {0}")]
    Select(nix::errno::Errno),

    #[error("failed to register signal handler: {0}")]
    Signal(io::Error),

    #[error("no such subordinate process")]
    UnknownProcess,

    #[error("unsupported terminal encoding: {0} (only UTF-8 is implemented)")]
    UnsupportedEncoding(String),
}

pub type Result<T> = std::result::Result<T, Error>;
