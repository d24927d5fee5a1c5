//! Controlling-terminal raw-mode setup and restoration: the filter must
//! not itself consume control keys, so the session's own controlling
//! terminal — not the PTY slave — is the one put into raw mode.

use std::os::fd::{BorrowedFd, RawFd};

use nix::sys::termios::{self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios};
use nix::unistd::{fpathconf, PathconfVar};

use crate::PtyError;

/// Snapshot of a controlling terminal's attributes, restorable via
/// [`restore`].
pub struct TermiosBackup {
    fd: RawFd,
    saved: Termios,
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn disabled_special_chars() -> &'static [SpecialCharacterIndices] {
    &[
        SpecialCharacterIndices::VEOF,
        SpecialCharacterIndices::VINTR,
        SpecialCharacterIndices::VREPRINT,
        SpecialCharacterIndices::VSTART,
        SpecialCharacterIndices::VSTOP,
        SpecialCharacterIndices::VLNEXT,
        SpecialCharacterIndices::VWERASE,
        SpecialCharacterIndices::VKILL,
        SpecialCharacterIndices::VSUSP,
        SpecialCharacterIndices::VQUIT,
        SpecialCharacterIndices::VDSUSP,
    ]
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn disabled_special_chars() -> &'static [SpecialCharacterIndices] {
    // Linux's termios has no VDSUSP slot.
    &[
        SpecialCharacterIndices::VEOF,
        SpecialCharacterIndices::VINTR,
        SpecialCharacterIndices::VREPRINT,
        SpecialCharacterIndices::VSTART,
        SpecialCharacterIndices::VSTOP,
        SpecialCharacterIndices::VLNEXT,
        SpecialCharacterIndices::VWERASE,
        SpecialCharacterIndices::VKILL,
        SpecialCharacterIndices::VSUSP,
        SpecialCharacterIndices::VQUIT,
    ]
}

/// Platform disable sentinel for the control characters above, read via
/// `fpathconf(_POSIX_VDISABLE)` the same way the reference implementation
/// reads it, falling back to the conventional `0xFF` if unavailable.
fn disable_sentinel(fd: BorrowedFd) -> u8 {
    fpathconf(fd, PathconfVar::_POSIX_VDISABLE)
        .ok()
        .flatten()
        .map(|v| v as u8)
        .unwrap_or(0xFF)
}

/// Puts `fd` (the controlling terminal, typically stdin) into raw mode,
/// returning a backup [`restore`] can use to undo it.
pub fn set_raw_mode(fd: RawFd) -> Result<TermiosBackup, PtyError> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let saved = termios::tcgetattr(borrowed)?;
    let mut raw = saved.clone();

    raw.input_flags.remove(
        InputFlags::IGNBRK
            | InputFlags::BRKINT
            | InputFlags::PARMRK
            | InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON,
    );
    raw.output_flags.remove(OutputFlags::OPOST | OutputFlags::ONLCR);
    raw.control_flags.remove(ControlFlags::CSIZE | ControlFlags::PARENB);
    raw.control_flags.insert(ControlFlags::CS8);
    raw.local_flags.remove(
        LocalFlags::ECHO
            | LocalFlags::ECHONL
            | LocalFlags::ICANON
            | LocalFlags::ISIG
            | LocalFlags::IEXTEN,
    );

    let disable = disable_sentinel(borrowed);
    for &idx in disabled_special_chars() {
        raw.control_chars[idx as usize] = disable;
    }

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &raw)?;
    Ok(TermiosBackup { fd, saved })
}

/// Restores a controlling terminal to the attributes captured by
/// [`set_raw_mode`]. Called on every session exit path.
pub fn restore(backup: &TermiosBackup) -> Result<(), PtyError> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(backup.fd) };
    termios::tcsetattr(borrowed, SetArg::TCSANOW, &backup.saved)?;
    Ok(())
}
