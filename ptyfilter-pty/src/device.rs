//! PTY device (C6): owns the master descriptor, the child pid, and a
//! snapshot of the controlling terminal's attributes for restoration.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};

use nix::libc;
use nix::pty::openpty;
use nix::sys::signal::{kill, Signal};
use nix::sys::termios::{tcflow, FlowArg};
use nix::unistd::Pid;

use crate::size::PtySize;
use crate::termios::{self, TermiosBackup};
use crate::PtyError;

/// Bytes read per call.
pub const READ_BUFFER_SIZE: usize = 8192;

/// Owns a forked child attached to a pseudo-terminal, plus the backup
/// needed to restore the controlling terminal's termios on teardown.
pub struct PtyDevice {
    master: File,
    child: Child,
    controlling_fd: RawFd,
    term_backup: Option<TermiosBackup>,
}

impl PtyDevice {
    /// Forks under a new pseudo-terminal. In the child: sets `TERM`/`LANG`
    /// and execs `/bin/sh -c "exec <command>"`. In the parent: puts
    /// `controlling_fd` (the session's own controlling terminal) into raw
    /// mode.
    pub fn spawn(
        term: &str,
        lang: &str,
        command: &str,
        controlling_fd: RawFd,
        size: PtySize,
    ) -> Result<Self, PtyError> {
        Self::spawn_in(term, lang, command, None, controlling_fd, size)
    }

    /// Like [`Self::spawn`], but the child inherits `cwd` as its working
    /// directory instead of the parent's, when given.
    pub fn spawn_in(
        term: &str,
        lang: &str,
        command: &str,
        cwd: Option<&Path>,
        controlling_fd: RawFd,
        size: PtySize,
    ) -> Result<Self, PtyError> {
        let winsize = size.into();
        let pty = openpty(None, Some(&winsize))?;
        let master = unsafe { File::from_raw_fd(pty.master.into_raw_fd()) };
        let slave = unsafe { File::from_raw_fd(pty.slave.into_raw_fd()) };
        let raw_master = master.as_raw_fd();
        let raw_slave = slave.as_raw_fd();

        let term_backup = termios::set_raw_mode(controlling_fd).ok();

        let shell_command = format!("exec {command}");
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(&shell_command);
        cmd.env(OsStr::new("TERM"), term);
        cmd.env(OsStr::new("LANG"), lang);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let stdin_slave = slave.try_clone()?;
        let stderr_slave = slave.try_clone()?;
        cmd.stdin(stdin_slave).stdout(slave).stderr(stderr_slave);

        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                for signo in &[
                    libc::SIGCHLD,
                    libc::SIGHUP,
                    libc::SIGINT,
                    libc::SIGQUIT,
                    libc::SIGTERM,
                ] {
                    libc::signal(*signo, libc::SIG_DFL);
                }
                libc::close(raw_master);
                libc::close(raw_slave);
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        set_nonblocking(raw_master)?;

        Ok(Self {
            master,
            child,
            controlling_fd,
            term_backup,
        })
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Reads up to `buf.len()` bytes (callers pass an
    /// [`READ_BUFFER_SIZE`]-sized buffer to honour the 8192-byte cap).
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, PtyError> {
        Ok(self.master.read(buf)?)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        Ok(self.master.write(data)?)
    }

    /// Reads the controlling terminal's winsize, applies it to the
    /// master, and signals the child with `SIGWINCH`. Returns the new
    /// `(rows, cols)`.
    pub fn fitsize(&mut self) -> Result<(u16, u16), PtyError> {
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        let res = unsafe { libc::ioctl(self.controlling_fd, libc::TIOCGWINSZ, &mut ws as *mut _) };
        if res < 0 {
            return Err(PtyError::Io(io::Error::last_os_error()));
        }
        self.apply_winsize(ws)?;
        Ok((ws.ws_row, ws.ws_col))
    }

    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let size = PtySize {
            rows,
            cols,
            cell_width: 0,
            cell_height: 0,
        };
        self.apply_winsize(size.into())
    }

    fn apply_winsize(&mut self, ws: libc::winsize) -> Result<(), PtyError> {
        let res = unsafe {
            libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws as *const _)
        };
        if res < 0 {
            return Err(PtyError::Resize(io::Error::last_os_error()));
        }
        let _ = kill(self.pid(), Signal::SIGWINCH);
        Ok(())
    }

    pub fn xon(&mut self) -> Result<(), PtyError> {
        let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.master.as_raw_fd()) };
        tcflow(fd, FlowArg::TCOON)?;
        Ok(())
    }

    pub fn xoff(&mut self) -> Result<(), PtyError> {
        let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.master.as_raw_fd()) };
        tcflow(fd, FlowArg::TCOOFF)?;
        Ok(())
    }

    /// Kills and reaps the child, returning its exit code.
    pub fn close(&mut self) -> Result<i32, PtyError> {
        let _ = self.child.kill();
        let status = self.child.wait()?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Non-blocking poll for child exit, used alongside `SIGCHLD`.
    pub fn try_wait(&mut self) -> Result<Option<i32>, PtyError> {
        Ok(self.child.try_wait()?.map(|s| s.code().unwrap_or(-1)))
    }

    /// Restores the controlling terminal's termios, if it was captured.
    pub fn restore_term(&mut self) {
        if let Some(backup) = &self.term_backup {
            if let Err(err) = termios::restore(backup) {
                log::warn!("ptyfilter: failed to restore controlling terminal termios: {err}");
            }
        }
    }
}

impl Drop for PtyDevice {
    fn drop(&mut self) {
        self.restore_term();
    }
}

fn set_nonblocking(raw_fd: RawFd) -> Result<(), PtyError> {
    unsafe {
        let flags = libc::fcntl(raw_fd, libc::F_GETFL, 0);
        if libc::fcntl(raw_fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
            return Err(PtyError::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}
