//! Session / multiplexer (C8): the `select()`-driven event loop. Owns
//! one main PTY and an optional mapping from fd to subordinate
//! [`Process`]; exactly one is the input focus at any time.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc::{SIGCHLD, SIGWINCH};
use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal, TimeValLike};
use signal_hook::low_level::{pipe as signal_pipe, unregister as unregister_signal};
use signal_hook::SigId;

use ptyfilter_pty::{PtyDevice, PtySize};
use ptyfilter_vte::ScanMode;

use crate::error::{Error, Result};
use crate::esc_timer::EscTimer;
use crate::process::{BoxObserver, Process};

/// Bytes read per `read()` call on stdin or a PTY master.
const READ_BUFFER_SIZE: usize = 8192;

/// `select()` poll timeout.
const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_millis(600);

/// Configuration accepted by [`Session::start`].
pub struct SessionConfig {
    pub term: String,
    pub lang: String,
    pub command: String,
    /// Byte encoding the scanners decode under. Only `"UTF-8"` is
    /// currently backed by a decoder; anything else fails at `start`.
    pub termenc: String,
    pub buffering: bool,
    pub esc_timeout: Duration,
    pub select_timeout: Duration,
    pub size: PtySize,
    /// Working directory for the main child, if not the parent's own.
    pub cwd: Option<std::path::PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            lang: "en_US.UTF-8".to_string(),
            command: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            termenc: "UTF-8".to_string(),
            buffering: false,
            esc_timeout: crate::esc_timer::DEFAULT_ESC_TIMEOUT,
            select_timeout: DEFAULT_SELECT_TIMEOUT,
            size: PtySize::default(),
            cwd: None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Focus {
    Main,
    Sub(RawFd),
}

/// Owns the controlling terminal's stdin fd, the main [`Process`], any
/// subordinate processes, and the self-pipes used for SIGWINCH, SIGCHLD
/// and ESC-timeout notification.
pub struct Session {
    stdin_fd: RawFd,
    main: Process,
    subordinates: HashMap<RawFd, Process>,
    focus: Focus,
    alive: bool,
    resize_pending: bool,

    winch_read: UnixStream,
    winch_id: SigId,
    chld_read: UnixStream,
    chld_id: SigId,
    esc_read: UnixStream,
    esc_write: UnixStream,

    select_timeout: Duration,
    esc_timeout: Duration,
}

impl Session {
    /// Forks the main process under a fresh PTY, registers `SIGWINCH`/
    /// `SIGCHLD` self-pipes, and delivers `Start` to the main process's
    /// observers.
    pub fn start(
        config: SessionConfig,
        stdin_fd: RawFd,
        stdout: Box<dyn Write + Send>,
        input_observer: BoxObserver,
        output_observer: BoxObserver,
    ) -> Result<Self> {
        if config.termenc != "UTF-8" {
            return Err(Error::UnsupportedEncoding(config.termenc.clone()));
        }

        let (winch_write, winch_read) = UnixStream::pair().map_err(Error::Io)?;
        winch_read.set_nonblocking(true).map_err(Error::Io)?;
        let winch_id = signal_pipe::register(SIGWINCH, winch_write).map_err(Error::Signal)?;

        let (chld_write, chld_read) = UnixStream::pair().map_err(Error::Io)?;
        chld_read.set_nonblocking(true).map_err(Error::Io)?;
        let chld_id = signal_pipe::register(SIGCHLD, chld_write).map_err(Error::Signal)?;

        let (esc_write, esc_read) = UnixStream::pair().map_err(Error::Io)?;
        esc_read.set_nonblocking(true).map_err(Error::Io)?;

        let pty = PtyDevice::spawn_in(
            &config.term,
            &config.lang,
            &config.command,
            config.cwd.as_deref(),
            stdin_fd,
            config.size,
        )?;
        let esc_timer = EscTimer::new(
            pty.master_fd() as u64,
            esc_write.try_clone().map_err(Error::Io)?,
            config.esc_timeout,
        );
        let mut main = Process::new(
            pty,
            ScanMode::FullUnicode,
            input_observer,
            ScanMode::FullUnicode,
            output_observer,
            stdout,
            config.buffering,
            esc_timer,
        );
        main.start();

        Ok(Self {
            stdin_fd,
            main,
            subordinates: HashMap::new(),
            focus: Focus::Main,
            alive: true,
            resize_pending: false,
            winch_read,
            winch_id,
            chld_read,
            chld_id,
            esc_read,
            esc_write,
            select_timeout: config.select_timeout,
            esc_timeout: config.esc_timeout,
        })
    }

    /// Spawns a subordinate process under its own PTY and registers it in
    /// the fd→Process map, returning the key (its PTY master fd) the
    /// caller can later pass to [`Session::focus_process`].
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_subordinate(
        &mut self,
        term: &str,
        lang: &str,
        command: &str,
        cwd: Option<&std::path::Path>,
        stdout: Box<dyn Write + Send>,
        input_observer: BoxObserver,
        output_observer: BoxObserver,
        buffering: bool,
        size: PtySize,
        focus_new: bool,
    ) -> Result<RawFd> {
        let pty = PtyDevice::spawn_in(term, lang, command, cwd, self.stdin_fd, size)?;
        let fd = pty.master_fd();
        let esc_timer = EscTimer::new(
            fd as u64,
            self.esc_write.try_clone().map_err(Error::Io)?,
            self.esc_timeout,
        );
        let mut process = Process::new(
            pty,
            ScanMode::FullUnicode,
            input_observer,
            ScanMode::FullUnicode,
            output_observer,
            stdout,
            buffering,
            esc_timer,
        );
        process.start();
        self.subordinates.insert(fd, process);
        if focus_new {
            self.focus_process(fd)?;
        }
        Ok(fd)
    }

    /// Switches input focus to the main process, draining whatever
    /// partial sequence the previously focused process held.
    pub fn focus_main(&mut self) {
        self.drain_current_focus();
        self.focus = Focus::Main;
    }

    /// Switches input focus to a subordinate process, draining the
    /// previous focus first. Fails silently (no-op) if `fd` names no live
    /// subordinate.
    pub fn focus_process(&mut self, fd: RawFd) -> Result<()> {
        if !self.subordinates.contains_key(&fd) {
            return Err(Error::UnknownProcess);
        }
        self.drain_current_focus();
        self.focus = Focus::Sub(fd);
        Ok(())
    }

    fn drain_current_focus(&mut self) {
        match self.focus {
            Focus::Main => self.main.drain(),
            Focus::Sub(fd) => {
                if let Some(process) = self.subordinates.get_mut(&fd) {
                    process.drain();
                }
            }
        }
    }

    fn focused_process_mut(&mut self) -> &mut Process {
        match self.focus {
            Focus::Main => &mut self.main,
            Focus::Sub(fd) => self
                .subordinates
                .get_mut(&fd)
                .expect("focus always names a live process"),
        }
    }

    /// Runs the `select()` loop until the session terminates (main PTY
    /// closes, `EIO`/`EBADF` on its master, or the main child exits), then
    /// delivers `End` to every live process and closes their PTYs.
    pub fn drive(&mut self) -> Result<()> {
        let result = self.drive_inner();
        self.teardown();
        result
    }

    fn drive_inner(&mut self) -> Result<()> {
        while self.alive {
            match self.select_once() {
                Ok(()) => {}
                Err(Error::Select(Errno::EINTR)) => {
                    self.resize_pending = true;
                    continue;
                }
                Err(Error::Select(Errno::EBADF)) => {
                    self.destruct_all_subordinates();
                    continue;
                }
                Err(Error::Select(Errno::EIO)) => {
                    self.alive = false;
                    break;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    fn select_once(&mut self) -> Result<()> {
        let mut read_fds = FdSet::new();
        let mut exception_fds = FdSet::new();
        let mut max_fd: RawFd = 0;

        let track = |fd: RawFd, max_fd: &mut RawFd| {
            *max_fd = (*max_fd).max(fd);
            unsafe { BorrowedFd::borrow_raw(fd) }
        };

        let stdin_bfd = track(self.stdin_fd, &mut max_fd);
        read_fds.insert(stdin_bfd);
        exception_fds.insert(stdin_bfd);

        let main_fd = self.main.master_fd();
        let main_bfd = track(main_fd, &mut max_fd);
        read_fds.insert(main_bfd);
        exception_fds.insert(main_bfd);

        let sub_fds: Vec<RawFd> = self.subordinates.keys().copied().collect();
        for &fd in &sub_fds {
            let bfd = track(fd, &mut max_fd);
            read_fds.insert(bfd);
            exception_fds.insert(bfd);
        }

        let winch_bfd = track(self.winch_read.as_raw_fd(), &mut max_fd);
        read_fds.insert(winch_bfd);
        let chld_bfd = track(self.chld_read.as_raw_fd(), &mut max_fd);
        read_fds.insert(chld_bfd);
        let esc_bfd = track(self.esc_read.as_raw_fd(), &mut max_fd);
        read_fds.insert(esc_bfd);

        let nfds = Some(max_fd + 1);

        let mut timeout = TimeVal::milliseconds(self.select_timeout.as_millis() as i64);
        let ready = select(
            nfds,
            Some(&mut read_fds),
            None,
            Some(&mut exception_fds),
            Some(&mut timeout),
        )
        .map_err(Error::Select)?;

        if ready == 0 {
            return Ok(());
        }

        if exception_fds.contains(main_bfd) {
            self.alive = false;
            return Ok(());
        }
        for &fd in &sub_fds {
            let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
            if exception_fds.contains(bfd) {
                self.destruct_process(fd);
            }
        }

        if read_fds.contains(winch_bfd) {
            drain_pipe(&mut self.winch_read);
            self.resize_pending = true;
        }
        if self.resize_pending {
            self.resize_pending = false;
            self.apply_resize();
        }

        if read_fds.contains(chld_bfd) {
            drain_pipe(&mut self.chld_read);
            self.reap_children();
        }

        if read_fds.contains(esc_bfd) {
            self.flush_esc_timeouts();
        }

        if read_fds.contains(stdin_bfd) {
            self.read_stdin();
        }

        if read_fds.contains(main_bfd) {
            self.read_process_output(None);
        }
        for &fd in &sub_fds {
            let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
            if read_fds.contains(bfd) && self.subordinates.contains_key(&fd) {
                self.read_process_output(Some(fd));
            }
        }

        Ok(())
    }

    fn apply_resize(&mut self) {
        let process = self.focused_process_mut();
        match process.fitsize() {
            Ok((rows, cols)) => process.process_resize(rows, cols),
            Err(err) => log::warn!("ptyfilter: fitsize failed: {err}"),
        }
    }

    fn reap_children(&mut self) {
        match self.main.try_wait() {
            Ok(Some(_)) => {
                self.alive = false;
                return;
            }
            Ok(None) => {}
            Err(err) => log::warn!("ptyfilter: try_wait on main failed: {err}"),
        }

        let mut exited = Vec::new();
        for (&fd, process) in self.subordinates.iter_mut() {
            match process.try_wait() {
                Ok(Some(_)) => exited.push(fd),
                Ok(None) => {}
                Err(err) => log::warn!("ptyfilter: try_wait on subordinate failed: {err}"),
            }
        }
        for fd in exited {
            self.destruct_process(fd);
        }
    }

    fn flush_esc_timeouts(&mut self) {
        let mut buf = [0u8; 8];
        loop {
            let mut esc_read = &self.esc_read;
            match esc_read.read(&mut buf) {
                Ok(8) => {
                    let id = u64::from_ne_bytes(buf) as RawFd;
                    if id == self.main.master_fd() {
                        self.main.flush_esc_timeout();
                    } else if let Some(process) = self.subordinates.get_mut(&id) {
                        process.flush_esc_timeout();
                    }
                }
                Ok(_) => break,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("ptyfilter: esc-timer pipe read failed: {err}");
                    break;
                }
            }
        }
    }

    fn read_stdin(&mut self) {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let raw = unsafe {
            nix::libc::read(
                self.stdin_fd,
                buf.as_mut_ptr() as *mut nix::libc::c_void,
                buf.len(),
            )
        };
        if raw < 0 {
            match Errno::last() {
                Errno::EAGAIN | Errno::EINTR => {}
                err => log::warn!("ptyfilter: stdin read failed: {err}"),
            }
            return;
        }
        if raw == 0 {
            // A zero-length read of stdin triggers a draw kick on the
            // main process regardless of current focus: it exists purely
            // to keep main's pipeline alive while a subordinate holds the
            // keyboard.
            self.main.process_input(&[]);
        } else {
            self.focused_process_mut().process_input(&buf[..raw as usize]);
        }
    }

    fn read_process_output(&mut self, fd: Option<RawFd>) {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let process = match fd {
            None => &mut self.main,
            Some(fd) => match self.subordinates.get_mut(&fd) {
                Some(p) => p,
                None => return,
            },
        };
        match process.read_output(&mut buf) {
            Ok(0) => match fd {
                None => self.alive = false,
                Some(fd) => self.destruct_process(fd),
            },
            Ok(n) => process.process_output(&buf[..n]),
            Err(ptyfilter_pty::PtyError::Io(err))
                if err.kind() == std::io::ErrorKind::WouldBlock =>
            {
                // select() said readable, but a spurious wakeup raced with
                // the child exiting; nothing to do until it's readable
                // (or in the exception set) again.
            }
            Err(err) => {
                log::debug!("ptyfilter: pty read failed: {err}");
                match fd {
                    None => self.alive = false,
                    Some(fd) => self.destruct_process(fd),
                }
            }
        }
    }

    /// Removes the fd from the read set, closes the master, delivers
    /// `End` exactly once, and unconditionally refocuses the main process
    /// — a subordinate's death refocuses main whether or not it happened
    /// to be focused.
    fn destruct_process(&mut self, fd: RawFd) {
        if let Some(mut process) = self.subordinates.remove(&fd) {
            process.end();
            let _ = process.close();
        }
        self.focus = Focus::Main;
    }

    fn destruct_all_subordinates(&mut self) {
        let fds: Vec<RawFd> = self.subordinates.keys().copied().collect();
        for fd in fds {
            self.destruct_process(fd);
        }
    }

    fn teardown(&mut self) {
        self.destruct_all_subordinates();
        self.main.end();
        let _ = self.main.close();
    }
}

fn drain_pipe(stream: &mut UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = unregister_signal(self.winch_id);
        let _ = unregister_signal(self.chld_id);
    }
}
