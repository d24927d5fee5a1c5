//! ESC timeout: a bare `ESC` left pending past a short timeout must not be
//! held indefinitely waiting for a CSI/DCS/OSC completion that may never
//! arrive. This is a self-pipe variant of the timeout, an alternative to
//! a mutex-guarded timer thread, since it folds the timeout into the same
//! `select()` the session already blocks on instead of introducing a
//! second lock around parser state.
//!
//! Arming spawns a short-lived thread that sleeps for the timeout and then,
//! unless its generation has been superseded by a cancel or a re-arm,
//! writes this timer's id to the session's notification pipe. The session
//! never touches parser state from that thread — only from its own loop,
//! after reading the id back out of the pipe.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Default ESC timeout: 0.5 s, configurable.
pub const DEFAULT_ESC_TIMEOUT: Duration = Duration::from_millis(500);

/// One process's handle onto the session-wide self-pipe ESC timeout.
/// Cloning shares the generation counter — cloned handles cancel and
/// re-arm the same logical timer.
#[derive(Clone)]
pub struct EscTimer {
    id: u64,
    generation: Arc<AtomicU64>,
    notify: UnixStream,
    timeout: Duration,
}

impl EscTimer {
    /// `id` identifies the owning process to the session (its PTY master
    /// fd works well: unique for as long as the process is alive).
    /// `notify` is a clone of the write end of the session's self-pipe.
    pub fn new(id: u64, notify: UnixStream, timeout: Duration) -> Self {
        Self {
            id,
            generation: Arc::new(AtomicU64::new(0)),
            notify,
            timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancels any pending timer and arms a fresh one. Exactly one flush
    /// notification reaches the session per surviving generation; races
    /// with a concurrent cancel/re-arm are tolerated by the generation
    /// check performed just before the write.
    pub fn rearm(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let watch = Arc::clone(&self.generation);
        let mut notify = match self.notify.try_clone() {
            Ok(n) => n,
            Err(err) => {
                log::warn!("ptyfilter: failed to clone esc-timer notify pipe: {err}");
                return;
            }
        };
        let id = self.id;
        let timeout = self.timeout;
        thread::spawn(move || {
            thread::sleep(timeout);
            if watch.load(Ordering::SeqCst) == generation {
                let _ = notify.write_all(&id.to_ne_bytes());
            }
        });
    }

    /// Cancels any pending timer without arming a new one.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Instant;

    #[test]
    fn rearm_notifies_after_timeout() {
        let (read_end, write_end) = UnixStream::pair().unwrap();
        read_end.set_nonblocking(true).unwrap();
        let timer = EscTimer::new(7, write_end, Duration::from_millis(30));
        timer.rearm();

        let start = Instant::now();
        let mut buf = [0u8; 8];
        let mut read_end = read_end;
        loop {
            match read_end.read(&mut buf) {
                Ok(8) => break,
                Ok(_) => panic!("short read"),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    assert!(start.elapsed() < Duration::from_secs(2), "timer never fired");
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(u64::from_ne_bytes(buf), 7);
    }

    #[test]
    fn cancel_suppresses_pending_notification() {
        let (mut read_end, write_end) = UnixStream::pair().unwrap();
        read_end.set_nonblocking(true).unwrap();
        let timer = EscTimer::new(1, write_end, Duration::from_millis(20));
        timer.rearm();
        timer.cancel();

        thread::sleep(Duration::from_millis(60));
        let mut buf = [0u8; 8];
        let err = read_end.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn rearm_cancels_previous_generation() {
        let (mut read_end, write_end) = UnixStream::pair().unwrap();
        read_end.set_nonblocking(true).unwrap();
        let timer = EscTimer::new(3, write_end, Duration::from_millis(20));
        timer.rearm();
        thread::sleep(Duration::from_millis(5));
        timer.rearm();

        thread::sleep(Duration::from_millis(60));
        let mut seen = 0;
        let mut buf = [0u8; 8];
        while read_end.read(&mut buf).is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 1, "only the surviving generation should notify");
    }
}
