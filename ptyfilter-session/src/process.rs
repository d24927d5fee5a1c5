//! Process wrapper (C7): binds a PTY device to an input parse context and
//! an output parse context, holding per-process ESC-timeout state.

use std::io::{self, Write};
use std::os::fd::RawFd;

use ptyfilter_pty::{PtyDevice, PtyError};
use ptyfilter_vte::{Event, EventObserver, ParseContext, ScanMode};

use crate::esc_timer::EscTimer;

/// Writes directly to a PTY master fd without taking ownership of it; the
/// owning [`PtyDevice`] outlives every [`ParseContext`] built against it,
/// since both live inside the same [`Process`].
struct MasterWriter(RawFd);

impl Write for MasterWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        use std::os::fd::BorrowedFd;
        let fd = unsafe { BorrowedFd::borrow_raw(self.0) };
        nix::unistd::write(fd, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A boxed [`EventObserver`] trait object — lets [`Session`](crate::Session)
/// hold differently-typed observers per process without becoming generic
/// over them itself.
pub type BoxObserver = Box<dyn EventObserver + Send>;

/// The PTY-independent half of a [`Process`]: the input/output parse
/// contexts and the ESC-timeout state. Split out from [`Process`] so the
/// dispatch logic can be unit-tested against a plain in-memory sink
/// instead of a forked PTY.
struct ProcessState {
    input: ParseContext<BoxObserver>,
    output: ParseContext<BoxObserver>,
    esc_timer: EscTimer,
}

impl ProcessState {
    fn new(
        input_mode: ScanMode,
        input_observer: BoxObserver,
        input_sink: Box<dyn Write + Send>,
        output_mode: ScanMode,
        output_observer: BoxObserver,
        output_sink: Box<dyn Write + Send>,
        buffering: bool,
        esc_timer: EscTimer,
    ) -> Self {
        Self {
            input: ParseContext::new(input_mode, input_observer, input_sink, buffering),
            output: ParseContext::new(output_mode, output_observer, output_sink, buffering),
            esc_timer,
        }
    }

    fn start(&mut self) {
        self.input.emit_lifecycle(Event::Start);
        self.output.emit_lifecycle(Event::Start);
    }

    fn end(&mut self) {
        self.esc_timer.cancel();
        self.input.emit_lifecycle(Event::End);
        self.output.emit_lifecycle(Event::End);
    }

    fn process_input(&mut self, bytes: &[u8]) {
        self.esc_timer.cancel();
        if !bytes.is_empty() {
            if let Err(err) = self.input.assign(bytes) {
                log::warn!("ptyfilter: input decoder mismatch: {err}");
            }
        }
        if self.input.state_is_esc() {
            self.esc_timer.rearm();
        } else {
            self.input.emit_lifecycle(Event::Draw);
            self.input.flush();
        }
    }

    fn process_output(&mut self, bytes: &[u8]) {
        if !bytes.is_empty() {
            if let Err(err) = self.output.assign(bytes) {
                log::warn!("ptyfilter: output decoder mismatch: {err}");
            }
        }
        if !self.output.state_is_esc() {
            self.output.emit_lifecycle(Event::Draw);
            self.output.flush();
        }
    }

    fn process_resize(&mut self, rows: u16, cols: u16) {
        self.input.emit_lifecycle(Event::Resize(rows, cols));
        self.output.emit_lifecycle(Event::Resize(rows, cols));
    }

    fn flush_esc_timeout(&mut self) {
        self.input.flush_parser();
        self.input.emit_lifecycle(Event::Draw);
        self.input.flush();
    }

    fn drain(&mut self) {
        self.esc_timer.cancel();
        self.input.drain();
    }
}

/// Binds one [`PtyDevice`] to an input parser (stdin → child) and an
/// output parser (child → stdout).
pub struct Process {
    pty: PtyDevice,
    state: ProcessState,
}

impl Process {
    pub fn new(
        pty: PtyDevice,
        input_mode: ScanMode,
        input_observer: BoxObserver,
        output_mode: ScanMode,
        output_observer: BoxObserver,
        stdout: Box<dyn Write + Send>,
        buffering: bool,
        esc_timer: EscTimer,
    ) -> Self {
        let master_fd = pty.master_fd();
        let input_sink: Box<dyn Write + Send> = Box::new(MasterWriter(master_fd));
        let state = ProcessState::new(
            input_mode,
            input_observer,
            input_sink,
            output_mode,
            output_observer,
            stdout,
            buffering,
            esc_timer,
        );
        Self { pty, state }
    }

    pub fn master_fd(&self) -> RawFd {
        self.pty.master_fd()
    }

    pub fn pty(&mut self) -> &mut PtyDevice {
        &mut self.pty
    }

    /// Delivers `Start` to both observers. Called once, before any data.
    pub fn start(&mut self) {
        self.state.start();
    }

    /// Delivers `End` to both observers, each scoped to its own context.
    /// Called exactly once, on teardown.
    pub fn end(&mut self) {
        self.state.end();
    }

    /// Cancels any pending ESC timer, feeds `bytes` to the input parser.
    /// If the parser lands back in `Ground`, delivers a `Draw` and
    /// flushes; otherwise a new ESC timer is armed.
    pub fn process_input(&mut self, bytes: &[u8]) {
        self.state.process_input(bytes);
    }

    /// Feeds `bytes` to the output parser. If `Ground`, delivers `Draw`
    /// and flushes. Output never arms an ESC timeout: a child's own
    /// escape sequences are expected to complete promptly, unlike a bare
    /// keystroke from a human at the other end of stdin.
    pub fn process_output(&mut self, bytes: &[u8]) {
        self.state.process_output(bytes);
    }

    /// Delivers `Resize` to both observers.
    pub fn process_resize(&mut self, rows: u16, cols: u16) {
        self.state.process_resize(rows, cols);
    }

    /// Called when this process's ESC timer fires: flushes the pending
    /// partial sequence as `Char(0x1B)`/`Invalid`, resets to `Ground`, and
    /// issues a draw.
    pub fn flush_esc_timeout(&mut self) {
        self.state.flush_esc_timeout();
    }

    /// Resets the input parser without emitting anything (any partial
    /// sequence is lost), and cancels a pending ESC timer. Used when this
    /// process loses input focus.
    pub fn drain(&mut self) {
        self.state.drain();
    }

    pub fn read_output(&mut self, buf: &mut [u8]) -> Result<usize, PtyError> {
        self.pty.read(buf)
    }

    pub fn write_input(&mut self, bytes: &[u8]) -> Result<usize, PtyError> {
        self.pty.write(bytes)
    }

    pub fn fitsize(&mut self) -> Result<(u16, u16), PtyError> {
        self.pty.fitsize()
    }

    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.pty.resize(rows, cols)
    }

    pub fn close(&mut self) -> Result<i32, PtyError> {
        self.state.esc_timer.cancel();
        self.pty.close()
    }

    pub fn try_wait(&mut self) -> Result<Option<i32>, PtyError> {
        self.pty.try_wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptyfilter_vte::DefaultObserver;
    use std::os::unix::net::UnixStream;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn pipe_esc_timer(timeout: Duration) -> (EscTimer, UnixStream) {
        let (read, write) = UnixStream::pair().unwrap();
        read.set_nonblocking(true).unwrap();
        (EscTimer::new(0, write, timeout), read)
    }

    fn new_state(esc_timer: EscTimer) -> (ProcessState, Arc<Mutex<Vec<u8>>>, Arc<Mutex<Vec<u8>>>) {
        let input_sink = SharedSink::default();
        let output_sink = SharedSink::default();
        let input_captured = input_sink.0.clone();
        let output_captured = output_sink.0.clone();
        let state = ProcessState::new(
            ScanMode::FullUnicode,
            Box::new(DefaultObserver),
            Box::new(input_sink),
            ScanMode::FullUnicode,
            Box::new(DefaultObserver),
            Box::new(output_sink),
            false,
            esc_timer,
        );
        (state, input_captured, output_captured)
    }

    #[test]
    fn process_output_flushes_complete_sequences_on_ground() {
        let (esc_timer, _read) = pipe_esc_timer(Duration::from_secs(5));
        let (mut state, _input, output) = new_state(esc_timer);
        state.process_output(b"\x1B[31;1mred");
        assert_eq!(&*output.lock().unwrap(), b"\x1B[31;1mred");
    }

    #[test]
    fn process_input_forwards_to_sink_and_round_trips() {
        let (esc_timer, _read) = pipe_esc_timer(Duration::from_secs(5));
        let (mut state, input, _output) = new_state(esc_timer);
        state.process_input(b"ls -la\n");
        assert_eq!(&*input.lock().unwrap(), b"ls -la\n");
    }

    #[test]
    fn process_input_leaving_partial_escape_does_not_rearm_without_timer() {
        // Verifies the observable effect of the non-Ground branch: bytes
        // of a still-incomplete CSI are withheld from the sink until the
        // sequence completes or is flushed.
        let (esc_timer, read) = pipe_esc_timer(Duration::from_millis(30));
        let (mut state, input, _output) = new_state(esc_timer);
        state.process_input(b"\x1B[31");
        assert_eq!(&*input.lock().unwrap(), b"", "partial CSI must not reach the sink yet");

        std::thread::sleep(Duration::from_millis(80));
        let mut buf = [0u8; 8];
        {
            use std::io::Read;
            let mut read = &read;
            assert!(read.read(&mut buf).is_ok(), "esc timer should have fired");
        }
        state.flush_esc_timeout();
        assert_eq!(&*input.lock().unwrap(), b"\x1B[31");
    }

    #[test]
    fn process_input_completes_escape_and_cancels_timer() {
        let (esc_timer, read) = pipe_esc_timer(Duration::from_millis(30));
        let (mut state, input, _output) = new_state(esc_timer);
        state.process_input(b"\x1B[2J");
        assert_eq!(&*input.lock().unwrap(), b"\x1B[2J");

        std::thread::sleep(Duration::from_millis(80));
        let mut buf = [0u8; 8];
        use std::io::Read;
        let mut read = &read;
        assert_eq!(
            read.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock,
            "timer must have been cancelled once the sequence completed"
        );
    }

    #[test]
    fn drain_resets_parser_without_emitting() {
        let (esc_timer, _read) = pipe_esc_timer(Duration::from_secs(5));
        let (mut state, input, _output) = new_state(esc_timer);
        state.process_input(b"\x1B[31");
        assert!(input.lock().unwrap().is_empty());
        state.drain();
        state.process_input(b"A");
        // After drain, the stale "\x1B[31" prefix is gone; only the new
        // byte is parsed and forwarded as a plain char.
        assert_eq!(&*input.lock().unwrap(), b"A");
    }

    #[test]
    fn start_and_end_are_idempotent_calls_not_propagated_to_sink() {
        let (esc_timer, _read) = pipe_esc_timer(Duration::from_secs(5));
        let (mut state, input, output) = new_state(esc_timer);
        state.start();
        state.end();
        assert!(input.lock().unwrap().is_empty());
        assert!(output.lock().unwrap().is_empty());
    }
}
