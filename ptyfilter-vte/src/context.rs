//! Parse context and dispatcher (C3): binds a scanner, an observer and an
//! output sink, forwarding unhandled events to the sink verbatim.

use std::io::Write;

use crate::observer::EventObserver;
use crate::parser::{Event, Parser};
use crate::scanner::{DecoderMismatch, ScanMode, Scanner};

/// Anything byte-oriented can serve as the target sink; this is just a
/// named alias over `std::io::Write` so observers don't need to depend on
/// a bespoke trait.
pub trait OutputSink: Write {}
impl<T: Write> OutputSink for T {}

/// Handle an observer uses to produce output: `put`/`putu` go through the
/// optional coalescing buffer, `puts` and `flush` talk to the sink
/// directly.
pub struct Writer<'a> {
    output: &'a mut dyn Write,
    buffer: &'a mut Vec<u8>,
    buffering: bool,
}

impl<'a> Writer<'a> {
    pub fn new(output: &'a mut dyn Write, buffer: &'a mut Vec<u8>, buffering: bool) -> Self {
        Self {
            output,
            buffer,
            buffering,
        }
    }

    fn write_direct(&mut self, bytes: &[u8]) {
        if let Err(err) = self.output.write_all(bytes) {
            log::warn!("ptyfilter: output sink write failed, dropping bytes: {err}");
        }
    }

    fn raw_bytes(&mut self, bytes: &[u8]) {
        if self.buffering {
            self.buffer.extend_from_slice(bytes);
        } else {
            self.write_direct(bytes);
        }
    }

    fn raw_byte(&mut self, b: u8) {
        self.raw_bytes(&[b]);
    }

    /// Encodes and writes one code point to the buffering layer. Ordinary
    /// code points (ASCII, BMP non-surrogate, supplementary) go out as
    /// UTF-8; a lone surrogate half (possible when the scanner runs in
    /// BMP mode) is carried through as its own 3-byte WTF-8-style
    /// sequence rather than being silently dropped.
    pub fn put(&mut self, cp: u32) {
        let mut tmp = [0u8; 4];
        if let Some(ch) = char::from_u32(cp) {
            let bytes = ch.encode_utf8(&mut tmp).as_bytes();
            self.raw_bytes(bytes);
        } else if (0xD800..=0xDFFF).contains(&cp) {
            let bytes = [
                0xE0 | ((cp >> 12) & 0x0F) as u8,
                0x80 | ((cp >> 6) & 0x3F) as u8,
                0x80 | (cp & 0x3F) as u8,
            ];
            self.raw_bytes(&bytes);
        }
    }

    /// Writes raw bytes to the target sink directly, bypassing the
    /// coalescing buffer. Flushes first so direct writes don't reorder
    /// ahead of bytes still pending in the buffer.
    pub fn puts(&mut self, bytes: &[u8]) {
        self.flush();
        self.write_direct(bytes);
    }

    /// Writes pre-encoded text to the buffering layer.
    pub fn putu(&mut self, text: &str) {
        self.raw_bytes(text.as_bytes());
    }

    /// Drains the buffering layer to the target sink in one write,
    /// swallowing I/O errors.
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let bytes = std::mem::take(self.buffer);
        self.write_direct(&bytes);
    }
}

/// Binds a [`Scanner`], a [`Parser`], an [`EventObserver`] and an output
/// sink. Feeds bytes through the scanner and parser, offering each event
/// to the observer and falling back to verbatim serialisation when the
/// observer doesn't consume it.
pub struct ParseContext<O> {
    scanner: Scanner,
    parser: Parser,
    observer: O,
    output: Box<dyn Write + Send>,
    buffer: Vec<u8>,
    buffering: bool,
}

impl<O: EventObserver> ParseContext<O> {
    pub fn new(mode: ScanMode, observer: O, output: Box<dyn Write + Send>, buffering: bool) -> Self {
        Self {
            scanner: Scanner::new(mode),
            parser: Parser::new(),
            observer,
            output,
            buffer: Vec::new(),
            buffering,
        }
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    /// True iff the parser holds a partial sequence; used by the caller
    /// to decide whether to arm an ESC timeout.
    pub fn state_is_esc(&self) -> bool {
        self.parser.state_is_esc()
    }

    /// Hands `bytes` to the scanner; if buffering, truncates the
    /// intermediate sink first. Every resulting code point is run through
    /// the parser and dispatched.
    pub fn assign(&mut self, bytes: &[u8]) -> Result<(), DecoderMismatch> {
        if self.buffering {
            self.buffer.clear();
        }
        self.scanner.assign(bytes, "UTF-8")?;
        self.drive_scanner();
        Ok(())
    }

    fn drive_scanner(&mut self) {
        let code_points: Vec<u32> = (&mut self.scanner).collect();
        for cp in code_points {
            self.step(cp);
        }
    }

    fn step(&mut self, cp: u32) {
        let mut events = Vec::new();
        self.parser.advance(cp, |e| events.push(e));
        for event in events {
            self.dispatch(event);
        }
    }

    fn dispatch(&mut self, event: Event) {
        let mut writer = Writer::new(&mut *self.output, &mut self.buffer, self.buffering);
        let handled = match &event {
            Event::Char(cp) => self.observer.handle_char(*cp, &mut writer),
            Event::Esc(intermediates, final_byte) => {
                self.observer.handle_esc(intermediates, *final_byte, &mut writer)
            }
            Event::Csi(parameters, intermediates, final_byte) => self.observer.handle_csi(
                parameters,
                intermediates,
                *final_byte,
                &mut writer,
            ),
            Event::Ss2(final_byte) => self.observer.handle_ss2(*final_byte, &mut writer),
            Event::Ss3(final_byte) => self.observer.handle_ss3(*final_byte, &mut writer),
            Event::ControlString(prefix, payload) => {
                self.observer.handle_control_string(*prefix, payload, &mut writer)
            }
            Event::Invalid(bytes) => self.observer.handle_invalid(bytes, &mut writer),
            Event::Start => {
                self.observer.handle_start(&mut writer);
                true
            }
            Event::End => {
                self.observer.handle_end(&mut writer);
                true
            }
            Event::Draw => {
                self.observer.handle_draw(&mut writer);
                true
            }
            Event::Resize(rows, cols) => {
                self.observer.handle_resize(*rows, *cols, &mut writer);
                true
            }
        };
        if !handled {
            Self::serialize(&event, &mut writer);
        }
    }

    fn serialize(event: &Event, writer: &mut Writer) {
        match event {
            Event::Char(cp) => writer.put(*cp),
            Event::Esc(intermediates, final_byte) => {
                writer.raw_byte(0x1B);
                writer.raw_bytes(intermediates);
                writer.raw_byte(*final_byte);
            }
            Event::Csi(parameters, intermediates, final_byte) => {
                writer.raw_byte(0x1B);
                writer.raw_byte(0x5B);
                writer.raw_bytes(parameters);
                writer.raw_bytes(intermediates);
                writer.raw_byte(*final_byte);
            }
            Event::Ss2(final_byte) => {
                writer.raw_byte(0x1B);
                writer.raw_byte(0x4E);
                writer.raw_byte(*final_byte);
            }
            Event::Ss3(final_byte) => {
                writer.raw_byte(0x1B);
                writer.raw_byte(0x4F);
                writer.raw_byte(*final_byte);
            }
            Event::ControlString(prefix, payload) => {
                writer.raw_byte(0x1B);
                writer.raw_byte(*prefix);
                writer.raw_bytes(payload);
                writer.raw_byte(0x1B);
                writer.raw_byte(0x5C);
            }
            Event::Invalid(bytes) => writer.raw_bytes(bytes),
            Event::Start | Event::End | Event::Draw | Event::Resize(..) => {}
        }
    }

    /// Emits a lifecycle event directly (used by the session for
    /// `Start`/`End`/`Draw`/`Resize`, which the parser itself never
    /// produces).
    pub fn emit_lifecycle(&mut self, event: Event) {
        debug_assert!(matches!(
            event,
            Event::Start | Event::End | Event::Draw | Event::Resize(..)
        ));
        self.dispatch(event);
    }

    /// Flushes the parser's pending partial sequence (if any) as an
    /// `Invalid`/`Char(0x1B)` event and resets to `Ground`. Used by the
    /// ESC timeout.
    pub fn flush_parser(&mut self) {
        if let Some(event) = self.parser.flush() {
            self.dispatch(event);
        }
    }

    /// Resets the parser without emitting anything. Used on focus switch.
    pub fn drain(&mut self) {
        self.parser.reset();
    }

    /// Drains the output buffering layer to the sink.
    pub fn flush(&mut self) {
        let mut writer = Writer::new(&mut *self.output, &mut self.buffer, self.buffering);
        writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::DefaultObserver;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn round_trip(input: &[u8], buffering: bool) -> Vec<u8> {
        let sink = SharedSink::default();
        let captured = sink.0.clone();
        let mut ctx = ParseContext::new(ScanMode::FullUnicode, DefaultObserver, Box::new(sink), buffering);
        ctx.assign(input).unwrap();
        ctx.flush();
        let out = captured.lock().unwrap().clone();
        out
    }

    #[test]
    fn pass_through_observer_round_trips_ascii() {
        assert_eq!(round_trip(b"hello, world", false), b"hello, world");
    }

    #[test]
    fn pass_through_observer_round_trips_csi() {
        assert_eq!(round_trip(b"\x1B[31;1mred\x1B[0m", false), b"\x1B[31;1mred\x1B[0m");
    }

    #[test]
    fn buffering_round_trips_identically_to_unbuffered() {
        let input: &[u8] = b"\x1B]0;title\x07plain text\x1B[2J";
        assert_eq!(round_trip(input, true), round_trip(input, false));
        assert_eq!(round_trip(input, true), input);
    }

    #[test]
    fn assign_truncates_buffer_when_buffering() {
        let sink = SharedSink::default();
        let mut ctx = ParseContext::new(ScanMode::FullUnicode, DefaultObserver, Box::new(sink), true);
        // Leave a partial escape sequence pending in the buffer without
        // flushing, then assign again: the pending buffer content must
        // not leak into the next assign's output.
        ctx.buffer.extend_from_slice(b"stale");
        ctx.assign(b"fresh").unwrap();
        assert_eq!(ctx.buffer, b"fresh");
    }

    #[test]
    fn invalid_sequence_reproduces_captured_bytes() {
        // Malformed CSI (never terminated by a final byte in 0x40..=0x7E
        // before CAN aborts it) round-trips its exact captured bytes.
        assert_eq!(round_trip(b"\x1B[31\x18", false), b"\x1B[31\x18");
    }
}
