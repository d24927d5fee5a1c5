//! The escape-sequence state machine (C2): a deterministic finite automaton
//! over code points with two buffered accumulators, `pbytes` and `ibytes`.

/// Parser state, ordered the same way the automaton's states are declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ParserState {
    #[default]
    Ground,
    Esc,
    EscIntermediate,
    CsiParameter,
    CsiIntermediate,
    Ss2,
    Ss3,
    Osc,
    OscEsc,
    Str,
    StrEsc,
}

/// A typed terminal event. The first seven variants are produced by
/// [`Parser::advance`]; `Draw`, `Start`, `End` and `Resize` are lifecycle
/// events synthesised by the session, never by the parser itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Char(u32),
    Esc(Vec<u8>, u8),
    Csi(Vec<u8>, Vec<u8>, u8),
    Ss2(u8),
    Ss3(u8),
    ControlString(u8, Vec<u8>),
    Invalid(Vec<u8>),
    Draw,
    Start,
    End,
    Resize(u16, u16),
}

/// Byte-at-a-time escape-sequence parser. Holds no scanner, observer or
/// sink state of its own — see [`crate::ParseContext`] for that.
#[derive(Debug, Default)]
pub struct Parser {
    state: ParserState,
    pbytes: Vec<u8>,
    ibytes: Vec<u8>,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// True iff a sequence is in progress; used by the session to decide
    /// whether to arm the ESC timeout.
    pub fn state_is_esc(&self) -> bool {
        self.state != ParserState::Ground
    }

    /// Discards buffers without emitting anything.
    pub fn reset(&mut self) {
        self.state = ParserState::Ground;
        self.pbytes.clear();
        self.ibytes.clear();
    }

    /// Synthesises an event for whatever partial sequence is pending (a
    /// bare `Char(0x1B)` if only the escape introducer was seen, otherwise
    /// an `Invalid` carrying the buffered prefix) and resets to `Ground`.
    /// Returns `None` if already at `Ground`.
    pub fn flush(&mut self) -> Option<Event> {
        let event = match self.state {
            ParserState::Ground => None,
            ParserState::Esc => Some(Event::Char(0x1B)),
            _ => {
                let mut bytes = vec![0x1B];
                bytes.extend_from_slice(&self.pbytes);
                bytes.extend_from_slice(&self.ibytes);
                Some(Event::Invalid(bytes))
            }
        };
        self.reset();
        event
    }

    /// Feeds one code point through the automaton, calling `emit` zero,
    /// one or two times depending on the transition taken.
    pub fn advance<F: FnMut(Event)>(&mut self, cp: u32, mut emit: F) {
        let emit: &mut dyn FnMut(Event) = &mut emit;
        match self.state {
            ParserState::Ground => self.step_ground(cp, emit),
            ParserState::Esc => self.step_esc(cp, emit),
            ParserState::EscIntermediate => self.step_esc_intermediate(cp, emit),
            ParserState::CsiParameter => self.step_csi_parameter(cp, emit),
            ParserState::CsiIntermediate => self.step_csi_intermediate(cp, emit),
            ParserState::Ss2 => self.step_single_shift(cp, emit, 0x4E, true),
            ParserState::Ss3 => self.step_single_shift(cp, emit, 0x4F, false),
            ParserState::Osc => self.step_control_string(cp, emit, true),
            ParserState::OscEsc => self.step_string_esc(cp, emit),
            ParserState::Str => self.step_control_string(cp, emit, false),
            ParserState::StrEsc => self.step_string_esc(cp, emit),
        }
    }

    fn clear_buffers(&mut self) {
        self.pbytes.clear();
        self.ibytes.clear();
    }

    fn step_ground(&mut self, b: u32, emit: &mut dyn FnMut(Event)) {
        if b == 0x1B {
            self.ibytes.clear();
            self.state = ParserState::Esc;
        } else {
            emit(Event::Char(b));
        }
    }

    fn step_esc(&mut self, b: u32, emit: &mut dyn FnMut(Event)) {
        match b {
            0x5B => {
                self.pbytes.clear();
                self.state = ParserState::CsiParameter;
            }
            0x5D => {
                self.pbytes = vec![0x5D];
                self.state = ParserState::Osc;
            }
            0x4E => self.state = ParserState::Ss2,
            0x4F => self.state = ParserState::Ss3,
            0x50 | 0x58 | 0x5E | 0x5F => {
                self.pbytes = vec![b as u8];
                self.state = ParserState::Str;
            }
            0x1B => {
                emit(Event::Invalid(vec![0x1B]));
                self.ibytes.clear();
                // stays in Esc
            }
            0x18 | 0x1A => {
                emit(Event::Invalid(vec![0x1B]));
                emit(Event::Char(b));
                self.state = ParserState::Ground;
            }
            _ if b < 0x20 => emit(Event::Char(b)),
            0x20..=0x2F => {
                self.ibytes.push(b as u8);
                self.state = ParserState::EscIntermediate;
            }
            0x30..=0x7E => {
                emit(Event::Esc(std::mem::take(&mut self.ibytes), b as u8));
                self.state = ParserState::Ground;
                self.clear_buffers();
            }
            0x7F => emit(Event::Char(b)),
            _ => {
                emit(Event::Invalid(vec![0x1B, b as u8]));
                self.state = ParserState::Ground;
            }
        }
    }

    fn step_esc_intermediate(&mut self, b: u32, emit: &mut dyn FnMut(Event)) {
        match b {
            0x20..=0x2F => self.ibytes.push(b as u8),
            0x30..=0x7E => {
                emit(Event::Esc(std::mem::take(&mut self.ibytes), b as u8));
                self.state = ParserState::Ground;
                self.clear_buffers();
            }
            0x7F => emit(Event::Char(b)),
            0x1B => {
                let mut bytes = vec![0x1B];
                bytes.extend_from_slice(&self.ibytes);
                emit(Event::Invalid(bytes));
                self.state = ParserState::Esc;
                self.clear_buffers();
            }
            0x18 | 0x1A => {
                let mut bytes = vec![0x1B];
                bytes.extend_from_slice(&self.ibytes);
                emit(Event::Invalid(bytes));
                emit(Event::Char(b));
                self.state = ParserState::Ground;
                self.clear_buffers();
            }
            _ if b < 0x20 => emit(Event::Char(b)),
            _ => {
                let mut bytes = vec![0x1B];
                bytes.extend_from_slice(&self.ibytes);
                bytes.push(b as u8);
                emit(Event::Invalid(bytes));
                self.state = ParserState::Ground;
                self.clear_buffers();
            }
        }
    }

    fn step_csi_parameter(&mut self, b: u32, emit: &mut dyn FnMut(Event)) {
        match b {
            0x30..=0x3F => self.pbytes.push(b as u8),
            0x20..=0x2F => {
                self.ibytes.push(b as u8);
                self.state = ParserState::CsiIntermediate;
            }
            0x40..=0x7E => {
                emit(Event::Csi(
                    std::mem::take(&mut self.pbytes),
                    std::mem::take(&mut self.ibytes),
                    b as u8,
                ));
                self.state = ParserState::Ground;
                self.clear_buffers();
            }
            0x7F => emit(Event::Char(b)),
            0x1B => {
                let mut bytes = vec![0x1B, 0x5B];
                bytes.extend_from_slice(&self.pbytes);
                emit(Event::Invalid(bytes));
                self.state = ParserState::Esc;
                self.clear_buffers();
            }
            0x18 | 0x1A => {
                let mut bytes = vec![0x1B, 0x5B];
                bytes.extend_from_slice(&self.pbytes);
                emit(Event::Invalid(bytes));
                emit(Event::Char(b));
                self.state = ParserState::Ground;
                self.clear_buffers();
            }
            _ if b < 0x20 => emit(Event::Char(b)),
            _ => {
                let mut bytes = vec![0x1B, 0x5B];
                bytes.extend_from_slice(&self.pbytes);
                emit(Event::Invalid(bytes));
                self.state = ParserState::Ground;
                self.clear_buffers();
            }
        }
    }

    fn step_csi_intermediate(&mut self, b: u32, emit: &mut dyn FnMut(Event)) {
        fn invalid_bytes(this: &Parser, extra: Option<u8>) -> Vec<u8> {
            let mut bytes = vec![0x1B, 0x5B];
            bytes.extend_from_slice(&this.pbytes);
            bytes.extend_from_slice(&this.ibytes);
            if let Some(b) = extra {
                bytes.push(b);
            }
            bytes
        }
        match b {
            0x20..=0x2F => self.ibytes.push(b as u8),
            0x40..=0x7E => {
                emit(Event::Csi(
                    std::mem::take(&mut self.pbytes),
                    std::mem::take(&mut self.ibytes),
                    b as u8,
                ));
                self.state = ParserState::Ground;
                self.clear_buffers();
            }
            0x30..=0x3F => {
                emit(Event::Invalid(invalid_bytes(self, Some(b as u8))));
                self.state = ParserState::Ground;
                self.clear_buffers();
            }
            0x7F => emit(Event::Char(b)),
            0x1B => {
                emit(Event::Invalid(invalid_bytes(self, None)));
                self.state = ParserState::Esc;
                self.clear_buffers();
            }
            0x18 | 0x1A => {
                emit(Event::Invalid(invalid_bytes(self, None)));
                emit(Event::Char(b));
                self.state = ParserState::Ground;
                self.clear_buffers();
            }
            _ if b < 0x20 => emit(Event::Char(b)),
            _ => {
                emit(Event::Invalid(invalid_bytes(self, Some(b as u8))));
                self.state = ParserState::Ground;
                self.clear_buffers();
            }
        }
    }

    /// Shared by `Osc` and `Str`; `has_bel_terminator` selects whether
    /// `0x07` ends the string (OSC) or merely falls through to the
    /// generic-invalid path (DCS/SOS/PM/APC, which only recognise ST).
    fn step_control_string(&mut self, b: u32, emit: &mut dyn FnMut(Event), has_bel_terminator: bool) {
        if has_bel_terminator && b == 0x07 {
            emit(Event::ControlString(self.pbytes[0], std::mem::take(&mut self.ibytes)));
            self.state = ParserState::Ground;
            self.clear_buffers();
            return;
        }
        if b == 0x1B {
            self.state = if has_bel_terminator {
                ParserState::OscEsc
            } else {
                ParserState::StrEsc
            };
            return;
        }
        if (0x08..=0x0D).contains(&b) {
            self.ibytes.push(b as u8);
            return;
        }
        if b < 0x20 {
            let mut bytes = vec![0x1B];
            bytes.extend_from_slice(&self.pbytes);
            bytes.extend_from_slice(&self.ibytes);
            bytes.push(b as u8);
            emit(Event::Invalid(bytes));
            self.state = ParserState::Ground;
            self.clear_buffers();
            return;
        }
        if b <= 0xFF {
            self.ibytes.push(b as u8);
        } else if let Some(ch) = char::from_u32(b) {
            // A payload code point beyond Latin-1: carry it through as
            // UTF-8 rather than truncating to a byte.
            let mut tmp = [0u8; 4];
            self.ibytes
                .extend_from_slice(ch.encode_utf8(&mut tmp).as_bytes());
        }
    }

    fn step_string_esc(&mut self, b: u32, emit: &mut dyn FnMut(Event)) {
        if b == 0x5C {
            emit(Event::ControlString(self.pbytes[0], std::mem::take(&mut self.ibytes)));
            self.state = ParserState::Ground;
            self.clear_buffers();
            return;
        }
        let mut bytes = vec![0x1B];
        bytes.extend_from_slice(&self.pbytes);
        bytes.extend_from_slice(&self.ibytes);
        bytes.push(0x1B);
        bytes.push(b as u8);
        emit(Event::Invalid(bytes));
        self.state = ParserState::Ground;
        self.clear_buffers();
    }

    fn step_single_shift(&mut self, b: u32, emit: &mut dyn FnMut(Event), introducer: u8, is_ss2: bool) {
        match b {
            0x20..=0x7E => {
                if is_ss2 {
                    emit(Event::Ss2(b as u8));
                } else {
                    emit(Event::Ss3(b as u8));
                }
                self.state = ParserState::Ground;
            }
            0x1B => {
                emit(Event::Invalid(vec![0x1B, introducer]));
                self.state = ParserState::Esc;
            }
            0x18 | 0x1A => {
                emit(Event::Invalid(vec![0x1B, introducer]));
                emit(Event::Char(b));
                self.state = ParserState::Ground;
            }
            _ if b < 0x20 => emit(Event::Char(b)),
            _ => {
                emit(Event::Invalid(vec![0x1B, introducer]));
                emit(Event::Char(b));
                self.state = ParserState::Ground;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(cps: &[u32]) -> Vec<Event> {
        let mut parser = Parser::new();
        let mut events = Vec::new();
        for &cp in cps {
            parser.advance(cp, |e| events.push(e));
        }
        events
    }

    fn bytes_to_cps(bytes: &[u8]) -> Vec<u32> {
        bytes.iter().map(|&b| b as u32).collect()
    }

    #[test]
    fn plain_ascii_chars() {
        let events = parse(&bytes_to_cps(b"01234"));
        assert_eq!(
            events,
            vec![
                Event::Char(48),
                Event::Char(49),
                Event::Char(50),
                Event::Char(51),
                Event::Char(52),
            ]
        );
    }

    #[test]
    fn csi_sgr() {
        let events = parse(&bytes_to_cps(b"\x1B[31;1m"));
        assert_eq!(events, vec![Event::Csi(b"31;1".to_vec(), vec![], b'm')]);
    }

    #[test]
    fn malformed_csi_then_recovery() {
        let events = parse(&bytes_to_cps(b"\x1B[?25\x1B[H"));
        assert_eq!(
            events,
            vec![
                Event::Invalid(vec![0x1B, 0x5B, 0x3F, 0x32, 0x35]),
                Event::Csi(vec![], vec![], b'H'),
            ]
        );
    }

    #[test]
    fn osc_with_bel_terminator() {
        let events = parse(&bytes_to_cps(b"\x1B]0;hello\x07"));
        assert_eq!(events, vec![Event::ControlString(0x5D, b"0;hello".to_vec())]);
    }

    #[test]
    fn lone_esc_flushes_to_char() {
        let mut parser = Parser::new();
        let mut events = Vec::new();
        parser.advance(0x1B, |e| events.push(e));
        assert!(parser.state_is_esc());
        let flushed = parser.flush();
        assert_eq!(flushed, Some(Event::Char(0x1B)));
        assert_eq!(parser.state(), ParserState::Ground);
    }

    #[test]
    fn reset_discards_without_emitting() {
        let mut parser = Parser::new();
        let mut events = Vec::new();
        parser.advance(0x1B, |e| events.push(e));
        parser.advance(0x5B, |e| events.push(e));
        assert!(events.is_empty());
        parser.reset();
        assert_eq!(parser.state(), ParserState::Ground);
    }

    #[test]
    fn can_aborts_escape_sequence() {
        let events = parse(&bytes_to_cps(b"\x1B[31\x18"));
        assert_eq!(
            events,
            vec![
                Event::Invalid(vec![0x1B, 0x5B, b'3', b'1']),
                Event::Char(0x18),
            ]
        );
    }

    #[test]
    fn ss2_dispatch() {
        let events = parse(&bytes_to_cps(b"\x1BNx"));
        assert_eq!(events, vec![Event::Ss2(b'x')]);
    }
}
