//! Code-point scanner (C1): decodes encoded bytes into a lazy, forward-only
//! sequence of code points, handling the BMP/full-Unicode duality and
//! surrogate-pair coalescing described for narrow-build consumers.

use std::collections::VecDeque;

use utf8parse::Receiver;

/// Returned by [`Scanner::continuous_assign`] when no encoding has been
/// configured yet via a prior [`Scanner::assign`].
#[derive(Debug, thiserror::Error)]
#[error("continuous_assign called before an encoding was configured via assign")]
pub struct DecoderMismatch;

/// BMP mode emits raw 16-bit code units (matching narrow-build consumers
/// that may see unpaired surrogate halves); full-Unicode mode coalesces
/// surrogate pairs into a single code point above `0x10000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    Bmp,
    #[default]
    FullUnicode,
}

/// A streaming byte-to-UTF-16-code-unit decoder. `feed` may be called
/// repeatedly across reads; malformed subsequences are replaced rather
/// than surfaced as errors. UTF-8, via [`Utf8Decoder`], is the only
/// built-in implementation.
trait Decoder {
    fn feed(&mut self, bytes: &[u8]) -> Vec<u16>;
}

/// Receives one `utf8parse::Parser::advance` outcome: a decoded code point,
/// or the replacement character on a malformed subsequence.
#[derive(Default)]
struct CharReceiver(Option<char>);

impl Receiver for CharReceiver {
    fn codepoint(&mut self, c: char) {
        self.0 = Some(c);
    }

    fn invalid_sequence(&mut self) {
        self.0 = Some(char::REPLACEMENT_CHARACTER);
    }
}

/// Streaming UTF-8 decoder producing UTF-16 code units, replacing
/// malformed subsequences with the replacement character. The underlying
/// `utf8parse::Parser` carries its own byte-at-a-time state, so a
/// multi-byte sequence split across two `feed` calls resumes correctly
/// without any buffering of our own.
#[derive(Default)]
struct Utf8Decoder {
    parser: utf8parse::Parser,
}

impl Decoder for Utf8Decoder {
    fn feed(&mut self, bytes: &[u8]) -> Vec<u16> {
        let mut units = Vec::new();
        for &b in bytes {
            let mut receiver = CharReceiver::default();
            self.parser.advance(&mut receiver, b);
            if let Some(ch) = receiver.0 {
                let mut buf = [0u16; 2];
                units.extend_from_slice(ch.encode_utf16(&mut buf));
            }
        }
        units
    }
}

/// Decodes encoded bytes into code points.
pub struct Scanner {
    mode: ScanMode,
    decoder: Option<Box<dyn Decoder>>,
    units: VecDeque<u16>,
    pending_high: Option<u16>,
}

impl Scanner {
    pub fn new(mode: ScanMode) -> Self {
        Self {
            mode,
            decoder: None,
            units: VecDeque::new(),
            pending_high: None,
        }
    }

    /// Replaces the buffer: subsequent iteration yields code points
    /// decoded from `bytes` under `encoding`. Only `"UTF-8"` (the
    /// reference encoding) is supported; any other name is reported the
    /// same way a pre-configuration gap is, since no decoder exists for
    /// it.
    pub fn assign(&mut self, bytes: &[u8], encoding: &str) -> Result<(), DecoderMismatch> {
        if !encoding.eq_ignore_ascii_case("UTF-8") {
            return Err(DecoderMismatch);
        }
        self.units.clear();
        self.pending_high = None;
        let mut decoder = Utf8Decoder::default();
        let units = decoder.feed(bytes);
        self.units.extend(units);
        self.decoder = Some(Box::new(decoder));
        Ok(())
    }

    /// Appends bytes to the streaming decoder's pending state, preserving
    /// any partial multi-byte sequence across calls.
    pub fn continuous_assign(&mut self, bytes: &[u8]) -> Result<(), DecoderMismatch> {
        let decoder = self.decoder.as_mut().ok_or(DecoderMismatch)?;
        let units = decoder.feed(bytes);
        self.units.extend(units);
        Ok(())
    }
}

impl Iterator for Scanner {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        match self.mode {
            ScanMode::Bmp => self.units.pop_front().map(u32::from),
            ScanMode::FullUnicode => loop {
                if let Some(high) = self.pending_high.take() {
                    match self.units.pop_front() {
                        None => {
                            self.pending_high = Some(high);
                            return None;
                        }
                        Some(u) if (0xDC00..=0xDFFF).contains(&u) => {
                            let cp = 0x10000
                                + (((high as u32 - 0xD800) << 10) | (u as u32 - 0xDC00));
                            return Some(cp);
                        }
                        Some(u) if (0xD800..=0xDBFF).contains(&u) => {
                            // Last-wins: the new high surrogate displaces
                            // the stale one, which is discarded unpaired.
                            self.pending_high = Some(u);
                            continue;
                        }
                        Some(u) => return Some(u32::from(u)),
                    }
                } else {
                    match self.units.pop_front() {
                        None => return None,
                        Some(u) if (0xD800..=0xDBFF).contains(&u) => {
                            self.pending_high = Some(u);
                            continue;
                        }
                        Some(u) => return Some(u32::from(u)),
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ascii() {
        let mut scanner = Scanner::new(ScanMode::FullUnicode);
        scanner.assign(b"01234", "UTF-8").unwrap();
        let cps: Vec<u32> = scanner.collect();
        assert_eq!(cps, vec![48, 49, 50, 51, 52]);
    }

    #[test]
    fn utf8_multibyte_full_unicode() {
        let mut scanner = Scanner::new(ScanMode::FullUnicode);
        scanner
            .assign(b"\xCC\xB3\xE2\x80\x80\xE4\x80\xB4\xE4\x80\x82", "UTF-8")
            .unwrap();
        let cps: Vec<u32> = scanner.collect();
        assert_eq!(cps, vec![819, 8192, 16436, 16386]);
    }

    #[test]
    fn surrogate_pair_coalesces() {
        let mut scanner = Scanner::new(ScanMode::FullUnicode);
        // U+1F600 GRINNING FACE encodes as the surrogate pair D83D DE00.
        scanner.units.extend([0xD83D, 0xDE00]);
        scanner.decoder = Some(Box::new(Utf8Decoder::default()));
        assert_eq!(scanner.next(), Some(0x1F600));
        assert_eq!(scanner.next(), None);
    }

    #[test]
    fn lone_high_surrogate_is_last_wins() {
        let mut scanner = Scanner::new(ScanMode::FullUnicode);
        scanner.units.extend([0xD800, 0x0041]);
        scanner.decoder = Some(Box::new(Utf8Decoder::default()));
        // The lone high surrogate is discarded; only 'A' is emitted.
        assert_eq!(scanner.next(), Some(0x0041));
        assert_eq!(scanner.next(), None);
    }

    #[test]
    fn continuous_assign_without_assign_fails() {
        let mut scanner = Scanner::new(ScanMode::FullUnicode);
        assert!(scanner.continuous_assign(b"x").is_err());
    }

    #[test]
    fn continuous_assign_preserves_split_utf8_sequence() {
        let mut scanner = Scanner::new(ScanMode::Bmp);
        scanner.assign(b"\xE2", "UTF-8").unwrap();
        assert_eq!(scanner.units.len(), 0);
        scanner.continuous_assign(b"\x80\x80").unwrap();
        let cps: Vec<u32> = scanner.collect();
        assert_eq!(cps, vec![8192]);
    }
}
