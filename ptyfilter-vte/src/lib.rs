//! Escape-sequence scanner, parser, dispatcher and observer protocol.
//!
//! This crate has no I/O and spawns no threads: it turns encoded bytes into
//! a stream of typed terminal [`Event`]s and offers them to an
//! [`EventObserver`], falling back to verbatim re-serialisation for
//! anything the observer doesn't consume.

mod context;
mod observer;
mod parser;
mod scanner;

pub use context::{OutputSink, ParseContext};
pub use observer::{Chain, DefaultObserver, EventObserver};
pub use parser::{Event, Parser, ParserState};
pub use scanner::{DecoderMismatch, ScanMode, Scanner};
