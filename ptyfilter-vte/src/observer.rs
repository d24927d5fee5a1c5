//! Event observer protocol (C4) and AND-combining composition (C5).

use crate::context::Writer;

/// Capability set a consumer implements to intercept parsed events.
/// Every method defaults to "not handled" (pure pass-through); a
/// consumer overrides only the handlers it cares about.
///
/// Each handler receives a [`Writer`] so it can emit replacement output
/// via `put`/`puts`/`putu` before returning `true` to suppress the
/// context's own verbatim re-emission.
pub trait EventObserver {
    fn handle_start(&mut self, _w: &mut Writer) -> bool {
        false
    }
    fn handle_end(&mut self, _w: &mut Writer) -> bool {
        false
    }
    fn handle_draw(&mut self, _w: &mut Writer) -> bool {
        false
    }
    fn handle_resize(&mut self, _rows: u16, _cols: u16, _w: &mut Writer) -> bool {
        false
    }
    fn handle_char(&mut self, _cp: u32, _w: &mut Writer) -> bool {
        false
    }
    fn handle_esc(&mut self, _intermediates: &[u8], _final_byte: u8, _w: &mut Writer) -> bool {
        false
    }
    fn handle_csi(
        &mut self,
        _parameters: &[u8],
        _intermediates: &[u8],
        _final_byte: u8,
        _w: &mut Writer,
    ) -> bool {
        false
    }
    fn handle_ss2(&mut self, _final_byte: u8, _w: &mut Writer) -> bool {
        false
    }
    fn handle_ss3(&mut self, _final_byte: u8, _w: &mut Writer) -> bool {
        false
    }
    fn handle_control_string(&mut self, _prefix: u8, _payload: &[u8], _w: &mut Writer) -> bool {
        false
    }
    fn handle_invalid(&mut self, _bytes: &[u8], _w: &mut Writer) -> bool {
        false
    }
}

/// The default observer: returns `false` (not handled) everywhere, so the
/// dispatcher always falls back to verbatim serialisation.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultObserver;

impl EventObserver for DefaultObserver {}

/// Lets a boxed trait object stand in for a concrete observer wherever a
/// `ParseContext<O: EventObserver>` is needed — used by consumers that
/// want to swap observers at runtime per session or per process.
impl<T: EventObserver + ?Sized> EventObserver for Box<T> {
    fn handle_start(&mut self, w: &mut Writer) -> bool {
        (**self).handle_start(w)
    }
    fn handle_end(&mut self, w: &mut Writer) -> bool {
        (**self).handle_end(w)
    }
    fn handle_draw(&mut self, w: &mut Writer) -> bool {
        (**self).handle_draw(w)
    }
    fn handle_resize(&mut self, rows: u16, cols: u16, w: &mut Writer) -> bool {
        (**self).handle_resize(rows, cols, w)
    }
    fn handle_char(&mut self, cp: u32, w: &mut Writer) -> bool {
        (**self).handle_char(cp, w)
    }
    fn handle_esc(&mut self, intermediates: &[u8], final_byte: u8, w: &mut Writer) -> bool {
        (**self).handle_esc(intermediates, final_byte, w)
    }
    fn handle_csi(
        &mut self,
        parameters: &[u8],
        intermediates: &[u8],
        final_byte: u8,
        w: &mut Writer,
    ) -> bool {
        (**self).handle_csi(parameters, intermediates, final_byte, w)
    }
    fn handle_ss2(&mut self, final_byte: u8, w: &mut Writer) -> bool {
        (**self).handle_ss2(final_byte, w)
    }
    fn handle_ss3(&mut self, final_byte: u8, w: &mut Writer) -> bool {
        (**self).handle_ss3(final_byte, w)
    }
    fn handle_control_string(&mut self, prefix: u8, payload: &[u8], w: &mut Writer) -> bool {
        (**self).handle_control_string(prefix, payload, w)
    }
    fn handle_invalid(&mut self, bytes: &[u8], w: &mut Writer) -> bool {
        (**self).handle_invalid(bytes, w)
    }
}

/// Composes two observers `L` and `R`: every event is offered to both,
/// left first; an event counts as consumed only if *both* returned
/// `true`. Lifecycle events (`Start`/`End`/`Draw`/`Resize`) are fanned
/// out the same way, though their combined boolean has no suppressive
/// effect on the context.
pub struct Chain<L, R> {
    pub left: L,
    pub right: R,
}

impl<L, R> Chain<L, R> {
    pub fn new(left: L, right: R) -> Self {
        Self { left, right }
    }
}

impl<L: EventObserver, R: EventObserver> EventObserver for Chain<L, R> {
    fn handle_start(&mut self, w: &mut Writer) -> bool {
        let l = self.left.handle_start(w);
        let r = self.right.handle_start(w);
        l && r
    }

    fn handle_end(&mut self, w: &mut Writer) -> bool {
        let l = self.left.handle_end(w);
        let r = self.right.handle_end(w);
        l && r
    }

    fn handle_draw(&mut self, w: &mut Writer) -> bool {
        let l = self.left.handle_draw(w);
        let r = self.right.handle_draw(w);
        l && r
    }

    fn handle_resize(&mut self, rows: u16, cols: u16, w: &mut Writer) -> bool {
        let l = self.left.handle_resize(rows, cols, w);
        let r = self.right.handle_resize(rows, cols, w);
        l && r
    }

    fn handle_char(&mut self, cp: u32, w: &mut Writer) -> bool {
        let l = self.left.handle_char(cp, w);
        let r = self.right.handle_char(cp, w);
        l && r
    }

    fn handle_esc(&mut self, intermediates: &[u8], final_byte: u8, w: &mut Writer) -> bool {
        let l = self.left.handle_esc(intermediates, final_byte, w);
        let r = self.right.handle_esc(intermediates, final_byte, w);
        l && r
    }

    fn handle_csi(
        &mut self,
        parameters: &[u8],
        intermediates: &[u8],
        final_byte: u8,
        w: &mut Writer,
    ) -> bool {
        let l = self
            .left
            .handle_csi(parameters, intermediates, final_byte, w);
        let r = self
            .right
            .handle_csi(parameters, intermediates, final_byte, w);
        l && r
    }

    fn handle_ss2(&mut self, final_byte: u8, w: &mut Writer) -> bool {
        let l = self.left.handle_ss2(final_byte, w);
        let r = self.right.handle_ss2(final_byte, w);
        l && r
    }

    fn handle_ss3(&mut self, final_byte: u8, w: &mut Writer) -> bool {
        let l = self.left.handle_ss3(final_byte, w);
        let r = self.right.handle_ss3(final_byte, w);
        l && r
    }

    fn handle_control_string(&mut self, prefix: u8, payload: &[u8], w: &mut Writer) -> bool {
        let l = self.left.handle_control_string(prefix, payload, w);
        let r = self.right.handle_control_string(prefix, payload, w);
        l && r
    }

    fn handle_invalid(&mut self, bytes: &[u8], w: &mut Writer) -> bool {
        let l = self.left.handle_invalid(bytes, w);
        let r = self.right.handle_invalid(bytes, w);
        l && r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysConsume;
    impl EventObserver for AlwaysConsume {
        fn handle_char(&mut self, _cp: u32, _w: &mut Writer) -> bool {
            true
        }
    }

    struct NeverConsume;
    impl EventObserver for NeverConsume {
        fn handle_char(&mut self, _cp: u32, _w: &mut Writer) -> bool {
            false
        }
    }

    fn dummy_writer(buf: &mut Vec<u8>, out: &mut Vec<u8>) -> Writer<'_> {
        Writer::new(out, buf, false)
    }

    #[test]
    fn chain_and_combines_consumption() {
        let mut buf = Vec::new();
        let mut out = Vec::new();
        let mut chain = Chain::new(AlwaysConsume, AlwaysConsume);
        assert!(chain.handle_char(65, &mut dummy_writer(&mut buf, &mut out)));

        let mut chain = Chain::new(AlwaysConsume, NeverConsume);
        assert!(!chain.handle_char(65, &mut dummy_writer(&mut buf, &mut out)));

        let mut chain = Chain::new(NeverConsume, NeverConsume);
        assert!(!chain.handle_char(65, &mut dummy_writer(&mut buf, &mut out)));
    }

    #[test]
    fn default_observer_never_consumes() {
        let mut buf = Vec::new();
        let mut out = Vec::new();
        let mut observer = DefaultObserver;
        assert!(!observer.handle_char(65, &mut dummy_writer(&mut buf, &mut out)));
        assert!(!observer.handle_start(&mut dummy_writer(&mut buf, &mut out)));
    }
}
