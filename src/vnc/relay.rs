//! Frame and input relays between the upstream client and downstream server.
//!
//! Relays hold weak references to the endpoints they were bound to. Endpoints
//! own the handlers that own the relays, so strong references would form a
//! cycle; a relay whose endpoint is gone simply does nothing.

use std::sync::{Arc, Weak};

use log::trace;

use crate::vnc::engine::{ClientPort, ServerPort};
use crate::vnc::framebuffer::Rect;

/// Copies dirty rectangles from the upstream mirror into the downstream one.
#[derive(Clone)]
pub struct FrameRelay {
    upstream: Weak<dyn ClientPort>,
    downstream: Weak<dyn ServerPort>,
}

impl FrameRelay {
    pub fn new(upstream: &Arc<dyn ClientPort>, downstream: &Arc<dyn ServerPort>) -> Self {
        Self {
            upstream: Arc::downgrade(upstream),
            downstream: Arc::downgrade(downstream),
        }
    }

    /// Copies `rect` row by row, then marks it modified on the server.
    ///
    /// The rectangle comes straight from the engine callback and is expected to
    /// be in bounds for both framebuffers.
    pub fn relay(&self, rect: Rect) {
        let (Some(upstream), Some(downstream)) = (self.upstream.upgrade(), self.downstream.upgrade())
        else {
            return;
        };
        let Some(source) = upstream.frame_buffer() else {
            return;
        };

        let target = downstream.frame_buffer();
        target.copy_rect_from(&source, rect);
        downstream.mark_modified(rect);
    }
}

/// Forwards viewer input to the upstream client while it is connected.
#[derive(Clone)]
pub struct InputRelay {
    upstream: Weak<dyn ClientPort>,
}

impl InputRelay {
    pub fn new(upstream: &Arc<dyn ClientPort>) -> Self {
        Self {
            upstream: Arc::downgrade(upstream),
        }
    }

    /// Forwards a pointer event. Dropped when the upstream is not connected.
    pub fn pointer(&self, button_mask: u8, x: u16, y: u16) {
        match self.connected_upstream() {
            Some(upstream) => upstream.send_pointer(x, y, button_mask),
            None => trace!("Dropping pointer event at {},{}: upstream offline", x, y),
        }
    }

    /// Forwards a key event. Dropped when the upstream is not connected.
    pub fn key(&self, key: u32, down: bool) {
        match self.connected_upstream() {
            Some(upstream) => upstream.send_key(key, down),
            None => trace!("Dropping key event {:#x}: upstream offline", key),
        }
    }

    fn connected_upstream(&self) -> Option<Arc<dyn ClientPort>> {
        self.upstream.upgrade().filter(|upstream| upstream.is_connected())
    }
}
