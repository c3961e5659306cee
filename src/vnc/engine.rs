//! Port interfaces to the RFB engine.
//!
//! The multiplexer does not speak the RFB wire protocol itself. It drives an
//! engine through two capabilities: a [`ClientPort`] connected to the upstream
//! server, and a [`ServerPort`] listening for downstream viewers. Both are
//! produced by factories so the core can run against fakes in tests.
//!
//! All methods take `&self`: the upstream client is used concurrently by the
//! control thread (inside [`ClientPort::run_event_loop`]) and by the input
//! relay (on the downstream loop thread), so engines must synchronize
//! internally.

use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineError;
use crate::vnc::framebuffer::{Framebuffer, PixelLayout, Rect};

/// Identifies one downstream viewer connection inside a server.
pub type ViewerId = u64;

/// Called with the dirty rectangle after the upstream framebuffer changed.
pub type FramebufferUpdateHandler = Arc<dyn Fn(Rect) + Send + Sync>;
/// Called with `(button_mask, x, y, viewer)` for each pointer event.
pub type PointerEventHandler = Arc<dyn Fn(u8, u16, u16, ViewerId) + Send + Sync>;
/// Called with `(down, keysym, viewer)` for each key event.
pub type KeyEventHandler = Arc<dyn Fn(bool, u32, ViewerId) + Send + Sync>;
/// Called when a new viewer connects.
pub type NewViewerHandler = Arc<dyn Fn(ViewerId) + Send + Sync>;

/// Creates an upstream client for the given pixel layout.
pub type ClientFactory =
    Arc<dyn Fn(PixelLayout) -> Result<Arc<dyn ClientPort>, EngineError> + Send + Sync>;
/// Creates a downstream server of `width` x `height` for the given pixel layout.
pub type ServerFactory =
    Arc<dyn Fn(u16, u16, PixelLayout) -> Result<Arc<dyn ServerPort>, EngineError> + Send + Sync>;

/// Upstream side: the proxy acting as a viewer of the target server.
pub trait ClientPort: Send + Sync {
    /// Sets the upstream host and port. The connection is made by [`initialize`].
    ///
    /// [`initialize`]: ClientPort::initialize
    fn set_endpoint(&self, host: &str, port: u16);

    /// Supplies the password used if the server requests authentication.
    fn set_credential(&self, secret: &str);

    fn set_pixel_format(&self, layout: PixelLayout);

    /// Connects and performs the RFB handshake. Returns `false` on failure.
    fn initialize(&self) -> bool;

    /// Requests a non-incremental update of the whole framebuffer.
    fn request_full_update(&self);

    fn send_pointer(&self, x: u16, y: u16, button_mask: u8);

    fn send_key(&self, key: u32, down: bool);

    /// Processes pending server messages, waiting up to `timeout` for one.
    ///
    /// Framebuffer update callbacks run synchronously inside this call.
    /// Returns `Ok(())` when the call finished normally (including timing out)
    /// and an error once the connection is gone.
    fn run_event_loop(&self, timeout: Duration) -> Result<(), EngineError>;

    fn is_connected(&self) -> bool;

    /// Drops the connection. Idempotent; a concurrent `run_event_loop` returns
    /// an error.
    fn close(&self);

    /// The client's local mirror of the remote framebuffer, once initialized.
    /// Laid out R, G, B, pad like every framebuffer the relay handles.
    fn frame_buffer(&self) -> Option<Arc<Framebuffer>>;

    fn frame_width(&self) -> u16;

    fn frame_height(&self) -> u16;

    fn set_framebuffer_update_handler(&self, handler: FramebufferUpdateHandler);
}

/// Downstream side: the proxy acting as a server for viewers.
pub trait ServerPort: Send + Sync {
    fn set_listen_port(&self, port: u16);

    fn set_pixel_format(&self, layout: PixelLayout);

    /// Binds the listen port and prepares to accept viewers.
    fn start(&self) -> Result<(), EngineError>;

    /// Serves viewers until [`stop`] is called or a fatal error occurs.
    ///
    /// Pointer, key and new-viewer callbacks run on the calling thread.
    ///
    /// [`stop`]: ServerPort::stop
    fn run_event_loop(&self, timeout: Duration) -> Result<(), EngineError>;

    /// Makes a blocked or future `run_event_loop` return. Idempotent and sticky:
    /// a stopped server is expected to be closed, not restarted.
    fn stop(&self);

    /// Releases the listener and all viewer connections. Idempotent.
    fn close(&self);

    /// Pixels served to viewers, laid out R, G, B, pad.
    fn frame_buffer(&self) -> Arc<Framebuffer>;

    fn width(&self) -> u16;

    fn height(&self) -> u16;

    /// Tells the engine `rect` changed so attached viewers get an update.
    fn mark_modified(&self, rect: Rect);

    fn set_pointer_handler(&self, handler: PointerEventHandler);

    fn set_key_handler(&self, handler: KeyEventHandler);

    fn set_new_viewer_handler(&self, handler: NewViewerHandler);
}
