//! VNC multiplexer
//!
//! A protocol-level relay that presents one upstream VNC server to any number of
//! downstream viewers, keeping viewer connections alive across upstream
//! disconnects.
//!
//! # Modules
//!
//! - `vnc`: The relay core (engine ports, framebuffer relay, lifecycle, supervisor).
//! - `config`: Connection settings.
//! - `error`: Error types.
//! - `logging`: Logger initialization for embedders.

pub mod config;
pub mod error;
pub mod logging;
pub mod vnc;

pub use config::MultiplexerConfig;
pub use error::{ConfigError, EngineError, FramebufferError, MultiplexerError, Result, SnapshotError};
pub use vnc::engine::{
    ClientFactory, ClientPort, FramebufferUpdateHandler, KeyEventHandler, NewViewerHandler,
    PointerEventHandler, ServerFactory, ServerPort, ViewerId,
};
pub use vnc::framebuffer::{Framebuffer, PixelLayout, Rect, Rgb, BYTES_PER_PIXEL};
pub use vnc::lifecycle::DownstreamLoop;
pub use vnc::multiplexer::{ConnectionCallback, ConnectionState, Multiplexer, MultiplexerBuilder};
pub use vnc::relay::{FrameRelay, InputRelay};
pub use vnc::snapshot::RgbSnapshot;
