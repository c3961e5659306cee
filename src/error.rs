//! Error types for the multiplexer and the engine ports it drives.

use thiserror::Error;

/// Failures reported by an RFB engine port (client or server side).
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not allocate a client handle.
    #[error("failed to create VNC client")]
    CreateClient,

    /// The engine could not allocate a server (screen) handle.
    #[error("failed to create VNC server")]
    CreateServer,

    /// The listen port is already bound by another server.
    #[error("port {0} is already in use")]
    AddressInUse(u16),

    /// The server failed to start listening.
    #[error("failed to start VNC server: {0}")]
    Start(String),

    /// The upstream connection was lost or the server went away.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Any other failure inside an event-loop call.
    #[error("event loop error: {0}")]
    EventLoop(String),
}

/// Framebuffer geometry and pixel-data errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramebufferError {
    #[error("invalid framebuffer dimensions {width}x{height} (each side must be {min}-{max})")]
    InvalidDimensions {
        width: u32,
        height: u32,
        min: u16,
        max: u16,
    },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("rectangle {x},{y} {width}x{height} is outside the {fb_width}x{fb_height} framebuffer")]
    OutOfBounds {
        x: u16,
        y: u16,
        width: u16,
        height: u16,
        fb_width: u16,
        fb_height: u16,
    },
}

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("target host must not be empty")]
    EmptyHost,

    #[error("{0} port must be 1-65535")]
    InvalidPort(&'static str),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Snapshot export errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("PNG encoding failed: {0}")]
    Png(#[from] png::EncodingError),
}

/// Top-level error returned by the multiplexer.
#[derive(Debug, Error)]
pub enum MultiplexerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to create proxy client: {0}")]
    ClientCreation(#[source] EngineError),

    #[error("failed to create proxy server: {0}")]
    ServerCreation(#[source] EngineError),

    #[error("failed to initialize VNC client connection to {host}:{port}")]
    Handshake { host: String, port: u16 },

    #[error(transparent)]
    Framebuffer(#[from] FramebufferError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MultiplexerError>;
