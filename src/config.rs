//! Multiplexer configuration.
//!
//! All values are fixed at construction. Changing the upstream target requires
//! building a new multiplexer.

use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;
use crate::vnc::framebuffer::Rgb;

/// Default VNC port of the upstream server.
pub const DEFAULT_TARGET_PORT: u16 = 5900;
/// Default port the proxy listens on for downstream viewers.
pub const DEFAULT_LISTEN_PORT: u16 = 5901;
/// Delay between upstream reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Per-call timeout of the upstream event loop.
pub const DEFAULT_CLIENT_LOOP_TIMEOUT: Duration = Duration::from_millis(1);
/// Per-call timeout of the downstream event loop.
pub const DEFAULT_SERVER_LOOP_TIMEOUT: Duration = Duration::from_millis(10);

/// Connection settings for one upstream server and one downstream listener.
#[derive(Clone, PartialEq, Eq)]
pub struct MultiplexerConfig {
    /// Host name or address of the upstream VNC server.
    pub target_host: String,
    /// Port of the upstream VNC server.
    pub target_port: u16,
    /// Password sent to the upstream server, if any.
    pub target_password: Option<String>,
    /// Port on which downstream viewers connect.
    pub listen_port: u16,
    /// Constant backoff between reconnect attempts.
    pub reconnect_delay: Duration,
    pub client_loop_timeout: Duration,
    pub server_loop_timeout: Duration,
    /// Color shown to viewers while the upstream is unavailable.
    pub placeholder_color: Rgb,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            target_host: "127.0.0.1".to_string(),
            target_port: DEFAULT_TARGET_PORT,
            target_password: None,
            listen_port: DEFAULT_LISTEN_PORT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            client_loop_timeout: DEFAULT_CLIENT_LOOP_TIMEOUT,
            server_loop_timeout: DEFAULT_SERVER_LOOP_TIMEOUT,
            placeholder_color: Rgb::BLACK,
        }
    }
}

impl MultiplexerConfig {
    /// Creates a configuration for the given upstream target and listen port.
    pub fn new(target_host: impl Into<String>, target_port: u16, listen_port: u16) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
            listen_port,
            ..Self::default()
        }
    }

    /// Sets the upstream password. An empty string means no password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.target_password = if password.is_empty() { None } else { Some(password) };
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_client_loop_timeout(mut self, timeout: Duration) -> Self {
        self.client_loop_timeout = timeout;
        self
    }

    pub fn with_server_loop_timeout(mut self, timeout: Duration) -> Self {
        self.server_loop_timeout = timeout;
        self
    }

    pub fn with_placeholder_color(mut self, color: Rgb) -> Self {
        self.placeholder_color = color;
        self
    }

    /// Checks that the configuration can drive a session.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.target_port == 0 {
            return Err(ConfigError::InvalidPort("target"));
        }
        if self.listen_port == 0 {
            return Err(ConfigError::InvalidPort("listen"));
        }
        if self.reconnect_delay.is_zero() {
            return Err(ConfigError::ZeroDuration("reconnect delay"));
        }
        if self.client_loop_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("client loop timeout"));
        }
        if self.server_loop_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("server loop timeout"));
        }
        Ok(())
    }
}

impl fmt::Debug for MultiplexerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexerConfig")
            .field("target_host", &self.target_host)
            .field("target_port", &self.target_port)
            .field(
                "target_password",
                &self.target_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("listen_port", &self.listen_port)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("client_loop_timeout", &self.client_loop_timeout)
            .field("server_loop_timeout", &self.server_loop_timeout)
            .field("placeholder_color", &self.placeholder_color)
            .finish()
    }
}
