//! Connection supervisor for one upstream server and one downstream listener.
//!
//! # State machine
//!
//! ```text
//!   Disconnected ──build / reconnect──▶ Connecting ──initialize ok──▶ Connected
//!        ▲                                  │  ▲                          │
//!        │                                  └──┘ retry after delay        │
//!        └───────────── event loop error / refresh / close ───────────────┘
//! ```
//!
//! The control thread (the caller of [`Multiplexer::run`]) drives the upstream
//! event loop. When it fails the downstream listener keeps running: viewers see
//! a placeholder image until the upstream is back. After every reconnect the
//! relays are rebound to the new client; if the negotiated geometry changed,
//! the downstream server is replaced first.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::config::MultiplexerConfig;
use crate::error::{EngineError, MultiplexerError, Result};
use crate::vnc::engine::{ClientFactory, ClientPort, ServerFactory, ServerPort, ViewerId};
use crate::vnc::framebuffer::{validate_dimensions, PixelLayout, Rect};
use crate::vnc::lifecycle::{get_or_init_relay_runtime, DownstreamLoop};
use crate::vnc::relay::{FrameRelay, InputRelay};
use crate::vnc::snapshot::RgbSnapshot;

/// Callback invoked on online/offline transitions.
pub type ConnectionCallback = Arc<dyn Fn() + Send + Sync>;

/// State of the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Builds a [`Multiplexer`] from a configuration, engine factories and
/// optional connection callbacks.
pub struct MultiplexerBuilder {
    config: MultiplexerConfig,
    client_factory: Option<ClientFactory>,
    server_factory: Option<ServerFactory>,
    on_online: Option<ConnectionCallback>,
    on_offline: Option<ConnectionCallback>,
}

impl MultiplexerBuilder {
    pub fn new(config: MultiplexerConfig) -> Self {
        Self {
            config,
            client_factory: None,
            server_factory: None,
            on_online: None,
            on_offline: None,
        }
    }

    pub fn client_factory(mut self, factory: ClientFactory) -> Self {
        self.client_factory = Some(factory);
        self
    }

    pub fn server_factory(mut self, factory: ServerFactory) -> Self {
        self.server_factory = Some(factory);
        self
    }

    /// Called each time the upstream link becomes connected.
    pub fn on_online<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_online = Some(Arc::new(callback));
        self
    }

    /// Called each time the upstream link stops being connected.
    pub fn on_offline<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_offline = Some(Arc::new(callback));
        self
    }

    /// Connects to the upstream server and provisions the downstream listener.
    ///
    /// Fails if either factory is missing or fails, or if the first handshake
    /// fails. Later failures are handled by the reconnect loop in
    /// [`Multiplexer::run`].
    pub fn build(self) -> Result<Multiplexer> {
        self.config.validate()?;

        let client_factory = self
            .client_factory
            .ok_or(MultiplexerError::ClientCreation(EngineError::CreateClient))?;
        let server_factory = self
            .server_factory
            .ok_or(MultiplexerError::ServerCreation(EngineError::CreateServer))?;

        let (shutdown, _) = watch::channel(false);
        let multiplexer = Multiplexer {
            downstream: DownstreamLoop::new(self.config.server_loop_timeout),
            config: self.config,
            client_factory,
            server_factory,
            on_online: self.on_online,
            on_offline: self.on_offline,
            endpoints: Mutex::new(Endpoints::default()),
            state: Mutex::new(ConnectionState::Disconnected),
            shutdown,
            binding_generation: AtomicU64::new(0),
        };

        multiplexer.transition(ConnectionState::Connecting);
        let client = match multiplexer.connect_upstream() {
            Ok(client) => client,
            Err(e) => {
                multiplexer.transition(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        multiplexer.lock_endpoints().client = Some(client.clone());
        multiplexer.transition(ConnectionState::Connected);

        let server = multiplexer.provision_server(client.frame_width(), client.frame_height())?;
        multiplexer.lock_endpoints().server = Some(server.clone());
        multiplexer.rebind(&client, &server);

        Ok(multiplexer)
    }
}

#[derive(Default)]
struct Endpoints {
    client: Option<Arc<dyn ClientPort>>,
    server: Option<Arc<dyn ServerPort>>,
    closed: bool,
}

/// Relays one upstream VNC server to any number of downstream viewers.
///
/// Share it behind an `Arc`: one thread calls [`run`](Multiplexer::run), others
/// may call [`refresh`](Multiplexer::refresh), [`close`](Multiplexer::close) or
/// the accessors. None of these may be called from inside an async context.
pub struct Multiplexer {
    config: MultiplexerConfig,
    client_factory: ClientFactory,
    server_factory: ServerFactory,
    on_online: Option<ConnectionCallback>,
    on_offline: Option<ConnectionCallback>,
    endpoints: Mutex<Endpoints>,
    state: Mutex<ConnectionState>,
    downstream: DownstreamLoop,
    shutdown: watch::Sender<bool>,
    binding_generation: AtomicU64,
}

impl Multiplexer {
    pub fn builder(config: MultiplexerConfig) -> MultiplexerBuilder {
        MultiplexerBuilder::new(config)
    }

    /// Drives the session until [`close`](Multiplexer::close) is called.
    ///
    /// Upstream failures never end this loop; they lead to the placeholder
    /// screen and a reconnect with constant backoff.
    pub fn run(&self) {
        info!(
            "Starting VNC multiplexer: {}:{} -> port {}",
            self.config.target_host, self.config.target_port, self.config.listen_port
        );
        self.ensure_downstream_loop();

        let mut rebuild_due: Option<Instant> = None;
        while !self.is_closed() {
            if let Some(client) = self.current_client() {
                debug!("Proxy client event loop started");
                self.pump_upstream(&client, &mut rebuild_due);
                client.close();
            }
            if self.is_closed() {
                break;
            }

            self.transition(ConnectionState::Disconnected);
            self.paint_placeholder();

            if !self.reconnect() {
                break;
            }
            rebuild_due = self.reconcile_downstream();
        }

        info!("VNC multiplexer stopped");
    }

    /// Drops the current upstream connection without touching the downstream
    /// listener. The control loop then reconnects as after any other loss.
    pub fn refresh(&self) {
        info!("Refresh requested, recreating target connection");
        // Mark offline before the loop can observe the break and reconnect
        self.transition(ConnectionState::Disconnected);
        if let Some(client) = self.current_client() {
            client.close();
        }
    }

    /// Stops the downstream loop and releases both endpoints.
    ///
    /// [`run`](Multiplexer::run) returns shortly after, including when it is in
    /// the middle of a reconnect wait.
    pub fn close(&self) {
        info!("Closing multiplexer");
        let (client, server, previous) = {
            let mut endpoints = self.lock_endpoints();
            endpoints.closed = true;
            // Shares the critical section of the reconnect install
            let previous = self.swap_state(ConnectionState::Disconnected);
            (endpoints.client.take(), endpoints.server.take(), previous)
        };
        self.shutdown.send_replace(true);

        // Stop the loop before closing the server it is serving
        self.downstream.shutdown();
        if let Some(client) = client {
            client.close();
        }
        if let Some(server) = server {
            server.close();
        }
        self.notify(previous, ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Width and height of the current downstream framebuffer.
    pub fn downstream_geometry(&self) -> Option<(u16, u16)> {
        self.current_server().map(|server| (server.width(), server.height()))
    }

    /// Packed RGB copy of the image currently served to viewers.
    pub fn rgb_snapshot(&self) -> Option<RgbSnapshot> {
        self.current_server().map(|server| server.frame_buffer().to_rgb())
    }

    /// Number of relay rebinds performed so far.
    pub fn binding_generation(&self) -> u64 {
        self.binding_generation.load(Ordering::SeqCst)
    }

    pub fn is_downstream_running(&self) -> bool {
        self.downstream.is_running()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Runs the upstream event loop until it reports an error or the
    /// multiplexer closes, retrying a pending downstream rebuild in between.
    fn pump_upstream(&self, client: &Arc<dyn ClientPort>, rebuild_due: &mut Option<Instant>) {
        loop {
            if let Err(e) = client.run_event_loop(self.config.client_loop_timeout) {
                warn!("Proxy client event loop error: {}", e);
                return;
            }
            if self.is_closed() {
                return;
            }
            if rebuild_due.is_some_and(|due| Instant::now() >= due) {
                *rebuild_due = self.reconcile_downstream();
            }
        }
    }

    /// Retries the upstream handshake until it succeeds. Returns `false` if the
    /// multiplexer was closed meanwhile.
    fn reconnect(&self) -> bool {
        self.transition(ConnectionState::Connecting);
        loop {
            if self.is_closed() {
                return false;
            }

            info!(
                "Attempting to reconnect to target server {}:{}",
                self.config.target_host, self.config.target_port
            );
            match self.connect_upstream() {
                Ok(client) => {
                    let mut endpoints = self.lock_endpoints();
                    if endpoints.closed {
                        drop(endpoints);
                        client.close();
                        return false;
                    }
                    endpoints.client = Some(client);
                    let previous = self.swap_state(ConnectionState::Connected);
                    drop(endpoints);

                    self.notify(previous, ConnectionState::Connected);
                    return true;
                }
                Err(e) => warn!(
                    "Reconnect failed: {}; retrying in {:?}",
                    e, self.config.reconnect_delay
                ),
            }

            if !self.wait_before_retry(self.config.reconnect_delay) {
                return false;
            }
        }
    }

    /// Creates and configures a client, then performs the handshake.
    fn connect_upstream(&self) -> Result<Arc<dyn ClientPort>> {
        let client = (self.client_factory)(PixelLayout::STANDARD)
            .map_err(MultiplexerError::ClientCreation)?;

        client.set_endpoint(&self.config.target_host, self.config.target_port);
        if let Some(password) = &self.config.target_password {
            client.set_credential(password);
        }
        client.set_pixel_format(PixelLayout::STANDARD);

        let handshake_failed = || MultiplexerError::Handshake {
            host: self.config.target_host.clone(),
            port: self.config.target_port,
        };
        if !client.initialize() {
            client.close();
            return Err(handshake_failed());
        }
        if let Err(e) = validate_dimensions(
            u32::from(client.frame_width()),
            u32::from(client.frame_height()),
        ) {
            client.close();
            return Err(e.into());
        }

        info!(
            "Proxy client connected to {}:{} ({}x{})",
            self.config.target_host,
            self.config.target_port,
            client.frame_width(),
            client.frame_height()
        );
        client.request_full_update();
        Ok(client)
    }

    /// Creates a downstream server of the given size and starts listening.
    fn provision_server(&self, width: u16, height: u16) -> Result<Arc<dyn ServerPort>> {
        let server = (self.server_factory)(width, height, PixelLayout::STANDARD)
            .map_err(MultiplexerError::ServerCreation)?;

        server.set_listen_port(self.config.listen_port);
        server.set_pixel_format(PixelLayout::STANDARD);
        if let Err(e) = server.start() {
            server.close();
            return Err(MultiplexerError::ServerCreation(e));
        }

        info!(
            "Proxy server listening on port {} ({}x{})",
            self.config.listen_port, width, height
        );
        Ok(server)
    }

    /// Brings the downstream side in line with the current client: replaces the
    /// server if the geometry changed, rebinds relays and makes sure the loop
    /// runs. Returns when to retry if the server could not be recreated.
    fn reconcile_downstream(&self) -> Option<Instant> {
        let client = self.current_client()?;
        let (width, height) = (client.frame_width(), client.frame_height());

        let mut replaced = false;
        let server = match self.current_server() {
            Some(server) if server.width() == width && server.height() == height => server,
            stale => {
                if let Some(stale) = stale {
                    info!(
                        "Framebuffer size changed from {}x{} to {}x{}, recreating proxy server",
                        stale.width(),
                        stale.height(),
                        width,
                        height
                    );
                    // Join the old loop before the replacement exists
                    self.downstream.stop();
                    stale.close();
                    self.lock_endpoints().server = None;
                }

                match self.provision_server(width, height) {
                    Ok(server) => {
                        let mut endpoints = self.lock_endpoints();
                        if endpoints.closed {
                            drop(endpoints);
                            server.close();
                            return None;
                        }
                        endpoints.server = Some(server.clone());
                        drop(endpoints);
                        replaced = true;
                        server
                    }
                    Err(e) => {
                        error!("Failed to recreate proxy server: {}", e);
                        return Some(Instant::now() + self.config.reconnect_delay);
                    }
                }
            }
        };

        self.rebind(&client, &server);
        if replaced {
            self.seed_downstream(&client, &server);
        }
        self.ensure_downstream_loop();
        None
    }

    /// Fills a freshly created server from the upstream mirror. Updates that
    /// arrived while no server was bound were dropped, so the mirror is copied
    /// once and a full update is requested on top.
    fn seed_downstream(&self, client: &Arc<dyn ClientPort>, server: &Arc<dyn ServerPort>) {
        FrameRelay::new(client, server).relay(server.frame_buffer().full_rect());
        client.request_full_update();
    }

    /// Registers fresh relays on the given endpoints.
    fn rebind(&self, client: &Arc<dyn ClientPort>, server: &Arc<dyn ServerPort>) {
        let frames = FrameRelay::new(client, server);
        client.set_framebuffer_update_handler(Arc::new(move |rect: Rect| frames.relay(rect)));

        let input = InputRelay::new(client);
        let pointer = input.clone();
        server.set_pointer_handler(Arc::new(
            move |button_mask: u8, x: u16, y: u16, _viewer: ViewerId| {
                pointer.pointer(button_mask, x, y)
            },
        ));
        server.set_key_handler(Arc::new(move |down: bool, key: u32, _viewer: ViewerId| {
            input.key(key, down)
        }));
        server.set_new_viewer_handler(Arc::new(|viewer: ViewerId| {
            info!("Viewer {} connected", viewer)
        }));

        let generation = self.binding_generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Relays rebound (generation {})", generation);
    }

    fn ensure_downstream_loop(&self) {
        if let Some(server) = self.current_server() {
            self.downstream.start(server);
        }
    }

    /// Fills the downstream framebuffer with the placeholder color so viewers
    /// can tell the upstream is gone.
    fn paint_placeholder(&self) {
        if let Some(server) = self.current_server() {
            let framebuffer = server.frame_buffer();
            framebuffer.fill(self.config.placeholder_color);
            server.mark_modified(framebuffer.full_rect());
        }
    }

    /// Sleeps for `delay`; returns `false` early if the multiplexer closes.
    fn wait_before_retry(&self, delay: Duration) -> bool {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return false;
        }

        get_or_init_relay_runtime().block_on(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                _ = shutdown_rx.changed() => false,
            }
        })
    }

    /// Records a state change and fires the matching callback, at most once per
    /// actual transition into or out of `Connected`.
    ///
    /// Once closed, only the move to `Disconnected` is accepted.
    fn transition(&self, next: ConnectionState) {
        let previous = {
            let endpoints = self.lock_endpoints();
            if endpoints.closed && next != ConnectionState::Disconnected {
                return;
            }
            self.swap_state(next)
        };
        self.notify(previous, next);
    }

    /// Replaces the state without notifying. Lock order is endpoints, then
    /// state.
    fn swap_state(&self, next: ConnectionState) -> ConnectionState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *state, next)
    }

    /// Fires the callback for a `previous -> next` change. Must be called
    /// without holding the endpoints or state lock.
    fn notify(&self, previous: ConnectionState, next: ConnectionState) {
        if previous == next {
            return;
        }
        debug!("Upstream connection {} -> {}", previous, next);

        if next == ConnectionState::Connected {
            if let Some(callback) = &self.on_online {
                callback();
            }
        } else if previous == ConnectionState::Connected {
            if let Some(callback) = &self.on_offline {
                callback();
            }
        }
    }

    fn current_client(&self) -> Option<Arc<dyn ClientPort>> {
        self.lock_endpoints().client.clone()
    }

    fn current_server(&self) -> Option<Arc<dyn ServerPort>> {
        self.lock_endpoints().server.clone()
    }

    fn lock_endpoints(&self) -> MutexGuard<'_, Endpoints> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close();
        }
    }
}
