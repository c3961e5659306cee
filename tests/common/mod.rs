//! Thread-based fake RFB engine shared by the integration tests.
//!
//! The fake client serves one scripted upstream (availability and geometry can
//! change between connections). Fake servers block in `run_event_loop` until
//! stopped. Every structural step is appended to an ordered event log.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use vnc_multiplexer::{
    ClientFactory, ClientPort, EngineError, Framebuffer, FramebufferUpdateHandler, KeyEventHandler,
    MultiplexerConfig, NewViewerHandler, PixelLayout, PointerEventHandler, Rect, ServerFactory,
    ServerPort, ViewerId,
};

pub const LISTEN_PORT: u16 = 5901;

/// Configuration with short timeouts suitable for tests.
pub fn fast_config() -> MultiplexerConfig {
    MultiplexerConfig::new("upstream.test", 5900, LISTEN_PORT)
        .with_password("secret")
        .with_reconnect_delay(Duration::from_millis(20))
        .with_client_loop_timeout(Duration::from_millis(2))
        .with_server_loop_timeout(Duration::from_millis(2))
}

/// Polls `condition` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ClientCreated(usize),
    ServerCreated { id: usize, width: u16, height: u16 },
    ServerStarted { id: usize, port: u16 },
    LoopStarted(usize),
    LoopExited(usize),
    ServerClosed(usize),
}

struct Upstream {
    available: bool,
    width: u16,
    height: u16,
}

pub struct FakeEngine {
    upstream: Mutex<Upstream>,
    events: Mutex<Vec<Event>>,
    bound_ports: Mutex<HashSet<u16>>,
    clients: Mutex<Vec<Arc<FakeClient>>>,
    servers: Mutex<Vec<Arc<FakeServer>>>,
    next_id: AtomicUsize,
    active_loops: AtomicUsize,
    max_active_loops: AtomicUsize,
    failing_server_creations: AtomicUsize,
    initialize_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FakeEngine {
    pub fn new(width: u16, height: u16) -> Arc<Self> {
        vnc_multiplexer::logging::init_logging(log::LevelFilter::Debug);
        Arc::new(Self {
            upstream: Mutex::new(Upstream {
                available: true,
                width,
                height,
            }),
            events: Mutex::new(Vec::new()),
            bound_ports: Mutex::new(HashSet::new()),
            clients: Mutex::new(Vec::new()),
            servers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            active_loops: AtomicUsize::new(0),
            max_active_loops: AtomicUsize::new(0),
            failing_server_creations: AtomicUsize::new(0),
            initialize_hook: Mutex::new(None),
        })
    }

    pub fn client_factory(self: &Arc<Self>) -> ClientFactory {
        let engine = Arc::downgrade(self);
        Arc::new(move |layout: PixelLayout| -> Result<Arc<dyn ClientPort>, EngineError> {
            let engine = engine.upgrade().ok_or(EngineError::CreateClient)?;
            let client: Arc<dyn ClientPort> = engine.create_client(layout);
            Ok(client)
        })
    }

    pub fn server_factory(self: &Arc<Self>) -> ServerFactory {
        let engine = Arc::downgrade(self);
        Arc::new(
            move |width: u16,
                  height: u16,
                  layout: PixelLayout|
                  -> Result<Arc<dyn ServerPort>, EngineError> {
                let engine = engine.upgrade().ok_or(EngineError::CreateServer)?;
                let server: Arc<dyn ServerPort> = engine.create_server(width, height, layout)?;
                Ok(server)
            },
        )
    }

    pub fn create_client(self: &Arc<Self>, layout: PixelLayout) -> Arc<FakeClient> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let client = Arc::new(FakeClient::new(id, Arc::downgrade(self), layout));
        self.clients.lock().unwrap().push(client.clone());
        self.record(Event::ClientCreated(id));
        client
    }

    pub fn create_server(
        self: &Arc<Self>,
        width: u16,
        height: u16,
        layout: PixelLayout,
    ) -> Result<Arc<FakeServer>, EngineError> {
        let failing = self
            .failing_server_creations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(EngineError::CreateServer);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let framebuffer =
            Arc::new(Framebuffer::new(width, height).map_err(|_| EngineError::CreateServer)?);
        let server = Arc::new(FakeServer::new(id, Arc::downgrade(self), framebuffer, layout));
        self.servers.lock().unwrap().push(server.clone());
        self.record(Event::ServerCreated { id, width, height });
        Ok(server)
    }

    pub fn set_upstream_available(&self, available: bool) {
        self.upstream.lock().unwrap().available = available;
    }

    pub fn set_upstream_geometry(&self, width: u16, height: u16) {
        let mut upstream = self.upstream.lock().unwrap();
        upstream.width = width;
        upstream.height = height;
    }

    /// Simulates the upstream server going away: new handshakes fail and the
    /// current connection breaks.
    pub fn drop_upstream(&self) {
        self.set_upstream_available(false);
        if let Some(client) = self.latest_client() {
            client.lose();
        }
    }

    /// Makes the next `count` server creations fail.
    pub fn fail_next_server_creations(&self, count: usize) {
        self.failing_server_creations.store(count, Ordering::SeqCst);
    }

    /// Runs `hook` inside the next successful client handshake.
    pub fn on_next_initialize(&self, hook: impl FnOnce() + Send + 'static) {
        *self.initialize_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn latest_client(&self) -> Option<Arc<FakeClient>> {
        self.clients.lock().unwrap().last().cloned()
    }

    pub fn latest_server(&self) -> Option<Arc<FakeServer>> {
        self.servers.lock().unwrap().last().cloned()
    }

    pub fn clients(&self) -> Vec<Arc<FakeClient>> {
        self.clients.lock().unwrap().clone()
    }

    pub fn servers(&self) -> Vec<Arc<FakeServer>> {
        self.servers.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn position(&self, event: Event) -> Option<usize> {
        self.events().iter().position(|e| *e == event)
    }

    pub fn active_loops(&self) -> usize {
        self.active_loops.load(Ordering::SeqCst)
    }

    pub fn max_active_loops(&self) -> usize {
        self.max_active_loops.load(Ordering::SeqCst)
    }

    pub fn is_port_bound(&self, port: u16) -> bool {
        self.bound_ports.lock().unwrap().contains(&port)
    }

    fn upstream_geometry(&self) -> Option<(u16, u16)> {
        let upstream = self.upstream.lock().unwrap();
        upstream.available.then_some((upstream.width, upstream.height))
    }

    fn bind(&self, port: u16) -> Result<(), EngineError> {
        if self.bound_ports.lock().unwrap().insert(port) {
            Ok(())
        } else {
            Err(EngineError::AddressInUse(port))
        }
    }

    fn unbind(&self, port: u16) {
        self.bound_ports.lock().unwrap().remove(&port);
    }

    fn loop_entered(&self, id: usize) {
        let active = self.active_loops.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_loops.fetch_max(active, Ordering::SeqCst);
        self.record(Event::LoopStarted(id));
    }

    fn loop_exited(&self, id: usize) {
        self.record(Event::LoopExited(id));
        self.active_loops.fetch_sub(1, Ordering::SeqCst);
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct FakeClient {
    pub id: usize,
    engine: Weak<FakeEngine>,
    layout: PixelLayout,
    endpoint: Mutex<Option<(String, u16)>>,
    credential: Mutex<Option<String>>,
    negotiated: Mutex<Option<PixelLayout>>,
    geometry: Mutex<(u16, u16)>,
    framebuffer: Mutex<Option<Arc<Framebuffer>>>,
    handler: Mutex<Option<FramebufferUpdateHandler>>,
    pending: Mutex<VecDeque<Rect>>,
    wake: Condvar,
    connected: AtomicBool,
    broken: AtomicBool,
    full_update_requests: AtomicUsize,
    delivered: AtomicUsize,
    pointer_events: Mutex<Vec<(u16, u16, u8)>>,
    key_events: Mutex<Vec<(u32, bool)>>,
}

impl FakeClient {
    fn new(id: usize, engine: Weak<FakeEngine>, layout: PixelLayout) -> Self {
        Self {
            id,
            engine,
            layout,
            endpoint: Mutex::new(None),
            credential: Mutex::new(None),
            negotiated: Mutex::new(None),
            geometry: Mutex::new((0, 0)),
            framebuffer: Mutex::new(None),
            handler: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            connected: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            full_update_requests: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
            pointer_events: Mutex::new(Vec::new()),
            key_events: Mutex::new(Vec::new()),
        }
    }

    /// Fills the upstream mirror with `value` and queues `rect` as dirty.
    pub fn deliver_fill(&self, value: u8, rect: Rect) {
        let framebuffer = self.framebuffer.lock().unwrap().clone();
        if let Some(framebuffer) = framebuffer {
            framebuffer.update_from_slice(&vec![value; framebuffer.len()]).unwrap();
        }
        self.pending.lock().unwrap().push_back(rect);
        self.wake.notify_all();
    }

    /// Breaks the connection as if the server went away.
    pub fn lose(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.broken.store(true, Ordering::SeqCst);
        let _guard = self.pending.lock().unwrap();
        self.wake.notify_all();
    }

    pub fn endpoint(&self) -> Option<(String, u16)> {
        self.endpoint.lock().unwrap().clone()
    }

    pub fn credential(&self) -> Option<String> {
        self.credential.lock().unwrap().clone()
    }

    pub fn negotiated_layout(&self) -> Option<PixelLayout> {
        *self.negotiated.lock().unwrap()
    }

    pub fn factory_layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn full_update_requests(&self) -> usize {
        self.full_update_requests.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().unwrap().is_some()
    }

    pub fn pointer_events(&self) -> Vec<(u16, u16, u8)> {
        self.pointer_events.lock().unwrap().clone()
    }

    pub fn key_events(&self) -> Vec<(u32, bool)> {
        self.key_events.lock().unwrap().clone()
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }
}

impl ClientPort for FakeClient {
    fn set_endpoint(&self, host: &str, port: u16) {
        *self.endpoint.lock().unwrap() = Some((host.to_string(), port));
    }

    fn set_credential(&self, secret: &str) {
        *self.credential.lock().unwrap() = Some(secret.to_string());
    }

    fn set_pixel_format(&self, layout: PixelLayout) {
        *self.negotiated.lock().unwrap() = Some(layout);
    }

    fn initialize(&self) -> bool {
        let Some(engine) = self.engine.upgrade() else {
            return false;
        };
        let Some((width, height)) = engine.upstream_geometry() else {
            return false;
        };
        let Ok(framebuffer) = Framebuffer::new(width, height) else {
            return false;
        };

        *self.geometry.lock().unwrap() = (width, height);
        *self.framebuffer.lock().unwrap() = Some(Arc::new(framebuffer));
        self.connected.store(true, Ordering::SeqCst);

        let hook = engine.initialize_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        true
    }

    fn request_full_update(&self) {
        self.full_update_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn send_pointer(&self, x: u16, y: u16, button_mask: u8) {
        self.pointer_events.lock().unwrap().push((x, y, button_mask));
    }

    fn send_key(&self, key: u32, down: bool) {
        self.key_events.lock().unwrap().push((key, down));
    }

    fn run_event_loop(&self, timeout: Duration) -> Result<(), EngineError> {
        let mut pending = self.pending.lock().unwrap();
        if !self.broken.load(Ordering::SeqCst) && pending.is_empty() {
            pending = self.wake.wait_timeout(pending, timeout).unwrap().0;
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(EngineError::ConnectionLost(format!("client {} disconnected", self.id)));
        }

        let rects: Vec<Rect> = pending.drain(..).collect();
        drop(pending);

        let handler = self.handler.lock().unwrap().clone();
        for rect in rects {
            if let Some(handler) = &handler {
                handler(rect);
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.lose();
    }

    fn frame_buffer(&self) -> Option<Arc<Framebuffer>> {
        self.framebuffer.lock().unwrap().clone()
    }

    fn frame_width(&self) -> u16 {
        self.geometry.lock().unwrap().0
    }

    fn frame_height(&self) -> u16 {
        self.geometry.lock().unwrap().1
    }

    fn set_framebuffer_update_handler(&self, handler: FramebufferUpdateHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }
}

pub struct FakeServer {
    pub id: usize,
    engine: Weak<FakeEngine>,
    layout: PixelLayout,
    framebuffer: Arc<Framebuffer>,
    listen_port: Mutex<Option<u16>>,
    bound_port: Mutex<Option<u16>>,
    negotiated: Mutex<Option<PixelLayout>>,
    stopped: Mutex<bool>,
    wake: Condvar,
    closed: AtomicBool,
    loop_runs: AtomicUsize,
    modified: Mutex<Vec<Rect>>,
    pointer_handler: Mutex<Option<PointerEventHandler>>,
    key_handler: Mutex<Option<KeyEventHandler>>,
    new_viewer_handler: Mutex<Option<NewViewerHandler>>,
}

impl FakeServer {
    fn new(
        id: usize,
        engine: Weak<FakeEngine>,
        framebuffer: Arc<Framebuffer>,
        layout: PixelLayout,
    ) -> Self {
        Self {
            id,
            engine,
            layout,
            framebuffer,
            listen_port: Mutex::new(None),
            bound_port: Mutex::new(None),
            negotiated: Mutex::new(None),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            closed: AtomicBool::new(false),
            loop_runs: AtomicUsize::new(0),
            modified: Mutex::new(Vec::new()),
            pointer_handler: Mutex::new(None),
            key_handler: Mutex::new(None),
            new_viewer_handler: Mutex::new(None),
        }
    }

    pub fn modified(&self) -> Vec<Rect> {
        self.modified.lock().unwrap().clone()
    }

    pub fn modified_count(&self, rect: Rect) -> usize {
        self.modified.lock().unwrap().iter().filter(|r| **r == rect).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap()
    }

    pub fn loop_runs(&self) -> usize {
        self.loop_runs.load(Ordering::SeqCst)
    }

    pub fn listen_port(&self) -> Option<u16> {
        *self.listen_port.lock().unwrap()
    }

    pub fn negotiated_layout(&self) -> Option<PixelLayout> {
        *self.negotiated.lock().unwrap()
    }

    pub fn factory_layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn pixel(&self, x: u16, y: u16) -> [u8; 4] {
        let offset = (usize::from(y) * usize::from(self.framebuffer.width()) + usize::from(x)) * 4;
        let pixels = self.framebuffer.pixels();
        [pixels[offset], pixels[offset + 1], pixels[offset + 2], pixels[offset + 3]]
    }

    /// Simulates a viewer moving the pointer.
    pub fn inject_pointer(&self, button_mask: u8, x: u16, y: u16, viewer: ViewerId) {
        let handler = self.pointer_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(button_mask, x, y, viewer);
        }
    }

    /// Simulates a viewer pressing or releasing a key.
    pub fn inject_key(&self, down: bool, key: u32, viewer: ViewerId) {
        let handler = self.key_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(down, key, viewer);
        }
    }

    pub fn connect_viewer(&self, viewer: ViewerId) {
        let handler = self.new_viewer_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(viewer);
        }
    }

    pub fn has_handlers(&self) -> bool {
        self.pointer_handler.lock().unwrap().is_some()
            && self.key_handler.lock().unwrap().is_some()
            && self.new_viewer_handler.lock().unwrap().is_some()
    }
}

impl ServerPort for FakeServer {
    fn set_listen_port(&self, port: u16) {
        *self.listen_port.lock().unwrap() = Some(port);
    }

    fn set_pixel_format(&self, layout: PixelLayout) {
        *self.negotiated.lock().unwrap() = Some(layout);
    }

    fn start(&self) -> Result<(), EngineError> {
        let engine = self.engine.upgrade().ok_or(EngineError::Start("engine gone".into()))?;
        let port = self
            .listen_port()
            .ok_or_else(|| EngineError::Start("no listen port".into()))?;
        engine.bind(port)?;
        *self.bound_port.lock().unwrap() = Some(port);
        engine.record(Event::ServerStarted { id: self.id, port });
        Ok(())
    }

    fn run_event_loop(&self, timeout: Duration) -> Result<(), EngineError> {
        let Some(engine) = self.engine.upgrade() else {
            return Err(EngineError::EventLoop("engine gone".into()));
        };
        self.loop_runs.fetch_add(1, Ordering::SeqCst);
        engine.loop_entered(self.id);

        let mut stopped = self.stopped.lock().unwrap();
        while !*stopped {
            stopped = self.wake.wait_timeout(stopped, timeout).unwrap().0;
        }
        drop(stopped);

        engine.loop_exited(self.id);
        Ok(())
    }

    fn stop(&self) {
        *self.stopped.lock().unwrap() = true;
        self.wake.notify_all();
    }

    fn close(&self) {
        self.stop();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            if let Some(port) = self.bound_port.lock().unwrap().take() {
                engine.unbind(port);
            }
            engine.record(Event::ServerClosed(self.id));
        }
    }

    fn frame_buffer(&self) -> Arc<Framebuffer> {
        self.framebuffer.clone()
    }

    fn width(&self) -> u16 {
        self.framebuffer.width()
    }

    fn height(&self) -> u16 {
        self.framebuffer.height()
    }

    fn mark_modified(&self, rect: Rect) {
        self.modified.lock().unwrap().push(rect);
    }

    fn set_pointer_handler(&self, handler: PointerEventHandler) {
        *self.pointer_handler.lock().unwrap() = Some(handler);
    }

    fn set_key_handler(&self, handler: KeyEventHandler) {
        *self.key_handler.lock().unwrap() = Some(handler);
    }

    fn set_new_viewer_handler(&self, handler: NewViewerHandler) {
        *self.new_viewer_handler.lock().unwrap() = Some(handler);
    }
}
