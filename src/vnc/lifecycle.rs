//! Start/stop coordination for the downstream server's event loop.
//!
//! The engine's `run_event_loop` blocks, so each loop runs on Tokio's blocking
//! pool under a supervising task. Stopping signals the supervisor, which calls
//! the server's `stop()` and waits for the blocking call to return; the caller
//! in turn waits for the supervisor. At most one loop exists at any time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{error, info, warn};
use once_cell::sync::OnceCell;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::vnc::engine::ServerPort;

/// Runtime hosting downstream loops and the reconnect timer.
static RELAY_RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Initializes or retrieves the shared Tokio runtime.
///
/// Callers block on it from plain threads; calling into it from inside
/// another runtime's async context panics.
pub(crate) fn get_or_init_relay_runtime() -> &'static Runtime {
    RELAY_RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .thread_name("vnc-mux")
            .enable_all()
            .build()
            .expect("Failed to build VNC multiplexer Tokio runtime")
    })
}

/// Stop signal and completion handle of one running loop.
///
/// Consumed when the loop is stopped; a restart creates a new one.
struct LoopControl {
    server: Arc<dyn ServerPort>,
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct LoopSlot {
    running: Option<LoopControl>,
    shut_down: bool,
}

/// Owns the downstream event loop of the current server.
pub struct DownstreamLoop {
    timeout: Duration,
    slot: Mutex<LoopSlot>,
}

impl DownstreamLoop {
    /// Creates a coordinator whose loops use `timeout` per engine call.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            slot: Mutex::new(LoopSlot::default()),
        }
    }

    /// Starts serving `server` on a dedicated loop.
    ///
    /// A loop still running for the same server is left alone. Any other loop is
    /// stopped and joined first. Returns `false` once [`shutdown`] was called.
    ///
    /// [`shutdown`]: DownstreamLoop::shutdown
    pub fn start(&self, server: Arc<dyn ServerPort>) -> bool {
        let mut slot = self.lock();
        if slot.shut_down {
            warn!("Not starting downstream event loop: coordinator is shut down");
            return false;
        }

        if let Some(control) = &slot.running {
            if Arc::ptr_eq(&control.server, &server) && !control.handle.is_finished() {
                return true;
            }
        }
        Self::stop_locked(&mut slot);

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = get_or_init_relay_runtime().spawn(supervise(server.clone(), self.timeout, stop_rx));
        slot.running = Some(LoopControl {
            server,
            stop_tx,
            handle,
        });
        true
    }

    /// Stops the running loop and waits until it has exited.
    ///
    /// No-op when nothing is running.
    pub fn stop(&self) {
        let mut slot = self.lock();
        Self::stop_locked(&mut slot);
    }

    /// Stops the running loop and refuses any later [`start`].
    ///
    /// [`start`]: DownstreamLoop::start
    pub fn shutdown(&self) {
        let mut slot = self.lock();
        slot.shut_down = true;
        Self::stop_locked(&mut slot);
    }

    /// Whether a loop is currently serving viewers.
    pub fn is_running(&self) -> bool {
        self.lock()
            .running
            .as_ref()
            .is_some_and(|control| !control.handle.is_finished())
    }

    // The slot lock stays held across the join so a concurrent start or
    // shutdown cannot observe a loop that is still winding down.
    fn stop_locked(slot: &mut MutexGuard<'_, LoopSlot>) {
        let Some(control) = slot.running.take() else {
            return;
        };

        // The supervisor may already be gone if the loop ended by itself
        let _ = control.stop_tx.send(());
        if let Err(e) = get_or_init_relay_runtime().block_on(control.handle) {
            error!("Downstream event loop task failed: {}", e);
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DownstreamLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn supervise(server: Arc<dyn ServerPort>, timeout: Duration, stop_rx: oneshot::Receiver<()>) {
    info!("Proxy server event loop started");

    let loop_server = server.clone();
    let mut pump = tokio::task::spawn_blocking(move || loop_server.run_event_loop(timeout));

    tokio::select! {
        biased;

        result = &mut pump => report(result),
        // A dropped sender means the coordinator went away: stop as well
        _ = stop_rx => {
            server.stop();
            report(pump.await);
        }
    }

    info!("Proxy server event loop stopped");
}

fn report(result: Result<Result<(), crate::error::EngineError>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Proxy server event loop ended with error: {}", e),
        Err(e) => error!("Proxy server event loop panicked: {}", e),
    }
}
