//! Core VNC relay implementation.
//!
//! This module sits between one upstream Remote Framebuffer (RFB) server and any
//! number of downstream viewers. Framebuffer updates flow downstream, input
//! events flow upstream, and the downstream listener survives upstream outages.
//!
//! # Architecture
//!
//! - **`engine`**: Port traits the external RFB engine implements (client and server side)
//! - **`framebuffer`**: Fixed 4-byte-per-pixel framebuffer mirrors and dirty rectangles
//! - **`relay`**: Frame relay (upstream → downstream pixels) and input relay (viewers → upstream)
//! - **`lifecycle`**: Start/stop coordination of the downstream event loop
//! - **`multiplexer`**: Connection supervisor with the reconnect state machine
//! - **`snapshot`**: Packed RGB snapshots and PNG export
//!
//! # Example Flow
//!
//! ```ignore
//! let multiplexer = Arc::new(
//!     Multiplexer::builder(MultiplexerConfig::new("10.0.0.5", 5900, 5901))
//!         .client_factory(engine.client_factory())
//!         .server_factory(engine.server_factory())
//!         .on_online(|| println!("upstream online"))
//!         .on_offline(|| println!("upstream offline"))
//!         .build()?,
//! );
//!
//! let runner = multiplexer.clone();
//! std::thread::spawn(move || runner.run());
//!
//! // Later
//! multiplexer.close();
//! ```

pub mod engine;
pub mod framebuffer;
pub mod lifecycle;
pub mod multiplexer;
pub mod relay;
pub mod snapshot;
