//! # coapd: CoAP Endpoint Runtime
//!
//! The runtime half of the workspace: per-connection sessions over
//! pluggable datagram transports, with the reliability machinery CoAP
//! layers on top of UDP (RFC 7252), block-wise transfers (RFC 7959) and
//! observe relationships (RFC 7641). The wire format itself lives in
//! `coapd-msg`.
//!
//! ## Architecture Overview
//!
//! ```text
//! coapd/
//! ├── config     - Endpoint configuration (TOML, validated)
//! ├── error      - Runtime error taxonomy and error sink
//! ├── transport  - Conn/Listener capability traits, UDP, loopback
//! ├── pool       - Process-wide message pool
//! ├── retransmit - Confirmable retransmission with exponential backoff
//! ├── dedup      - (remote, message-id) duplicate suppression
//! ├── token      - Token registry: one-shot waiters and observers
//! ├── blockwise  - Block1/Block2 split and reassembly engine
//! ├── dispatch   - Bounded handler work pool
//! ├── session    - Per-connection driver: reader, writer, timers
//! ├── observe    - Client-side observation handles
//! ├── keepalive  - Empty-CON probing companion task
//! └── server     - Accept loop over a transport Listener
//! ```
//!
//! ## Concurrency Model
//!
//! Each session runs a reader task, a writer task and a retransmission
//! timer task; user handlers are dispatched to a shared bounded work
//! pool and never block the reader. Datagrams from one remote are parsed
//! in arrival order but handled in parallel; outbound datagrams are
//! serialised through the writer, so socket-write order matches enqueue
//! order. Every waiting operation takes a
//! [`tokio_util::sync::CancellationToken`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use coapd::{Config, Server};
//! use coapd::transport::udp::UdpListener;
//! use coapd_msg::{Code, ContentFormat};
//!
//! # async fn run() -> coapd::Result<()> {
//! let listener = UdpListener::bind("0.0.0.0:5683".parse().unwrap())?;
//! let server = Server::new(Config::default()).with_handler(Arc::new(|w, _req| {
//!     w.set_response(Code::CONTENT, ContentFormat::TEXT_PLAIN, &b"hello"[..]);
//! }));
//! server.serve(listener).await
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod blockwise;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod keepalive;
pub mod observe;
pub mod pool;
pub mod retransmit;
pub mod server;
pub mod session;
pub mod token;
pub mod transport;

pub use config::Config;
pub use dispatch::{BoundedPool, WorkPool};
pub use error::{default_error_sink, Error, ErrorSink, Result};
pub use keepalive::KeepAlive;
pub use observe::Observation;
pub use server::Server;
pub use session::{Handler, ResponseWriter, Session};
