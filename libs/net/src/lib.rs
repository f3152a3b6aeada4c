//! Readiness-driven TCP transport for the plfm-vt relay.
//!
//! This library provides:
//! - [`RingBuffer`]: fixed-capacity byte buffers that two connections can
//!   share, so relayed bytes are never copied between them
//! - [`Connection`] and [`ServerSock`]: non-blocking TCP endpoints
//! - [`NetEventLoop`]: a single-threaded readiness loop delivering
//!   [`ConnectionHandler`] / [`ServerHandler`] callbacks
//! - [`EventLoopGroup`]: round-robin distribution over several loops
//!
//! Low-level lifecycle tracing is emitted under the `plfm_net::lowlevel`
//! target and can be enabled independently, e.g.
//! `RUST_LOG=plfm_net::lowlevel=trace`.

mod buffer;
mod connection;
mod event_loop;
mod group;
mod handler;
mod server;

pub use buffer::RingBuffer;
pub use connection::{Connection, ConnectionId};
pub use event_loop::NetEventLoop;
pub use group::EventLoopGroup;
pub use handler::{ConnectionHandler, HandlerContext, ServerContext, ServerHandler};
pub use server::ServerSock;
