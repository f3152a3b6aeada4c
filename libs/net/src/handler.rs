//! Readiness callbacks delivered by an event loop.
//!
//! All callbacks for connections registered on one loop run sequentially
//! on that loop's thread, so a handler never races with another handler
//! of the same loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::buffer::RingBuffer;
use crate::connection::Connection;
use crate::event_loop::NetEventLoop;
use crate::server::ServerSock;

/// Context passed to [`ConnectionHandler`] callbacks.
pub struct HandlerContext<'a> {
    connection: &'a Arc<Connection>,
    event_loop: &'a NetEventLoop,
}

impl<'a> HandlerContext<'a> {
    pub fn new(connection: &'a Arc<Connection>, event_loop: &'a NetEventLoop) -> Self {
        Self {
            connection,
            event_loop,
        }
    }

    /// The connection the event is about.
    pub fn connection(&self) -> &'a Arc<Connection> {
        self.connection
    }

    /// The loop the connection is registered on.
    pub fn event_loop(&self) -> &'a NetEventLoop {
        self.event_loop
    }
}

/// Per-connection event handler.
pub trait ConnectionHandler: Send + Sync {
    /// An outbound connection finished connecting. Only fired for
    /// connections added with `add_client_connection`.
    fn connected(&self, _ctx: &HandlerContext<'_>) {}

    /// Bytes were stored into the connection's inbound buffer.
    fn readable(&self, ctx: &HandlerContext<'_>);

    /// Bytes from the outbound buffer were written to the socket.
    fn writable(&self, ctx: &HandlerContext<'_>);

    /// The socket reported an I/O error. The loop closes the connection
    /// afterwards if the handler did not.
    fn exception(&self, ctx: &HandlerContext<'_>, err: &io::Error);

    /// The remote end sent EOF. The connection stays registered.
    fn closed(&self, ctx: &HandlerContext<'_>);

    /// The connection left the loop (closed or explicitly removed).
    fn removed(&self, ctx: &HandlerContext<'_>);
}

/// Context passed to [`ServerHandler`] callbacks.
pub struct ServerContext<'a> {
    server: &'a Arc<ServerSock>,
    event_loop: &'a NetEventLoop,
}

impl<'a> ServerContext<'a> {
    pub fn new(server: &'a Arc<ServerSock>, event_loop: &'a NetEventLoop) -> Self {
        Self { server, event_loop }
    }

    pub fn server(&self) -> &'a Arc<ServerSock> {
        self.server
    }

    pub fn event_loop(&self) -> &'a NetEventLoop {
        self.event_loop
    }
}

/// Acceptor event handler.
pub trait ServerHandler: Send + Sync {
    /// `accept` failed. The acceptor keeps serving.
    fn accept_fail(&self, ctx: &ServerContext<'_>, err: &io::Error);

    /// A connection was accepted. It is not registered on any loop yet.
    fn connection(&self, ctx: &ServerContext<'_>, connection: Arc<Connection>);

    /// Allocate the (inbound, outbound) buffers for a new connection.
    fn io_buffers(&self, remote: &SocketAddr) -> (RingBuffer, RingBuffer);

    /// The listener left the loop.
    fn removed(&self, ctx: &ServerContext<'_>);
}
