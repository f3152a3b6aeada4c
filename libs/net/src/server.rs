//! Listening sockets.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use mio::net::TcpListener;
use mio::Token;
use parking_lot::Mutex;

/// A bound, non-blocking TCP listener.
pub struct ServerSock {
    bind: SocketAddr,
    pub(crate) listener: Mutex<TcpListener>,
    pub(crate) token: Mutex<Option<Token>>,
}

impl ServerSock {
    /// Bind a listener on `addr`. Port 0 picks an ephemeral port.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let bind = listener.local_addr()?;
        Ok(Self {
            bind,
            listener: Mutex::new(listener),
            token: Mutex::new(None),
        })
    }

    /// The bound address (with the actual port when bound to port 0).
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind
    }

    /// Whether the listener is attached to an event loop.
    pub fn is_registered(&self) -> bool {
        self.token.lock().is_some()
    }
}

impl fmt::Display for ServerSock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server[{}]", self.bind)
    }
}

impl fmt::Debug for ServerSock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSock").field("bind", &self.bind).finish()
    }
}
