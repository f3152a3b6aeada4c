//! TCP connections owned by an event loop.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use mio::net::TcpStream;
use mio::Token;
use parking_lot::Mutex;
use tracing::trace;

use crate::buffer::RingBuffer;
use crate::event_loop::Shared;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Where a connection is currently registered.
#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) owner: Weak<Shared>,
    pub(crate) token: Token,
}

/// A non-blocking TCP endpoint with an inbound and an outbound buffer.
///
/// The event loop stores bytes read from the socket into `in_buffer` and
/// writes bytes pending in `out_buffer` to the socket.
pub struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
    local: Option<SocketAddr>,
    pub(crate) stream: Mutex<TcpStream>,
    in_buffer: Arc<RingBuffer>,
    out_buffer: Arc<RingBuffer>,
    closed: AtomicBool,
    remote_closed: AtomicBool,
    pub(crate) registration: Mutex<Option<Registration>>,
}

impl Connection {
    pub(crate) fn from_mio(
        stream: TcpStream,
        remote: SocketAddr,
        in_buffer: Arc<RingBuffer>,
        out_buffer: Arc<RingBuffer>,
    ) -> Self {
        let local = stream.local_addr().ok();
        Self {
            id: ConnectionId::next(),
            remote,
            local,
            stream: Mutex::new(stream),
            in_buffer,
            out_buffer,
            closed: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
            registration: Mutex::new(None),
        }
    }

    /// Wrap an already connected std socket. The socket is switched to
    /// non-blocking mode.
    pub fn from_std(
        stream: std::net::TcpStream,
        in_buffer: Arc<RingBuffer>,
        out_buffer: Arc<RingBuffer>,
    ) -> io::Result<Self> {
        let remote = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        Ok(Self::from_mio(
            TcpStream::from_std(stream),
            remote,
            in_buffer,
            out_buffer,
        ))
    }

    /// Start a non-blocking connect to `remote`.
    ///
    /// The connection completes asynchronously; register it with
    /// [`NetEventLoop::add_client_connection`](crate::NetEventLoop::add_client_connection)
    /// to be told when it is established.
    pub fn connect(
        remote: SocketAddr,
        in_buffer: Arc<RingBuffer>,
        out_buffer: Arc<RingBuffer>,
    ) -> io::Result<Self> {
        let stream = TcpStream::connect(remote)?;
        Ok(Self::from_mio(stream, remote, in_buffer, out_buffer))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Buffer receiving bytes read from the socket.
    pub fn in_buffer(&self) -> &Arc<RingBuffer> {
        &self.in_buffer
    }

    /// Buffer holding bytes to be written to the socket.
    pub fn out_buffer(&self) -> &Arc<RingBuffer> {
        &self.out_buffer
    }

    /// True once closed locally or once the remote end sent EOF.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.remote_closed.load(Ordering::Acquire)
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_locally_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the connection is attached to an event loop.
    pub fn is_registered(&self) -> bool {
        self.registration.lock().is_some()
    }

    /// Close the socket. Idempotent and callable from any thread.
    ///
    /// If the connection is registered, its loop removes it and fires the
    /// handler's `removed` callback on the loop thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(target: "plfm_net::lowlevel", conn = %self, "closing connection");

        if let Err(e) = self.stream.lock().shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                trace!(target: "plfm_net::lowlevel", conn = %self, error = %e, "shutdown failed");
            }
        }

        let registration = self.registration.lock().clone();
        if let Some(registration) = registration {
            if let Some(owner) = registration.owner.upgrade() {
                owner.schedule_removal(registration.token);
            }
        }
    }

    pub(crate) fn mark_remote_closed(&self) {
        self.remote_closed.store(true, Ordering::Release);
    }

    /// Token of this connection on `owner`, if registered there.
    pub(crate) fn token_on(&self, owner: &Arc<Shared>) -> Option<Token> {
        self.registration
            .lock()
            .as_ref()
            .filter(|r| std::ptr::eq(r.owner.as_ptr(), Arc::as_ptr(owner)))
            .map(|r| r.token)
    }

    pub(crate) fn clear_registration(&self, token: Token) {
        let mut registration = self.registration.lock();
        if registration.as_ref().is_some_and(|r| r.token == token) {
            *registration = None;
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.id, self.remote)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("remote_closed", &self.remote_closed.load(Ordering::Relaxed))
            .finish()
    }
}
