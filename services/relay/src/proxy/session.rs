//! Relay sessions and teardown helpers.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use plfm_net::Connection;
use serde::Serialize;
use tracing::trace;

use super::LOWLEVEL;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ses-{}", self.0)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    /// Passive connect in progress.
    Connecting = 0,
    /// Both directions relaying.
    Open = 1,
    /// One side hit EOF; the other is draining what is left.
    Draining = 2,
    /// Torn down.
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// An active (accepted) connection paired with a passive (outbound)
/// connection. Each side's inbound buffer is the other side's outbound
/// buffer.
pub struct Session {
    id: SessionId,
    active: Arc<Connection>,
    passive: Arc<Connection>,
    state: AtomicU8,
    created_at: SystemTime,
    /// Set once the passive side has been removed from its loop.
    retired: AtomicBool,
}

impl Session {
    pub(crate) fn new(active: Arc<Connection>, passive: Arc<Connection>) -> Self {
        debug_assert!(Arc::ptr_eq(active.in_buffer(), passive.out_buffer()));
        debug_assert!(Arc::ptr_eq(active.out_buffer(), passive.in_buffer()));
        Self {
            id: SessionId::next(),
            active,
            passive,
            state: AtomicU8::new(SessionState::Connecting as u8),
            created_at: SystemTime::now(),
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The accepted client connection.
    pub fn active(&self) -> &Arc<Connection> {
        &self.active
    }

    /// The outbound backend connection.
    pub fn passive(&self) -> &Arc<Connection> {
        &self.passive
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Whether both connections are closed. A session draining toward
    /// one side after the other hit EOF is still open.
    pub fn is_closed(&self) -> bool {
        self.active.is_closed() && self.passive.is_closed()
    }

    /// Move to `state`. `Closed` is terminal.
    pub(crate) fn set_state(&self, state: SessionState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != SessionState::Closed as u8).then_some(state as u8)
            });
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Close both connections and release the active side's buffers,
    /// which are the only two buffers of the session.
    pub(crate) fn close_and_release(&self) {
        self.set_state(SessionState::Closed);
        close_connection_and_release_buffers(&self.active);
        close_connection(&self.passive);
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            state: self.state(),
            client: self.active.remote(),
            backend: self.passive.remote(),
            to_backend_pending: self.active.in_buffer().used(),
            to_client_pending: self.active.out_buffer().used(),
            age_ms: self
                .created_at
                .elapsed()
                .unwrap_or(Duration::ZERO)
                .as_millis() as u64,
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} -> {})", self.id, self.active, self.passive)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("active", &self.active)
            .field("passive", &self.passive)
            .finish()
    }
}

/// Serializable snapshot of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub client: SocketAddr,
    pub backend: SocketAddr,
    /// Bytes buffered from client to backend.
    pub to_backend_pending: usize,
    /// Bytes buffered from backend to client.
    pub to_client_pending: usize,
    pub age_ms: u64,
}

pub(crate) fn close_connection(connection: &Connection) {
    trace!(target: LOWLEVEL, conn = %connection, "closing connection");
    connection.close();
}

pub(crate) fn close_connection_and_release_buffers(connection: &Connection) {
    close_connection(connection);
    connection.in_buffer().release();
    connection.out_buffer().release();
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use plfm_net::RingBuffer;

    /// Two connected sockets wrapped as an aliased active/passive pair.
    pub(crate) fn aliased_pair() -> (Arc<Connection>, Arc<Connection>, Vec<std::net::TcpStream>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = std::net::TcpStream::connect(addr).unwrap();
        let (a_peer, _) = listener.accept().unwrap();
        let b = std::net::TcpStream::connect(addr).unwrap();
        let (b_peer, _) = listener.accept().unwrap();

        let to_backend = Arc::new(RingBuffer::with_capacity(64));
        let to_client = Arc::new(RingBuffer::with_capacity(64));
        let active =
            Connection::from_std(a, Arc::clone(&to_backend), Arc::clone(&to_client)).unwrap();
        let passive = Connection::from_std(b, to_client, to_backend).unwrap();
        (Arc::new(active), Arc::new(passive), vec![a_peer, b_peer])
    }

    #[test]
    fn test_session_ids_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("ses-"));
    }

    #[test]
    fn test_closed_state_is_terminal() {
        let (active, passive, _peers) = aliased_pair();
        let session = Session::new(active, passive);
        assert_eq!(session.state(), SessionState::Connecting);

        session.set_state(SessionState::Open);
        assert_eq!(session.state(), SessionState::Open);

        session.set_state(SessionState::Closed);
        session.set_state(SessionState::Draining);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_close_and_release() {
        let (active, passive, _peers) = aliased_pair();
        let session = Session::new(Arc::clone(&active), Arc::clone(&passive));
        active.in_buffer().push(b"pending");

        session.close_and_release();
        assert!(session.is_closed());
        assert!(active.is_locally_closed());
        assert!(passive.is_locally_closed());
        assert!(active.in_buffer().is_released());
        assert!(active.out_buffer().is_released());
        assert!(passive.in_buffer().is_released());
        assert!(passive.out_buffer().is_released());

        // Repeated teardown is harmless.
        session.close_and_release();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_half_closed_session_is_not_closed() {
        let (active, passive, _peers) = aliased_pair();
        let session = Session::new(Arc::clone(&active), Arc::clone(&passive));
        assert!(!session.is_closed());

        active.close();
        assert!(active.is_closed());
        assert!(!passive.is_closed());
        assert!(!session.is_closed());

        passive.close();
        assert!(session.is_closed());
    }

    #[test]
    fn test_info_reports_pending_bytes() {
        let (active, passive, _peers) = aliased_pair();
        let session = Session::new(Arc::clone(&active), passive);
        active.in_buffer().push(b"abc");
        active.out_buffer().push(b"hello");

        let info = session.info();
        assert_eq!(info.to_backend_pending, 3);
        assert_eq!(info.to_client_pending, 5);
        assert_eq!(info.state, SessionState::Connecting);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], "connecting");
        assert_eq!(json["id"], session.id().as_u64());
    }
}
