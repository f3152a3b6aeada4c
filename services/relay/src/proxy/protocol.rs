//! Protocol-mediated backend resolution.
//!
//! A [`ProtocolHandler`] inspects the first bytes a client sends (a TLS
//! ClientHello, a proxy preamble, ...) and eventually produces the
//! [`Connector`] that decides where the client goes. The relay then
//! detaches the negotiation from the connection and relays as usual. Bytes
//! the negotiation leaves in the inbound buffer are forwarded to the
//! backend.

use std::fmt;
use std::io;
use std::sync::Arc;

use plfm_net::{Connection, NetEventLoop};
use thiserror::Error;
use tracing::warn;

use super::bridge::Bridge;
use super::connector::Connector;

/// Why a negotiation did not produce a connector.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("connection closed during negotiation")]
    Closed,

    #[error("connection failed during negotiation: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no route for {0}")]
    NoRoute(String),
}

/// Factory for per-connection negotiations.
pub trait ProtocolHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Start negotiating on `ctx.connection()`.
    ///
    /// Implementations must call [`ProtocolContext::register_result`]
    /// before returning; otherwise the connection is closed as misuse.
    fn init(&self, ctx: &mut ProtocolContext) -> Box<dyn Negotiation>;
}

/// Per-connection negotiation state machine.
///
/// Callbacks stop once the context is resolved.
pub trait Negotiation: Send {
    /// New bytes are in the connection's inbound buffer.
    fn readable(&mut self, ctx: &mut ProtocolContext);

    /// Bytes were flushed from the outbound buffer.
    fn writable(&mut self, _ctx: &mut ProtocolContext) {}

    /// The connection failed. If still unresolved afterwards the
    /// negotiation fails with the error.
    fn exception(&mut self, _ctx: &mut ProtocolContext, _err: &io::Error) {}

    /// The client sent EOF before resolution.
    fn closed(&mut self, ctx: &mut ProtocolContext) {
        ctx.fail(NegotiationError::Closed);
    }
}

type Resolution = Result<Connector, NegotiationError>;

enum ResultSlot {
    Unregistered,
    Pending(Option<Bridge>),
    Resolved(Option<Bridge>, Resolution),
    Finished,
}

/// What a negotiation sees of its connection, plus the slot its result
/// is delivered through.
pub struct ProtocolContext {
    connection: Arc<Connection>,
    event_loop: NetEventLoop,
    slot: ResultSlot,
}

impl ProtocolContext {
    pub(crate) fn new(connection: Arc<Connection>, event_loop: NetEventLoop) -> Self {
        Self {
            connection,
            event_loop,
            slot: ResultSlot::Unregistered,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Loop the negotiation runs on.
    pub fn event_loop(&self) -> &NetEventLoop {
        &self.event_loop
    }

    /// Declare that this negotiation will deliver a result.
    pub fn register_result(&mut self) {
        if matches!(self.slot, ResultSlot::Unregistered) {
            self.slot = ResultSlot::Pending(None);
        }
    }

    /// Resolve with the connector that picks the backend.
    pub fn succeed(&mut self, connector: Connector) {
        self.resolve(Ok(connector));
    }

    /// Resolve with a failure. The connection is closed.
    pub fn fail(&mut self, err: NegotiationError) {
        self.resolve(Err(err));
    }

    /// Whether a result was already delivered.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self.slot,
            ResultSlot::Resolved(..) | ResultSlot::Finished
        )
    }

    fn resolve(&mut self, resolution: Resolution) {
        match std::mem::replace(&mut self.slot, ResultSlot::Finished) {
            ResultSlot::Pending(bridge) => {
                self.slot = ResultSlot::Resolved(bridge, resolution);
            }
            ResultSlot::Unregistered => {
                warn!(conn = %self.connection, "Negotiation resolved without a registered result slot");
                self.slot = ResultSlot::Unregistered;
            }
            other => self.slot = other,
        }
    }

    pub(crate) fn has_result_slot(&self) -> bool {
        !matches!(self.slot, ResultSlot::Unregistered)
    }

    /// Attach the bridge that receives the result.
    pub(crate) fn install(&mut self, bridge: Bridge) {
        self.slot = match std::mem::replace(&mut self.slot, ResultSlot::Finished) {
            ResultSlot::Pending(_) => ResultSlot::Pending(Some(bridge)),
            ResultSlot::Resolved(_, resolution) => ResultSlot::Resolved(Some(bridge), resolution),
            other => other,
        };
    }

    /// Take a delivered result. Afterwards the context is finished.
    pub(crate) fn take_resolution(&mut self) -> Option<(Option<Bridge>, Resolution)> {
        match std::mem::replace(&mut self.slot, ResultSlot::Finished) {
            ResultSlot::Resolved(bridge, resolution) => Some((bridge, resolution)),
            other => {
                self.slot = other;
                None
            }
        }
    }

    /// Drop the slot without delivering anything.
    pub(crate) fn abandon(&mut self) {
        self.slot = ResultSlot::Finished;
    }
}

impl fmt::Debug for ProtocolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = match self.slot {
            ResultSlot::Unregistered => "unregistered",
            ResultSlot::Pending(_) => "pending",
            ResultSlot::Resolved(..) => "resolved",
            ResultSlot::Finished => "finished",
        };
        f.debug_struct("ProtocolContext")
            .field("connection", &self.connection.to_string())
            .field("event_loop", &self.event_loop.name())
            .field("slot", &slot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plfm_net::RingBuffer;

    fn context(event_loop: &NetEventLoop) -> ProtocolContext {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let conn = Connection::from_std(
            stream,
            Arc::new(RingBuffer::with_capacity(16)),
            Arc::new(RingBuffer::with_capacity(16)),
        )
        .unwrap();
        ProtocolContext::new(Arc::new(conn), event_loop.clone())
    }

    #[test]
    fn test_result_requires_registration() {
        let event_loop = NetEventLoop::spawn("proto-unregistered").unwrap();
        let mut ctx = context(&event_loop);

        ctx.succeed(Connector::refuse());
        assert!(!ctx.has_result_slot());
        assert!(!ctx.is_resolved());
        assert!(ctx.take_resolution().is_none());

        event_loop.close();
    }

    #[test]
    fn test_first_resolution_wins() {
        let event_loop = NetEventLoop::spawn("proto-first").unwrap();
        let mut ctx = context(&event_loop);

        ctx.register_result();
        assert!(!ctx.is_resolved());
        ctx.fail(NegotiationError::Protocol("bad preamble".into()));
        ctx.succeed(Connector::refuse());
        assert!(ctx.is_resolved());

        let (bridge, resolution) = ctx.take_resolution().unwrap();
        assert!(bridge.is_none());
        assert!(matches!(resolution, Err(NegotiationError::Protocol(_))));

        // Finished: nothing further is delivered.
        ctx.succeed(Connector::refuse());
        assert!(ctx.take_resolution().is_none());

        event_loop.close();
    }
}
