//! Connection handlers for the two sides of a session.
//!
//! Bytes move without handler involvement: both sides share buffers and
//! the event loop flushes one side's inbound buffer through the other
//! side's socket. The handlers only drive the session lifecycle.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use plfm_net::{Connection, ConnectionHandler, HandlerContext};
use tracing::{debug, error, trace};

use super::connector::Endpoint;
use super::registry::SessionRegistry;
use super::relay::RelayStats;
use super::session::{close_connection_and_release_buffers, Session, SessionState};
use super::LOWLEVEL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Active,
    Passive,
}

impl Side {
    fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Passive => "passive",
        }
    }
}

pub(crate) struct RelayHandler {
    session: Arc<Session>,
    side: Side,
    registry: Arc<SessionRegistry>,
    stats: Arc<RelayStats>,
    /// Passive side only: who to tell about the connect outcome.
    endpoint: Option<Endpoint>,
    connected: AtomicBool,
}

impl RelayHandler {
    pub(crate) fn passive(
        session: Arc<Session>,
        registry: Arc<SessionRegistry>,
        stats: Arc<RelayStats>,
        endpoint: Endpoint,
    ) -> Self {
        Self {
            session,
            side: Side::Passive,
            registry,
            stats,
            endpoint: Some(endpoint),
            connected: AtomicBool::new(false),
        }
    }

    fn active(session: Arc<Session>, registry: Arc<SessionRegistry>, stats: Arc<RelayStats>) -> Self {
        Self {
            session,
            side: Side::Active,
            registry,
            stats,
            endpoint: None,
            connected: AtomicBool::new(true),
        }
    }

    fn peer(&self) -> &Arc<Connection> {
        match self.side {
            Side::Active => self.session.passive(),
            Side::Passive => self.session.active(),
        }
    }
}

impl ConnectionHandler for RelayHandler {
    fn connected(&self, ctx: &HandlerContext<'_>) {
        if self.side != Side::Passive {
            return;
        }
        self.connected.store(true, Ordering::Release);
        if let Some(endpoint) = &self.endpoint {
            endpoint.connection_established();
        }

        let active = self.session.active();
        let handler = Arc::new(RelayHandler::active(
            Arc::clone(&self.session),
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
        ));
        match ctx.event_loop().add_connection(Arc::clone(active), handler) {
            Ok(()) => {
                self.session.set_state(SessionState::Open);
                debug!(
                    session_id = %self.session.id(),
                    client = %active.remote(),
                    backend = %ctx.connection().remote(),
                    "Session established"
                );
            }
            Err(e) => {
                error!(
                    session_id = %self.session.id(),
                    conn = %active,
                    error = %e,
                    "Failed to register active connection"
                );
                self.session.close_and_release();
            }
        }
    }

    fn readable(&self, _ctx: &HandlerContext<'_>) {
        // The peer flushes the shared buffer.
    }

    fn writable(&self, ctx: &HandlerContext<'_>) {
        let connection = ctx.connection();
        if self.peer().is_closed() && connection.out_buffer().used() == 0 {
            trace!(
                target: LOWLEVEL,
                session_id = %self.session.id(),
                conn = %connection,
                "drained toward closed peer"
            );
            close_connection_and_release_buffers(connection);
        }
    }

    fn exception(&self, ctx: &HandlerContext<'_>, err: &io::Error) {
        error!(
            session_id = %self.session.id(),
            side = self.side.as_str(),
            conn = %ctx.connection(),
            error = %err,
            "Session connection failed"
        );
        self.session.close_and_release();

        if self.side == Side::Passive && !self.connected.load(Ordering::Acquire) {
            self.stats.record_connect_failed();
            if let Some(endpoint) = &self.endpoint {
                endpoint.connection_failed();
            }
        }
    }

    fn closed(&self, ctx: &HandlerContext<'_>) {
        trace!(
            target: LOWLEVEL,
            session_id = %self.session.id(),
            side = self.side.as_str(),
            conn = %ctx.connection(),
            "remote sent EOF"
        );
        // The connection reporting EOF counts as closed itself, so only a
        // torn-down session short-circuits here.
        if self.session.state() == SessionState::Closed {
            return;
        }

        let peer = self.peer();
        if peer.out_buffer().used() == 0 {
            close_connection_and_release_buffers(peer);
        } else {
            // Stop reading into the buffer the peer still drains; the
            // peer closes itself once it is empty.
            self.session.set_state(SessionState::Draining);
            peer.in_buffer().close_input();
        }
    }

    fn removed(&self, ctx: &HandlerContext<'_>) {
        trace!(
            target: LOWLEVEL,
            session_id = %self.session.id(),
            side = self.side.as_str(),
            conn = %ctx.connection(),
            "removed from event loop"
        );
        self.session.close_and_release();

        if self.side == Side::Passive && self.registry.retire(&self.session) {
            self.stats.record_session_closed();
            debug!(session_id = %self.session.id(), "Session closed");
        }
    }
}
