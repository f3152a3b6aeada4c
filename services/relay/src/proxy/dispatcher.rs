//! Accept-time dispatch: every accepted connection either relays
//! directly or negotiates first.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use plfm_net::{Connection, ConnectionHandler, RingBuffer, ServerContext, ServerHandler};
use tracing::{debug, error, info};

use super::bridge::{Bridge, NegotiationHandler};
use super::config::{LoopProvider, ValidatedConfig};
use super::connector::{Connector, ConnectorGen, Endpoint};
use super::handler::RelayHandler;
use super::protocol::{ProtocolContext, ProtocolHandler};
use super::registry::SessionRegistry;
use super::relay::{RelayEvents, RelayStats};
use super::session::{close_connection_and_release_buffers, Session};

/// State shared by the acceptor, the bridges and the management API.
pub(crate) struct RelayCore {
    connector_gen: Arc<dyn ConnectorGen>,
    loop_provider: Arc<dyn LoopProvider>,
    in_buffer_size: usize,
    out_buffer_size: usize,
    sessions: Arc<SessionRegistry>,
    stats: Arc<RelayStats>,
    events: Arc<dyn RelayEvents>,
}

impl RelayCore {
    pub(crate) fn new(config: &ValidatedConfig, events: Arc<dyn RelayEvents>) -> Self {
        Self {
            connector_gen: Arc::clone(&config.connector_gen),
            loop_provider: Arc::clone(&config.loop_provider),
            in_buffer_size: config.in_buffer_size,
            out_buffer_size: config.out_buffer_size,
            sessions: Arc::new(SessionRegistry::new()),
            stats: Arc::new(RelayStats::default()),
            events,
        }
    }

    pub(crate) fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub(crate) fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Route `active` according to `connector`.
    pub(crate) fn dispatch(self: &Arc<Self>, active: Arc<Connection>, connector: Connector) {
        match connector {
            Connector::Direct(resolver) => {
                let endpoint = resolver.resolve(&active);
                self.establish(active, endpoint);
            }
            Connector::Handler(handler) => self.negotiate(active, handler),
        }
    }

    /// Open the passive connection and register it. The active side is
    /// registered once the passive connect completes.
    fn establish(&self, active: Arc<Connection>, endpoint: Option<Endpoint>) {
        let Some(endpoint) = endpoint else {
            info!(conn = %active, "No backend for connection, closing");
            self.stats.record_refused();
            close_connection_and_release_buffers(&active);
            return;
        };

        let passive = match endpoint.connect(
            Arc::clone(active.out_buffer()),
            Arc::clone(active.in_buffer()),
        ) {
            Ok(passive) => Arc::new(passive),
            Err(e) => {
                error!(
                    conn = %active,
                    backend = %endpoint,
                    error = %e,
                    "Failed to connect to backend"
                );
                self.stats.record_connect_failed();
                endpoint.connection_failed();
                close_connection_and_release_buffers(&active);
                return;
            }
        };

        let session = Arc::new(Session::new(active, passive));
        let Some(event_loop) = self.loop_provider.next_loop() else {
            session.close_and_release();
            error!(session_id = %session.id(), "No event loop available for session");
            self.stats.record_no_event_loop();
            return;
        };

        let handler = Arc::new(RelayHandler::passive(
            Arc::clone(&session),
            Arc::clone(&self.sessions),
            Arc::clone(&self.stats),
            endpoint,
        ));
        if let Err(e) = event_loop.add_client_connection(Arc::clone(session.passive()), handler) {
            error!(
                session_id = %session.id(),
                event_loop = %event_loop.name(),
                error = %e,
                "Failed to register passive connection"
            );
            session.close_and_release();
            return;
        }

        if !self.sessions.publish(&session) {
            debug!(session_id = %session.id(), "Session closed before publication");
            return;
        }
        self.stats.record_session_opened();
        debug!(
            session_id = %session.id(),
            event_loop = %event_loop.name(),
            client = %session.active().remote(),
            backend = %session.passive().remote(),
            "Session connecting"
        );
    }

    /// Attach a negotiation to `active`; its result is dispatched again.
    fn negotiate(self: &Arc<Self>, active: Arc<Connection>, handler: Arc<dyn ProtocolHandler>) {
        let Some(event_loop) = self.loop_provider.next_loop() else {
            error!(
                conn = %active,
                protocol = handler.name(),
                "No event loop available for negotiation"
            );
            self.stats.record_no_event_loop();
            close_connection_and_release_buffers(&active);
            return;
        };
        self.stats.record_negotiation_started();

        let mut ctx = ProtocolContext::new(Arc::clone(&active), event_loop.clone());
        let negotiation = handler.init(&mut ctx);
        if !ctx.has_result_slot() {
            error!(
                conn = %active,
                protocol = handler.name(),
                "Protocol handler did not register a result slot, closing connection"
            );
            close_connection_and_release_buffers(&active);
            return;
        }

        // Resolved during init: nothing is attached yet.
        if let Some((_, resolution)) = ctx.take_resolution() {
            match resolution {
                Ok(connector) => self.dispatch(active, connector),
                Err(_) => {
                    self.stats.record_negotiation_failed();
                    close_connection_and_release_buffers(&active);
                }
            }
            return;
        }

        ctx.install(Bridge::new(
            Arc::clone(self),
            event_loop.clone(),
            Arc::clone(&active),
        ));
        let adapter = Arc::new(NegotiationHandler::new(handler.name(), ctx, negotiation));
        let attached: Arc<dyn ConnectionHandler> = adapter.clone();
        if let Err(e) = event_loop.add_connection(Arc::clone(&active), attached) {
            adapter.registration_failed(&e);
            error!(
                conn = %active,
                protocol = handler.name(),
                event_loop = %event_loop.name(),
                error = %e,
                "Failed to register connection for negotiation"
            );
            close_connection_and_release_buffers(&active);
        }
    }
}

/// Server handler on the accept loop.
pub(crate) struct SessionServerHandler {
    core: Arc<RelayCore>,
}

impl SessionServerHandler {
    pub(crate) fn new(core: Arc<RelayCore>) -> Self {
        Self { core }
    }
}

impl ServerHandler for SessionServerHandler {
    fn accept_fail(&self, ctx: &ServerContext<'_>, err: &io::Error) {
        error!(server = %ctx.server(), error = %err, "Accept failed");
        self.core.stats.record_accept_failed();
    }

    fn connection(&self, _ctx: &ServerContext<'_>, connection: Arc<Connection>) {
        self.core.stats.record_accepted();
        let connector = self.core.connector_gen.connector();
        self.core.dispatch(connection, connector);
    }

    fn io_buffers(&self, _remote: &SocketAddr) -> (RingBuffer, RingBuffer) {
        (
            RingBuffer::with_capacity(self.core.in_buffer_size),
            RingBuffer::with_capacity(self.core.out_buffer_size),
        )
    }

    fn removed(&self, ctx: &ServerContext<'_>) {
        info!(server = %ctx.server(), "Server removed from accept loop");
        self.core.events.server_removed(ctx.server());
    }
}
