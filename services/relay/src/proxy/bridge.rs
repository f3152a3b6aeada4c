//! Hand-off from a finished negotiation back to the dispatcher.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use plfm_net::{Connection, ConnectionHandler, HandlerContext, NetEventLoop};
use tracing::{debug, error, trace};

use super::connector::Connector;
use super::dispatcher::RelayCore;
use super::protocol::{Negotiation, NegotiationError, ProtocolContext};
use super::session::close_connection_and_release_buffers;
use super::LOWLEVEL;

/// Delivers a negotiation result for one connection.
pub(crate) struct Bridge {
    core: Arc<RelayCore>,
    event_loop: NetEventLoop,
    active: Arc<Connection>,
}

impl Bridge {
    pub(crate) fn new(core: Arc<RelayCore>, event_loop: NetEventLoop, active: Arc<Connection>) -> Self {
        Self {
            core,
            event_loop,
            active,
        }
    }

    /// Detach the negotiation handler and dispatch `connector`, or close
    /// the connection when the negotiation failed.
    pub(crate) fn complete(self, resolution: Result<Connector, NegotiationError>) {
        match resolution {
            Ok(connector) => {
                if let Err(e) = self.event_loop.remove_connection(&self.active) {
                    // The connection is left as is: neither the negotiation
                    // nor the dispatcher can safely own it now.
                    error!(
                        anomaly = true,
                        conn = %self.active,
                        event_loop = %self.event_loop.name(),
                        error = %e,
                        "Fatal: negotiated connection could not be detached, abandoning it"
                    );
                    return;
                }
                trace!(
                    target: LOWLEVEL,
                    conn = %self.active,
                    connector = connector.kind(),
                    "negotiation resolved"
                );
                self.core.dispatch(self.active, connector);
            }
            Err(err) => {
                self.core.stats().record_negotiation_failed();
                trace!(target: LOWLEVEL, conn = %self.active, error = %err, "negotiation failed");
                close_connection_and_release_buffers(&self.active);
            }
        }
    }
}

struct NegotiationState {
    ctx: ProtocolContext,
    negotiation: Box<dyn Negotiation>,
}

/// Event-loop handler that feeds connection events into a negotiation
/// until it resolves.
pub(crate) struct NegotiationHandler {
    protocol: String,
    state: Mutex<NegotiationState>,
}

impl NegotiationHandler {
    pub(crate) fn new(
        protocol: impl Into<String>,
        ctx: ProtocolContext,
        negotiation: Box<dyn Negotiation>,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            state: Mutex::new(NegotiationState { ctx, negotiation }),
        }
    }

    /// Run one negotiation callback and deliver its result, if any.
    ///
    /// The bridge runs after the lock is released: detaching fires
    /// `removed` on this handler synchronously.
    fn step(&self, f: impl FnOnce(&mut dyn Negotiation, &mut ProtocolContext)) {
        let resolution = {
            let mut state = self.state.lock();
            let NegotiationState { ctx, negotiation } = &mut *state;
            if ctx.is_resolved() {
                return;
            }
            f(negotiation.as_mut(), ctx);
            ctx.take_resolution()
        };

        if let Some((Some(bridge), resolution)) = resolution {
            bridge.complete(resolution);
        }
    }

    /// The connection could not be registered for negotiation.
    pub(crate) fn registration_failed(&self, err: &io::Error) {
        let mut state = self.state.lock();
        let NegotiationState { ctx, negotiation } = &mut *state;
        negotiation.exception(ctx, err);
        ctx.abandon();
    }
}

impl ConnectionHandler for NegotiationHandler {
    fn readable(&self, _ctx: &HandlerContext<'_>) {
        self.step(|negotiation, ctx| negotiation.readable(ctx));
    }

    fn writable(&self, _ctx: &HandlerContext<'_>) {
        self.step(|negotiation, ctx| negotiation.writable(ctx));
    }

    fn exception(&self, _ctx: &HandlerContext<'_>, err: &io::Error) {
        self.step(|negotiation, ctx| {
            negotiation.exception(ctx, err);
            ctx.fail(NegotiationError::Io(io::Error::new(err.kind(), err.to_string())));
        });
    }

    fn closed(&self, _ctx: &HandlerContext<'_>) {
        self.step(|negotiation, ctx| negotiation.closed(ctx));
    }

    fn removed(&self, ctx: &HandlerContext<'_>) {
        let mut state = self.state.lock();
        if state.ctx.is_resolved() {
            return;
        }
        // Removed mid-negotiation: the loop shut down or the connection
        // was closed from outside.
        state.ctx.abandon();
        drop(state);
        debug!(
            conn = %ctx.connection(),
            protocol = %self.protocol,
            "Connection removed during negotiation"
        );
        close_connection_and_release_buffers(ctx.connection());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::relay::NoopEvents;
    use crate::proxy::RelayConfig;
    use plfm_net::{RingBuffer, ServerSock};

    fn core(event_loop: &NetEventLoop) -> Arc<RelayCore> {
        let config = RelayConfig::new()
            .accept_loop(event_loop.clone())
            .connector_gen(Arc::new(Connector::refuse))
            .loop_provider(Arc::new(event_loop.clone()))
            .server(Arc::new(ServerSock::bind("127.0.0.1:0".parse().unwrap()).unwrap()))
            .validate()
            .unwrap();
        Arc::new(RelayCore::new(&config, Arc::new(NoopEvents)))
    }

    fn unregistered() -> (Arc<Connection>, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        let connection = Connection::from_std(
            server_side,
            Arc::new(RingBuffer::with_capacity(16)),
            Arc::new(RingBuffer::with_capacity(16)),
        )
        .unwrap();
        (Arc::new(connection), client)
    }

    #[test]
    fn test_detach_failure_stops_dispatch() {
        let event_loop = NetEventLoop::spawn("bridge-detach").unwrap();
        let core = core(&event_loop);
        let (active, _client) = unregistered();

        // Never attached, so detaching fails.
        Bridge::new(Arc::clone(&core), event_loop.clone(), Arc::clone(&active))
            .complete(Ok(Connector::refuse()));

        let stats = core.stats().snapshot();
        assert_eq!(stats.refused, 0);
        assert_eq!(stats.negotiations_failed, 0);
        assert!(!active.is_locally_closed());
        event_loop.close();
    }

    #[test]
    fn test_failed_negotiation_closes_connection() {
        let event_loop = NetEventLoop::spawn("bridge-fail").unwrap();
        let core = core(&event_loop);
        let (active, _client) = unregistered();

        Bridge::new(Arc::clone(&core), event_loop.clone(), Arc::clone(&active))
            .complete(Err(NegotiationError::Protocol("garbage".to_string())));

        assert_eq!(core.stats().snapshot().negotiations_failed, 1);
        assert!(active.is_locally_closed());
        assert!(active.in_buffer().is_released());
        event_loop.close();
    }
}
