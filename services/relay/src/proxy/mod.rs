//! Protocol-agnostic TCP relay core.
//!
//! This module provides:
//! - Accept-time dispatch of every inbound connection
//! - Direct relaying to a resolved backend endpoint
//! - Protocol-mediated resolution (negotiate first, then relay)
//! - Half-close aware session teardown
//! - A lock-free registry of live sessions
//!
//! ## Architecture
//!
//! ```text
//! Client -> Acceptor -> Dispatcher -> Connector ─┬─ Direct ───────────────> passive connect
//!                                                └─ Handler -> negotiation ─> Bridge ─┘
//!
//! passive connected -> active registered on the same loop -> Session open
//! ```
//!
//! The two connections of a session share their buffers: the active
//! connection's outbound buffer is the passive connection's inbound buffer
//! and vice versa. Bytes are never copied by the relay.
//!
//! ## Usage
//!
//! ```ignore
//! use plfm_net::{EventLoopGroup, NetEventLoop, ServerSock};
//! use plfm_relay::{Endpoint, Relay, RelayConfig};
//!
//! let acceptor = NetEventLoop::spawn("acceptor")?;
//! let workers = Arc::new(EventLoopGroup::spawn("worker", 4)?);
//! let server = Arc::new(ServerSock::bind("[::]:7000".parse()?)?);
//!
//! let config = RelayConfig::new()
//!     .accept_loop(acceptor)
//!     .loop_provider(workers)
//!     .server(server)
//!     .connector_gen(Arc::new(Endpoint::new("[::1]:8080".parse()?)));
//! let relay = Relay::new(config)?;
//! relay.start()?;
//! ```

mod bridge;
mod config;
mod connector;
mod dispatcher;
mod handler;
mod protocol;
mod registry;
mod relay;
mod session;

pub use config::{ConfigError, LoopProvider, RelayConfig, DEFAULT_BUFFER_SIZE};
pub use connector::{Connector, ConnectorGen, Endpoint, EndpointResolver};
pub use protocol::{Negotiation, NegotiationError, ProtocolContext, ProtocolHandler};
pub use registry::SessionRegistry;
pub use relay::{NoopEvents, Relay, RelayEvents, RelayStats, RelayStatsSnapshot};
pub use session::{Session, SessionId, SessionInfo, SessionState};

/// Tracing target for low-level lifecycle events.
pub(crate) const LOWLEVEL: &str = "plfm_relay::lowlevel";
