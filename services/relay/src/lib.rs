//! plfm-vt Relay
//!
//! Protocol-agnostic TCP relay. Every accepted connection is paired with
//! an outbound connection to a backend, and bytes flow between the two
//! through shared buffers.
//!
//! - [`proxy`]: the relay core (dispatch, sessions, half-close handling)
//! - [`backend`]: round-robin backend pool with failure cooldown
//! - [`sni`]: SNI-routed TLS passthrough

pub mod backend;
pub mod config;
pub mod proxy;
pub mod sni;

pub use backend::{Backend, BackendPool, BackendPoolStats, HealthStatus};
pub use proxy::{
    ConfigError, Connector, ConnectorGen, Endpoint, EndpointResolver, LoopProvider, Negotiation,
    NegotiationError, NoopEvents, ProtocolContext, ProtocolHandler, Relay, RelayConfig,
    RelayEvents, RelayStats, RelayStatsSnapshot, Session, SessionId, SessionInfo,
    SessionRegistry, SessionState,
};
pub use sni::{SniResult, SniRouter};
