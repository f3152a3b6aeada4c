//! Relay lifecycle and management API.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use plfm_net::{NetEventLoop, ServerSock};
use serde::Serialize;
use tracing::info;

use super::config::{ConfigError, RelayConfig};
use super::dispatcher::{RelayCore, SessionServerHandler};
use super::session::{Session, SessionInfo};

/// Notifications about the relay's own resources.
pub trait RelayEvents: Send + Sync {
    /// The server socket was removed from its accept loop.
    fn server_removed(&self, _server: &Arc<ServerSock>) {}
}

/// Ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl RelayEvents for NoopEvents {}

/// Relay counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    accepted: AtomicU64,
    accept_failed: AtomicU64,
    refused: AtomicU64,
    connect_failed: AtomicU64,
    no_event_loop: AtomicU64,
    negotiations_started: AtomicU64,
    negotiations_failed: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
}

macro_rules! counter {
    ($($record:ident => $field:ident),* $(,)?) => {
        impl RelayStats {
            $(
                pub(crate) fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> RelayStatsSnapshot {
                RelayStatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }

        /// Point-in-time copy of [`RelayStats`].
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct RelayStatsSnapshot {
            $(pub $field: u64,)*
        }
    };
}

counter! {
    record_accepted => accepted,
    record_accept_failed => accept_failed,
    record_refused => refused,
    record_connect_failed => connect_failed,
    record_no_event_loop => no_event_loop,
    record_negotiation_started => negotiations_started,
    record_negotiation_failed => negotiations_failed,
    record_session_opened => sessions_opened,
    record_session_closed => sessions_closed,
}

/// A TCP relay bound to one server socket.
pub struct Relay {
    core: Arc<RelayCore>,
    accept_loop: NetEventLoop,
    server: Arc<ServerSock>,
}

impl Relay {
    /// Validate `config` and build an inactive relay.
    pub fn new(config: RelayConfig) -> Result<Self, ConfigError> {
        Self::with_events(config, Arc::new(NoopEvents))
    }

    pub fn with_events(config: RelayConfig, events: Arc<dyn RelayEvents>) -> Result<Self, ConfigError> {
        let config = config.validate()?;
        Ok(Self {
            core: Arc::new(RelayCore::new(&config, events)),
            accept_loop: config.accept_loop,
            server: config.server,
        })
    }

    /// Start accepting connections.
    pub fn start(&self) -> io::Result<()> {
        let handler = Arc::new(SessionServerHandler::new(Arc::clone(&self.core)));
        self.accept_loop
            .add_server(Arc::clone(&self.server), handler)?;
        info!(
            listen_addr = %self.server.bind_addr(),
            accept_loop = %self.accept_loop.name(),
            "Relay started"
        );
        Ok(())
    }

    /// Stop accepting. Sessions already established keep running.
    pub fn stop(&self) -> io::Result<()> {
        self.accept_loop.remove_server(&self.server)?;
        info!(listen_addr = %self.server.bind_addr(), "Relay stopped");
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.server.bind_addr()
    }

    pub fn session_count(&self) -> usize {
        self.core.sessions().len()
    }

    /// Append every live session to `out`.
    pub fn copy_sessions<E: Extend<Arc<Session>>>(&self, out: &mut E) {
        self.core.sessions().copy_into(out);
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.core
            .sessions()
            .snapshot()
            .iter()
            .map(|session| session.info())
            .collect()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.core.stats().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counters() {
        let stats = RelayStats::default();
        stats.record_accepted();
        stats.record_accepted();
        stats.record_refused();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.accepted, 2);
        assert_eq!(snapshot.refused, 1);
        assert_eq!(snapshot.sessions_opened, 0);

        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["accepted"], 2);
    }

    #[test]
    fn test_invalid_config_fails_eagerly() {
        let result = Relay::new(RelayConfig::new());
        assert_eq!(result.err(), Some(ConfigError::MissingAcceptLoop));
    }
}
