//! Relay configuration and validation.

use std::fmt;
use std::sync::Arc;

use plfm_net::{EventLoopGroup, NetEventLoop, ServerSock};
use thiserror::Error;

use super::connector::ConnectorGen;

/// Default capacity of each per-connection buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Supplies the event loop that hosts a new session.
pub trait LoopProvider: Send + Sync {
    /// Next loop to use, or `None` when none is available.
    fn next_loop(&self) -> Option<NetEventLoop>;
}

impl LoopProvider for EventLoopGroup {
    fn next_loop(&self) -> Option<NetEventLoop> {
        self.next()
    }
}

impl LoopProvider for NetEventLoop {
    fn next_loop(&self) -> Option<NetEventLoop> {
        (!self.is_closed()).then(|| self.clone())
    }
}

/// Configuration faults detected before a relay is activated.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no accept event loop configured")]
    MissingAcceptLoop,

    #[error("no connector generator configured")]
    MissingConnectorGen,

    #[error("no event loop provider configured")]
    MissingLoopProvider,

    #[error("no server socket configured")]
    MissingServer,

    #[error("in_buffer_size must be positive")]
    InvalidInBufferSize,

    #[error("out_buffer_size must be positive")]
    InvalidOutBufferSize,
}

/// Builder for a [`Relay`](super::Relay).
#[derive(Clone)]
pub struct RelayConfig {
    accept_loop: Option<NetEventLoop>,
    connector_gen: Option<Arc<dyn ConnectorGen>>,
    loop_provider: Option<Arc<dyn LoopProvider>>,
    server: Option<Arc<ServerSock>>,
    in_buffer_size: usize,
    out_buffer_size: usize,
}

impl RelayConfig {
    pub fn new() -> Self {
        Self {
            accept_loop: None,
            connector_gen: None,
            loop_provider: None,
            server: None,
            in_buffer_size: DEFAULT_BUFFER_SIZE,
            out_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Loop on which the server socket is registered.
    pub fn accept_loop(mut self, event_loop: NetEventLoop) -> Self {
        self.accept_loop = Some(event_loop);
        self
    }

    pub fn connector_gen(mut self, gen: Arc<dyn ConnectorGen>) -> Self {
        self.connector_gen = Some(gen);
        self
    }

    pub fn loop_provider(mut self, provider: Arc<dyn LoopProvider>) -> Self {
        self.loop_provider = Some(provider);
        self
    }

    pub fn server(mut self, server: Arc<ServerSock>) -> Self {
        self.server = Some(server);
        self
    }

    /// Capacity of an accepted connection's inbound buffer (client to backend).
    pub fn in_buffer_size(mut self, size: usize) -> Self {
        self.in_buffer_size = size;
        self
    }

    /// Capacity of an accepted connection's outbound buffer (backend to client).
    pub fn out_buffer_size(mut self, size: usize) -> Self {
        self.out_buffer_size = size;
        self
    }

    /// Check every field. Reports the first fault found.
    pub(crate) fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let accept_loop = self.accept_loop.ok_or(ConfigError::MissingAcceptLoop)?;
        let connector_gen = self
            .connector_gen
            .ok_or(ConfigError::MissingConnectorGen)?;
        let loop_provider = self
            .loop_provider
            .ok_or(ConfigError::MissingLoopProvider)?;
        let server = self.server.ok_or(ConfigError::MissingServer)?;
        if self.in_buffer_size == 0 {
            return Err(ConfigError::InvalidInBufferSize);
        }
        if self.out_buffer_size == 0 {
            return Err(ConfigError::InvalidOutBufferSize);
        }

        Ok(ValidatedConfig {
            accept_loop,
            connector_gen,
            loop_provider,
            server,
            in_buffer_size: self.in_buffer_size,
            out_buffer_size: self.out_buffer_size,
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("accept_loop", &self.accept_loop.as_ref().map(|l| l.name()))
            .field("connector_gen", &self.connector_gen.is_some())
            .field("loop_provider", &self.loop_provider.is_some())
            .field("server", &self.server.as_ref().map(|s| s.bind_addr()))
            .field("in_buffer_size", &self.in_buffer_size)
            .field("out_buffer_size", &self.out_buffer_size)
            .finish()
    }
}

/// A configuration that passed [`RelayConfig::validate`].
pub(crate) struct ValidatedConfig {
    pub(crate) accept_loop: NetEventLoop,
    pub(crate) connector_gen: Arc<dyn ConnectorGen>,
    pub(crate) loop_provider: Arc<dyn LoopProvider>,
    pub(crate) server: Arc<ServerSock>,
    pub(crate) in_buffer_size: usize,
    pub(crate) out_buffer_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Endpoint;

    fn complete(event_loop: &NetEventLoop) -> RelayConfig {
        let server = ServerSock::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        RelayConfig::new()
            .accept_loop(event_loop.clone())
            .loop_provider(Arc::new(event_loop.clone()))
            .server(Arc::new(server))
            .connector_gen(Arc::new(Endpoint::new("127.0.0.1:9".parse().unwrap())))
    }

    #[test]
    fn test_complete_config_validates() {
        let event_loop = NetEventLoop::spawn("cfg-ok").unwrap();
        let validated = complete(&event_loop).validate().unwrap();
        assert_eq!(validated.in_buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(validated.out_buffer_size, DEFAULT_BUFFER_SIZE);
        event_loop.close();
    }

    #[test]
    fn test_missing_fields_are_reported() {
        let event_loop = NetEventLoop::spawn("cfg-missing").unwrap();

        let mut config = complete(&event_loop);
        config.accept_loop = None;
        assert_eq!(config.validate().err(), Some(ConfigError::MissingAcceptLoop));

        let mut config = complete(&event_loop);
        config.connector_gen = None;
        assert_eq!(config.validate().err(), Some(ConfigError::MissingConnectorGen));

        let mut config = complete(&event_loop);
        config.loop_provider = None;
        assert_eq!(config.validate().err(), Some(ConfigError::MissingLoopProvider));

        let mut config = complete(&event_loop);
        config.server = None;
        assert_eq!(config.validate().err(), Some(ConfigError::MissingServer));

        event_loop.close();
    }

    #[test]
    fn test_zero_buffer_sizes_rejected() {
        let event_loop = NetEventLoop::spawn("cfg-sizes").unwrap();

        let config = complete(&event_loop).in_buffer_size(0);
        assert_eq!(config.validate().err(), Some(ConfigError::InvalidInBufferSize));

        let config = complete(&event_loop).out_buffer_size(0);
        assert_eq!(config.validate().err(), Some(ConfigError::InvalidOutBufferSize));

        event_loop.close();
    }

    #[test]
    fn test_closed_loop_provides_nothing() {
        let event_loop = NetEventLoop::spawn("cfg-provider").unwrap();
        assert!(event_loop.next_loop().is_some());
        event_loop.close();
        assert!(event_loop.next_loop().is_none());
    }
}
