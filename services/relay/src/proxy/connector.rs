//! Backend resolution strategies.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use plfm_net::{Connection, RingBuffer};

use super::protocol::ProtocolHandler;

type EndpointHook = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// A resolved backend address plus outcome notifications for whoever
/// chose it.
#[derive(Clone)]
pub struct Endpoint {
    remote: SocketAddr,
    on_connected: Option<EndpointHook>,
    on_failure: Option<EndpointHook>,
}

impl Endpoint {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            on_connected: None,
            on_failure: None,
        }
    }

    /// Called once the outbound connect completes.
    pub fn on_connected(mut self, hook: impl Fn(SocketAddr) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(hook));
        self
    }

    /// Called when the outbound connection fails before connecting.
    pub fn on_failure(mut self, hook: impl Fn(SocketAddr) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Start a non-blocking connect using the given buffers.
    pub fn connect(
        &self,
        in_buffer: Arc<RingBuffer>,
        out_buffer: Arc<RingBuffer>,
    ) -> io::Result<Connection> {
        Connection::connect(self.remote, in_buffer, out_buffer)
    }

    pub fn connection_established(&self) {
        if let Some(hook) = &self.on_connected {
            hook(self.remote);
        }
    }

    pub fn connection_failed(&self) {
        if let Some(hook) = &self.on_failure {
            hook(self.remote);
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.remote)
    }
}

/// Picks the backend for an accepted connection. `None` refuses it.
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self, active: &Connection) -> Option<Endpoint>;
}

impl<F> EndpointResolver for F
where
    F: Fn(&Connection) -> Option<Endpoint> + Send + Sync,
{
    fn resolve(&self, active: &Connection) -> Option<Endpoint> {
        self(active)
    }
}

/// How one accepted connection gets its backend.
#[derive(Clone)]
pub enum Connector {
    /// Resolve an endpoint immediately and relay.
    Direct(Arc<dyn EndpointResolver>),
    /// Run a protocol negotiation that eventually yields another connector.
    Handler(Arc<dyn ProtocolHandler>),
}

impl Connector {
    pub fn direct(resolver: impl EndpointResolver + 'static) -> Self {
        Self::Direct(Arc::new(resolver))
    }

    /// Always relay to `endpoint`.
    pub fn to(endpoint: Endpoint) -> Self {
        Self::Direct(Arc::new(move |_: &Connection| Some(endpoint.clone())))
    }

    /// Refuse every connection.
    pub fn refuse() -> Self {
        Self::Direct(Arc::new(|_: &Connection| None))
    }

    pub fn handler(handler: impl ProtocolHandler + 'static) -> Self {
        Self::Handler(Arc::new(handler))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Handler(_) => "handler",
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(_) => f.write_str("Connector::Direct"),
            Self::Handler(handler) => write!(f, "Connector::Handler({})", handler.name()),
        }
    }
}

/// Produces one connector per accepted connection.
pub trait ConnectorGen: Send + Sync {
    fn connector(&self) -> Connector;
}

impl<F> ConnectorGen for F
where
    F: Fn() -> Connector + Send + Sync,
{
    fn connector(&self) -> Connector {
        self()
    }
}

impl ConnectorGen for Endpoint {
    fn connector(&self) -> Connector {
        Connector::to(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detached() -> Connection {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        Connection::from_std(
            stream,
            Arc::new(RingBuffer::with_capacity(16)),
            Arc::new(RingBuffer::with_capacity(16)),
        )
        .unwrap()
    }

    #[test]
    fn test_fixed_endpoint_connector() {
        let addr: SocketAddr = "10.0.0.1:8080".parse().unwrap();
        let conn = detached();

        match Endpoint::new(addr).connector() {
            Connector::Direct(resolver) => {
                assert_eq!(resolver.resolve(&conn).unwrap().remote(), addr);
            }
            other => panic!("unexpected connector {other:?}"),
        }

        match Connector::refuse() {
            Connector::Direct(resolver) => assert!(resolver.resolve(&conn).is_none()),
            other => panic!("unexpected connector {other:?}"),
        }
    }

    #[test]
    fn test_endpoint_hooks() {
        let failures = Arc::new(AtomicUsize::new(0));
        let successes = Arc::new(AtomicUsize::new(0));
        let endpoint = Endpoint::new("10.0.0.1:1".parse().unwrap())
            .on_failure({
                let failures = Arc::clone(&failures);
                move |_| {
                    failures.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_connected({
                let successes = Arc::clone(&successes);
                move |_| {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            });

        endpoint.clone().connection_failed();
        endpoint.connection_established();
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(successes.load(Ordering::SeqCst), 1);

        // Without hooks both notifications are no-ops.
        let plain = Endpoint::new("10.0.0.1:1".parse().unwrap());
        plain.connection_failed();
        plain.connection_established();
    }
}
