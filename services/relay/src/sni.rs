//! SNI (Server Name Indication) routing for TLS passthrough.
//!
//! [`SniRouter`] is a protocol handler: it waits for the client's TLS
//! ClientHello, extracts the SNI hostname and resolves the connection to
//! the backend pool registered for that hostname. The ClientHello stays in
//! the inbound buffer and is forwarded to the backend untouched.
//!
//! - Exact hostname match after normalization (lowercase, no trailing dot)
//! - Connections without SNI, or with an unknown hostname, use the
//!   fallback pool if one is set
//! - At most `max_bytes` are inspected

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::backend::BackendPool;
use crate::proxy::{
    Connector, Negotiation, NegotiationError, ProtocolContext, ProtocolHandler,
};

/// Default maximum bytes inspected for a ClientHello.
pub const DEFAULT_MAX_HELLO_BYTES: usize = 8192;

/// Result of SNI inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// Successfully extracted SNI hostname (normalized to lowercase).
    Found(String),
    /// TLS ClientHello present but no SNI extension.
    NoSni,
    /// Data is not a TLS ClientHello.
    NotTls,
    /// More bytes are needed to see the whole ClientHello record.
    Incomplete,
    /// ClientHello is malformed.
    Malformed,
}

/// Normalize a hostname for matching.
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.to_lowercase().trim_end_matches('.').to_string()
}

/// Parse SNI from the start of a TLS stream.
///
/// TLS Record structure:
/// - byte 0: record type (0x16 = Handshake)
/// - bytes 1-2: version
/// - bytes 3-4: record length
/// - bytes 5+: handshake message
///
/// Handshake ClientHello:
/// - byte 0: handshake type (0x01 = ClientHello)
/// - bytes 1-3: length
/// - bytes 4-5: client version
/// - bytes 6-37: random (32 bytes)
/// - byte 38: session ID length
/// - variable: session ID
/// - 2 bytes: cipher suites length
/// - variable: cipher suites
/// - 1 byte: compression methods length
/// - variable: compression methods
/// - 2 bytes: extensions length
/// - variable: extensions
pub fn parse_sni(data: &[u8]) -> SniResult {
    match data.first() {
        None => return SniResult::Incomplete,
        Some(&0x16) => {}
        Some(_) => return SniResult::NotTls,
    }
    if data.len() < 5 {
        return SniResult::Incomplete;
    }

    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if data.len() < 5 + record_len {
        return SniResult::Incomplete;
    }
    let handshake = &data[5..5 + record_len];

    // Check handshake type (0x01 = ClientHello)
    match handshake.first() {
        None => return SniResult::Malformed,
        Some(&0x01) => {}
        Some(_) => return SniResult::NotTls,
    }
    if handshake.len() < 4 {
        return SniResult::Malformed;
    }
    let handshake_len =
        ((handshake[1] as usize) << 16) | ((handshake[2] as usize) << 8) | (handshake[3] as usize);
    let client_hello = &handshake[4..];
    // A ClientHello split over several records is not supported.
    if client_hello.len() < handshake_len || client_hello.len() < 34 {
        return SniResult::Malformed;
    }
    let client_hello = &client_hello[..handshake_len];

    // Skip version (2) + random (32) = 34 bytes
    let mut pos = 34;

    // Session ID
    if pos >= client_hello.len() {
        return SniResult::Malformed;
    }
    let session_id_len = client_hello[pos] as usize;
    pos += 1 + session_id_len;

    // Cipher suites
    if pos + 2 > client_hello.len() {
        return SniResult::Malformed;
    }
    let cipher_suites_len =
        u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;

    // Compression methods
    if pos >= client_hello.len() {
        return SniResult::Malformed;
    }
    let compression_len = client_hello[pos] as usize;
    pos += 1 + compression_len;

    // Extensions
    if pos + 2 > client_hello.len() {
        return SniResult::NoSni;
    }
    let extensions_len = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]) as usize;
    pos += 2;

    let extensions_end = (pos + extensions_len).min(client_hello.len());

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]);
        let ext_len = u16::from_be_bytes([client_hello[pos + 2], client_hello[pos + 3]]) as usize;
        pos += 4;

        if ext_type == 0x0000 {
            if pos + ext_len > extensions_end {
                return SniResult::Malformed;
            }
            return parse_sni_extension(&client_hello[pos..pos + ext_len]);
        }

        pos += ext_len;
    }

    SniResult::NoSni
}

/// Parse the SNI extension value.
///
/// SNI extension structure:
/// - 2 bytes: list length
/// - for each entry:
///   - 1 byte: name type (0 = hostname)
///   - 2 bytes: name length
///   - variable: name
fn parse_sni_extension(data: &[u8]) -> SniResult {
    if data.len() < 2 {
        return SniResult::Malformed;
    }

    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + list_len {
        return SniResult::Malformed;
    }

    let mut pos = 2;
    while pos + 3 <= 2 + list_len {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;

        if pos + name_len > data.len() {
            return SniResult::Malformed;
        }
        if name_type == 0 {
            return match std::str::from_utf8(&data[pos..pos + name_len]) {
                Ok(hostname) => SniResult::Found(normalize_hostname(hostname)),
                Err(_) => SniResult::Malformed,
            };
        }

        pos += name_len;
    }

    SniResult::NoSni
}

/// Immutable routing snapshot.
#[derive(Default, Clone)]
struct SniTable {
    routes: HashMap<String, BackendPool>,
    fallback: Option<BackendPool>,
}

/// Routes TLS connections by SNI hostname.
///
/// Routes are swapped atomically; a connection keeps the snapshot that
/// was current when its negotiation started.
pub struct SniRouter {
    table: ArcSwap<SniTable>,
    max_bytes: usize,
}

impl SniRouter {
    pub fn new() -> Self {
        Self::with_max_bytes(DEFAULT_MAX_HELLO_BYTES)
    }

    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            table: ArcSwap::from_pointee(SniTable::default()),
            max_bytes,
        }
    }

    /// Replace every route. The fallback is kept.
    pub fn set_routes(&self, routes: impl IntoIterator<Item = (String, BackendPool)>) {
        let routes: HashMap<String, BackendPool> = routes
            .into_iter()
            .map(|(host, pool)| (normalize_hostname(&host), pool))
            .collect();
        let route_count = routes.len();
        self.table.rcu(|current| SniTable {
            routes: routes.clone(),
            fallback: current.fallback.clone(),
        });
        info!(route_count, "SNI routes updated");
    }

    /// Add or replace the route for one hostname.
    pub fn upsert(&self, hostname: &str, pool: BackendPool) {
        let hostname = normalize_hostname(hostname);
        self.table.rcu(|current| {
            let mut next = SniTable::clone(current);
            next.routes.insert(hostname.clone(), pool.clone());
            next
        });
    }

    pub fn remove(&self, hostname: &str) -> bool {
        let hostname = normalize_hostname(hostname);
        let mut removed = false;
        self.table.rcu(|current| {
            let mut next = SniTable::clone(current);
            removed = next.routes.remove(&hostname).is_some();
            next
        });
        removed
    }

    /// Pool used when SNI is missing or unknown.
    pub fn set_fallback(&self, pool: Option<BackendPool>) {
        self.table.rcu(|current| SniTable {
            routes: current.routes.clone(),
            fallback: pool.clone(),
        });
    }

    /// Pool for `hostname`, falling back to the default pool.
    pub fn route(&self, hostname: Option<&str>) -> Option<BackendPool> {
        let table = self.table.load();
        hostname
            .and_then(|host| table.routes.get(&normalize_hostname(host)))
            .or(table.fallback.as_ref())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.table.load().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().routes.is_empty()
    }
}

impl Default for SniRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolHandler for SniRouter {
    fn name(&self) -> &str {
        "sni"
    }

    fn init(&self, ctx: &mut ProtocolContext) -> Box<dyn Negotiation> {
        ctx.register_result();
        Box::new(SniNegotiation {
            table: self.table.load_full(),
            max_bytes: self.max_bytes,
        })
    }
}

struct SniNegotiation {
    table: Arc<SniTable>,
    max_bytes: usize,
}

impl SniNegotiation {
    fn resolve(&self, ctx: &mut ProtocolContext, hostname: Option<String>) {
        let pool = hostname
            .as_deref()
            .and_then(|host| self.table.routes.get(host))
            .or(self.table.fallback.as_ref());

        match pool {
            Some(pool) => {
                debug!(
                    conn = %ctx.connection(),
                    sni = hostname.as_deref().unwrap_or(""),
                    pool = pool.name(),
                    "SNI route matched"
                );
                ctx.succeed(Connector::direct(pool.clone()));
            }
            None => {
                let hostname = hostname.unwrap_or_default();
                info!(conn = %ctx.connection(), sni = %hostname, "No route for SNI");
                ctx.fail(NegotiationError::NoRoute(hostname));
            }
        }
    }
}

impl Negotiation for SniNegotiation {
    fn readable(&mut self, ctx: &mut ProtocolContext) {
        let buffer = Arc::clone(ctx.connection().in_buffer());
        let hello = buffer.peek();

        match parse_sni(&hello) {
            SniResult::Incomplete => {
                if hello.len() >= self.max_bytes || buffer.free() == 0 {
                    debug!(conn = %ctx.connection(), bytes = hello.len(), "ClientHello too large");
                    ctx.fail(NegotiationError::Protocol(format!(
                        "ClientHello exceeds {} bytes",
                        hello.len()
                    )));
                }
            }
            SniResult::Found(hostname) => self.resolve(ctx, Some(hostname)),
            SniResult::NoSni => self.resolve(ctx, None),
            SniResult::NotTls => {
                debug!(conn = %ctx.connection(), "Not a TLS ClientHello");
                ctx.fail(NegotiationError::Protocol("not a TLS ClientHello".into()));
            }
            SniResult::Malformed => {
                debug!(conn = %ctx.connection(), "Malformed ClientHello");
                ctx.fail(NegotiationError::Protocol("malformed ClientHello".into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::proxy::EndpointResolver;
    use plfm_net::{Connection, NetEventLoop, RingBuffer};
    use std::net::SocketAddr;

    /// A TLS 1.2 ClientHello, optionally carrying SNI.
    fn client_hello(host: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(host) = host {
            let name = host.as_bytes();
            let mut sni = Vec::new();
            sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
            sni.push(0);
            sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
            sni.extend_from_slice(name);
            extensions.extend_from_slice(&[0x00, 0x00]);
            extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&sni);
        }

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    fn pool(name: &str, addr: &str) -> BackendPool {
        let pool = BackendPool::new(name);
        pool.update_backends(vec![Backend::new(addr.parse().unwrap(), name)]);
        pool
    }

    #[test]
    fn test_parse_sni_found() {
        let result = parse_sni(&client_hello(Some("Example.COM.")));
        assert_eq!(result, SniResult::Found("example.com".into()));
    }

    #[test]
    fn test_parse_no_sni() {
        assert_eq!(parse_sni(&client_hello(None)), SniResult::NoSni);
    }

    #[test]
    fn test_parse_not_tls() {
        let http_request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(parse_sni(http_request), SniResult::NotTls);
    }

    #[test]
    fn test_parse_incomplete_prefixes() {
        let hello = client_hello(Some("example.com"));
        for len in [0, 1, 4, 5, 20, hello.len() - 1] {
            assert_eq!(parse_sni(&hello[..len]), SniResult::Incomplete, "prefix {len}");
        }
    }

    #[test]
    fn test_parse_malformed() {
        // Record complete, but the ClientHello is cut short.
        let data = [0x16, 0x03, 0x01, 0x00, 0x04, 0x01, 0x00, 0x00, 0x40];
        assert_eq!(parse_sni(&data), SniResult::Malformed);
    }

    #[test]
    fn test_normalize_trailing_dot() {
        assert_eq!(normalize_hostname("EXAMPLE.COM."), "example.com");
    }

    #[test]
    fn test_router_routes_and_fallback() {
        let router = SniRouter::new();
        router.set_routes([("API.example.com".to_string(), pool("api", "10.0.0.1:443"))]);
        assert_eq!(router.len(), 1);
        assert_eq!(router.route(Some("api.example.com.")).unwrap().name(), "api");
        assert!(router.route(Some("www.example.com")).is_none());
        assert!(router.route(None).is_none());

        router.set_fallback(Some(pool("default", "10.0.0.2:443")));
        assert_eq!(router.route(Some("www.example.com")).unwrap().name(), "default");
        assert_eq!(router.route(None).unwrap().name(), "default");

        router.upsert("www.example.com", pool("www", "10.0.0.3:443"));
        assert_eq!(router.route(Some("www.example.com")).unwrap().name(), "www");
        assert!(router.remove("WWW.example.com"));
        assert!(!router.remove("www.example.com"));
    }

    fn negotiation_context(event_loop: &NetEventLoop, data: &[u8]) -> ProtocolContext {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let conn = Connection::from_std(
            stream,
            Arc::new(RingBuffer::with_capacity(1024)),
            Arc::new(RingBuffer::with_capacity(1024)),
        )
        .unwrap();
        conn.in_buffer().push(data);
        ProtocolContext::new(Arc::new(conn), event_loop.clone())
    }

    #[test]
    fn test_negotiation_resolves_to_pool() {
        let event_loop = NetEventLoop::spawn("sni-resolve").unwrap();
        let router = SniRouter::new();
        router.upsert("example.com", pool("example", "10.0.0.1:443"));

        let hello = client_hello(Some("example.com"));
        let mut ctx = negotiation_context(&event_loop, &hello[..10]);
        let mut negotiation = router.init(&mut ctx);

        negotiation.readable(&mut ctx);
        assert!(!ctx.is_resolved());

        ctx.connection().in_buffer().push(&hello[10..]);
        negotiation.readable(&mut ctx);
        let (_, resolution) = ctx.take_resolution().unwrap();
        let resolver = match resolution {
            Ok(Connector::Direct(resolver)) => resolver,
            other => panic!("unexpected resolution {other:?}"),
        };
        let endpoint = resolver.resolve(ctx.connection()).unwrap();
        assert_eq!(endpoint.remote(), "10.0.0.1:443".parse::<SocketAddr>().unwrap());

        // The ClientHello is still buffered for the backend.
        assert_eq!(ctx.connection().in_buffer().used(), hello.len());
        event_loop.close();
    }

    #[test]
    fn test_negotiation_fails_without_route() {
        let event_loop = NetEventLoop::spawn("sni-no-route").unwrap();
        let router = SniRouter::new();

        let mut ctx = negotiation_context(&event_loop, &client_hello(Some("unknown.test")));
        let mut negotiation = router.init(&mut ctx);
        negotiation.readable(&mut ctx);

        let (_, resolution) = ctx.take_resolution().unwrap();
        match resolution {
            Err(NegotiationError::NoRoute(host)) => assert_eq!(host, "unknown.test"),
            other => panic!("unexpected resolution {other:?}"),
        }
        event_loop.close();
    }

    #[test]
    fn test_negotiation_rejects_oversized_hello() {
        let event_loop = NetEventLoop::spawn("sni-oversized").unwrap();
        let router = SniRouter::with_max_bytes(16);

        let hello = client_hello(Some("example.com"));
        let mut ctx = negotiation_context(&event_loop, &hello[..32]);
        let mut negotiation = router.init(&mut ctx);
        negotiation.readable(&mut ctx);

        let (_, resolution) = ctx.take_resolution().unwrap();
        assert!(matches!(resolution, Err(NegotiationError::Protocol(_))));
        event_loop.close();
    }
}
