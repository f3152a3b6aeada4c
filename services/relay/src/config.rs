//! Relay configuration (env-driven).

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::proxy::DEFAULT_BUFFER_SIZE;

/// How accepted connections find their backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Round-robin over a fixed backend set.
    Direct { backends: Vec<SocketAddr> },
    /// TLS passthrough routed by SNI hostname.
    Sni {
        routes: Vec<(String, SocketAddr)>,
        fallback: Option<SocketAddr>,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address to accept client connections on.
    pub listen_addr: SocketAddr,

    pub routing: Routing,

    /// Number of relay event loops.
    pub workers: usize,

    /// Capacity of the client-to-backend buffer of each session.
    pub in_buffer_size: usize,

    /// Capacity of the backend-to-client buffer of each session.
    pub out_buffer_size: usize,

    /// How long a backend is skipped after a failed connect.
    pub backend_cooldown: Duration,

    /// Period of the session status report.
    pub status_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr: SocketAddr = var("RELAY_LISTEN")
            .unwrap_or_else(|| "[::]:7000".to_string())
            .parse()
            .context("RELAY_LISTEN must be a socket address (example: [::]:7000).")?;

        let sni_routes = var("RELAY_SNI_ROUTES")
            .map(|v| parse_routes(&v))
            .transpose()
            .context("RELAY_SNI_ROUTES must be a list of host=addr pairs.")?;
        let sni_fallback: Option<SocketAddr> = parse_var(&var, "RELAY_SNI_FALLBACK")
            .context("RELAY_SNI_FALLBACK must be a socket address.")?;

        let routing = match (sni_routes, sni_fallback) {
            (None, None) => {
                let backends = var("RELAY_BACKENDS")
                    .map(|v| parse_addrs(&v))
                    .transpose()
                    .context("RELAY_BACKENDS must be a comma-separated list of socket addresses.")?
                    .unwrap_or_default();
                if backends.is_empty() {
                    bail!("No backends configured. Set RELAY_BACKENDS or RELAY_SNI_ROUTES.");
                }
                Routing::Direct { backends }
            }
            (routes, fallback) => Routing::Sni {
                routes: routes.unwrap_or_default(),
                fallback,
            },
        };

        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = parse_var::<usize>(&var, "RELAY_WORKERS")
            .context("RELAY_WORKERS must be an integer.")?
            .unwrap_or(default_workers)
            .max(1);

        let in_buffer_size = parse_var::<usize>(&var, "RELAY_IN_BUFFER")
            .context("RELAY_IN_BUFFER must be an integer (bytes).")?
            .unwrap_or(DEFAULT_BUFFER_SIZE);
        let out_buffer_size = parse_var::<usize>(&var, "RELAY_OUT_BUFFER")
            .context("RELAY_OUT_BUFFER must be an integer (bytes).")?
            .unwrap_or(DEFAULT_BUFFER_SIZE);

        let cooldown_ms: u64 = parse_var(&var, "RELAY_BACKEND_COOLDOWN_MS")
            .context("RELAY_BACKEND_COOLDOWN_MS must be an integer (milliseconds).")?
            .unwrap_or(5000);

        let status_interval_ms: u64 = parse_var(&var, "RELAY_STATUS_INTERVAL_MS")
            .context("RELAY_STATUS_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(30_000);

        let log_level = var("RELAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            routing,
            workers,
            in_buffer_size,
            out_buffer_size,
            backend_cooldown: Duration::from_millis(cooldown_ms),
            status_interval: Duration::from_millis(status_interval_ms.max(100)),
            log_level,
        })
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("invalid value for {key}"))
}

fn parse_addrs(value: &str) -> Result<Vec<SocketAddr>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<SocketAddr>().with_context(|| format!("invalid address {s:?}")))
        .collect()
}

fn parse_routes(value: &str) -> Result<Vec<(String, SocketAddr)>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (host, addr) = entry
                .split_once('=')
                .with_context(|| format!("route {entry:?} is not host=addr"))?;
            let addr = addr
                .trim()
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid address in route {entry:?}"))?;
            Ok((host.trim().to_string(), addr))
        })
        .collect()
}
