//! plfm-vt Relay
//!
//! TCP relay with optional SNI-routed TLS passthrough.
//!
//! This service:
//! - Accepts TCP connections on the configured address
//! - Resolves each connection to a backend (round-robin, or by SNI)
//! - Relays bytes on a pool of event-loop threads
//! - Periodically reports live sessions

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use plfm_net::{EventLoopGroup, NetEventLoop, ServerSock};
use plfm_relay::config::{Config, Routing};
use plfm_relay::{
    Backend, BackendPool, Connector, ConnectorGen, ProtocolHandler, Relay, RelayConfig, SniRouter,
};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RELAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting plfm-vt relay");
    info!(
        listen_addr = %config.listen_addr,
        workers = config.workers,
        in_buffer_size = config.in_buffer_size,
        out_buffer_size = config.out_buffer_size,
        "Configuration loaded"
    );

    let acceptor = NetEventLoop::spawn("relay-acceptor").context("Failed to start accept loop")?;
    let workers = Arc::new(
        EventLoopGroup::spawn("relay-worker", config.workers)
            .context("Failed to start relay event loops")?,
    );
    let server = Arc::new(
        ServerSock::bind(config.listen_addr)
            .with_context(|| format!("Failed to bind {}", config.listen_addr))?,
    );

    let relay_config = RelayConfig::new()
        .accept_loop(acceptor.clone())
        .loop_provider(workers.clone())
        .server(server)
        .connector_gen(connector_gen(&config))
        .in_buffer_size(config.in_buffer_size)
        .out_buffer_size(config.out_buffer_size);
    let relay = Relay::new(relay_config).context("Invalid relay configuration")?;
    relay.start().context("Failed to start relay")?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut status = tokio::time::interval(config.status_interval);
    status.tick().await;

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutdown signal received");
                break;
            }
            _ = status.tick() => report_status(&relay),
        }
    }

    if let Err(e) = relay.stop() {
        warn!(error = %e, "Failed to stop relay");
    }
    acceptor.close();
    workers.close();
    info!(sessions = relay.session_count(), "Relay shut down");
    Ok(())
}

fn connector_gen(config: &Config) -> Arc<dyn ConnectorGen> {
    let cooldown = config.backend_cooldown;
    match &config.routing {
        Routing::Direct { backends } => {
            let pool = BackendPool::with_cooldown("default", cooldown);
            pool.update_backends(backends.iter().copied().map(Backend::from).collect());
            Arc::new(pool)
        }
        Routing::Sni { routes, fallback } => {
            let router = SniRouter::new();
            router.set_routes(
                routes
                    .iter()
                    .map(|(host, addr)| (host.clone(), single_backend(host, *addr, cooldown))),
            );
            router.set_fallback(fallback.map(|addr| single_backend("fallback", addr, cooldown)));

            let router: Arc<dyn ProtocolHandler> = Arc::new(router);
            Arc::new(move || Connector::Handler(Arc::clone(&router)))
        }
    }
}

fn single_backend(name: &str, addr: SocketAddr, cooldown: Duration) -> BackendPool {
    let pool = BackendPool::with_cooldown(name, cooldown);
    pool.update_backends(vec![Backend::new(addr, name)]);
    pool
}

fn report_status(relay: &Relay) {
    let stats = relay.stats();
    info!(
        sessions = relay.session_count(),
        accepted = stats.accepted,
        refused = stats.refused,
        connect_failed = stats.connect_failed,
        negotiations_failed = stats.negotiations_failed,
        sessions_opened = stats.sessions_opened,
        sessions_closed = stats.sessions_closed,
        "Relay status"
    );

    if tracing::enabled!(Level::DEBUG) {
        match serde_json::to_string(&relay.sessions()) {
            Ok(snapshot) => debug!(sessions = %snapshot, "Session snapshot"),
            Err(e) => warn!(error = %e, "Failed to serialize session snapshot"),
        }
    }
}
