//! Backend pool with round-robin selection.
//!
//! The pool resolves every accepted connection to one backend:
//! - Round-robin among eligible backends
//! - A backend whose connect failed sits out for a cooldown period
//! - A successful connect makes it healthy again
//!
//! When every backend is cooling down the connection is refused.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use plfm_net::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::proxy::{Connector, ConnectorGen, Endpoint, EndpointResolver};

/// Default time a failed backend is skipped.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

/// A relay target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    pub addr: SocketAddr,
    /// Label for logs.
    pub name: String,
}

impl Backend {
    pub fn new(addr: SocketAddr, name: impl Into<String>) -> Self {
        Self {
            addr,
            name: name.into(),
        }
    }
}

impl From<SocketAddr> for Backend {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr, addr.to_string())
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.addr)
    }
}

/// Health status of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Last connect succeeded.
    Healthy,
    /// Last connect failed.
    Unhealthy,
    /// Never tried.
    Unknown,
}

struct BackendState {
    backend: Backend,
    health: HealthStatus,
    last_failure: Option<Instant>,
    consecutive_failures: u32,
}

impl BackendState {
    fn new(backend: Backend) -> Self {
        Self {
            backend,
            health: HealthStatus::Unknown,
            last_failure: None,
            consecutive_failures: 0,
        }
    }

    fn eligible(&self, now: Instant, cooldown: Duration) -> bool {
        match self.health {
            HealthStatus::Healthy | HealthStatus::Unknown => true,
            HealthStatus::Unhealthy => self
                .last_failure
                .map_or(true, |at| now.saturating_duration_since(at) >= cooldown),
        }
    }
}

struct PoolInner {
    name: String,
    backends: RwLock<Vec<BackendState>>,
    rr_counter: AtomicUsize,
    cooldown: Duration,
    selections: AtomicU64,
    refusals: AtomicU64,
    failures: AtomicU64,
}

impl PoolInner {
    fn mark_healthy(&self, addr: SocketAddr) {
        let mut backends = self.backends.write();
        if let Some(state) = backends.iter_mut().find(|s| s.backend.addr == addr) {
            if state.health != HealthStatus::Healthy {
                debug!(pool = %self.name, backend = %state.backend, "Backend healthy");
            }
            state.health = HealthStatus::Healthy;
            state.consecutive_failures = 0;
        }
    }

    fn mark_unhealthy(&self, addr: SocketAddr) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut backends = self.backends.write();
        if let Some(state) = backends.iter_mut().find(|s| s.backend.addr == addr) {
            state.health = HealthStatus::Unhealthy;
            state.last_failure = Some(Instant::now());
            state.consecutive_failures += 1;
            warn!(
                pool = %self.name,
                backend = %state.backend,
                consecutive_failures = state.consecutive_failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "Backend connection failed"
            );
        }
    }
}

/// A pool of interchangeable backends. Cheap to clone.
#[derive(Clone)]
pub struct BackendPool {
    inner: Arc<PoolInner>,
}

impl BackendPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_cooldown(name, DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(name: impl Into<String>, cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                backends: RwLock::new(Vec::new()),
                rr_counter: AtomicUsize::new(0),
                cooldown,
                selections: AtomicU64::new(0),
                refusals: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Replace the backend set.
    ///
    /// Backends present in both sets keep their health; new ones start
    /// as [`HealthStatus::Unknown`].
    pub fn update_backends(&self, backends: Vec<Backend>) {
        let mut state = self.inner.backends.write();
        let mut existing: HashMap<Backend, BackendState> =
            state.drain(..).map(|s| (s.backend.clone(), s)).collect();

        *state = backends
            .into_iter()
            .map(|b| existing.remove(&b).unwrap_or_else(|| BackendState::new(b)))
            .collect();

        info!(
            pool = %self.inner.name,
            backend_count = state.len(),
            "Updated backend pool"
        );
    }

    pub fn len(&self) -> usize {
        self.inner.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.backends.read().is_empty()
    }

    /// Number of backends currently eligible for selection.
    pub fn eligible_count(&self) -> usize {
        let now = Instant::now();
        self.inner
            .backends
            .read()
            .iter()
            .filter(|s| s.eligible(now, self.inner.cooldown))
            .count()
    }

    pub fn health(&self, addr: SocketAddr) -> Option<HealthStatus> {
        self.inner
            .backends
            .read()
            .iter()
            .find(|s| s.backend.addr == addr)
            .map(|s| s.health)
    }

    /// Pick the next eligible backend in round-robin order.
    pub fn select(&self) -> Option<Backend> {
        let now = Instant::now();
        let backends = self.inner.backends.read();
        let eligible: Vec<&BackendState> = backends
            .iter()
            .filter(|s| s.eligible(now, self.inner.cooldown))
            .collect();

        if eligible.is_empty() {
            self.inner.refusals.fetch_add(1, Ordering::Relaxed);
            warn!(pool = %self.inner.name, "No eligible backends");
            return None;
        }

        let idx = self.inner.rr_counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
        self.inner.selections.fetch_add(1, Ordering::Relaxed);
        Some(eligible[idx].backend.clone())
    }

    pub fn mark_healthy(&self, addr: SocketAddr) {
        self.inner.mark_healthy(addr);
    }

    pub fn mark_unhealthy(&self, addr: SocketAddr) {
        self.inner.mark_unhealthy(addr);
    }

    /// Endpoint for `backend` that reports connect outcomes to this pool.
    fn endpoint(&self, backend: &Backend) -> Endpoint {
        let on_connected = Arc::clone(&self.inner);
        let on_failure = Arc::clone(&self.inner);
        Endpoint::new(backend.addr)
            .on_connected(move |addr| on_connected.mark_healthy(addr))
            .on_failure(move |addr| on_failure.mark_unhealthy(addr))
    }

    pub fn stats(&self) -> BackendPoolStats {
        BackendPoolStats {
            selections: self.inner.selections.load(Ordering::Relaxed),
            refusals: self.inner.refusals.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
        }
    }
}

impl EndpointResolver for BackendPool {
    fn resolve(&self, active: &Connection) -> Option<Endpoint> {
        let backend = self.select()?;
        debug!(
            pool = %self.inner.name,
            conn = %active,
            backend = %backend,
            "Selected backend"
        );
        Some(self.endpoint(&backend))
    }
}

impl ConnectorGen for BackendPool {
    fn connector(&self) -> Connector {
        Connector::direct(self.clone())
    }
}

/// Statistics for a backend pool.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BackendPoolStats {
    pub selections: u64,
    pub refusals: u64,
    pub failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends() -> Vec<Backend> {
        vec![
            Backend::new("[fd00::1]:8080".parse().unwrap(), "a"),
            Backend::new("[fd00::2]:8080".parse().unwrap(), "b"),
        ]
    }

    #[test]
    fn test_backend_display() {
        let backend = Backend::from("[fd00::1]:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(backend.to_string(), "[fd00::1]:8080([fd00::1]:8080)");
    }

    #[test]
    fn test_backend_pool_update() {
        let pool = BackendPool::new("pool-1");
        let backends = backends();

        pool.update_backends(backends.clone());
        assert_eq!(pool.len(), 2);

        pool.mark_unhealthy(backends[0].addr);
        pool.update_backends(vec![backends[0].clone()]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.health(backends[0].addr), Some(HealthStatus::Unhealthy));
    }

    #[test]
    fn test_round_robin() {
        let pool = BackendPool::new("rr");
        pool.update_backends(backends());

        let first = pool.select().unwrap();
        let second = pool.select().unwrap();
        let third = pool.select().unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
        assert_eq!(pool.stats().selections, 3);
    }

    #[test]
    fn test_failed_backend_sits_out_cooldown() {
        let pool = BackendPool::with_cooldown("cooldown", Duration::from_secs(60));
        let backends = backends();
        pool.update_backends(backends.clone());

        pool.mark_unhealthy(backends[0].addr);
        assert_eq!(pool.eligible_count(), 1);
        for _ in 0..4 {
            assert_eq!(pool.select().unwrap(), backends[1]);
        }

        pool.mark_unhealthy(backends[1].addr);
        assert!(pool.select().is_none());
        assert_eq!(pool.stats().refusals, 1);
        assert_eq!(pool.stats().failures, 2);

        pool.mark_healthy(backends[0].addr);
        assert_eq!(pool.select().unwrap(), backends[0]);
    }

    #[test]
    fn test_zero_cooldown_retries_immediately() {
        let pool = BackendPool::with_cooldown("retry", Duration::ZERO);
        let backend = Backend::from("127.0.0.1:9".parse::<SocketAddr>().unwrap());
        pool.update_backends(vec![backend.clone()]);

        pool.mark_unhealthy(backend.addr);
        assert_eq!(pool.select(), Some(backend));
    }

    #[test]
    fn test_endpoint_reports_outcome() {
        let pool = BackendPool::with_cooldown("hooks", Duration::from_secs(60));
        let backend = Backend::from("127.0.0.1:9".parse::<SocketAddr>().unwrap());
        pool.update_backends(vec![backend.clone()]);

        let endpoint = pool.endpoint(&backend);
        endpoint.connection_failed();
        assert_eq!(pool.health(backend.addr), Some(HealthStatus::Unhealthy));
        assert_eq!(pool.eligible_count(), 0);

        endpoint.connection_established();
        assert_eq!(pool.health(backend.addr), Some(HealthStatus::Healthy));
    }
}
