//! Connection pool for backend HTTP connections
//!
//! Backends are addressed by the `ip:port` the locator reports, so one pooled
//! client serves every container.

use crate::locator::BackendAddress;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent to backends
    pub total_requests: AtomicU64,
    /// Requests that failed before a response arrived
    pub failed_requests: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsSnapshot {
    pub total_requests: u64,
    pub failed_requests: u64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total_requests: self.get_total_requests(),
            failed_requests: self.get_failed_requests(),
        }
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to backend containers
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to `backend`, keeping method, path, query and headers
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        backend: &BackendAddress,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = backend_uri(backend, path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// `http://ip:port/path`, bracketing IPv6 literals
fn backend_uri(backend: &BackendAddress, path: &str) -> String {
    if backend.ip.contains(':') {
        format!("http://[{}]:{}{}", backend.ip, backend.port, path)
    } else {
        format!("http://{}:{}{}", backend.ip, backend.port, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        assert_eq!(stats.get_total_requests(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.failed_requests, 1);
    }

    #[test]
    fn test_backend_uri() {
        let v4 = BackendAddress::new("172.17.0.2", 4000);
        assert_eq!(backend_uri(&v4, "/a?b=1"), "http://172.17.0.2:4000/a?b=1");

        let v6 = BackendAddress::new("fd00::2", 80);
        assert_eq!(backend_uri(&v6, "/"), "http://[fd00::2]:80/");
    }

    #[test]
    fn test_pool_creation() {
        let config = PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        };

        let pool = ConnectionPool::new(config);
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.config().idle_timeout, Duration::from_secs(30));
        assert_eq!(pool.stats().get_total_requests(), 0);
    }
}
