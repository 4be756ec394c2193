use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::resolver::HostResolver;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// State shared by every connection
struct Shared {
    resolver: Arc<dyn HostResolver>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    /// Appended to Host headers that carry no port
    listen_port: u16,
}

/// The main reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    resolver: Arc<dyn HostResolver>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        resolver: Arc<dyn HostResolver>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, resolver, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        resolver: Arc<dyn HostResolver>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            resolver,
            shutdown_rx,
            pool: Arc::new(ConnectionPool::new(pool_config)),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bound on forwarding a request to a located backend
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let shared = Arc::new(Shared {
            resolver: self.resolver,
            pool: self.pool,
            request_timeout: self.request_timeout,
            listen_port: local_addr.port(),
        });
        let mut shutdown_rx = self.shutdown_rx;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let shared = Arc::clone(&shared);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, shared).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        async move { handle_request(req, shared, addr).await }
    });

    // auto::Builder serves HTTP/1.1 and h2c on the same port
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    shared: Arc<Shared>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let host = match extract_host(&req, shared.listen_port) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    // X-Forwarded-* are overwritten, not appended: this proxy is the first trusted hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Ok(value) = HeaderValue::from_str(&host) {
        headers.insert(X_FORWARDED_HOST, value);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(host, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    if shared.resolver.is_draining() {
        return Ok(json_error_response(
            ProxyErrorCode::ShuttingDown,
            "Proxy is shutting down",
        ));
    }

    let backend = match shared.resolver.resolve(&host).await {
        Some(backend) => backend,
        None => {
            // Same answer for unknown hosts and failed provisioning
            return Ok(json_error_response(
                ProxyErrorCode::BackendUnavailable,
                "No backend available for host",
            ));
        }
    };

    let timeout = shared.request_timeout;
    let result = tokio::time::timeout(timeout, shared.pool.send_request(req, &backend)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(host, backend = %backend, error = %e, "Failed to forward request via pool");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
        Err(_) => {
            warn!(
                host,
                backend = %backend,
                timeout_secs = timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            ))
        }
    }
}

/// Lower-cased `host:port` from the Host header (or the HTTP/2 authority).
///
/// `default_port` is used when the client sent no port.
fn extract_host<B>(req: &Request<B>, default_port: u16) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))?;

    normalize_host(&raw, default_port)
}

fn normalize_host(raw: &str, default_port: u16) -> Option<String> {
    let (hostname, port) = match raw.rsplit_once(':') {
        Some((hostname, port)) => (hostname, port.parse::<u16>().ok()?),
        None => (raw, default_port),
    };

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Same character set the hostname grammar accepts for its fields
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return None;
    }

    Some(format!("{}:{}", hostname.to_lowercase(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host_keeps_port() {
        assert_eq!(
            normalize_host("Master.Hello-World.acme.github.com.moorage:3000", 80),
            Some("master.hello-world.acme.github.com.moorage:3000".to_string())
        );
    }

    #[test]
    fn test_normalize_host_appends_listen_port() {
        assert_eq!(
            normalize_host("master.app.acme.github.com.moorage", 3000),
            Some("master.app.acme.github.com.moorage:3000".to_string())
        );
    }

    #[test]
    fn test_normalize_host_accepts_underscore_refspec() {
        assert_eq!(
            normalize_host("feature_x.app.acme.github.com.moorage:3000", 80),
            Some("feature_x.app.acme.github.com.moorage:3000".to_string())
        );
    }

    #[test]
    fn test_normalize_host_rejects_invalid() {
        assert_eq!(normalize_host("", 80), None);
        assert_eq!(normalize_host(":80", 80), None);
        assert_eq!(normalize_host("host:notaport", 80), None);
        assert_eq!(normalize_host("host:99999", 80), None);
        assert_eq!(normalize_host("bad host:80", 80), None);
        assert_eq!(normalize_host("evil\r\nhost", 80), None);
        assert_eq!(normalize_host(&"a".repeat(254), 80), None);
    }

    #[test]
    fn test_extract_host_from_header() {
        let req = Request::builder()
            .uri("/")
            .header(hyper::header::HOST, "example.com:8080")
            .body(())
            .unwrap();
        assert_eq!(extract_host(&req, 3000), Some("example.com:8080".to_string()));
    }

    #[test]
    fn test_extract_host_from_authority() {
        let req = Request::builder()
            .uri("http://master.app.acme.github.com.moorage:3000/path")
            .body(())
            .unwrap();
        assert_eq!(
            extract_host(&req, 80),
            Some("master.app.acme.github.com.moorage:3000".to_string())
        );
    }

    #[test]
    fn test_extract_host_missing() {
        let req = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(extract_host(&req, 80), None);
    }
}
