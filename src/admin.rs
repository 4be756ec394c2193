use crate::pool::PoolStats;
use crate::resolver::Resolver;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const INSTANCES_PREFIX: &str = "/instances/";

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

struct AdminState {
    resolver: Arc<Resolver>,
    pool_stats: Arc<PoolStats>,
    auth_token: String,
}

/// Operator API: provisioned instances, statistics and health
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        resolver: Arc<Resolver>,
        pool_stats: Arc<PoolStats>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            state: Arc::new(AdminState {
                resolver,
                pool_stats,
                auth_token,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, state: Arc<AdminState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn handle_admin_request<B>(
    req: Request<B>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let response = match (method, path) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        _ if !check_auth(&req, &state.auth_token) => {
            warn!(path, "Unauthorized admin API request");
            response(StatusCode::UNAUTHORIZED, "unauthorized")
        }

        // Tracked identities and their provisioning state
        (&Method::GET, "/instances") => {
            let instances = state.resolver.instances();
            let body = serde_json::json!({
                "count": instances.len(),
                "instances": instances,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        // Drop a retained result: DELETE /instances/{container_name}
        (&Method::DELETE, path) if path.starts_with(INSTANCES_PREFIX) => {
            let name = path.strip_prefix(INSTANCES_PREFIX).unwrap_or("");
            if name.is_empty() {
                response(StatusCode::BAD_REQUEST, "missing container name")
            } else if state.resolver.forget(name) {
                response(StatusCode::OK, "ok")
            } else {
                response(StatusCode::NOT_FOUND, "no completed instance with that name")
            }
        }

        (&Method::GET, "/stats") => {
            let body = serde_json::json!({
                "resolver": state.resolver.stats(),
                "pool": state.pool_stats.snapshot(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
