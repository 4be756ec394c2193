//! End-to-end proxy tests
//!
//! A real hyper backend runs in-process; the scripted runner's inspection
//! output points the resolver at it.

use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use moorage::descriptor::HostParser;
use moorage::guard::ConcurrencyGuard;
use moorage::locator::Locator;
use moorage::provisioner::Provisioner;
use moorage::proxy::ProxyServer;
use moorage::resolver::Resolver;
use moorage::testing::ScriptedRunner;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

const HOST: &str = "master.hello-world.acme.github.com.moorage:3000";
const CONTAINER: &str = "master.hello-world.acme.github.com";
const HOST_WITHOUT_PORT: &str = "master.hello-world.acme.github.com.moorage";

async fn backend_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let seen_host = req
        .headers()
        .get("x-forwarded-host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = format!("hello from backend: {}", req.uri().path());

    Ok(Response::builder()
        .header("x-seen-host", seen_host)
        .body(Full::new(Bytes::from(body)))
        .unwrap())
}

/// Start a plain HTTP/1.1 backend, returning its address
async fn start_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(backend_handler))
                    .await;
            });
        }
    });

    addr
}

struct TestProxy {
    addr: SocketAddr,
    runner: Arc<ScriptedRunner>,
    resolver: Arc<Resolver>,
    _shutdown: watch::Sender<bool>,
}

async fn start_proxy() -> TestProxy {
    let runner = Arc::new(ScriptedRunner::new());
    let resolver = Arc::new(Resolver::new(
        HostParser::default(),
        Provisioner::new(runner.clone(), "/opt/src", "https"),
        Locator::new(runner.clone()),
        Arc::new(ConcurrencyGuard::new(2, 10, 10)),
        true,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = ProxyServer::new(addr, resolver.clone(), shutdown_rx);

    tokio::spawn(async move {
        let _ = proxy.serve(listener).await;
    });

    TestProxy {
        addr,
        runner,
        resolver,
        _shutdown: shutdown_tx,
    }
}

async fn get(proxy: &TestProxy, host: Option<&str>, path: &str) -> Response<Incoming> {
    let client: Client<HttpConnector, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();

    let mut builder = Request::builder().uri(format!("http://{}{}", proxy.addr, path));
    if let Some(host) = host {
        builder = builder.header(hyper::header::HOST, host);
    }
    client.request(builder.body(Empty::new()).unwrap()).await.unwrap()
}

async fn body_string(resp: Response<Incoming>) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_request_is_forwarded_to_provisioned_backend() {
    let backend = start_backend().await;
    let proxy = start_proxy().await;
    proxy
        .runner
        .set_inspection(CONTAINER, &format!("127.0.0.1:{}/tcp", backend.port()));

    let resp = get(&proxy, Some(HOST), "/greeting?x=1").await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-seen-host").unwrap(), HOST);
    assert_eq!(body_string(resp).await, "hello from backend: /greeting");
    assert_eq!(proxy.runner.runs(), 1);
}

#[tokio::test]
async fn test_host_without_port_uses_listen_port() {
    let backend = start_backend().await;
    let proxy = start_proxy().await;
    proxy
        .runner
        .set_inspection(CONTAINER, &format!("127.0.0.1:{}/tcp", backend.port()));

    let resp = get(&proxy, Some(HOST_WITHOUT_PORT), "/").await;

    assert_eq!(resp.status(), StatusCode::OK);
    let expected = format!("{}:{}", HOST_WITHOUT_PORT, proxy.addr.port());
    assert_eq!(resp.headers().get("x-seen-host").unwrap(), expected.as_str());
}

#[tokio::test]
async fn test_underscore_refspec_is_served() {
    let backend = start_backend().await;
    let proxy = start_proxy().await;
    proxy.runner.set_inspection(
        "feature_x.hello-world.acme.github.com",
        &format!("127.0.0.1:{}/tcp", backend.port()),
    );

    let host = "feature_x.hello-world.acme.github.com.moorage:3000";
    let resp = get(&proxy, Some(host), "/").await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-seen-host").unwrap(), host);
    assert_eq!(proxy.runner.runs(), 1);
}

#[tokio::test]
async fn test_draining_proxy_reports_shutting_down() {
    let proxy = start_proxy().await;
    proxy.resolver.guard().drain().await;

    let resp = get(&proxy, Some(HOST), "/").await;

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        resp.headers().get("x-proxy-error").unwrap(),
        "SHUTTING_DOWN"
    );
    assert_eq!(proxy.runner.call_count(), 0);
}

#[tokio::test]
async fn test_unknown_host_is_bad_gateway() {
    let proxy = start_proxy().await;

    let resp = get(&proxy, Some("example.com:3000"), "/").await;

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        resp.headers().get("x-proxy-error").unwrap(),
        "BACKEND_UNAVAILABLE"
    );
    assert!(body_string(resp).await.contains("\"code\":\"BACKEND_UNAVAILABLE\""));
    assert_eq!(proxy.runner.call_count(), 0);
}

#[tokio::test]
async fn test_invalid_host_header_is_rejected() {
    let proxy = start_proxy().await;

    let resp = get(&proxy, Some("bad_host!:3000"), "/").await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        resp.headers().get("x-proxy-error").unwrap(),
        "MISSING_HOST_HEADER"
    );
}

#[tokio::test]
async fn test_unreachable_backend_reports_connection_failure() {
    // Reserve a port, then free it so nothing listens there
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);

    let proxy = start_proxy().await;
    proxy
        .runner
        .set_inspection(CONTAINER, &format!("127.0.0.1:{}/tcp", port));

    let resp = get(&proxy, Some(HOST), "/").await;

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        resp.headers().get("x-proxy-error").unwrap(),
        "CONNECTION_FAILED"
    );
}
