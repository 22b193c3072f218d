mod common;

use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{header, Body, Request, Response, StatusCode};
use rustls::pki_types::ServerName;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use common::self_signed;
use wired_node::dns::{DnsRecord, ZoneStore};
use wired_node::error_pages::ErrorPages;
use wired_node::proxy::{serve_redirect, ProxyConfig, ProxyRouter, ReverseProxy, ORIGIN_IP_HEADER};
use wired_node::snowflake::Snowflake;
use wired_node::tls::{server_config, CertStore};

/// Origin that echoes `host|origin-ip|uri`
async fn start_echo_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Body>| async move {
                    let header_value = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-")
                            .to_string()
                    };
                    let body = format!(
                        "{}|{}|{}",
                        header_value(header::HOST.as_str()),
                        header_value(ORIGIN_IP_HEADER),
                        req.uri()
                    );
                    Ok::<_, Infallible>(Response::new(Body::from(body)))
                });
                let _ = Http::new().serve_connection(stream, service).await;
            });
        }
    });
    addr
}

/// Origin that accepts connections and never answers
async fn start_silent_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            held.push(stream);
        }
    });
    addr
}

struct Edge {
    addr: SocketAddr,
    certs: Arc<CertStore>,
    roots: rustls::RootCertStore,
}

/// HTTPS proxy on an ephemeral port holding a certificate for `app.test`
async fn start_edge(config: ProxyConfig, router: Arc<ProxyRouter>) -> Edge {
    let certs = Arc::new(CertStore::new());
    let (chain, key) = self_signed(&["app.test"], 30);
    certs.install(&chain, &key, "app.test").unwrap();

    let mut roots = rustls::RootCertStore::empty();
    add_roots(&mut roots, &chain);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = Arc::new(ReverseProxy::new(config, router, Arc::new(ErrorPages::default())));
    let tls = server_config(Arc::clone(&certs)).unwrap();
    tokio::spawn(async move {
        let _ = proxy.serve_tls(listener, tls).await;
    });

    Edge { addr, certs, roots }
}

fn add_roots(roots: &mut rustls::RootCertStore, chain_pem: &str) {
    for cert in rustls_pemfile::certs(&mut chain_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
}

async fn connect_tls(edge: &Edge, sni: &str) -> std::io::Result<TlsStream<TcpStream>> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(edge.roots.clone())
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(edge.addr).await?;
    let name = ServerName::try_from(sni.to_string()).unwrap();
    connector.connect(name, stream).await
}

async fn get<S>(stream: S, host: &str, uri: &str) -> Response<Body>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::handshake(stream).await.unwrap();
    tokio::spawn(connection);
    let request = Request::builder()
        .uri(uri)
        .header(header::HOST, host)
        .body(Body::empty())
        .unwrap();
    sender.send_request(request).await.unwrap()
}

async fn body_string(response: Response<Body>) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn protected(name: &str, id: &str) -> DnsRecord {
    DnsRecord::a(name, Ipv4Addr::LOCALHOST, 300)
        .with_id(id)
        .with_protected(true)
}

#[test]
fn test_proxy_config_custom() {
    let toml_str = r#"
        https_addr = "127.0.0.1:8443"
        http_addr = "127.0.0.1:8080"
        origin_port = 8000
        backend_timeout_secs = 3
    "#;

    let config: ProxyConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(config.https_addr.port(), 8443);
    assert_eq!(config.http_addr.port(), 8080);
    assert_eq!(config.origin_port, 8000);
    assert_eq!(config.backend_timeout_secs, 3);
    assert_eq!(config.header_read_timeout_secs, 2);
    assert_eq!(config.read_timeout_secs, 5);
    assert_eq!(config.write_timeout_secs, 10);
    assert_eq!(config.idle_timeout_secs, 90);
}

#[tokio::test]
async fn test_sni_selects_certificate() {
    let edge = start_edge(ProxyConfig::default(), Arc::new(ProxyRouter::new())).await;

    assert!(connect_tls(&edge, "app.test").await.is_ok());
    assert!(connect_tls(&edge, "other.test").await.is_err());

    // Certificates installed later are served without a restart
    let (chain, key) = self_signed(&["other.test"], 30);
    edge.certs.install(&chain, &key, "other.test").unwrap();
    let mut edge = edge;
    add_roots(&mut edge.roots, &chain);
    assert!(connect_tls(&edge, "other.test").await.is_ok());
}

#[tokio::test]
async fn test_request_forwarded_to_origin() {
    let origin = start_echo_origin().await;
    let router = Arc::new(ProxyRouter::new());
    router.upsert(&protected("app.test.", "1")).await;
    let config = ProxyConfig {
        origin_port: origin.port(),
        ..ProxyConfig::default()
    };
    let edge = start_edge(config, router).await;

    let tls = connect_tls(&edge, "app.test").await.unwrap();
    let response = get(tls, "app.test", "/hello?x=1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "app.test|127.0.0.1|/hello?x=1");
}

#[tokio::test]
async fn test_unknown_host_gets_error_page() {
    let edge = start_edge(ProxyConfig::default(), Arc::new(ProxyRouter::new())).await;

    let tls = connect_tls(&edge, "app.test").await.unwrap();
    let response = get(tls, "unrouted.test", "/").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_string(response).await.contains("604"));
}

#[tokio::test]
async fn test_silent_origin_times_out() {
    let origin = start_silent_origin().await;
    let router = Arc::new(ProxyRouter::new());
    router.upsert(&protected("app.test.", "1")).await;
    let config = ProxyConfig {
        origin_port: origin.port(),
        backend_timeout_secs: 1,
        ..ProxyConfig::default()
    };
    let edge = start_edge(config, router).await;

    let tls = connect_tls(&edge, "app.test").await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), get(tls, "app.test", "/slow"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(body_string(response).await.contains("605"));
}

#[tokio::test]
async fn test_route_found_in_store_without_event() {
    let origin = start_echo_origin().await;
    let store = Arc::new(ZoneStore::new(Arc::new(Snowflake::new(1).unwrap())));
    store.insert_record("app.test.", protected("app.test.", "9")).await.unwrap();
    let config = ProxyConfig {
        origin_port: origin.port(),
        ..ProxyConfig::default()
    };
    let router = Arc::new(ProxyRouter::new());
    let pages = Arc::new(ErrorPages::default());
    let proxy = ReverseProxy::new(config, router, pages).with_store(store);

    let request = Request::builder()
        .uri("/")
        .header(header::HOST, "APP.test:443")
        .body(Body::empty())
        .unwrap();
    let response = proxy.handle(request, "192.0.2.55:40000".parse().unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "app.test|192.0.2.55|/");
}

#[tokio::test]
async fn test_plain_http_redirects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_redirect(
        listener,
        Arc::new(ErrorPages::default()),
        ProxyConfig::default().connection_timeouts(),
    ));

    let stream = TcpStream::connect(addr).await.unwrap();
    let response = get(stream, "app.test", "/login?next=%2F").await;
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.headers()[header::LOCATION], "https://app.test/login?next=%2F");
}

#[tokio::test]
async fn test_idle_keep_alive_connection_closes() {
    let config = ProxyConfig {
        idle_timeout_secs: 1,
        ..ProxyConfig::default()
    };
    let edge = start_edge(config, Arc::new(ProxyRouter::new())).await;

    let tls = connect_tls(&edge, "app.test").await.unwrap();
    let (mut sender, connection) = hyper::client::conn::handshake(tls).await.unwrap();
    let connection = tokio::spawn(connection);

    let request = Request::builder()
        .uri("/")
        .header(header::HOST, "unrouted.test")
        .body(Body::empty())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    body_string(response).await;

    // The response kept the connection open; the edge drops it once idle
    let idle_since = std::time::Instant::now();
    let closed = tokio::time::timeout(Duration::from_secs(5), connection)
        .await
        .expect("idle connection was not closed");
    // a dropped TLS session may end with an unexpected-EOF error
    let _ = closed.unwrap();
    assert!(idle_since.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn test_silent_client_dropped_before_handshake() {
    let config = ProxyConfig {
        read_timeout_secs: 1,
        ..ProxyConfig::default()
    };
    let edge = start_edge(config, Arc::new(ProxyRouter::new())).await;

    let mut stream = TcpStream::connect(edge.addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("silent connection was not closed");
    // EOF or reset, never data
    assert!(matches!(read, Ok(0) | Err(_)));
}
