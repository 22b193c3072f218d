//! TLS-terminating reverse proxy
//!
//! Port 443 terminates TLS with a certificate picked by SNI and forwards the
//! request to the origin address recorded for the `Host`. Port 80 only
//! redirects to HTTPS. Failures are answered with the error page bank.
//! Both listeners run every connection through a [`DeadlineStream`].

use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::deadline::{ConnectionTimeouts, DeadlineStream, InFlight};
use crate::dns::{fqdn, DnsRecord, DnsRecordValue, ZoneStore};
use crate::error_pages::{
    ErrorPages, BACKEND_CONNECT, BACKEND_TIMEOUT, DNS_FAILURE, HANDLER_PANIC, NO_RECORD,
    TARGET_UNSET,
};
use crate::events::{
    Event, EventBuses, RecordAdded, RecordRemoved, ADD_RECORD, DNS_BUS, REMOVE_RECORD,
};

/// Header carrying the client address to the origin
pub const ORIGIN_IP_HEADER: &str = "wired-origin-ip";

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub https_addr: SocketAddr,
    pub http_addr: SocketAddr,
    /// Port the origin listens on
    pub origin_port: u16,
    pub backend_timeout_secs: u64,
    /// Request head, counted from its first byte
    pub header_read_timeout_secs: u64,
    /// TLS handshake plus the first request head; also the longest stall
    /// between request body chunks
    pub read_timeout_secs: u64,
    /// One socket write making no progress
    pub write_timeout_secs: u64,
    /// Keep-alive wait for the next request
    pub idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            https_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 443)),
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 80)),
            origin_port: 80,
            backend_timeout_secs: 10,
            header_read_timeout_secs: 2,
            read_timeout_secs: 5,
            write_timeout_secs: 10,
            idle_timeout_secs: 90,
        }
    }
}

impl ProxyConfig {
    pub fn connection_timeouts(&self) -> ConnectionTimeouts {
        ConnectionTimeouts {
            first_request: Duration::from_secs(self.read_timeout_secs),
            header: Duration::from_secs(self.header_read_timeout_secs),
            write: Duration::from_secs(self.write_timeout_secs),
            idle: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid host: {0}")]
    InvalidHost(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Route {
    record_id: String,
    origin: IpAddr,
}

/// Host -> origin address, fed from `dns` bus events
#[derive(Debug, Default)]
pub struct ProxyRouter {
    routes: RwLock<HashMap<String, Route>>,
}

impl ProxyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update routes from one `dns` bus event
    pub async fn apply(&self, event: &Event) {
        match event.event_type {
            ADD_RECORD => match event.decode::<RecordAdded>() {
                Ok(added) => self.upsert(&added.record).await,
                Err(e) => warn!("Undecodable record event: {}", e),
            },
            REMOVE_RECORD => match event.decode::<RecordRemoved>() {
                Ok(removed) => self.remove_record(&removed.id).await,
                Err(e) => warn!("Undecodable record event: {}", e),
            },
            _ => {}
        }
    }

    /// Route the record's name to its address if it is a protected A/AAAA
    pub async fn upsert(&self, record: &DnsRecord) {
        let host = route_key(&record.name);
        let mut routes = self.routes.write().await;
        match protected_origin(record) {
            Some(origin) => {
                debug!("Route {} -> {}", host, origin);
                routes.insert(
                    host,
                    Route {
                        record_id: record.metadata.id.clone(),
                        origin,
                    },
                );
            }
            None => {
                // The record may have been unprotected in place
                if routes.get(&host).is_some_and(|r| r.record_id == record.metadata.id) {
                    routes.remove(&host);
                }
            }
        }
    }

    pub async fn remove_record(&self, record_id: &str) {
        self.routes.write().await.retain(|host, route| {
            let keep = route.record_id != record_id;
            if !keep {
                debug!("Route {} removed", host);
            }
            keep
        });
    }

    pub async fn origin_for(&self, host: &str) -> Option<IpAddr> {
        self.routes.read().await.get(&route_key(host)).map(|r| r.origin)
    }

    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Follow the `dns` bus for the life of the returned task
    pub fn follow(self: &Arc<Self>, buses: &EventBuses) -> JoinHandle<()> {
        let mut rx = buses.bus(DNS_BUS).subscribe_all();
        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                router.apply(&event).await;
            }
        })
    }
}

fn route_key(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

fn protected_origin(record: &DnsRecord) -> Option<IpAddr> {
    if !record.metadata.protected {
        return None;
    }
    match &record.value {
        DnsRecordValue::A(ip) => Some(IpAddr::V4(*ip)),
        DnsRecordValue::AAAA(ip) => Some(IpAddr::V6(*ip)),
        _ => None,
    }
}

/// `Host` header, lower-cased and without port
fn request_host(req: &Request<Body>) -> Option<String> {
    let raw = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))?;

    let host = if raw.starts_with('[') {
        raw.split(']').next().map(|h| format!("{}]", h))?
    } else {
        raw.split(':').next()?.to_string()
    };
    let host = host.trim().to_lowercase();
    (!host.is_empty()).then_some(host)
}

fn path_and_query(req: &Request<Body>) -> String {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

/// Request handling shared by every HTTPS connection
pub struct ReverseProxy {
    config: ProxyConfig,
    router: Arc<ProxyRouter>,
    store: Option<Arc<ZoneStore>>,
    pages: Arc<ErrorPages>,
    client: Client<HttpConnector>,
}

impl ReverseProxy {
    pub fn new(config: ProxyConfig, router: Arc<ProxyRouter>, pages: Arc<ErrorPages>) -> Self {
        Self {
            config,
            router,
            store: None,
            pages,
            client: Client::new(),
        }
    }

    /// Consult the record store when the routing table has no entry
    pub fn with_store(mut self, store: Arc<ZoneStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    async fn resolve_origin(&self, host: &str) -> Result<Option<IpAddr>, ProxyError> {
        if let Some(origin) = self.router.origin_for(host).await {
            return Ok(Some(origin));
        }
        let Some(store) = &self.store else {
            return Ok(None);
        };
        // Addresses are never routed
        if host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().is_ok() {
            return Ok(None);
        }
        if host.contains(['/', ' ', '@']) {
            return Err(ProxyError::InvalidHost(host.to_string()));
        }

        let origin = store
            .records_by_name(&fqdn(host))
            .await
            .iter()
            .find_map(protected_origin);
        if let Some(origin) = origin {
            debug!("Route {} -> {} (from store)", host, origin);
        }
        Ok(origin)
    }

    /// Serve one request, recovering from panics with the 606 page
    pub async fn handle(&self, req: Request<Body>, remote: SocketAddr) -> Response<Body> {
        let started = Instant::now();
        let method = req.method().clone();
        let host = request_host(&req).unwrap_or_default();
        let path = req.uri().path().to_string();

        let response = match AssertUnwindSafe(self.forward(req, remote)).catch_unwind().await {
            Ok(response) => response,
            Err(_) => {
                error!("Handler panicked for {} {}{}", method, host, path);
                self.pages.response(HANDLER_PANIC)
            }
        };

        info!(
            "{} {} {} {} {}ms",
            method,
            host,
            path,
            response.status().as_u16(),
            started.elapsed().as_millis()
        );
        response
    }

    async fn forward(&self, req: Request<Body>, remote: SocketAddr) -> Response<Body> {
        let Some(host) = request_host(&req) else {
            return self.pages.response(NO_RECORD);
        };

        let origin = match self.resolve_origin(&host).await {
            Ok(Some(origin)) => origin,
            Ok(None) => return self.pages.response(NO_RECORD),
            Err(e) => {
                debug!("Origin lookup for {} failed: {}", host, e);
                return self.pages.response(DNS_FAILURE);
            }
        };

        let target = format!(
            "http://{}{}",
            SocketAddr::new(origin, self.config.origin_port),
            path_and_query(&req)
        );
        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!("Invalid upstream target {}: {}", target, e);
                return self.pages.response(TARGET_UNSET);
            }
        };

        let (mut parts, body) = req.into_parts();
        let body = body_with_read_timeout(body, Duration::from_secs(self.config.read_timeout_secs));
        parts.uri = uri;
        if let Ok(value) = HeaderValue::from_str(&remote.ip().to_string()) {
            parts.headers.insert(ORIGIN_IP_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&host) {
            parts.headers.insert(header::HOST, value);
        }
        let upstream = Request::from_parts(parts, body);

        let deadline = Duration::from_secs(self.config.backend_timeout_secs);
        match tokio::time::timeout(deadline, self.client.request(upstream)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!("Upstream {} failed: {}", target, e);
                if e.is_timeout() {
                    self.pages.response(BACKEND_TIMEOUT)
                } else {
                    self.pages.response(BACKEND_CONNECT)
                }
            }
            Err(_) => {
                debug!("Upstream {} timed out after {:?}", target, deadline);
                self.pages.response(BACKEND_TIMEOUT)
            }
        }
    }

    /// Serve HTTP/1.1 on an accepted stream. `in_flight` is the counter its
    /// [`DeadlineStream`] watches.
    pub async fn serve_connection<S>(
        self: Arc<Self>,
        stream: S,
        remote: SocketAddr,
        in_flight: InFlight,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let proxy = Arc::clone(&self);
        let service = service_fn(move |req| {
            let proxy = Arc::clone(&proxy);
            let running = in_flight.start();
            async move {
                let response = proxy.handle(req, remote).await;
                drop(running);
                Ok::<_, Infallible>(response)
            }
        });
        if let Err(e) = http1().serve_connection(stream, service).await {
            debug!("Connection from {} ended: {}", remote, e);
        }
    }

    /// Accept TLS connections on `listener` forever
    pub async fn serve_tls(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Arc<rustls::ServerConfig>,
    ) -> Result<(), ProxyError> {
        let acceptor = TlsAcceptor::from(tls);
        let timeouts = self.config.connection_timeouts();
        info!("HTTPS proxy listening on {}", listener.local_addr()?);

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("HTTPS accept failed: {}", e);
                    continue;
                }
            };
            let acceptor = acceptor.clone();
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                let in_flight = InFlight::new();
                let stream = DeadlineStream::new(stream, timeouts, in_flight.clone());
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => proxy.serve_connection(tls_stream, remote, in_flight).await,
                    Err(e) => debug!("TLS handshake with {} failed: {}", remote, e),
                }
            });
        }
    }

    /// Bind both ports and serve until either listener fails
    pub async fn run(self: Arc<Self>, tls: Arc<rustls::ServerConfig>) -> Result<(), ProxyError> {
        let https = TcpListener::bind(self.config.https_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.config.https_addr,
                source,
            })?;
        let http = TcpListener::bind(self.config.http_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.config.http_addr,
                source,
            })?;
        let pages = Arc::clone(&self.pages);
        let timeouts = self.config.connection_timeouts();

        tokio::select! {
            result = self.serve_tls(https, tls) => result,
            result = serve_redirect(http, pages, timeouts) => result,
        }
    }
}

/// HTTP/1.1 only; header and keep-alive deadlines live in [`DeadlineStream`]
fn http1() -> Http {
    let mut http = Http::new();
    http.http1_only(true);
    http
}

/// Fail the upstream request body when the client stalls between chunks
fn body_with_read_timeout(body: Body, limit: Duration) -> Body {
    if body.is_end_stream() {
        return body;
    }
    let chunks = futures::stream::unfold(Some(body), move |state| async move {
        let mut body = state?;
        match tokio::time::timeout(limit, body.data()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(body))),
            Ok(Some(Err(e))) => Some((Err(io::Error::new(io::ErrorKind::Other, e)), None)),
            Ok(None) => None,
            Err(_) => Some((
                Err(io::Error::new(io::ErrorKind::TimedOut, "request body stalled")),
                None,
            )),
        }
    });
    Body::wrap_stream(chunks)
}

/// 301 to the same host, path and query over HTTPS
pub fn redirect_response(req: &Request<Body>, pages: &ErrorPages) -> Response<Body> {
    let Some(host) = request_host(req) else {
        return pages.response(NO_RECORD);
    };
    let location = format!("https://{}{}", host, path_and_query(req));
    match HeaderValue::from_str(&location) {
        Ok(value) => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => pages.response(NO_RECORD),
    }
}

/// Plain-HTTP listener that only redirects
pub async fn serve_redirect(
    listener: TcpListener,
    pages: Arc<ErrorPages>,
    timeouts: ConnectionTimeouts,
) -> Result<(), ProxyError> {
    info!("HTTP redirect listening on {}", listener.local_addr()?);
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("HTTP accept failed: {}", e);
                continue;
            }
        };
        let pages = Arc::clone(&pages);
        tokio::spawn(async move {
            let in_flight = InFlight::new();
            let stream = DeadlineStream::new(stream, timeouts, in_flight.clone());
            let service = service_fn(move |req: Request<Body>| {
                let running = in_flight.start();
                let response = redirect_response(&req, &pages);
                drop(running);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1().serve_connection(stream, service).await {
                debug!("Redirect connection from {} ended: {}", remote, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn protected(name: &str, ip: [u8; 4], id: &str) -> DnsRecord {
        DnsRecord::a(name, Ipv4Addr::from(ip), 300)
            .with_id(id)
            .with_protected(true)
    }

    fn request(host: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_proxy_config_default() {
        let config = ProxyConfig::default();
        assert_eq!(config.https_addr.port(), 443);
        assert_eq!(config.http_addr.port(), 80);
        assert_eq!(config.origin_port, 80);
        assert_eq!(config.backend_timeout_secs, 10);
        assert_eq!(config.read_timeout_secs, 5);
        assert_eq!(config.write_timeout_secs, 10);
        assert_eq!(config.idle_timeout_secs, 90);

        let timeouts = config.connection_timeouts();
        assert_eq!(timeouts.header, Duration::from_secs(2));
        assert_eq!(timeouts.idle, Duration::from_secs(90));
    }

    #[test]
    fn test_request_host() {
        assert_eq!(request_host(&request("A.Test:8443", "/")).as_deref(), Some("a.test"));
        assert_eq!(request_host(&request("[::1]:443", "/")).as_deref(), Some("[::1]"));
        let no_host = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(request_host(&no_host), None);
    }

    #[tokio::test]
    async fn test_router_follows_records() {
        let router = ProxyRouter::new();
        router.upsert(&protected("a.test.", [10, 0, 0, 1], "1")).await;
        router
            .upsert(&DnsRecord::a("b.test.", Ipv4Addr::new(10, 0, 0, 2), 300).with_id("2"))
            .await;

        assert_eq!(router.origin_for("A.test").await, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(router.origin_for("b.test").await, None);

        router.upsert(&protected("a.test.", [10, 0, 0, 9], "1")).await;
        assert_eq!(router.origin_for("a.test").await, Some("10.0.0.9".parse().unwrap()));

        router
            .upsert(&DnsRecord::a("a.test.", Ipv4Addr::new(10, 0, 0, 9), 300).with_id("1"))
            .await;
        assert!(router.is_empty().await);
    }

    #[tokio::test]
    async fn test_router_applies_bus_events() {
        let router = ProxyRouter::new();
        let added = Event::new(
            ADD_RECORD,
            "edge-a",
            &RecordAdded {
                domain: "test.".to_string(),
                record: protected("a.test.", [10, 0, 0, 1], "7"),
            },
        )
        .unwrap();
        router.apply(&added).await;
        assert_eq!(router.len().await, 1);

        let removed = Event::new(
            REMOVE_RECORD,
            "edge-a",
            &RecordRemoved {
                id: "7".to_string(),
                domain: "test.".to_string(),
                record: None,
            },
        )
        .unwrap();
        router.apply(&removed).await;
        assert!(router.is_empty().await);
    }

    #[test]
    fn test_redirect_keeps_path_and_query() {
        let pages = ErrorPages::default();
        let response = redirect_response(&request("a.test", "/path?x=1"), &pages);
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "https://a.test/path?x=1");
    }

    #[tokio::test]
    async fn test_unknown_host_gets_604_page() {
        let proxy = ReverseProxy::new(
            ProxyConfig::default(),
            Arc::new(ProxyRouter::new()),
            Arc::new(ErrorPages::default()),
        );
        let response = proxy
            .handle(request("nowhere.test", "/"), "127.0.0.1:5000".parse().unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stalled_request_body_fails() {
        let (mut sender, body) = Body::channel();
        sender.send_data(hyper::body::Bytes::from_static(b"part")).await.unwrap();

        let mut body = body_with_read_timeout(body, Duration::from_millis(50));
        assert_eq!(body.data().await.unwrap().unwrap(), "part");
        assert!(body.data().await.unwrap().is_err());
        assert!(body.data().await.is_none());
        drop(sender);
    }

    #[tokio::test]
    async fn test_address_host_gets_604_page() {
        let ids = Arc::new(crate::snowflake::Snowflake::new(1).unwrap());
        let store = Arc::new(ZoneStore::new(ids));
        let proxy = ReverseProxy::new(
            ProxyConfig::default(),
            Arc::new(ProxyRouter::new()),
            Arc::new(ErrorPages::default()),
        )
        .with_store(store);

        for host in ["192.0.2.10", "192.0.2.10:443", "[2001:db8::1]:443"] {
            let stripped = request_host(&request(host, "/")).unwrap();
            assert_eq!(proxy.resolve_origin(&stripped).await.unwrap(), None);
            let response = proxy
                .handle(request(host, "/"), "127.0.0.1:5000".parse().unwrap())
                .await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "host {}", host);
        }
    }

    #[tokio::test]
    async fn test_refused_backend_gets_603_page() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let router = Arc::new(ProxyRouter::new());
        router.upsert(&protected("a.test.", [127, 0, 0, 1], "1")).await;
        let config = ProxyConfig {
            origin_port: port,
            ..ProxyConfig::default()
        };
        let proxy = ReverseProxy::new(config, router, Arc::new(ErrorPages::default()));

        let response = proxy
            .handle(request("a.test", "/"), "127.0.0.1:5000".parse().unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
