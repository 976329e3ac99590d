// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! The proxy instance: accept loop, CONNECT handling (interception or
//! opaque tunnel), the per-exchange pipeline and the control-plane
//! operations that reconfigure a running instance.

use crate::ca::CertificateAuthority;
use crate::capture::HarRecorder;
use crate::config::{Config, TlsConfig};
use crate::connection::ConnectionMetadata;
use crate::dns::DnsCache;
use crate::error::{ConfigError, UpstreamError};
use crate::exchange::{synthetic_response, ExchangeContext};
use crate::filters::{FilterChain, InterceptorRegistry, RequestInterceptor, ResponseInterceptor};
use crate::har::Har;
use crate::rules::RuleEngine;
use crate::shaper::{ShapedStream, Shaper, ShaperSettings};
use crate::upstream::{Upstream, UpstreamSettings};
use anyhow::Context;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, CONNECTION};
use hyper::http::uri::Scheme;
use hyper::{service::service_fn, Method, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoConnBuilder;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<BoxBody<Bytes, Infallible>>, Infallible>> + Send>>;

// RFC 7230 Section 6.1: Hop-by-hop headers must not be forwarded by proxies.
static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Origin-form path on which the proxy serves its own CA certificate.
pub const CA_CERT_PATH: &str = "/_har_proxy/cert";

const DNS_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct AlwaysResolves(Arc<CertifiedKey>);

impl ResolvesServerCert for AlwaysResolves {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Where and how an instance listens. Everything else comes from [`Config`].
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub bind: IpAddr,
    /// Zero picks an ephemeral port.
    pub port: u16,
    /// Overrides `[upstream] proxy`.
    pub upstream_proxy: Option<String>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            upstream_proxy: None,
        }
    }
}

struct Shared {
    recorder: Arc<HarRecorder>,
    rules: Arc<RuleEngine>,
    shaper: Arc<Shaper>,
    upstream: Upstream,
    interceptors: Arc<InterceptorRegistry>,
    chain: FilterChain,
    ca: Option<Arc<CertificateAuthority>>,
    passthrough_domains: Vec<String>,
    shutdown: watch::Receiver<bool>,
}

impl Shared {
    async fn new(
        cfg: &Config,
        upstream_proxy: Option<&str>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Arc<Self>> {
        let rules = Arc::new(RuleEngine::new());
        cfg.apply_rules(&rules).context("invalid rules")?;
        let shaper = Arc::new(Shaper::new(cfg.shaper_settings()?));
        let dns = Arc::new(DnsCache::new(cfg.timeouts.dns_cache_ms));

        let mut upstream_settings: UpstreamSettings = cfg.upstream_settings()?;
        if let Some(proxy) = upstream_proxy {
            upstream_settings.proxy = Some(proxy.parse()?);
        }
        let upstream = Upstream::new(upstream_settings, dns, shaper.clone())?;

        let ca = if cfg.tls.enabled {
            Some(load_ca(&cfg.tls).await?)
        } else {
            None
        };

        let recorder = Arc::new(HarRecorder::new(cfg.capture_settings()));
        let interceptors = Arc::new(InterceptorRegistry::new());
        let chain = FilterChain::standard(recorder.clone(), interceptors.clone());

        Ok(Arc::new(Self {
            recorder,
            rules,
            shaper,
            upstream,
            interceptors,
            chain,
            ca,
            passthrough_domains: cfg
                .tls
                .passthrough_domains
                .iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
            shutdown,
        }))
    }

    fn is_passthrough(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.passthrough_domains.iter().any(|d| host.ends_with(d))
    }
}

async fn load_ca(tls: &TlsConfig) -> anyhow::Result<Arc<CertificateAuthority>> {
    match (tls.ca_cert_path.as_deref(), tls.ca_key_path.as_deref()) {
        (Some(cert), Some(key)) => {
            CertificateAuthority::load_or_generate(Path::new(cert), Path::new(key)).await
        }
        (None, None) => CertificateAuthority::ephemeral(),
        _ => anyhow::bail!("tls.ca_cert_path and tls.ca_key_path must be set together"),
    }
}

/// A running proxy instance.
pub struct ProxyServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyServer {
    /// Bind, load the CA and start accepting. Fails on invalid configuration,
    /// a port already in use, or a CA that cannot sign.
    pub async fn start(cfg: &Config, options: ProxyOptions) -> anyhow::Result<Self> {
        let (shutdown, rx) = watch::channel(false);
        let shared = Shared::new(cfg, options.upstream_proxy.as_deref(), rx.clone()).await?;

        let listen = SocketAddr::new(options.bind, options.port);
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind {}", listen))?;
        let addr = listener.local_addr()?;
        info!(%addr, mitm = shared.ca.is_some(), "listening");

        let accept = tokio::spawn(accept_loop(listener, shared.clone(), rx.clone()));
        let sweep = tokio::spawn(dns_sweep(shared.upstream.dns().clone(), rx));

        Ok(Self {
            addr,
            shared,
            shutdown,
            tasks: Mutex::new(vec![accept, sweep]),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting, let open connections finish their current exchange
    /// and close.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut t) => t.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(%e, "proxy task ended abnormally");
            }
        }
        info!(addr = %self.addr, "stopped");
    }

    pub fn ca_cert_pem(&self) -> Option<String> {
        self.shared.ca.as_ref().map(|ca| ca.get_ca_cert_pem())
    }

    // HAR

    /// Start a fresh HAR and return the previous one.
    pub fn new_har(&self, page_ref: Option<String>, page_title: Option<String>) -> Option<Har> {
        self.shared.recorder.new_har(page_ref, page_title)
    }

    /// Stop recording and return the last HAR.
    pub fn end_har(&self) -> Option<Har> {
        self.shared.recorder.end_har()
    }

    pub fn new_page(
        &self,
        page_ref: Option<String>,
        page_title: Option<String>,
    ) -> Result<String, ConfigError> {
        self.shared.recorder.new_page(page_ref, page_title)
    }

    pub fn get_har(&self) -> Option<Har> {
        self.shared.recorder.har()
    }

    /// The current HAR restricted to the given pages and their entries.
    pub fn get_har_for_pages<S: AsRef<str>>(&self, page_refs: &[S]) -> Option<Har> {
        self.shared
            .recorder
            .har()
            .map(|har| har.filter_pages(page_refs))
    }

    pub fn set_capture_headers(&self, on: bool) {
        self.shared.recorder.set_capture_headers(on);
    }

    pub fn set_capture_content(&self, on: bool) {
        self.shared.recorder.set_capture_content(on);
    }

    pub fn set_capture_binary_content(&self, on: bool) {
        self.shared.recorder.set_capture_binary_content(on);
    }

    /// Wait until no request has been seen for `quiet`, or `timeout`
    /// elapses. Returns whether the quiet period was reached.
    pub async fn wait_for_network_traffic_to_stop(&self, quiet: Duration, timeout: Duration) -> bool {
        self.shared
            .recorder
            .wait_for_traffic_to_stop(quiet, timeout)
            .await
    }

    // Rules

    pub fn blacklist_requests(&self, pattern: &str, status: u16) -> Result<(), ConfigError> {
        self.shared.rules.blacklist_requests(pattern, status)
    }

    pub fn clear_blacklist(&self) {
        self.shared.rules.clear_blacklist();
    }

    pub fn whitelist_requests<S: AsRef<str>>(
        &self,
        patterns: &[S],
        status: u16,
    ) -> Result<(), ConfigError> {
        self.shared.rules.whitelist_requests(patterns, status)
    }

    pub fn clear_whitelist(&self) {
        self.shared.rules.clear_whitelist();
    }

    pub fn rewrite_url(&self, pattern: &str, replacement: &str) -> Result<(), ConfigError> {
        self.shared.rules.rewrite_url(pattern, replacement)
    }

    pub fn clear_rewrite_rules(&self) {
        self.shared.rules.clear_rewrite_rules();
    }

    pub fn remap_host(&self, host: &str, new_host: &str) -> Result<(), ConfigError> {
        self.shared.rules.remap_host(host, new_host)?;
        self.shared.upstream.dns().invalidate(host);
        Ok(())
    }

    pub fn clear_host_remaps(&self) {
        self.shared.rules.clear_host_remaps();
    }

    pub fn clear_dns_cache(&self) {
        self.shared.upstream.dns().clear();
    }

    /// Zero disables caching.
    pub fn set_dns_cache_timeout(&self, ms: u64) {
        self.shared.upstream.dns().set_ttl_ms(ms);
    }

    pub fn add_header(&self, name: &str, value: &str) -> Result<(), ConfigError> {
        self.shared.rules.add_header(name, value)
    }

    pub fn clear_headers(&self) {
        self.shared.rules.clear_headers();
    }

    pub fn set_header_filter(&self, pattern: Option<&str>) -> Result<(), ConfigError> {
        self.shared.rules.set_header_filter(pattern)
    }

    pub fn auto_basic_authorization(
        &self,
        domain: &str,
        username: &str,
        password: &str,
    ) -> Result<(), ConfigError> {
        self.shared.rules.auto_basic_auth(domain, username, password)
    }

    pub fn stop_auto_basic_authorization(&self, domain: &str) {
        self.shared.rules.stop_auto_basic_auth(domain);
    }

    // Upstream connections

    pub fn set_retry_count(&self, count: u32) {
        self.shared.upstream.set_retry_count(count);
    }

    pub fn set_request_timeout(&self, ms: u64) {
        self.shared.upstream.set_request_timeout_ms(ms);
    }

    pub fn set_socket_operation_timeout(&self, ms: u64) {
        self.shared.upstream.set_socket_timeout_ms(ms);
    }

    pub fn set_connection_timeout(&self, ms: u64) {
        self.shared.upstream.set_connect_timeout_ms(ms);
    }

    pub fn set_upstream_proxy(&self, proxy: Option<&str>) -> Result<(), ConfigError> {
        self.shared.upstream.set_upstream_proxy(proxy)
    }

    pub fn set_trust_all_servers(&self, on: bool) {
        self.shared.upstream.set_trust_all_servers(on);
    }

    // Shaping

    pub fn set_upstream_kbps(&self, kbps: u64) {
        self.shared.shaper.set_upstream_kbps(kbps);
    }

    pub fn set_downstream_kbps(&self, kbps: u64) {
        self.shared.shaper.set_downstream_kbps(kbps);
    }

    pub fn set_latency(&self, ms: u64) {
        self.shared.shaper.set_latency(ms);
    }

    pub fn set_payload_percentage(&self, pct: u8) -> Result<(), ConfigError> {
        self.shared.shaper.set_payload_percentage(pct)
    }

    pub fn set_max_bits_per_second_threshold(&self, bps: u64) {
        self.shared.shaper.set_max_bits_per_second(bps);
    }

    pub fn enable_shaping(&self) {
        self.shared.shaper.enable();
    }

    pub fn disable_shaping(&self) {
        self.shared.shaper.disable();
    }

    pub fn shaper_settings(&self) -> ShaperSettings {
        self.shared.shaper.settings()
    }

    // Interceptors

    pub fn add_request_interceptor(&self, interceptor: Arc<dyn RequestInterceptor>) {
        self.shared.interceptors.add_request_interceptor(interceptor);
    }

    pub fn add_response_interceptor(&self, interceptor: Arc<dyn ResponseInterceptor>) {
        self.shared.interceptors.add_response_interceptor(interceptor);
    }

    /// Removes every registered request and response interceptor.
    pub fn clear_interceptors(&self) {
        self.shared.interceptors.clear();
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let server_builder = AutoConnBuilder::new(TokioExecutor::new());
    loop {
        let (stream, remote_addr) = tokio::select! {
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(%e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        let shared = shared.clone();
        let builder_clone = server_builder.clone();
        tokio::spawn(async move {
            let conn_metadata = Arc::new(ConnectionMetadata::new(remote_addr));
            trace!(%remote_addr, id = %conn_metadata.id, "accepted");
            let mut shutdown = shared.shutdown.clone();
            let summary = conn_metadata.clone();
            let service = service_fn(move |req: Request<Incoming>| {
                let shared = shared.clone();
                let conn_metadata = conn_metadata.clone();
                let fut: ServiceFuture = Box::pin(async move {
                    handle_request(req, shared, conn_metadata, Scheme::HTTP, None).await
                });
                fut
            });

            let conn = builder_clone.serve_connection_with_upgrades(TokioIo::new(stream), service);
            tokio::pin!(conn);
            let res = tokio::select! {
                res = conn.as_mut() => res,
                _ = shutdown.changed() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = res {
                debug!(%e, %remote_addr, "connection error");
            }
            trace!(
                %remote_addr,
                exchanges = summary.exchanges(),
                age_ms = summary.age().as_millis() as u64,
                "connection closed"
            );
        });
    }
    debug!("accept loop finished");
}

async fn dns_sweep(dns: Arc<DnsCache>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(DNS_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => dns.cleanup_expired(),
            _ = shutdown.changed() => break,
        }
    }
}

fn text_response(status: u16, body: &str) -> Response<BoxBody<Bytes, Infallible>> {
    synthetic_response(status, Bytes::copy_from_slice(body.as_bytes())).map(|b| Full::new(b).boxed())
}

async fn handle_request<B>(
    req: Request<B>,
    shared: Arc<Shared>,
    conn_metadata: Arc<ConnectionMetadata>,
    scheme: Scheme,
    connect_authority: Option<String>,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() == Method::CONNECT {
        if connect_authority.is_some() {
            return Ok(text_response(405, "Nested CONNECT not supported"));
        }
        return Ok(handle_connect_request(req, shared, conn_metadata).await);
    }

    if req.method() == Method::GET
        && req.uri().scheme().is_none()
        && connect_authority.is_none()
        && req.uri().path() == CA_CERT_PATH
    {
        return Ok(match &shared.ca {
            Some(ca) => Response::builder()
                .header("Content-Type", "application/x-x509-ca-cert")
                .header(
                    "Content-Disposition",
                    "attachment; filename=\"har-proxy-ca.crt\"",
                )
                .body(Full::new(Bytes::from(ca.get_ca_cert_pem())).boxed())
                .unwrap_or_else(|e| {
                    error!("failed to build CA response: {}", e);
                    text_response(500, "internal error")
                }),
            None => text_response(404, "TLS interception not enabled"),
        });
    }

    handle_http_logic(req, shared, conn_metadata, scheme, connect_authority).await
}

async fn handle_http_logic<B>(
    req: Request<B>,
    shared: Arc<Shared>,
    conn_metadata: Arc<ConnectionMetadata>,
    scheme: Scheme,
    connect_authority: Option<String>,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let boxed: Box<dyn std::error::Error + Send + Sync> = e.into();
            error!("failed to collect request body: {}", boxed);
            return Ok(text_response(400, "request body collect error"));
        }
    };
    let mut request = Request::from_parts(parts, body);
    strip_hop_by_hop(request.headers_mut());
    let seq = conn_metadata.next_exchange();

    let mut ctx = ExchangeContext::new(
        conn_metadata,
        scheme,
        connect_authority,
        shared.rules.snapshot(),
        shared.shaper.settings(),
    );

    let mut response = match shared.chain.run_request(&mut ctx, &mut request) {
        Some(short_circuit) => short_circuit,
        None => {
            let url = request.uri().clone();
            match shared.upstream.dispatch(&mut ctx, request).await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(%url, error = %e, "upstream exchange failed");
                    let reason = e.to_string();
                    if let Some(capture) = ctx.capture_mut() {
                        capture.fail(&reason);
                    }
                    synthetic_response(e.status_code(), reason)
                }
            }
        }
    };

    shared.chain.run_response(&mut ctx, &mut response);
    strip_hop_by_hop(response.headers_mut());
    debug!(
        id = %ctx.id,
        client = %ctx.connection.remote_addr,
        seq,
        status = response.status().as_u16(),
        elapsed_ms = ctx.started.elapsed().as_millis() as u64,
        "exchange finished"
    );
    Ok(response.map(|b| Full::new(b).boxed()))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_hop_headers = parse_connection_tokens(headers.get(CONNECTION));
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str(), &connection_hop_headers))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(&name);
    }
}

// Parse a Connection header value into a lowercased set of tokens
fn parse_connection_tokens(val: Option<&hyper::header::HeaderValue>) -> HashSet<String> {
    let mut set = HashSet::new();
    if let Some(conn_val) = val {
        if let Ok(conn_str) = conn_val.to_str() {
            for token in conn_str.split(',') {
                let trimmed = token.trim().to_ascii_lowercase();
                if !trimmed.is_empty() {
                    set.insert(trimmed);
                }
            }
        }
    }
    set
}

fn is_hop_by_hop_header(name: &str, connection_hop_headers: &HashSet<String>) -> bool {
    connection_hop_headers.contains(name) || HOP_BY_HOP_HEADERS.contains(&name)
}

/// Answer a CONNECT and take over the upgraded connection in the
/// background. Tunnels that will not be intercepted are checked against
/// the blacklist and whitelist first and refused with the rule's status,
/// and the server side is connected before the client gets its 200.
async fn handle_connect_request<B>(
    req: Request<B>,
    shared: Arc<Shared>,
    conn_metadata: Arc<ConnectionMetadata>,
) -> Response<BoxBody<Bytes, Infallible>>
where
    B: hyper::body::Body + Send + 'static,
{
    let Some(authority) = req.uri().authority().cloned() else {
        return text_response(400, "CONNECT target must be host:port");
    };
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = authority.port_u16().unwrap_or(443);
    let intercept = shared.ca.is_some() && !shared.is_passthrough(&host);

    let server = if intercept {
        None
    } else {
        let url = if port == 443 {
            format!("https://{}/", authority.host())
        } else {
            format!("https://{}:{}/", authority.host(), port)
        };
        if let Some(block) = shared.rules.snapshot().check_blocked(&url) {
            debug!(%url, reason = block.reason(), status = block.status(), "tunnel refused");
            return text_response(block.status(), "");
        }
        match connect_passthrough(&host, port, &shared).await {
            Ok(server) => Some(server),
            Err(e) => {
                warn!(%host, port, "tunnel target unreachable: {}", e);
                return text_response(e.status_code(), &e.to_string());
            }
        }
    };

    tokio::task::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let res = match server {
                    None => {
                        handle_connect(upgraded, authority.to_string(), &host, shared, conn_metadata)
                            .await
                    }
                    Some(server) => {
                        info!(%host, port, "tunneling connection (passthrough)");
                        tunnel(TokioIo::new(upgraded), server, &shared).await
                    }
                };
                if let Err(e) = res {
                    error!(%host, "connect error: {:#}", e);
                }
            }
            Err(e) => error!("upgrade error for {}: {}", authority, e),
        }
    });
    Response::new(Full::new(Bytes::new()).boxed())
}

/// Terminate TLS with a leaf for `host` and serve the decrypted stream as
/// HTTPS exchanges.
fn handle_connect<'a>(
    client_conn: hyper::upgrade::Upgraded,
    authority: String,
    host: &'a str,
    shared: Arc<Shared>,
    conn_metadata: Arc<ConnectionMetadata>,
) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
    Box::pin(async move {
    let ca = shared
        .ca
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("interception requested without a CA"))?;
    let cert = ca.gen_cert_for_domain(host)?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(AlwaysResolves(cert)));
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
    let stream = acceptor
        .accept(TokioIo::new(client_conn))
        .await
        .with_context(|| format!("TLS handshake with client for {}", host))?;
    trace!(%host, "client TLS established");

    let mut shutdown = shared.shutdown.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let shared = shared.clone();
        let conn_metadata = conn_metadata.clone();
        let authority = authority.clone();
        let fut: ServiceFuture = Box::pin(async move {
            handle_request(req, shared, conn_metadata, Scheme::HTTPS, Some(authority)).await
        });
        fut
    });

    let builder = AutoConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    tokio::pin!(conn);
    let res = tokio::select! {
        res = conn.as_mut() => res,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = res {
        debug!("TLS connection error: {}", e);
    }
    Ok(())
    })
}

/// Open the server side of an opaque tunnel, honoring host remaps and the
/// upstream proxy.
async fn connect_passthrough(
    host: &str,
    port: u16,
    shared: &Shared,
) -> Result<TcpStream, UpstreamError> {
    let target = shared
        .rules
        .snapshot()
        .remap_host(host)
        .map(str::to_string)
        .unwrap_or_else(|| host.to_string());
    trace!("tunnel: connecting to {}:{}", target, port);
    shared.upstream.connect_raw(&target, port).await
}

/// Copy bytes both ways between the client and the server without looking
/// at them. The server side is shaped like any other upstream stream.
async fn tunnel<S>(mut client: S, server: TcpStream, shared: &Shared) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut server = ShapedStream::new(server, shared.shaper.clone());
    let (n1, n2) = tokio::io::copy_bidirectional(&mut client, &mut server).await?;
    trace!("tunnel: copy finished: {} bytes -> {} bytes", n1, n2);
    Ok(())
}
