// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Upstream dispatch: resolve, connect (directly or through a chained
//! proxy), optional TLS, then one HTTP/1.1 exchange over a shaped stream.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_LENGTH, HOST};
use hyper::http::uri::{Authority, Scheme};
use hyper::{Request, Response, Uri};
use hyper_rustls::ConfigBuilderExt;
use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::capture::DispatchTimings;
use crate::dns::DnsCache;
use crate::error::{ConfigError, UpstreamError};
use crate::exchange::ExchangeContext;
use crate::shaper::{ShapedStream, Shaper};

const MAX_TUNNEL_RESPONSE: usize = 8 * 1024;

/// Any byte stream an upstream exchange can run over.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// `host:port` of a chained upstream HTTP proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddr {
    pub host: String,
    pub port: u16,
}

impl FromStr for ProxyAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s
            .trim()
            .trim_start_matches("http://")
            .trim_end_matches('/');
        let (host, port) = bare
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::parameter("upstream_proxy", format!("'{}' is not host:port", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigError::parameter("upstream_proxy", format!("invalid port in '{}'", s)))?;
        if host.is_empty() || port == 0 {
            return Err(ConfigError::parameter(
                "upstream_proxy",
                format!("'{}' is not host:port", s),
            ));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Connection-level knobs. `None` timeouts are unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSettings {
    pub retry_count: u32,
    pub request_timeout: Option<Duration>,
    pub socket_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub proxy: Option<ProxyAddr>,
    pub trust_all_servers: bool,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            retry_count: 0,
            request_timeout: None,
            socket_timeout: Some(Duration::from_secs(60)),
            connect_timeout: Some(Duration::from_secs(60)),
            proxy: None,
            trust_all_servers: false,
        }
    }
}

fn millis_or_none(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

pub struct Upstream {
    settings: RwLock<UpstreamSettings>,
    dns: Arc<DnsCache>,
    shaper: Arc<Shaper>,
    verified: TlsConnector,
    insecure: TlsConnector,
}

impl Upstream {
    pub fn new(
        settings: UpstreamSettings,
        dns: Arc<DnsCache>,
        shaper: Arc<Shaper>,
    ) -> anyhow::Result<Self> {
        let mut verified = match rustls::ClientConfig::builder().with_native_roots() {
            Ok(builder) => builder.with_no_client_auth(),
            Err(e) => {
                warn!(%e, "no native root certificates; verified upstream TLS will fail");
                rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth()
            }
        };
        verified.alpn_protocols = vec![b"http/1.1".to_vec()];

        let mut insecure = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        insecure.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            settings: RwLock::new(settings),
            dns,
            shaper,
            verified: TlsConnector::from(Arc::new(verified)),
            insecure: TlsConnector::from(Arc::new(insecure)),
        })
    }

    pub fn settings(&self) -> UpstreamSettings {
        match self.settings.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => {
                warn!("upstream settings lock poisoned during read");
                poisoned.into_inner().clone()
            }
        }
    }

    fn update<F: FnOnce(&mut UpstreamSettings)>(&self, f: F) {
        match self.settings.write() {
            Ok(mut s) => f(&mut s),
            Err(poisoned) => {
                warn!("upstream settings lock poisoned during write");
                f(&mut poisoned.into_inner())
            }
        }
    }

    pub fn set_retry_count(&self, count: u32) {
        self.update(|s| s.retry_count = count);
    }

    /// Zero removes the limit.
    pub fn set_request_timeout_ms(&self, ms: u64) {
        self.update(|s| s.request_timeout = millis_or_none(ms));
    }

    /// Zero removes the limit.
    pub fn set_socket_timeout_ms(&self, ms: u64) {
        self.update(|s| s.socket_timeout = millis_or_none(ms));
    }

    /// Zero removes the limit.
    pub fn set_connect_timeout_ms(&self, ms: u64) {
        self.update(|s| s.connect_timeout = millis_or_none(ms));
    }

    pub fn set_upstream_proxy(&self, proxy: Option<&str>) -> Result<(), ConfigError> {
        let parsed = proxy.map(ProxyAddr::from_str).transpose()?;
        self.update(|s| s.proxy = parsed);
        Ok(())
    }

    pub fn set_trust_all_servers(&self, on: bool) {
        self.update(|s| s.trust_all_servers = on);
    }

    pub fn dns(&self) -> &Arc<DnsCache> {
        &self.dns
    }

    /// Send `request` upstream and collect the full response, advancing the
    /// exchange's capture as the request is dispatched and answered.
    pub async fn dispatch(
        &self,
        ctx: &mut ExchangeContext,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, UpstreamError> {
        let settings = self.settings();
        with_timeout(
            settings.request_timeout,
            "request",
            self.exchange(ctx, request, &settings),
        )
        .await?
    }

    async fn exchange(
        &self,
        ctx: &mut ExchangeContext,
        request: Request<Bytes>,
        settings: &UpstreamSettings,
    ) -> Result<Response<Bytes>, UpstreamError> {
        let uri = request.uri().clone();
        let https = uri.scheme() == Some(&Scheme::HTTPS);
        let host = uri
            .host()
            .ok_or_else(|| UpstreamError::Protocol(format!("no host in '{}'", uri)))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        let connect_host = ctx.connect_host.clone().unwrap_or_else(|| host.clone());

        let mut timings = DispatchTimings::default();
        let stream: Box<dyn Io> = match &settings.proxy {
            Some(proxy) => {
                let tcp = self
                    .connect_tcp(&proxy.host, proxy.port, settings, &mut timings)
                    .await?;
                if https {
                    let tunnel_started = Instant::now();
                    let tcp = open_tunnel(tcp, &connect_host, port, settings.socket_timeout).await?;
                    timings.connect = timings.connect.map(|c| c + tunnel_started.elapsed());
                    Box::new(self.tls_handshake(tcp, &host, settings, &mut timings).await?)
                } else {
                    Box::new(tcp)
                }
            }
            None => {
                let tcp = self
                    .connect_tcp(&connect_host, port, settings, &mut timings)
                    .await?;
                if https {
                    Box::new(self.tls_handshake(tcp, &host, settings, &mut timings).await?)
                } else {
                    Box::new(tcp)
                }
            }
        };

        let io = TokioIo::new(ShapedStream::new(stream, self.shaper.clone()));
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(%e, "upstream connection closed with error");
            }
        });

        if let Some(capture) = ctx.capture.as_mut() {
            capture.dispatched(&request, &timings);
        }

        let target = if settings.proxy.is_some() && !https {
            absolute_target(&uri, &connect_host, port)?
        } else {
            origin_target(&uri)?
        };
        let (mut parts, body) = request.into_parts();
        if !parts.headers.contains_key(HOST) {
            if let Some(auth) = uri.authority() {
                if let Ok(v) = HeaderValue::from_str(auth.as_str()) {
                    parts.headers.insert(HOST, v);
                }
            }
        }
        parts.uri = target;
        parts.version = hyper::Version::HTTP_11;
        let outgoing = Request::from_parts(parts, Full::new(body));

        let sent = Instant::now();
        trace!(%uri, target = %connect_host, port, "dispatching");
        let head = with_timeout(
            settings.socket_timeout,
            "response headers",
            sender.send_request(outgoing),
        )
        .await?
        .map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        if let Some(capture) = ctx.capture.as_mut() {
            capture.response_started(sent.elapsed());
        }

        if let Some(latency) = ctx.shaping.latency() {
            tokio::time::sleep(latency).await;
        }

        let receiving = Instant::now();
        let (mut parts, body) = head.into_parts();
        let body = with_timeout(settings.socket_timeout, "response body", body.collect())
            .await?
            .map_err(|e| UpstreamError::Protocol(e.to_string()))?
            .to_bytes();
        let keep = ctx.shaping.truncated_len(body.len());
        let body = if keep < body.len() {
            debug!(%uri, original = body.len(), kept = keep, "truncating response payload");
            body.slice(..keep)
        } else {
            body
        };
        if let Some(capture) = ctx.capture.as_mut() {
            capture.response_received(receiving.elapsed());
        }

        parts.headers.remove(CONTENT_LENGTH);
        Ok(Response::from_parts(parts, body))
    }

    /// Opaque TCP stream to `host:port` for a passthrough tunnel, through
    /// the chained proxy when one is set.
    pub async fn connect_raw(&self, host: &str, port: u16) -> Result<TcpStream, UpstreamError> {
        let settings = self.settings();
        let mut timings = DispatchTimings::default();
        match &settings.proxy {
            Some(proxy) => {
                let tcp = self
                    .connect_tcp(&proxy.host, proxy.port, &settings, &mut timings)
                    .await?;
                open_tunnel(tcp, host, port, settings.socket_timeout).await
            }
            None => self.connect_tcp(host, port, &settings, &mut timings).await,
        }
    }

    async fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        settings: &UpstreamSettings,
        timings: &mut DispatchTimings,
    ) -> Result<TcpStream, UpstreamError> {
        let dns_started = Instant::now();
        let resolved = self.dns.resolve(host, port).await?;
        if !resolved.cached {
            timings.dns = Some(dns_started.elapsed());
        }

        let connect_started = Instant::now();
        let rounds = settings.retry_count.saturating_add(1);
        let mut last = UpstreamError::Connect {
            target: format!("{}:{}", host, port),
            attempts: rounds,
            reason: "no addresses".into(),
        };
        for round in 0..rounds {
            for addr in &resolved.addrs {
                match with_timeout(settings.connect_timeout, "connect", TcpStream::connect(addr))
                    .await
                {
                    Ok(Ok(stream)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            trace!(%e, "set_nodelay failed");
                        }
                        timings.connect = Some(connect_started.elapsed());
                        timings.server_ip = Some(addr.ip());
                        return Ok(stream);
                    }
                    Ok(Err(e)) => {
                        last = UpstreamError::Connect {
                            target: format!("{}:{}", host, port),
                            attempts: rounds,
                            reason: e.to_string(),
                        }
                    }
                    Err(timeout) => last = timeout,
                }
            }
            if round + 1 < rounds {
                debug!(%host, port, attempt = round + 1, "upstream connect failed, retrying");
            }
        }
        Err(last)
    }

    async fn tls_handshake(
        &self,
        tcp: TcpStream,
        host: &str,
        settings: &UpstreamSettings,
        timings: &mut DispatchTimings,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, UpstreamError> {
        let name = ServerName::try_from(host.to_string()).map_err(|e| UpstreamError::Tls {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        let connector = if settings.trust_all_servers {
            &self.insecure
        } else {
            &self.verified
        };
        let started = Instant::now();
        let stream = with_timeout(settings.connect_timeout, "tls handshake", connector.connect(name, tcp))
            .await?
            .map_err(|e| UpstreamError::Tls {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        let ssl = started.elapsed();
        timings.ssl = Some(ssl);
        timings.connect = timings.connect.map(|c| c + ssl);
        Ok(stream)
    }
}

async fn with_timeout<F: Future>(
    limit: Option<Duration>,
    stage: &'static str,
    fut: F,
) -> Result<F::Output, UpstreamError> {
    match limit {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| UpstreamError::Timeout(stage)),
        None => Ok(fut.await),
    }
}

fn origin_target(uri: &Uri) -> Result<Uri, UpstreamError> {
    let pq = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    pq.parse::<Uri>()
        .map_err(|e| UpstreamError::Protocol(format!("bad request target '{}': {}", pq, e)))
}

fn absolute_target(uri: &Uri, host: &str, port: u16) -> Result<Uri, UpstreamError> {
    let authority = if port == 80 {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    };
    let authority = Authority::from_str(&authority)
        .map_err(|e| UpstreamError::Protocol(format!("bad authority '{}': {}", authority, e)))?;
    let mut parts = uri.clone().into_parts();
    parts.scheme = Some(Scheme::HTTP);
    parts.authority = Some(authority);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(hyper::http::uri::PathAndQuery::from_static("/"));
    }
    Uri::from_parts(parts).map_err(|e| UpstreamError::Protocol(e.to_string()))
}

/// Ask a chained proxy for a tunnel to `host:port`.
async fn open_tunnel(
    mut stream: TcpStream,
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> Result<TcpStream, UpstreamError> {
    let connect = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
        host = host,
        port = port
    );
    stream
        .write_all(connect.as_bytes())
        .await
        .map_err(|e| UpstreamError::UpstreamProxy(e.to_string()))?;

    let head = with_timeout(timeout, "upstream proxy tunnel", read_head(&mut stream)).await??;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok());
    match status {
        Some(s) if (200..300).contains(&s) => Ok(stream),
        _ => Err(UpstreamError::UpstreamProxy(status_line.to_string())),
    }
}

async fn read_head(stream: &mut TcpStream) -> Result<String, UpstreamError> {
    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() >= MAX_TUNNEL_RESPONSE {
            return Err(UpstreamError::UpstreamProxy("oversized CONNECT response".into()));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| UpstreamError::UpstreamProxy(e.to_string()))?;
        if n == 0 {
            return Err(UpstreamError::UpstreamProxy(
                "connection closed during CONNECT".into(),
            ));
        }
        buf.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Accepts any upstream certificate when `trust_all_servers` is on.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
