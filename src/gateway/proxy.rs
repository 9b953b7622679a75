//! Single-host reverse proxy in front of an API Gateway stage.
//!
//! Two flavours share one implementation:
//!
//! - **Public** ([`ReverseProxy::public`]) — dials the invoke URL's host
//!   directly and verifies its certificate against the web PKI roots.
//! - **Private** ([`ReverseProxy::private`]) — always dials
//!   `127.0.0.1:<ssm_port>`, the local end of a remote-host forwarder, and
//!   speaks TLS through it with SNI set to the gateway hostname. The
//!   certificate belongs to a hostname that is never resolved locally, so
//!   verification is skipped; the wire up to the forwarder is loopback.
//!
//! Every request gets `Host` set to the upstream host and the stage (or
//! base path) prepended once. Hop-by-hop headers are dropped in both
//! directions. Upstream failures become `502 Bad Gateway`.
//!
//! Each request opens its own upstream connection; through a forwarder that
//! maps to a fresh session stream.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::TunnelError;

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Where upstream connections go.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Dial {
    /// Pinned to a local forwarder, regardless of the upstream host.
    Loopback(u16),
    Remote { host: String, port: u16 },
}

impl fmt::Display for Dial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loopback(port) => write!(f, "127.0.0.1:{port}"),
            Self::Remote { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

struct UpstreamTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    sni: String,
}

/// Reverse proxy to one upstream host.
pub struct ReverseProxy {
    dial: Dial,
    tls: Option<UpstreamTls>,
    /// `Host` header / URL authority presented upstream.
    authority: String,
    /// Path prefix added to every request (`/prod`), empty for none.
    prefix: String,
}

impl ReverseProxy {
    /// Proxy to a private gateway through the forwarder on `ssm_port`.
    pub fn private(remote_host: &str, ssm_port: u16, stage_name: &str) -> Result<Self, TunnelError> {
        let server_name = ServerName::try_from(remote_host.to_string())
            .map_err(|e| TunnelError::Tls(format!("invalid server name {remote_host}: {e}")))?;
        let prefix = stage_name.trim_matches('/');
        Ok(Self {
            dial: Dial::Loopback(ssm_port),
            tls: Some(UpstreamTls {
                connector: TlsConnector::from(Arc::new(insecure_client_config()?)),
                server_name,
                sni: remote_host.to_string(),
            }),
            authority: remote_host.to_string(),
            prefix: if prefix.is_empty() {
                String::new()
            } else {
                format!("/{prefix}")
            },
        })
    }

    /// Proxy to a public invoke URL such as
    /// `https://abc123.execute-api.eu-west-1.amazonaws.com/prod`. The URL's
    /// path becomes the prefix.
    pub fn public(invoke_url: &str) -> Result<Self, TunnelError> {
        let invalid = |reason: &str| TunnelError::InvalidUrl {
            url: invoke_url.to_string(),
            reason: reason.to_string(),
        };
        let uri: Uri = invoke_url.parse().map_err(|e: axum::http::uri::InvalidUri| invalid(&e.to_string()))?;
        let secure = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(invalid("scheme must be http or https")),
        };
        let host = uri.host().ok_or_else(|| invalid("missing host"))?.to_string();
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| invalid("missing host"))?;
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        let tls = if secure {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|e| TunnelError::Tls(format!("invalid server name {host}: {e}")))?;
            Some(UpstreamTls {
                connector: TlsConnector::from(Arc::new(verified_client_config()?)),
                server_name,
                sni: host.clone(),
            })
        } else {
            None
        };

        Ok(Self {
            dial: Dial::Remote { host, port },
            tls,
            authority,
            prefix: uri.path().trim_end_matches('/').to_string(),
        })
    }

    /// Host presented upstream (`Host` header and URL authority).
    pub fn upstream_host(&self) -> &str {
        &self.authority
    }

    /// SNI sent in the TLS handshake, if the upstream speaks TLS.
    pub fn server_name(&self) -> Option<&str> {
        self.tls.as_ref().map(|t| t.sni.as_str())
    }

    fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }

    /// Base URL requests are sent to, e.g. `https://<remote_host>`.
    pub fn target_url(&self) -> String {
        format!("{}://{}", self.scheme(), self.authority)
    }

    /// Rewrite an incoming request for the upstream: origin-form URI with the
    /// prefix applied, upstream `Host`, hop-by-hop headers removed. Returns
    /// the absolute upstream URL.
    pub fn rewrite(&self, parts: &mut Parts) -> Result<Uri, TunnelError> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let rewritten = join_prefix(&self.prefix, path_and_query);

        parts.uri = rewritten.parse().map_err(|e: axum::http::uri::InvalidUri| {
            TunnelError::InvalidUrl {
                url: rewritten.clone(),
                reason: e.to_string(),
            }
        })?;
        strip_hop_by_hop(&mut parts.headers);
        let host = HeaderValue::from_str(&self.authority).map_err(|e| TunnelError::InvalidUrl {
            url: self.authority.clone(),
            reason: e.to_string(),
        })?;
        parts.headers.insert(header::HOST, host);

        let absolute = format!("{}{}", self.target_url(), rewritten);
        absolute.parse().map_err(|e: axum::http::uri::InvalidUri| TunnelError::InvalidUrl {
            url: absolute.clone(),
            reason: e.to_string(),
        })
    }

    /// Forward one request, mapping every upstream failure to `502`.
    pub async fn forward(&self, req: Request) -> Response {
        let (mut parts, body) = req.into_parts();
        let method = parts.method.clone();
        let url = match self.rewrite(&mut parts) {
            Ok(url) => url,
            Err(e) => return bad_gateway(&e),
        };
        debug!(%method, %url, "proxying request");

        match self.send(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => {
                warn!(%method, %url, "upstream request failed: {e}");
                bad_gateway(&e)
            }
        }
    }

    async fn send(
        &self,
        req: Request,
    ) -> Result<hyper::Response<hyper::body::Incoming>, TunnelError> {
        let stream = match &self.dial {
            Dial::Loopback(port) => TcpStream::connect((Ipv4Addr::LOCALHOST, *port)).await,
            Dial::Remote { host, port } => TcpStream::connect((host.as_str(), *port)).await,
        }
        .map_err(|e| TunnelError::UpstreamUnreachable(format!("connect {}: {e}", self.dial)))?;

        let mut sender = match &self.tls {
            Some(tls) => {
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), stream)
                    .await
                    .map_err(|e| {
                        TunnelError::UpstreamUnreachable(format!(
                            "TLS handshake with {}: {e}",
                            self.authority
                        ))
                    })?;
                handshake(stream).await?
            }
            None => handshake(stream).await?,
        };

        sender
            .send_request(req)
            .await
            .map_err(|e| TunnelError::UpstreamUnreachable(e.to_string()))
    }

    /// Axum router sending every path and method through [`forward`](Self::forward).
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(self)
            .layer(TraceLayer::new_for_http())
    }
}

async fn proxy_handler(State(proxy): State<Arc<ReverseProxy>>, req: Request) -> Response {
    proxy.forward(req).await
}

async fn handshake<I>(io: I) -> Result<http1::SendRequest<Body>, TunnelError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| TunnelError::UpstreamUnreachable(format!("HTTP handshake failed: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("upstream connection closed: {e}");
        }
    });
    Ok(sender)
}

fn bad_gateway(err: &TunnelError) -> Response {
    (StatusCode::BAD_GATEWAY, format!("vaws proxy: {err}\n")).into_response()
}

/// Prepend `prefix` to `path_and_query` unless the path already starts with
/// it as a whole segment. The query string is carried over untouched.
pub fn join_prefix(prefix: &str, path_and_query: &str) -> String {
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_and_query, None),
    };
    let path = if path.is_empty() { "/" } else { path };
    let has_prefix = prefix.is_empty()
        || path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'));
    let mut joined = if has_prefix {
        path.to_string()
    } else {
        format!("{prefix}{path}")
    };
    if let Some(q) = query {
        joined.push('?');
        joined.push_str(q);
    }
    joined
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn verified_client_config() -> Result<ClientConfig, TunnelError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn insecure_client_config() -> Result<ClientConfig, TunnelError> {
    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipVerification))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Accepts any certificate. Only used behind a loopback forwarder.
#[derive(Debug)]
struct SkipVerification;

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Bind the proxy listener on `127.0.0.1:<port>`.
pub async fn bind_local(port: u16) -> Result<TcpListener, TunnelError> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .map_err(|e| TunnelError::PortUnavailable(format!("127.0.0.1:{port}: {e}")))
}

/// A running local HTTP server in front of a [`ReverseProxy`].
pub struct ProxyServer {
    port: u16,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ProxyServer {
    /// Serve `proxy` on a pre-bound `listener`. `on_error` runs if the serve
    /// loop fails (not on a requested shutdown).
    pub fn spawn<F>(listener: TcpListener, proxy: Arc<ReverseProxy>, on_error: F) -> Self
    where
        F: FnOnce(String) + Send + 'static,
    {
        let port = listener.local_addr().map_or(0, |a| a.port());
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone().cancelled_owned();
        let upstream = proxy.target_url();
        let task = tokio::spawn(async move {
            info!(port, %upstream, "proxy listening on 127.0.0.1:{port}");
            let result = axum::serve(listener, proxy.router())
                .with_graceful_shutdown(signal)
                .await;
            match result {
                Ok(()) => debug!(port, "proxy server stopped"),
                Err(e) => {
                    warn!(port, "proxy server failed: {e}");
                    on_error(e.to_string());
                }
            }
        });
        Self {
            port,
            shutdown,
            task,
        }
    }

    /// Graceful shutdown bounded by `timeout`; in-flight requests still
    /// running after that are aborted.
    pub async fn shutdown(mut self, timeout: Duration) {
        self.shutdown.cancel();
        if tokio::time::timeout(timeout, &mut self.task).await.is_err() {
            warn!(port = self.port, "proxy shutdown timed out, aborting");
            self.task.abort();
        }
    }
}
