use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::body::Body;
use axum::http::header::{self, HeaderValue};
use axum::http::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use neopkg_core::PkgError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::HttpProxyConfig;

/// Unix socket paths must stay below this many bytes.
pub const UNIX_SOCKET_PATH_LIMIT: usize = 100;

const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Where a backend listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyTarget {
    Http { authority: String },
    Https { authority: String, host: String },
    Unix { path: PathBuf },
}

impl ProxyTarget {
    /// Parses `http://host:port`, `https://host:port` or `unix://path`.
    /// Relative socket paths are resolved against `installed_dir`.
    pub fn parse(address: &str, installed_dir: &Path) -> Result<Self> {
        let address = address.trim();
        if let Some(rest) = address.strip_prefix("http://") {
            let authority = authority_of(rest, address)?;
            return Ok(Self::Http {
                authority: with_default_port(&authority, 80),
            });
        }
        if let Some(rest) = address.strip_prefix("https://") {
            let authority = authority_of(rest, address)?;
            let host = host_of(&authority);
            return Ok(Self::Https {
                authority: with_default_port(&authority, 443),
                host,
            });
        }
        if let Some(rest) = address.strip_prefix("unix://") {
            if rest.is_empty() {
                return Err(anyhow!("unix proxy address '{address}' has no socket path"));
            }
            let raw = Path::new(rest);
            let joined = if raw.is_absolute() {
                raw.to_path_buf()
            } else {
                installed_dir.join(raw)
            };
            let path: PathBuf = joined
                .components()
                .filter(|component| !matches!(component, Component::CurDir))
                .collect();
            let len = path.as_os_str().len();
            if len >= UNIX_SOCKET_PATH_LIMIT {
                return Err(PkgError::SocketPathTooLong {
                    path: path.display().to_string(),
                    len,
                }
                .into());
            }
            return Ok(Self::Unix { path });
        }

        Err(anyhow!(
            "unsupported proxy address '{address}'; expected http://, https:// or unix://"
        ))
    }

    fn host_header(&self) -> &str {
        match self {
            Self::Http { authority } | Self::Https { authority, .. } => authority,
            Self::Unix { .. } => "localhost",
        }
    }
}

/// Forwards requests under a path prefix to a backend over HTTP, HTTPS or a
/// unix socket. One connection is opened per request.
#[derive(Clone)]
pub struct ReverseProxy {
    target: ProxyTarget,
    prefix: String,
    strip_prefix: String,
    tls: Option<TlsConnector>,
}

impl std::fmt::Debug for ReverseProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseProxy")
            .field("target", &self.target)
            .field("prefix", &self.prefix)
            .field("strip_prefix", &self.strip_prefix)
            .finish()
    }
}

impl ReverseProxy {
    pub fn new(config: &HttpProxyConfig, installed_dir: &Path) -> Result<Self> {
        let target = ProxyTarget::parse(&config.address, installed_dir)?;
        let tls = match target {
            ProxyTarget::Https { .. } => Some(permissive_tls_connector()?),
            _ => None,
        };
        Ok(Self {
            target,
            prefix: config.prefix.clone(),
            strip_prefix: config.strip_prefix.clone(),
            tls,
        })
    }

    /// The path (and query) sent upstream for an incoming `path_and_query`.
    pub fn upstream_path(&self, path_and_query: &str) -> String {
        let stripped = if self.strip_prefix.is_empty() {
            path_and_query
        } else {
            path_and_query
                .strip_prefix(self.strip_prefix.as_str())
                .unwrap_or(path_and_query)
        };
        if stripped.starts_with('/') {
            stripped.to_string()
        } else {
            format!("/{stripped}")
        }
    }

    pub async fn forward(&self, request: Request<Body>) -> Result<Response<Body>> {
        let (mut parts, body) = request.into_parts();
        let incoming = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let upstream = self.upstream_path(incoming);
        parts.uri = upstream
            .parse::<Uri>()
            .with_context(|| format!("invalid upstream path '{upstream}'"))?;
        for name in HOP_BY_HOP_HEADERS {
            parts.headers.remove(name);
        }
        parts.headers.insert(
            header::HOST,
            HeaderValue::from_str(self.target.host_header())
                .context("backend address is not a valid host header")?,
        );
        let request = Request::from_parts(parts, body);
        debug!(backend = ?self.target, path = %upstream, "forwarding request to backend");

        match &self.target {
            ProxyTarget::Http { authority } => {
                let stream = TcpStream::connect(authority.as_str())
                    .await
                    .with_context(|| format!("failed connecting to backend {authority}"))?;
                send_over(TokioIo::new(stream), request).await
            }
            ProxyTarget::Https { authority, host } => {
                let stream = TcpStream::connect(authority.as_str())
                    .await
                    .with_context(|| format!("failed connecting to backend {authority}"))?;
                let connector = self
                    .tls
                    .clone()
                    .context("https backend has no tls connector")?;
                let server_name = ServerName::try_from(host.clone())
                    .with_context(|| format!("invalid tls server name '{host}'"))?;
                let tls = connector
                    .connect(server_name, stream)
                    .await
                    .with_context(|| format!("tls handshake with {authority} failed"))?;
                send_over(TokioIo::new(tls), request).await
            }
            ProxyTarget::Unix { path } => send_over_unix(path, request).await,
        }
    }
}

#[cfg(unix)]
async fn send_over_unix(path: &Path, request: Request<Body>) -> Result<Response<Body>> {
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .with_context(|| format!("failed connecting to backend socket {}", path.display()))?;
    send_over(TokioIo::new(stream), request).await
}

#[cfg(not(unix))]
async fn send_over_unix(path: &Path, _request: Request<Body>) -> Result<Response<Body>> {
    Err(anyhow!(
        "unix socket backends are not supported on this platform: {}",
        path.display()
    ))
}

async fn send_over<I>(io: I, request: Request<Body>) -> Result<Response<Body>>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
        .await
        .context("http handshake with backend failed")?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(error = %err, "backend connection closed");
        }
    });

    let response = sender
        .send_request(request)
        .await
        .context("backend request failed")?;
    Ok(response.map(Body::new))
}

fn authority_of(rest: &str, address: &str) -> Result<String> {
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(anyhow!("proxy address '{address}' has no host"));
    }
    Ok(authority.to_string())
}

fn host_of(authority: &str) -> String {
    if let Some(bracketed) = authority.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or_default().to_string();
    }
    authority
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(authority)
        .to_string()
}

fn with_default_port(authority: &str, port: u16) -> String {
    let tail = match authority.rfind(']') {
        Some(idx) => &authority[idx + 1..],
        None => authority,
    };
    let has_port = tail.rsplit_once(':').is_some_and(|(_, port)| {
        !port.is_empty() && port.chars().all(|ch| ch.is_ascii_digit())
    });
    if has_port {
        authority.to_string()
    } else {
        format!("{authority}:{port}")
    }
}

fn permissive_tls_connector() -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .context("failed configuring tls protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any server certificate (backends commonly run self-signed) while
/// still checking handshake signatures against the presented certificate.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        debug!(server = ?server_name, "accepting backend certificate without verification");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
