//! Control transports: one line-oriented client/server interface over raw
//! TCP, TLS, WebSocket and WebSocket over TLS.
//!
//! The four variants differ on two axes only. Framing is newline-delimited
//! on raw sockets and one message per frame on WebSockets. TLS is an
//! optional wrap around the accepted stream.

pub mod tcp;
pub mod web;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SocketType {
    #[default]
    Plain,
    PlainWebsocket,
    Tls,
    TlsWebsocket,
}

impl SocketType {
    /// Numeric form used in the controller export.
    pub fn code(self) -> u8 {
        match self {
            SocketType::Plain => 0,
            SocketType::PlainWebsocket => 1,
            SocketType::Tls => 2,
            SocketType::TlsWebsocket => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SocketType::Plain),
            1 => Some(SocketType::PlainWebsocket),
            2 => Some(SocketType::Tls),
            3 => Some(SocketType::TlsWebsocket),
            _ => None,
        }
    }

    pub fn is_tls(self) -> bool {
        matches!(self, SocketType::Tls | SocketType::TlsWebsocket)
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, SocketType::PlainWebsocket | SocketType::TlsWebsocket)
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketType::Plain => write!(f, "plain"),
            SocketType::PlainWebsocket => write!(f, "plain-websocket"),
            SocketType::Tls => write!(f, "tls"),
            SocketType::TlsWebsocket => write!(f, "tls-websocket"),
        }
    }
}

/// Serde adapter storing a [`SocketType`] as its numeric code.
pub mod socket_type_code {
    use super::SocketType;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &SocketType, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(value.code())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SocketType, D::Error> {
        let code = u8::deserialize(deserializer)?;
        SocketType::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown socket type {code}")))
    }
}

/// One connected control peer.
#[async_trait]
pub trait ControlClient: Send {
    async fn send_line(&mut self, data: &[u8]) -> Result<()>;

    /// Next line or message, without its delimiter. `None` once the peer
    /// has closed the connection.
    async fn read_line(&mut self) -> Result<Option<Vec<u8>>>;

    fn peer(&self) -> String;
}

/// Invoked once per accepted connection; the connection lives as long as
/// the returned future.
pub type ClientHandler = Arc<dyn Fn(Box<dyn ControlClient>) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait ControlTransport: Send + Sync {
    /// Bind `host` and serve connections with `handler` in the background.
    /// Returns the bound address.
    async fn listen(&self, host: &str, handler: ClientHandler) -> Result<SocketAddr>;

    /// Stop accepting and fail every pending read on open connections.
    fn stop(&self);
}

/// TLS material for the TLS variants.
#[derive(Debug, Clone, Default)]
pub struct TlsFiles<'a> {
    pub cert: Option<&'a Path>,
    pub key: Option<&'a Path>,
}

/// Build the transport for `socket_type`. WebSocket variants serve
/// `extra_routes` beside the control route.
pub fn build(
    socket_type: SocketType,
    tls: TlsFiles<'_>,
    extra_routes: axum::Router,
) -> Result<Box<dyn ControlTransport>> {
    let acceptor = if socket_type.is_tls() {
        let (Some(cert), Some(key)) = (tls.cert, tls.key) else {
            anyhow::bail!("socket type {socket_type} needs a TLS certificate and key");
        };
        Some(tokio_rustls::TlsAcceptor::from(load_tls_config(cert, key)?))
    } else {
        None
    };
    Ok(if socket_type.is_websocket() {
        Box::new(web::WebSocketTransport::new(acceptor, extra_routes))
    } else {
        Box::new(tcp::LineTransport::new(acceptor))
    })
}

/// Load a PEM certificate chain and private key into a rustls server config.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("reading TLS cert {}", cert_path.display()))?;
    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("reading TLS key {}", key_path.display()))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("parsing TLS certs: {}", e))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_path.display());
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| anyhow::anyhow!("parsing TLS key: {}", e))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?;
    Ok(Arc::new(config))
}

/// Client config that accepts any server certificate. Controllers usually
/// run with self-signed certificates; the HMAC envelope authenticates
/// commands, not the TLS layer.
pub fn insecure_client_config() -> Arc<rustls::ClientConfig> {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    Arc::new(config)
}

#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
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
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}
